//! Stock / watchlist persistence operations.

use super::{json_string_vec, Db, StoreResult};
use crate::models::{AnalysisKind, Stock, StockState};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Row};

fn stock_from_row(row: &Row<'_>) -> rusqlite::Result<Stock> {
    let state_raw: String = row.get("state")?;
    let kind_raw: String = row.get("default_analysis_kind")?;
    let tags_raw: String = row.get("tags")?;
    let earnings_raw: Option<String> = row.get("next_earnings_date")?;
    Ok(Stock {
        ticker: row.get("ticker")?,
        name: row.get("name")?,
        sector: row.get("sector")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        state: StockState::parse(&state_raw).unwrap_or(StockState::Analysis),
        default_analysis_kind: AnalysisKind::parse(&kind_raw).unwrap_or(AnalysisKind::Stock),
        priority: row.get("priority")?,
        next_earnings_date: earnings_raw
            .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
        earnings_confirmed: row.get::<_, i64>("earnings_confirmed")? != 0,
        has_open_position: row.get::<_, i64>("has_open_position")? != 0,
        max_position_pct: row.get("max_position_pct")?,
        tags: json_string_vec(&tags_raw),
        notes: row.get("notes")?,
        expires_at: row.get("expires_at")?,
    })
}

const STOCK_COLS: &str = "ticker, name, sector, enabled, state, default_analysis_kind, priority, \
     next_earnings_date, earnings_confirmed, has_open_position, max_position_pct, tags, notes, \
     expires_at";

impl Db {
    /// Insert or update a stock. Priority clamps to 1..=10, max position
    /// percent to 0..=100; the ticker must already be normalized.
    pub async fn upsert_stock(&self, stock: &Stock) -> StoreResult<()> {
        let s = stock.clone();
        let ts = Utc::now().timestamp();
        self.call("upsert_stock", move |conn| {
            conn.execute(
                "INSERT INTO stocks (ticker, name, sector, enabled, state, default_analysis_kind, \
                     priority, next_earnings_date, earnings_confirmed, has_open_position, \
                     max_position_pct, tags, notes, expires_at, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15) \
                 ON CONFLICT(ticker) DO UPDATE SET \
                    name = excluded.name, \
                    sector = excluded.sector, \
                    enabled = excluded.enabled, \
                    state = excluded.state, \
                    default_analysis_kind = excluded.default_analysis_kind, \
                    priority = excluded.priority, \
                    next_earnings_date = excluded.next_earnings_date, \
                    earnings_confirmed = excluded.earnings_confirmed, \
                    has_open_position = excluded.has_open_position, \
                    max_position_pct = excluded.max_position_pct, \
                    tags = excluded.tags, \
                    notes = excluded.notes, \
                    expires_at = excluded.expires_at, \
                    updated_at = excluded.updated_at",
                params![
                    s.ticker,
                    s.name,
                    s.sector,
                    s.enabled as i64,
                    s.state.as_str(),
                    s.default_analysis_kind.as_str(),
                    s.priority.clamp(1, 10),
                    s.next_earnings_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    s.earnings_confirmed as i64,
                    s.has_open_position as i64,
                    s.max_position_pct.clamp(0.0, 100.0),
                    serde_json::to_string(&s.tags).unwrap_or_else(|_| "[]".into()),
                    s.notes,
                    s.expires_at,
                    ts,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_stock(&self, ticker: &str) -> StoreResult<Option<Stock>> {
        let ticker = ticker.to_string();
        self.call("get_stock", move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {STOCK_COLS} FROM stocks WHERE ticker = ?1"
            ))?;
            let mut rows = stmt.query(params![ticker])?;
            match rows.next()? {
                Some(row) => Ok(Some(stock_from_row(row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    /// Enabled, non-archived stocks in scheduler dispatch order.
    pub async fn list_enabled_stocks(&self) -> StoreResult<Vec<Stock>> {
        self.call("list_enabled_stocks", move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {STOCK_COLS} FROM stocks \
                 WHERE enabled = 1 AND state != 'archived' \
                 ORDER BY priority DESC, ticker ASC"
            ))?;
            let rows = stmt.query_map([], stock_from_row)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn disable_stock(&self, ticker: &str) -> StoreResult<bool> {
        let ticker = ticker.to_string();
        let ts = Utc::now().timestamp();
        self.call("disable_stock", move |conn| {
            let n = conn.execute(
                "UPDATE stocks SET enabled = 0, updated_at = ?2 WHERE ticker = ?1",
                params![ticker, ts],
            )?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn set_stock_state(&self, ticker: &str, state: StockState) -> StoreResult<bool> {
        let ticker = ticker.to_string();
        let ts = Utc::now().timestamp();
        self.call("set_stock_state", move |conn| {
            let n = conn.execute(
                "UPDATE stocks SET state = ?2, updated_at = ?3 WHERE ticker = ?1",
                params![ticker, state.as_str(), ts],
            )?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn set_earnings(
        &self,
        ticker: &str,
        date: Option<NaiveDate>,
        confirmed: bool,
    ) -> StoreResult<bool> {
        let ticker = ticker.to_string();
        let ts = Utc::now().timestamp();
        self.call("set_earnings", move |conn| {
            let n = conn.execute(
                "UPDATE stocks SET next_earnings_date = ?2, earnings_confirmed = ?3, \
                 updated_at = ?4 WHERE ticker = ?1",
                params![
                    ticker,
                    date.map(|d| d.format("%Y-%m-%d").to_string()),
                    confirmed as i64,
                    ts
                ],
            )?;
            Ok(n > 0)
        })
        .await
    }

    /// Delete a stock. Refused while a non-terminal run references it.
    pub async fn remove_stock(&self, ticker: &str) -> StoreResult<bool> {
        let ticker = ticker.to_string();
        self.call("remove_stock", move |conn| {
            let tx = conn.transaction()?;
            let open: i64 = tx.query_row(
                "SELECT COUNT(*) FROM runs WHERE ticker = ?1 AND status IN ('pending', 'running')",
                params![ticker],
                |row| row.get(0),
            )?;
            if open > 0 {
                // Surfaced as a constraint, not retried.
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
                    Some(format!("{ticker} has {open} open run(s)")),
                ));
            }
            let n = tx.execute("DELETE FROM stocks WHERE ticker = ?1", params![ticker])?;
            tx.commit()?;
            Ok(n > 0)
        })
        .await
    }

    /// Archive every entry whose expiry is past `now`. Returns the tickers
    /// transitioned; archived entries stay on disk for audit.
    pub async fn archive_expired_stocks(&self, now_ts: i64) -> StoreResult<Vec<String>> {
        self.call("archive_expired_stocks", move |conn| {
            let tx = conn.transaction()?;
            let expired: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT ticker FROM stocks \
                     WHERE expires_at IS NOT NULL AND expires_at <= ?1 AND state != 'archived' \
                     ORDER BY ticker ASC",
                )?;
                let rows = stmt.query_map(params![now_ts], |row| row.get(0))?;
                let mut out = Vec::new();
                for r in rows {
                    out.push(r?);
                }
                out
            };
            for ticker in &expired {
                tx.execute(
                    "UPDATE stocks SET state = 'archived', enabled = 0, updated_at = ?2 \
                     WHERE ticker = ?1",
                    params![ticker, now_ts],
                )?;
            }
            tx.commit()?;
            Ok(expired)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ticker: &str, priority: i64) -> Stock {
        Stock {
            ticker: ticker.into(),
            name: None,
            sector: Some("Semiconductors".into()),
            enabled: true,
            state: StockState::Analysis,
            default_analysis_kind: AnalysisKind::Stock,
            priority,
            next_earnings_date: None,
            earnings_confirmed: false,
            has_open_position: false,
            max_position_pct: 5.0,
            tags: vec!["ai".into()],
            notes: None,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn upsert_and_get_round_trip() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_stock(&sample("NVDA", 9)).await.unwrap();
        let got = db.get_stock("NVDA").await.unwrap().unwrap();
        assert_eq!(got.ticker, "NVDA");
        assert_eq!(got.priority, 9);
        assert_eq!(got.tags, vec!["ai".to_string()]);
    }

    #[tokio::test]
    async fn priority_clamped_on_write() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_stock(&sample("AMD", 42)).await.unwrap();
        assert_eq!(db.get_stock("AMD").await.unwrap().unwrap().priority, 10);
    }

    #[tokio::test]
    async fn enabled_list_is_ordered_and_excludes_archived() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_stock(&sample("AMD", 5)).await.unwrap();
        db.upsert_stock(&sample("NVDA", 9)).await.unwrap();
        db.upsert_stock(&sample("AAPL", 9)).await.unwrap();
        let mut archived = sample("INTC", 10);
        archived.state = StockState::Archived;
        db.upsert_stock(&archived).await.unwrap();

        let tickers: Vec<String> = db
            .list_enabled_stocks()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.ticker)
            .collect();
        assert_eq!(tickers, vec!["AAPL", "NVDA", "AMD"]);
    }

    #[tokio::test]
    async fn earnings_update_and_disable() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_stock(&sample("NVDA", 5)).await.unwrap();

        let date = NaiveDate::from_ymd_opt(2026, 8, 26).unwrap();
        assert!(db.set_earnings("NVDA", Some(date), true).await.unwrap());
        let s = db.get_stock("NVDA").await.unwrap().unwrap();
        assert_eq!(s.next_earnings_date, Some(date));
        assert!(s.earnings_confirmed);

        assert!(db.disable_stock("NVDA").await.unwrap());
        assert!(db.list_enabled_stocks().await.unwrap().is_empty());
        assert!(!db.set_earnings("GHOST", None, false).await.unwrap());
    }

    #[tokio::test]
    async fn removal_refused_with_open_runs() {
        let db = Db::open_in_memory().unwrap();
        db.upsert_stock(&sample("NVDA", 5)).await.unwrap();
        use chrono::TimeZone;
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        db.create_adhoc_run(
            crate::models::TaskKind::AnalyzeStock,
            "NVDA",
            AnalysisKind::Stock,
            now,
        )
        .await
        .unwrap();

        let err = db.remove_stock("NVDA").await.unwrap_err();
        assert!(matches!(err, crate::storage::StoreError::Permanent(_)));
    }

    #[tokio::test]
    async fn expiry_sweep_archives() {
        let db = Db::open_in_memory().unwrap();
        let mut s = sample("TSLA", 5);
        s.expires_at = Some(1_000);
        db.upsert_stock(&s).await.unwrap();
        db.upsert_stock(&sample("NVDA", 5)).await.unwrap();

        let swept = db.archive_expired_stocks(2_000).await.unwrap();
        assert_eq!(swept, vec!["TSLA".to_string()]);
        let tsla = db.get_stock("TSLA").await.unwrap().unwrap();
        assert_eq!(tsla.state, StockState::Archived);
        assert!(!tsla.enabled);
        // Idempotent on re-sweep.
        assert!(db.archive_expired_stocks(2_000).await.unwrap().is_empty());
    }
}
