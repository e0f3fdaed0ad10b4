//! Watchlist lifecycle: add/remove, state transitions, expiry sweep.

use crate::models::{normalize_ticker, Stock, StockState};
use crate::storage::Db;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;

#[derive(Clone)]
pub struct WatchlistManager {
    db: Db,
}

impl WatchlistManager {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn add(&self, mut stock: Stock, actor: &str) -> Result<Stock> {
        stock.ticker = normalize_ticker(&stock.ticker)?;
        self.db.upsert_stock(&stock).await?;
        self.db
            .log_event(
                "watchlist.add",
                actor,
                "stock",
                &stock.ticker,
                "ok",
                &json!({ "state": stock.state.as_str(), "priority": stock.priority }),
            )
            .await?;
        info!(ticker = %stock.ticker, "stock added to watchlist");
        Ok(stock)
    }

    pub async fn remove(&self, ticker: &str, actor: &str) -> Result<bool> {
        let ticker = normalize_ticker(ticker)?;
        let removed = self.db.remove_stock(&ticker).await?;
        self.db
            .log_event(
                "watchlist.remove",
                actor,
                "stock",
                &ticker,
                if removed { "ok" } else { "not_found" },
                &json!({}),
            )
            .await?;
        Ok(removed)
    }

    pub async fn set_state(&self, ticker: &str, state: StockState, actor: &str) -> Result<bool> {
        let ticker = normalize_ticker(ticker)?;
        let changed = self.db.set_stock_state(&ticker, state).await?;
        self.db
            .log_event(
                "watchlist.set_state",
                actor,
                "stock",
                &ticker,
                if changed { "ok" } else { "not_found" },
                &json!({ "state": state.as_str() }),
            )
            .await?;
        Ok(changed)
    }

    /// Archive entries whose expiry has passed. Kept for audit, excluded from
    /// the enabled listing.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let swept = self.db.archive_expired_stocks(now.timestamp()).await?;
        for ticker in &swept {
            self.db
                .log_event(
                    "watchlist.expired",
                    "service",
                    "stock",
                    ticker,
                    "ok",
                    &json!({}),
                )
                .await?;
            info!(ticker = %ticker, "watchlist entry expired, archived");
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnalysisKind;
    use chrono::TimeZone;

    fn stock(ticker: &str) -> Stock {
        Stock {
            ticker: ticker.into(),
            name: None,
            sector: None,
            enabled: true,
            state: StockState::Analysis,
            default_analysis_kind: AnalysisKind::Stock,
            priority: 5,
            next_earnings_date: None,
            earnings_confirmed: false,
            has_open_position: false,
            max_position_pct: 5.0,
            tags: vec![],
            notes: None,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn add_normalizes_ticker() {
        let mgr = WatchlistManager::new(Db::open_in_memory().unwrap());
        let added = mgr.add(stock("nvda"), "test").await.unwrap();
        assert_eq!(added.ticker, "NVDA");
        assert!(mgr.remove("NVDA", "test").await.unwrap());
    }

    #[tokio::test]
    async fn invalid_ticker_rejected() {
        let mgr = WatchlistManager::new(Db::open_in_memory().unwrap());
        assert!(mgr.add(stock("NOT A TICKER"), "test").await.is_err());
    }

    #[tokio::test]
    async fn sweep_archives_expired_entries() {
        let db = Db::open_in_memory().unwrap();
        let mgr = WatchlistManager::new(db.clone());
        let mut s = stock("TSLA");
        s.expires_at = Some(500);
        mgr.add(s, "test").await.unwrap();
        mgr.add(stock("NVDA"), "test").await.unwrap();

        let now = Utc.timestamp_opt(1_000, 0).unwrap();
        let swept = mgr.sweep_expired(now).await.unwrap();
        assert_eq!(swept, vec!["TSLA".to_string()]);
        assert_eq!(
            db.get_stock("TSLA").await.unwrap().unwrap().state,
            StockState::Archived
        );
    }
}
