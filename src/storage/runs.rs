//! Run and analysis-result persistence.

use super::{Db, StoreResult};
use crate::models::{
    AnalysisKind, AnalysisRecord, ParsedAnalysis, Recommendation, Run, RunStatus, TaskKind,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use std::collections::BTreeMap;

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    let task_raw: String = row.get("task_kind")?;
    let kind_raw: String = row.get("analysis_kind")?;
    let status_raw: String = row.get("status")?;
    let rec_raw: Option<String> = row.get("recommendation")?;
    Ok(Run {
        id: row.get("id")?,
        schedule_id: row.get("schedule_id")?,
        task_kind: TaskKind::parse(&task_raw).unwrap_or(TaskKind::Custom),
        ticker: row.get("ticker")?,
        analysis_kind: AnalysisKind::parse(&kind_raw).unwrap_or(AnalysisKind::Stock),
        status: RunStatus::parse(&status_raw).unwrap_or(RunStatus::Pending),
        stage: row.get("stage")?,
        gate_passed: row.get::<_, i64>("gate_passed")? != 0,
        recommendation: rec_raw.map(|s| Recommendation::parse(&s)),
        confidence: row.get("confidence")?,
        expected_value_pct: row.get("expected_value_pct")?,
        order_placed: row.get::<_, i64>("order_placed")? != 0,
        order_id: row.get("order_id")?,
        artifact_path: row.get("artifact_path")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        duration_ms: row.get("duration_ms")?,
        error: row.get("error")?,
        raw_output: row.get("raw_output")?,
    })
}

fn result_from_row(row: &Row<'_>) -> rusqlite::Result<AnalysisRecord> {
    let kind_raw: String = row.get("analysis_kind")?;
    let rec_raw: String = row.get("recommendation")?;
    let modifiers_raw: Option<String> = row.get("confidence_modifiers")?;
    Ok(AnalysisRecord {
        run_id: row.get("run_id")?,
        ticker: row.get("ticker")?,
        analysis_kind: AnalysisKind::parse(&kind_raw).unwrap_or(AnalysisKind::Stock),
        gate_passed: row.get::<_, i64>("gate_passed")? != 0,
        recommendation: Recommendation::parse(&rec_raw),
        confidence: row.get("confidence")?,
        adjusted_confidence: row.get("adjusted_confidence")?,
        confidence_modifiers: modifiers_raw.and_then(|s| serde_json::from_str(&s).ok()),
        expected_value_pct: row.get("expected_value_pct")?,
        entry_price: row.get("entry_price")?,
        stop_price: row.get("stop_price")?,
        target_price: row.get("target_price")?,
        position_size_pct: row.get("position_size_pct")?,
        trade_structure: row.get("trade_structure")?,
        expiry: row.get("expiry")?,
        strikes: row.get("strikes")?,
        rationale: row.get("rationale")?,
        snapshot_price: row.get("snapshot_price")?,
        implied_vol: row.get("implied_vol")?,
        doc_id: row.get("doc_id")?,
        created_at: row.get("created_at")?,
    })
}

const RUN_COLS: &str = "id, schedule_id, task_kind, ticker, analysis_kind, status, stage, \
     gate_passed, recommendation, confidence, expected_value_pct, order_placed, order_id, \
     artifact_path, started_at, completed_at, duration_ms, error, raw_output";

const RESULT_COLS: &str = "run_id, ticker, analysis_kind, gate_passed, recommendation, \
     confidence, adjusted_confidence, confidence_modifiers, expected_value_pct, entry_price, \
     stop_price, target_price, position_size_pct, trade_structure, expiry, strikes, rationale, \
     snapshot_price, implied_vol, doc_id, created_at";

impl Db {
    /// Run row for an invocation without a backing schedule.
    pub async fn create_adhoc_run(
        &self,
        task_kind: TaskKind,
        ticker: &str,
        analysis_kind: AnalysisKind,
        now: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let ticker = ticker.to_string();
        let now_ts = now.timestamp();
        self.call("create_adhoc_run", move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO runs (schedule_id, tick_key, task_kind, ticker, analysis_kind, \
                     status, started_at) \
                 VALUES (NULL, NULL, ?1, ?2, ?3, 'running', ?4)",
                params![task_kind.as_str(), ticker, analysis_kind.as_str(), now_ts],
            )?;
            tx.execute(
                "UPDATE service_status SET total_runs = total_runs + 1 WHERE id = 1",
                [],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    pub async fn get_run(&self, run_id: i64) -> StoreResult<Option<Run>> {
        self.call("get_run", move |conn| {
            let mut stmt =
                conn.prepare_cached(&format!("SELECT {RUN_COLS} FROM runs WHERE id = ?1"))?;
            stmt.query_row(params![run_id], run_from_row).optional()
        })
        .await
    }

    pub async fn list_recent_runs(&self, limit: usize) -> StoreResult<Vec<Run>> {
        let limit = limit.clamp(1, 1000) as i64;
        self.call("list_recent_runs", move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {RUN_COLS} FROM runs ORDER BY id DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit], run_from_row)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    /// Progress label. Intermediate state only; terminal status is published
    /// solely through the completion path.
    pub async fn update_run_stage(&self, run_id: i64, stage: &str) -> StoreResult<()> {
        let stage = stage.to_string();
        self.call("update_run_stage", move |conn| {
            conn.execute(
                "UPDATE runs SET stage = ?2 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![run_id, stage],
            )?;
            Ok(())
        })
        .await
    }

    /// Attach the phase-1 artifact and parsed summary to the run row.
    pub async fn update_run_output(
        &self,
        run_id: i64,
        parsed: &ParsedAnalysis,
        artifact_path: &str,
        raw_output: &str,
    ) -> StoreResult<()> {
        let p = parsed.clone();
        let artifact_path = artifact_path.to_string();
        let raw_output = raw_output.to_string();
        self.call("update_run_output", move |conn| {
            conn.execute(
                "UPDATE runs SET gate_passed = ?2, recommendation = ?3, confidence = ?4, \
                     expected_value_pct = ?5, artifact_path = ?6, raw_output = ?7 \
                 WHERE id = ?1",
                params![
                    run_id,
                    p.gate_passed as i64,
                    p.recommendation.as_str(),
                    p.confidence,
                    p.expected_value_pct,
                    artifact_path,
                    raw_output
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Terminal transition for ad-hoc runs (no schedule counters involved).
    pub async fn mark_run_terminal(
        &self,
        run_id: i64,
        status: RunStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let error = error.map(|e| e.to_string());
        let now_ts = Utc::now().timestamp();
        self.call("mark_run_terminal", move |conn| {
            conn.execute(
                "UPDATE runs SET status = ?2, completed_at = ?3, error = ?4, \
                     duration_ms = CASE WHEN started_at IS NULL THEN NULL \
                                        ELSE (?3 - started_at) * 1000 END \
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![run_id, status.as_str(), now_ts, error],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_run_order(
        &self,
        run_id: i64,
        order_placed: bool,
        order_id: Option<&str>,
    ) -> StoreResult<()> {
        let order_id = order_id.map(|s| s.to_string());
        self.call("set_run_order", move |conn| {
            conn.execute(
                "UPDATE runs SET order_placed = ?2, order_id = ?3 WHERE id = ?1",
                params![run_id, order_placed as i64, order_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Crash-replay hygiene: fail any `running` run started before the cutoff.
    pub async fn fail_orphaned_runs(&self, started_before_ts: i64) -> StoreResult<usize> {
        let now_ts = Utc::now().timestamp();
        self.call("fail_orphaned_runs", move |conn| {
            let n = conn.execute(
                "UPDATE runs SET status = 'failed', error = 'orphaned', completed_at = ?2, \
                     duration_ms = CASE WHEN started_at IS NULL THEN NULL \
                                        ELSE (?2 - started_at) * 1000 END \
                 WHERE status = 'running' AND started_at < ?1",
                params![started_before_ts, now_ts],
            )?;
            Ok(n)
        })
        .await
    }

    pub async fn save_analysis_result(&self, rec: &AnalysisRecord) -> StoreResult<()> {
        let r = rec.clone();
        self.call("save_analysis_result", move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO analysis_results \
                     (run_id, ticker, analysis_kind, gate_passed, recommendation, confidence, \
                      adjusted_confidence, confidence_modifiers, expected_value_pct, entry_price, \
                      stop_price, target_price, position_size_pct, trade_structure, expiry, \
                      strikes, rationale, snapshot_price, implied_vol, doc_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                     ?17, ?18, ?19, ?20, ?21)",
                params![
                    r.run_id,
                    r.ticker,
                    r.analysis_kind.as_str(),
                    r.gate_passed as i64,
                    r.recommendation.as_str(),
                    r.confidence,
                    r.adjusted_confidence,
                    r.confidence_modifiers
                        .as_ref()
                        .map(|m| serde_json::to_string(m).unwrap_or_else(|_| "{}".into())),
                    r.expected_value_pct,
                    r.entry_price,
                    r.stop_price,
                    r.target_price,
                    r.position_size_pct,
                    r.trade_structure,
                    r.expiry,
                    r.strikes,
                    r.rationale,
                    r.snapshot_price,
                    r.implied_vol,
                    r.doc_id,
                    r.created_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Adjusted confidence and its modifiers land in one statement so readers
    /// never see one without the other.
    pub async fn update_analysis_confidence(
        &self,
        run_id: i64,
        adjusted: i64,
        modifiers: &BTreeMap<String, i64>,
    ) -> StoreResult<()> {
        let modifiers_json = serde_json::to_string(modifiers).unwrap_or_else(|_| "{}".into());
        self.call("update_analysis_confidence", move |conn| {
            conn.execute(
                "UPDATE analysis_results SET adjusted_confidence = ?2, \
                     confidence_modifiers = ?3 \
                 WHERE run_id = ?1",
                params![run_id, adjusted, modifiers_json],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_analysis_result(&self, run_id: i64) -> StoreResult<Option<AnalysisRecord>> {
        self.call("get_analysis_result", move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {RESULT_COLS} FROM analysis_results WHERE run_id = ?1"
            ))?;
            stmt.query_row(params![run_id], result_from_row).optional()
        })
        .await
    }

    /// Most recent results for a ticker, newest first. Feeds the pattern vote
    /// and the synthesis history table.
    pub async fn list_recent_results(
        &self,
        ticker: &str,
        limit: usize,
    ) -> StoreResult<Vec<AnalysisRecord>> {
        let ticker = ticker.to_string();
        let limit = limit.clamp(1, 100) as i64;
        self.call("list_recent_results", move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {RESULT_COLS} FROM analysis_results WHERE ticker = ?1 \
                 ORDER BY created_at DESC, run_id DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![ticker, limit], result_from_row)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn count_results(&self, ticker: &str) -> StoreResult<i64> {
        let ticker = ticker.to_string();
        self.call("count_results", move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM analysis_results WHERE ticker = ?1",
                params![ticker],
                |row| row.get(0),
            )
        })
        .await
    }

    /// Results keyed by ingested document id; used to enrich retrieval hits.
    pub async fn get_results_by_doc_ids(
        &self,
        doc_ids: &[String],
    ) -> StoreResult<Vec<AnalysisRecord>> {
        if doc_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = doc_ids.to_vec();
        self.call("get_results_by_doc_ids", move |conn| {
            let placeholders = std::iter::repeat("?")
                .take(ids.len())
                .collect::<Vec<_>>()
                .join(", ");
            let mut stmt = conn.prepare(&format!(
                "SELECT {RESULT_COLS} FROM analysis_results WHERE doc_id IN ({placeholders})"
            ))?;
            let rows = stmt.query_map(params_from_iter(ids.iter()), result_from_row)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(run_id: i64, ticker: &str, rec: Recommendation, created_at: i64) -> AnalysisRecord {
        AnalysisRecord {
            run_id,
            ticker: ticker.into(),
            analysis_kind: AnalysisKind::Stock,
            gate_passed: true,
            recommendation: rec,
            confidence: 70,
            adjusted_confidence: None,
            confidence_modifiers: None,
            expected_value_pct: 10.0,
            entry_price: Some(100.0),
            stop_price: Some(90.0),
            target_price: Some(120.0),
            position_size_pct: Some(2.5),
            trade_structure: Some("shares".into()),
            expiry: None,
            strikes: None,
            rationale: Some("momentum".into()),
            snapshot_price: Some(101.5),
            implied_vol: Some(0.42),
            doc_id: Some(format!("{ticker}_stock_20260801T10{run_id:02}")),
            created_at,
        }
    }

    #[tokio::test]
    async fn analysis_result_round_trip_is_lossless() {
        let db = Db::open_in_memory().unwrap();
        let rec = record(1, "NVDA", Recommendation::Buy, 1_000);
        db.save_analysis_result(&rec).await.unwrap();
        let got = db.get_analysis_result(1).await.unwrap().unwrap();
        assert_eq!(got.ticker, rec.ticker);
        assert_eq!(got.recommendation, rec.recommendation);
        assert_eq!(got.confidence, rec.confidence);
        assert_eq!(got.entry_price, rec.entry_price);
        assert_eq!(got.implied_vol, rec.implied_vol);
        assert_eq!(got.doc_id, rec.doc_id);
        assert_eq!(got.created_at, rec.created_at);
    }

    #[tokio::test]
    async fn confidence_update_is_atomic_pair() {
        let db = Db::open_in_memory().unwrap();
        db.save_analysis_result(&record(1, "NVDA", Recommendation::Buy, 1_000))
            .await
            .unwrap();
        let mut modifiers = BTreeMap::new();
        modifiers.insert("first_analysis".to_string(), -10);
        modifiers.insert("no_graph".to_string(), -5);
        db.update_analysis_confidence(1, 61, &modifiers).await.unwrap();

        let got = db.get_analysis_result(1).await.unwrap().unwrap();
        assert_eq!(got.adjusted_confidence, Some(61));
        assert_eq!(got.confidence_modifiers, Some(modifiers));
    }

    #[tokio::test]
    async fn recent_results_ordered_newest_first() {
        let db = Db::open_in_memory().unwrap();
        db.save_analysis_result(&record(1, "NVDA", Recommendation::Buy, 100))
            .await
            .unwrap();
        db.save_analysis_result(&record(2, "NVDA", Recommendation::Sell, 300))
            .await
            .unwrap();
        db.save_analysis_result(&record(3, "NVDA", Recommendation::Wait, 200))
            .await
            .unwrap();
        db.save_analysis_result(&record(4, "AMD", Recommendation::Buy, 400))
            .await
            .unwrap();

        let recs: Vec<Recommendation> = db
            .list_recent_results("NVDA", 3)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.recommendation)
            .collect();
        assert_eq!(
            recs,
            vec![
                Recommendation::Sell,
                Recommendation::Wait,
                Recommendation::Buy
            ]
        );
    }

    #[tokio::test]
    async fn orphaned_runs_failed_on_sweep() {
        let db = Db::open_in_memory().unwrap();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let run = db
            .create_adhoc_run(TaskKind::AnalyzeStock, "NVDA", AnalysisKind::Stock, now)
            .await
            .unwrap();

        let swept = db.fail_orphaned_runs(1_700_000_100).await.unwrap();
        assert_eq!(swept, 1);
        let row = db.get_run(run).await.unwrap().unwrap();
        assert_eq!(row.status, RunStatus::Failed);
        assert_eq!(row.error.as_deref(), Some("orphaned"));
    }

    #[tokio::test]
    async fn order_fields_recorded_by_execution_stage() {
        let db = Db::open_in_memory().unwrap();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let run = db
            .create_adhoc_run(TaskKind::Pipeline, "NVDA", AnalysisKind::Stock, now)
            .await
            .unwrap();
        db.set_run_order(run, true, Some("IB-123")).await.unwrap();
        let row = db.get_run(run).await.unwrap().unwrap();
        assert!(row.order_placed);
        assert_eq!(row.order_id.as_deref(), Some("IB-123"));
    }

    #[tokio::test]
    async fn doc_id_lookup_matches() {
        let db = Db::open_in_memory().unwrap();
        db.save_analysis_result(&record(1, "NVDA", Recommendation::Buy, 100))
            .await
            .unwrap();
        db.save_analysis_result(&record(2, "AMD", Recommendation::Sell, 200))
            .await
            .unwrap();

        let hits = db
            .get_results_by_doc_ids(&["NVDA_stock_20260801T1001".to_string()])
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].ticker, "NVDA");
    }
}
