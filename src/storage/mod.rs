//! Persistence layer.
//!
//! Typed operations over a single SQLite database (WAL mode). Callers never
//! see raw SQL. Every operation runs in its own short transaction; writers
//! retry transient conflicts with backoff before surfacing.

mod runs;
mod schedules;
mod status;
mod stocks;

pub use schedules::NewSchedule;

use anyhow::Context as _;
use chrono::Utc;
use rand::Rng;
use rusqlite::{params, Connection, ErrorCode};
use serde_json::Value;
use std::{path::Path, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Retriable: lock contention, busy database, I/O hiccups.
    #[error("transient persistence error: {0}")]
    Transient(String),
    /// Not retried: schema/constraint violations and the like.
    #[error("permanent persistence error: {0}")]
    Permanent(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(ffi, _) => match ffi.code {
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::CannotOpen => StoreError::Transient(e.to_string()),
                ErrorCode::ConstraintViolation => StoreError::Permanent(e.to_string()),
                _ => StoreError::Permanent(e.to_string()),
            },
            _ => StoreError::Permanent(e.to_string()),
        }
    }
}

const MAX_RETRIES: u32 = 3;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS stocks (
    ticker TEXT PRIMARY KEY,
    name TEXT,
    sector TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    state TEXT NOT NULL DEFAULT 'analysis',
    default_analysis_kind TEXT NOT NULL DEFAULT 'stock',
    priority INTEGER NOT NULL DEFAULT 5,
    next_earnings_date TEXT,
    earnings_confirmed INTEGER NOT NULL DEFAULT 0,
    has_open_position INTEGER NOT NULL DEFAULT 0,
    max_position_pct REAL NOT NULL DEFAULT 5.0,
    tags TEXT NOT NULL DEFAULT '[]',
    notes TEXT,
    expires_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_stocks_enabled
    ON stocks(enabled, priority DESC, ticker ASC);

CREATE TABLE IF NOT EXISTS schedules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    task_kind TEXT NOT NULL,
    ticker TEXT,
    scanner_id TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    analysis_kind TEXT NOT NULL DEFAULT 'stock',
    frequency TEXT NOT NULL,
    time_of_day TEXT,
    day_of_week INTEGER,
    interval_minutes INTEGER,
    days_before_earnings INTEGER,
    days_after_earnings INTEGER,
    market_hours_only INTEGER NOT NULL DEFAULT 0,
    trading_days_only INTEGER NOT NULL DEFAULT 0,
    priority INTEGER NOT NULL DEFAULT 5,
    max_runs_per_day INTEGER NOT NULL DEFAULT 1,
    timeout_seconds INTEGER NOT NULL DEFAULT 600,
    enabled INTEGER NOT NULL DEFAULT 1,
    run_count INTEGER NOT NULL DEFAULT 0,
    fail_count INTEGER NOT NULL DEFAULT 0,
    consecutive_fails INTEGER NOT NULL DEFAULT 0,
    max_consecutive_fails INTEGER NOT NULL DEFAULT 3,
    last_run_at INTEGER,
    last_run_status TEXT,
    next_run_at INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_schedules_due
    ON schedules(enabled, next_run_at);

CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_id INTEGER,
    tick_key TEXT,
    task_kind TEXT NOT NULL,
    ticker TEXT NOT NULL,
    analysis_kind TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    stage TEXT,
    gate_passed INTEGER NOT NULL DEFAULT 0,
    recommendation TEXT,
    confidence INTEGER,
    expected_value_pct REAL,
    order_placed INTEGER NOT NULL DEFAULT 0,
    order_id TEXT,
    artifact_path TEXT,
    started_at INTEGER,
    completed_at INTEGER,
    duration_ms INTEGER,
    error TEXT,
    raw_output TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_tick
    ON runs(schedule_id, tick_key);
CREATE INDEX IF NOT EXISTS idx_runs_schedule_started
    ON runs(schedule_id, started_at DESC);
CREATE INDEX IF NOT EXISTS idx_runs_status
    ON runs(status, started_at DESC);

CREATE TABLE IF NOT EXISTS analysis_results (
    run_id INTEGER PRIMARY KEY,
    ticker TEXT NOT NULL,
    analysis_kind TEXT NOT NULL,
    gate_passed INTEGER NOT NULL DEFAULT 0,
    recommendation TEXT NOT NULL DEFAULT 'UNKNOWN',
    confidence INTEGER NOT NULL DEFAULT 0,
    adjusted_confidence INTEGER,
    confidence_modifiers TEXT,
    expected_value_pct REAL NOT NULL DEFAULT 0.0,
    entry_price REAL,
    stop_price REAL,
    target_price REAL,
    position_size_pct REAL,
    trade_structure TEXT,
    expiry TEXT,
    strikes TEXT,
    rationale TEXT,
    snapshot_price REAL,
    implied_vol REAL,
    doc_id TEXT,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_results_ticker_created
    ON analysis_results(ticker, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_results_doc_id
    ON analysis_results(doc_id);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    category TEXT NOT NULL DEFAULT 'general',
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS service_status (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    started_at INTEGER NOT NULL,
    last_heartbeat INTEGER NOT NULL,
    last_tick_ms INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL DEFAULT 'idle',
    current_task TEXT,
    pid INTEGER NOT NULL,
    host TEXT NOT NULL,
    total_runs INTEGER NOT NULL DEFAULT 0,
    total_analyses INTEGER NOT NULL DEFAULT 0,
    total_executions INTEGER NOT NULL DEFAULT 0,
    total_errors INTEGER NOT NULL DEFAULT 0,
    analyses_today INTEGER NOT NULL DEFAULT 0,
    executions_today INTEGER NOT NULL DEFAULT 0,
    today_date TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    ts INTEGER NOT NULL,
    action TEXT NOT NULL,
    actor TEXT NOT NULL,
    resource_kind TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    result TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_log(ts DESC);
"#;

#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open database {}", db_path.display()))?;
        conn.execute_batch(SCHEMA_SQL).context("apply schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Test construction; same schema, no file.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        conn.execute_batch(SCHEMA_SQL).context("apply schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run one operation against the connection, retrying transient failures
    /// with jittered backoff. The closure must be safe to re-run (every caller
    /// wraps a single statement or a full BEGIN..COMMIT transaction).
    pub(crate) async fn call<T, F>(&self, op: &'static str, mut f: F) -> StoreResult<T>
    where
        F: FnMut(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut attempt: u32 = 0;
        loop {
            let res = {
                let mut conn = self.conn.lock().await;
                f(&mut conn)
            };
            match res {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let err = StoreError::from(e);
                    match err {
                        StoreError::Transient(_) if attempt < MAX_RETRIES => {
                            attempt += 1;
                            let jitter = rand::thread_rng().gen_range(0..25u64);
                            let backoff =
                                Duration::from_millis(50 * 2u64.pow(attempt - 1) + jitter);
                            warn!(op, attempt, error = %err, "transient persistence error, retrying");
                            tokio::time::sleep(backoff).await;
                        }
                        _ => return Err(err),
                    }
                }
            }
        }
    }

    /// Append-only audit trail. Observational; never read for decisions.
    pub async fn log_event(
        &self,
        action: &str,
        actor: &str,
        resource_kind: &str,
        resource_id: &str,
        result: &str,
        details: &Value,
    ) -> StoreResult<()> {
        let id = Uuid::new_v4().to_string();
        let ts = Utc::now().timestamp();
        let action = action.to_string();
        let actor = actor.to_string();
        let resource_kind = resource_kind.to_string();
        let resource_id = resource_id.to_string();
        let result = result.to_string();
        let details = details.to_string();
        self.call("log_event", move |conn| {
            conn.execute(
                "INSERT INTO audit_log (id, ts, action, actor, resource_kind, resource_id, result, details) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![id, ts, action, actor, resource_kind, resource_id, result, details],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_setting(&self, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        self.call("get_setting", move |conn| {
            let mut stmt = conn.prepare_cached("SELECT value FROM settings WHERE key = ?1")?;
            let mut rows = stmt.query(params![key])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get(0)?)),
                None => Ok(None),
            }
        })
        .await
    }

    pub async fn set_setting(&self, key: &str, value: &str, category: &str) -> StoreResult<()> {
        let key = key.to_string();
        let value = value.to_string();
        let category = category.to_string();
        let ts = Utc::now().timestamp();
        self.call("set_setting", move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value, category, updated_at) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(key) DO UPDATE SET \
                    value = excluded.value, \
                    category = excluded.category, \
                    updated_at = excluded.updated_at",
                params![key, value, category, ts],
            )?;
            Ok(())
        })
        .await
    }
}

pub(crate) fn json_string_vec(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}
