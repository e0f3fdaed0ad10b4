//! Schedule persistence: due selection, idempotent start, completion
//! counters, circuit-breaker bookkeeping.

use super::{json_string_vec, Db, StoreResult};
use crate::models::{AnalysisKind, Frequency, RunStatus, Schedule, TaskKind};
use chrono::{DateTime, NaiveTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

/// Attributes for schedule creation. Task kind and frequency are typed, so
/// unknown kinds cannot reach the database.
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub name: String,
    pub task_kind: TaskKind,
    pub ticker: Option<String>,
    pub scanner_id: Option<String>,
    pub tags: Vec<String>,
    pub analysis_kind: AnalysisKind,
    pub frequency: Frequency,
    pub time_of_day: Option<NaiveTime>,
    pub day_of_week: Option<u8>,
    pub interval_minutes: Option<i64>,
    pub days_before_earnings: Option<i64>,
    pub days_after_earnings: Option<i64>,
    pub market_hours_only: bool,
    pub trading_days_only: bool,
    pub priority: i64,
    pub max_runs_per_day: i64,
    pub timeout_seconds: i64,
    pub max_consecutive_fails: i64,
    pub next_run_at: Option<i64>,
}

impl Default for NewSchedule {
    fn default() -> Self {
        Self {
            name: String::new(),
            task_kind: TaskKind::AnalyzeStock,
            ticker: None,
            scanner_id: None,
            tags: Vec::new(),
            analysis_kind: AnalysisKind::Stock,
            frequency: Frequency::Daily,
            time_of_day: None,
            day_of_week: None,
            interval_minutes: None,
            days_before_earnings: None,
            days_after_earnings: None,
            market_hours_only: false,
            trading_days_only: false,
            priority: 5,
            max_runs_per_day: 1,
            timeout_seconds: 600,
            max_consecutive_fails: 3,
            next_run_at: None,
        }
    }
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let task_raw: String = row.get("task_kind")?;
    let kind_raw: String = row.get("analysis_kind")?;
    let freq_raw: String = row.get("frequency")?;
    let tod_raw: Option<String> = row.get("time_of_day")?;
    let status_raw: Option<String> = row.get("last_run_status")?;
    let tags_raw: String = row.get("tags")?;
    Ok(Schedule {
        id: row.get("id")?,
        name: row.get("name")?,
        task_kind: TaskKind::parse(&task_raw).unwrap_or(TaskKind::Custom),
        ticker: row.get("ticker")?,
        scanner_id: row.get("scanner_id")?,
        tags: json_string_vec(&tags_raw),
        analysis_kind: AnalysisKind::parse(&kind_raw).unwrap_or(AnalysisKind::Stock),
        frequency: Frequency::parse(&freq_raw).unwrap_or(Frequency::Once),
        time_of_day: tod_raw.and_then(|s| NaiveTime::parse_from_str(&s, "%H:%M:%S").ok()),
        day_of_week: row.get::<_, Option<i64>>("day_of_week")?.map(|d| d as u8),
        interval_minutes: row.get("interval_minutes")?,
        days_before_earnings: row.get("days_before_earnings")?,
        days_after_earnings: row.get("days_after_earnings")?,
        market_hours_only: row.get::<_, i64>("market_hours_only")? != 0,
        trading_days_only: row.get::<_, i64>("trading_days_only")? != 0,
        priority: row.get("priority")?,
        max_runs_per_day: row.get("max_runs_per_day")?,
        timeout_seconds: row.get("timeout_seconds")?,
        enabled: row.get::<_, i64>("enabled")? != 0,
        run_count: row.get("run_count")?,
        fail_count: row.get("fail_count")?,
        consecutive_fails: row.get("consecutive_fails")?,
        max_consecutive_fails: row.get("max_consecutive_fails")?,
        last_run_at: row.get("last_run_at")?,
        last_run_status: status_raw.and_then(|s| RunStatus::parse(&s)),
        next_run_at: row.get("next_run_at")?,
    })
}

const SCHEDULE_COLS: &str = "id, name, task_kind, ticker, scanner_id, tags, analysis_kind, \
     frequency, time_of_day, day_of_week, interval_minutes, days_before_earnings, \
     days_after_earnings, market_hours_only, trading_days_only, priority, max_runs_per_day, \
     timeout_seconds, enabled, run_count, fail_count, consecutive_fails, max_consecutive_fails, \
     last_run_at, last_run_status, next_run_at";

impl Db {
    pub async fn create_schedule(&self, new: &NewSchedule) -> StoreResult<i64> {
        let n = new.clone();
        let ts = Utc::now().timestamp();
        self.call("create_schedule", move |conn| {
            conn.execute(
                "INSERT INTO schedules (name, task_kind, ticker, scanner_id, tags, analysis_kind, \
                     frequency, time_of_day, day_of_week, interval_minutes, days_before_earnings, \
                     days_after_earnings, market_hours_only, trading_days_only, priority, \
                     max_runs_per_day, timeout_seconds, max_consecutive_fails, next_run_at, \
                     created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                     ?17, ?18, ?19, ?20, ?20)",
                params![
                    n.name,
                    n.task_kind.as_str(),
                    n.ticker,
                    n.scanner_id,
                    serde_json::to_string(&n.tags).unwrap_or_else(|_| "[]".into()),
                    n.analysis_kind.as_str(),
                    n.frequency.as_str(),
                    n.time_of_day.map(|t| t.format("%H:%M:%S").to_string()),
                    n.day_of_week.map(|d| d as i64),
                    n.interval_minutes,
                    n.days_before_earnings,
                    n.days_after_earnings,
                    n.market_hours_only as i64,
                    n.trading_days_only as i64,
                    n.priority.clamp(1, 10),
                    n.max_runs_per_day.max(1),
                    n.timeout_seconds.max(1),
                    n.max_consecutive_fails.max(1),
                    n.next_run_at,
                    ts,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn get_schedule(&self, id: i64) -> StoreResult<Option<Schedule>> {
        self.call("get_schedule", move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SCHEDULE_COLS} FROM schedules WHERE id = ?1"
            ))?;
            stmt.query_row(params![id], schedule_from_row).optional()
        })
        .await
    }

    pub async fn list_schedules(&self) -> StoreResult<Vec<Schedule>> {
        self.call("list_schedules", move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SCHEDULE_COLS} FROM schedules ORDER BY priority DESC, id ASC"
            ))?;
            let rows = stmt.query_map([], schedule_from_row)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    /// Enabled, untripped schedules due at `now`, in stable processing order.
    pub async fn list_due_schedules(&self, now: DateTime<Utc>) -> StoreResult<Vec<Schedule>> {
        let now_ts = now.timestamp();
        self.call("list_due_schedules", move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {SCHEDULE_COLS} FROM schedules \
                 WHERE enabled = 1 \
                   AND next_run_at IS NOT NULL AND next_run_at <= ?1 \
                   AND consecutive_fails < max_consecutive_fails \
                 ORDER BY priority DESC, next_run_at ASC, id ASC"
            ))?;
            let rows = stmt.query_map(params![now_ts], schedule_from_row)?;
            let mut out = Vec::new();
            for r in rows {
                out.push(r?);
            }
            Ok(out)
        })
        .await
    }

    /// Create the run row for a due schedule and bump `run_count`, keyed by
    /// `(schedule_id, tick_key)` with the tick rounded to one second. Replays
    /// of the same tick return the existing run id without a second
    /// increment, so a crash between start and completion cannot double-start.
    pub async fn mark_schedule_started(
        &self,
        schedule: &Schedule,
        ticker: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let schedule_id = schedule.id;
        let task_kind = schedule.task_kind;
        let analysis_kind = schedule.analysis_kind;
        let ticker = ticker.to_string();
        let now_ts = now.timestamp();
        let tick_key = now_ts.to_string();
        self.call("mark_schedule_started", move |conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO runs \
                     (schedule_id, tick_key, task_kind, ticker, analysis_kind, status, started_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6)",
                params![
                    schedule_id,
                    tick_key,
                    task_kind.as_str(),
                    ticker,
                    analysis_kind.as_str(),
                    now_ts
                ],
            )?;
            if inserted > 0 {
                tx.execute(
                    "UPDATE schedules SET run_count = run_count + 1, last_run_at = ?2, \
                     updated_at = ?2 WHERE id = ?1",
                    params![schedule_id, now_ts],
                )?;
                tx.execute(
                    "UPDATE service_status SET total_runs = total_runs + 1 WHERE id = 1",
                    [],
                )?;
            }
            let run_id: i64 = tx.query_row(
                "SELECT id FROM runs WHERE schedule_id = ?1 AND tick_key = ?2",
                params![schedule_id, tick_key],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(run_id)
        })
        .await
    }

    /// Finalize a run and fold the outcome into the schedule's counters:
    /// `completed` resets `consecutive_fails`, `failed` increments both
    /// failure counters. Terminal run states are sinks; a second call is a
    /// no-op on the run row.
    pub async fn mark_schedule_completed(
        &self,
        schedule_id: i64,
        run_id: i64,
        status: RunStatus,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let error = error.map(|e| e.to_string());
        let now_ts = Utc::now().timestamp();
        self.call("mark_schedule_completed", move |conn| {
            let tx = conn.transaction()?;
            let transitioned = tx.execute(
                "UPDATE runs SET status = ?2, completed_at = ?3, error = ?4, \
                     duration_ms = CASE WHEN started_at IS NULL THEN NULL \
                                        ELSE (?3 - started_at) * 1000 END \
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![run_id, status.as_str(), now_ts, error],
            )?;
            // Terminal is a sink: a replayed completion must not move the
            // schedule counters a second time.
            if transitioned == 0 {
                tx.commit()?;
                return Ok(());
            }
            match status {
                RunStatus::Completed => {
                    tx.execute(
                        "UPDATE schedules SET consecutive_fails = 0, last_run_status = ?2, \
                         updated_at = ?3 WHERE id = ?1",
                        params![schedule_id, status.as_str(), now_ts],
                    )?;
                }
                RunStatus::Failed => {
                    tx.execute(
                        "UPDATE schedules SET fail_count = fail_count + 1, \
                             consecutive_fails = consecutive_fails + 1, \
                             last_run_status = ?2, updated_at = ?3 \
                         WHERE id = ?1",
                        params![schedule_id, status.as_str(), now_ts],
                    )?;
                    tx.execute(
                        "UPDATE service_status SET total_errors = total_errors + 1 WHERE id = 1",
                        [],
                    )?;
                }
                _ => {
                    tx.execute(
                        "UPDATE schedules SET last_run_status = ?2, updated_at = ?3 WHERE id = ?1",
                        params![schedule_id, status.as_str(), now_ts],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// `next_run_at` advance (or disable, for `once` schedules).
    pub async fn set_next_run(
        &self,
        schedule_id: i64,
        next_run_at: Option<i64>,
        enabled: Option<bool>,
    ) -> StoreResult<()> {
        let now_ts = Utc::now().timestamp();
        self.call("set_next_run", move |conn| {
            match enabled {
                Some(en) => conn.execute(
                    "UPDATE schedules SET next_run_at = ?2, enabled = ?3, updated_at = ?4 \
                     WHERE id = ?1",
                    params![schedule_id, next_run_at, en as i64, now_ts],
                )?,
                None => conn.execute(
                    "UPDATE schedules SET next_run_at = ?2, updated_at = ?3 WHERE id = ?1",
                    params![schedule_id, next_run_at, now_ts],
                )?,
            };
            Ok(())
        })
        .await
    }

    pub async fn set_schedule_enabled(&self, schedule_id: i64, enabled: bool) -> StoreResult<bool> {
        let now_ts = Utc::now().timestamp();
        self.call("set_schedule_enabled", move |conn| {
            let n = conn.execute(
                "UPDATE schedules SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
                params![schedule_id, enabled as i64, now_ts],
            )?;
            Ok(n > 0)
        })
        .await
    }

    /// Manual circuit-breaker reset.
    pub async fn reset_circuit_breaker(&self, schedule_id: i64) -> StoreResult<bool> {
        let now_ts = Utc::now().timestamp();
        self.call("reset_circuit_breaker", move |conn| {
            let n = conn.execute(
                "UPDATE schedules SET consecutive_fails = 0, updated_at = ?2 WHERE id = ?1",
                params![schedule_id, now_ts],
            )?;
            Ok(n > 0)
        })
        .await
    }

    /// Runs started by this schedule inside the half-open local-day window.
    pub async fn count_schedule_runs_between(
        &self,
        schedule_id: i64,
        start_ts: i64,
        end_ts: i64,
    ) -> StoreResult<i64> {
        self.call("count_schedule_runs_between", move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM runs \
                 WHERE schedule_id = ?1 AND started_at >= ?2 AND started_at < ?3",
                params![schedule_id, start_ts, end_ts],
                |row| row.get(0),
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn due_sched(name: &str, priority: i64, next_run_at: i64) -> NewSchedule {
        NewSchedule {
            name: name.into(),
            ticker: Some("NVDA".into()),
            priority,
            next_run_at: Some(next_run_at),
            ..NewSchedule::default()
        }
    }

    #[tokio::test]
    async fn due_query_filters_and_orders() {
        let db = Db::open_in_memory().unwrap();
        let now = Utc.timestamp_opt(1_000_000, 0).unwrap();

        db.create_schedule(&due_sched("low", 3, 999_000)).await.unwrap();
        db.create_schedule(&due_sched("high-late", 9, 999_500)).await.unwrap();
        db.create_schedule(&due_sched("high-early", 9, 999_100)).await.unwrap();
        db.create_schedule(&due_sched("future", 9, 1_000_001)).await.unwrap();
        let disabled = db.create_schedule(&due_sched("disabled", 9, 999_000)).await.unwrap();
        db.set_schedule_enabled(disabled, false).await.unwrap();

        let names: Vec<String> = db
            .list_due_schedules(now)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["high-early", "high-late", "low"]);
    }

    #[tokio::test]
    async fn start_is_idempotent_per_tick() {
        let db = Db::open_in_memory().unwrap();
        let id = db.create_schedule(&due_sched("s", 5, 0)).await.unwrap();
        let sched = db.get_schedule(id).await.unwrap().unwrap();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let run_a = db.mark_schedule_started(&sched, "NVDA", now).await.unwrap();
        let run_b = db.mark_schedule_started(&sched, "NVDA", now).await.unwrap();
        assert_eq!(run_a, run_b);
        assert_eq!(db.get_schedule(id).await.unwrap().unwrap().run_count, 1);

        // A later tick is a new run.
        let later = Utc.timestamp_opt(1_700_000_001, 0).unwrap();
        let run_c = db.mark_schedule_started(&sched, "NVDA", later).await.unwrap();
        assert_ne!(run_a, run_c);
        assert_eq!(db.get_schedule(id).await.unwrap().unwrap().run_count, 2);
    }

    #[tokio::test]
    async fn completion_counters_follow_status() {
        let db = Db::open_in_memory().unwrap();
        let id = db.create_schedule(&due_sched("s", 5, 0)).await.unwrap();
        let sched = db.get_schedule(id).await.unwrap().unwrap();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let run = db.mark_schedule_started(&sched, "NVDA", now).await.unwrap();
        db.mark_schedule_completed(id, run, RunStatus::Failed, Some("boom"))
            .await
            .unwrap();
        let s = db.get_schedule(id).await.unwrap().unwrap();
        assert_eq!(s.fail_count, 1);
        assert_eq!(s.consecutive_fails, 1);
        assert_eq!(s.last_run_status, Some(RunStatus::Failed));

        let later = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        let run2 = db.mark_schedule_started(&sched, "NVDA", later).await.unwrap();
        db.mark_schedule_completed(id, run2, RunStatus::Completed, None)
            .await
            .unwrap();
        let s = db.get_schedule(id).await.unwrap().unwrap();
        assert_eq!(s.fail_count, 1);
        assert_eq!(s.consecutive_fails, 0);
        assert_eq!(s.last_run_status, Some(RunStatus::Completed));
    }

    #[tokio::test]
    async fn tripped_schedule_excluded_until_reset() {
        let db = Db::open_in_memory().unwrap();
        let id = db
            .create_schedule(&NewSchedule {
                max_consecutive_fails: 2,
                ..due_sched("s", 5, 0)
            })
            .await
            .unwrap();

        for i in 0..2 {
            let sched = db.get_schedule(id).await.unwrap().unwrap();
            let now = Utc.timestamp_opt(1_700_000_000 + i, 0).unwrap();
            let run = db.mark_schedule_started(&sched, "NVDA", now).await.unwrap();
            db.mark_schedule_completed(id, run, RunStatus::Failed, Some("x"))
                .await
                .unwrap();
        }

        let now = Utc.timestamp_opt(1_700_001_000, 0).unwrap();
        assert!(db.list_due_schedules(now).await.unwrap().is_empty());

        db.reset_circuit_breaker(id).await.unwrap();
        assert_eq!(db.list_due_schedules(now).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminal_run_state_is_a_sink() {
        let db = Db::open_in_memory().unwrap();
        let id = db.create_schedule(&due_sched("s", 5, 0)).await.unwrap();
        let sched = db.get_schedule(id).await.unwrap().unwrap();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let run = db.mark_schedule_started(&sched, "NVDA", now).await.unwrap();

        db.mark_schedule_completed(id, run, RunStatus::Completed, None)
            .await
            .unwrap();
        db.mark_schedule_completed(id, run, RunStatus::Failed, Some("late"))
            .await
            .unwrap();

        let row = db.get_run(run).await.unwrap().unwrap();
        assert_eq!(row.status, RunStatus::Completed);
        assert!(row.error.is_none());
    }
}
