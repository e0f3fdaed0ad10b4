//! Service heartbeat singleton and daily counters.

use super::{Db, StoreResult};
use crate::models::ServiceStatus;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

fn status_from_row(row: &Row<'_>) -> rusqlite::Result<ServiceStatus> {
    Ok(ServiceStatus {
        started_at: row.get("started_at")?,
        last_heartbeat: row.get("last_heartbeat")?,
        last_tick_ms: row.get("last_tick_ms")?,
        state: row.get("state")?,
        current_task: row.get("current_task")?,
        pid: row.get("pid")?,
        host: row.get("host")?,
        total_runs: row.get("total_runs")?,
        total_analyses: row.get("total_analyses")?,
        total_executions: row.get("total_executions")?,
        total_errors: row.get("total_errors")?,
        analyses_today: row.get("analyses_today")?,
        executions_today: row.get("executions_today")?,
        today_date: row.get("today_date")?,
    })
}

const STATUS_COLS: &str = "started_at, last_heartbeat, last_tick_ms, state, current_task, pid, \
     host, total_runs, total_analyses, total_executions, total_errors, analyses_today, \
     executions_today, today_date";

impl Db {
    pub async fn get_service_status(&self) -> StoreResult<Option<ServiceStatus>> {
        self.call("get_service_status", move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {STATUS_COLS} FROM service_status WHERE id = 1"
            ))?;
            stmt.query_row([], status_from_row).optional()
        })
        .await
    }

    /// Claim the singleton row for this process. Cumulative counters survive
    /// restarts; identity and heartbeat fields are overwritten.
    pub async fn register_service_start(
        &self,
        pid: i64,
        host: &str,
        today: &str,
    ) -> StoreResult<()> {
        let host = host.to_string();
        let today = today.to_string();
        let now_ts = Utc::now().timestamp();
        self.call("register_service_start", move |conn| {
            conn.execute(
                "INSERT INTO service_status \
                     (id, started_at, last_heartbeat, state, pid, host, today_date) \
                 VALUES (1, ?1, ?1, 'idle', ?2, ?3, ?4) \
                 ON CONFLICT(id) DO UPDATE SET \
                    started_at = excluded.started_at, \
                    last_heartbeat = excluded.last_heartbeat, \
                    state = excluded.state, \
                    current_task = NULL, \
                    pid = excluded.pid, \
                    host = excluded.host",
                params![now_ts, pid, host, today],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn heartbeat(
        &self,
        state: &str,
        current_task: Option<&str>,
        last_tick_ms: i64,
    ) -> StoreResult<()> {
        let state = state.to_string();
        let current_task = current_task.map(|s| s.to_string());
        let now_ts = Utc::now().timestamp();
        self.call("heartbeat", move |conn| {
            conn.execute(
                "UPDATE service_status SET last_heartbeat = ?1, state = ?2, \
                     current_task = ?3, last_tick_ms = ?4 \
                 WHERE id = 1",
                params![now_ts, state, current_task, last_tick_ms],
            )?;
            Ok(())
        })
        .await
    }

    /// Zero the today-counters when the persisted date differs from `today`.
    /// Returns whether a rollover happened.
    pub async fn rollover_counters_if_new_day(&self, today: &str) -> StoreResult<bool> {
        let today = today.to_string();
        self.call("rollover_counters_if_new_day", move |conn| {
            let n = conn.execute(
                "UPDATE service_status SET analyses_today = 0, executions_today = 0, \
                     today_date = ?1 \
                 WHERE id = 1 AND today_date != ?1",
                params![today],
            )?;
            Ok(n > 0)
        })
        .await
    }

    pub async fn increment_today_analyses(&self) -> StoreResult<()> {
        self.call("increment_today_analyses", move |conn| {
            conn.execute(
                "UPDATE service_status SET analyses_today = analyses_today + 1, \
                     total_analyses = total_analyses + 1 \
                 WHERE id = 1",
                [],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn increment_today_executions(&self) -> StoreResult<()> {
        self.call("increment_today_executions", move |conn| {
            conn.execute(
                "UPDATE service_status SET executions_today = executions_today + 1, \
                     total_executions = total_executions + 1 \
                 WHERE id = 1",
                [],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn analyses_today(&self) -> StoreResult<i64> {
        self.call("analyses_today", move |conn| {
            conn.query_row(
                "SELECT analyses_today FROM service_status WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map(|v| v.unwrap_or(0))
        })
        .await
    }

    pub async fn executions_today(&self) -> StoreResult<i64> {
        self.call("executions_today", move |conn| {
            conn.query_row(
                "SELECT executions_today FROM service_status WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map(|v| v.unwrap_or(0))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_heartbeat() {
        let db = Db::open_in_memory().unwrap();
        db.register_service_start(4242, "host-a", "2026-08-03").await.unwrap();
        db.heartbeat("busy", Some("scheduler"), 125).await.unwrap();

        let st = db.get_service_status().await.unwrap().unwrap();
        assert_eq!(st.pid, 4242);
        assert_eq!(st.host, "host-a");
        assert_eq!(st.state, "busy");
        assert_eq!(st.current_task.as_deref(), Some("scheduler"));
        assert_eq!(st.last_tick_ms, 125);
    }

    #[tokio::test]
    async fn counters_roll_over_once_per_day() {
        let db = Db::open_in_memory().unwrap();
        db.register_service_start(1, "h", "2026-08-03").await.unwrap();
        db.increment_today_analyses().await.unwrap();
        db.increment_today_analyses().await.unwrap();
        db.increment_today_executions().await.unwrap();
        assert_eq!(db.analyses_today().await.unwrap(), 2);
        assert_eq!(db.executions_today().await.unwrap(), 1);

        assert!(!db.rollover_counters_if_new_day("2026-08-03").await.unwrap());
        assert!(db.rollover_counters_if_new_day("2026-08-04").await.unwrap());
        assert_eq!(db.analyses_today().await.unwrap(), 0);

        let st = db.get_service_status().await.unwrap().unwrap();
        // Cumulative counters survive the rollover.
        assert_eq!(st.total_analyses, 2);
        assert_eq!(st.total_executions, 1);
        assert_eq!(st.today_date, "2026-08-04");
    }

    #[tokio::test]
    async fn counters_default_to_zero_without_row() {
        let db = Db::open_in_memory().unwrap();
        assert_eq!(db.analyses_today().await.unwrap(), 0);
    }
}
