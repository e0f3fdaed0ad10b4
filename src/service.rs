//! Long-running service loop: heartbeats, counter rollover, scheduler passes,
//! watchlist maintenance. Single-instance: a fresh heartbeat from another pid
//! refuses startup.

use crate::calendar::TradingCalendar;
use crate::scheduler::Scheduler;
use crate::shutdown::ShutdownToken;
use crate::storage::Db;
use crate::watchlist::WatchlistManager;
use anyhow::{bail, Result};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(30);

pub struct ServiceLoop {
    db: Db,
    calendar: TradingCalendar,
    scheduler: Scheduler,
    watchlist: WatchlistManager,
    tick_interval: Duration,
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

impl ServiceLoop {
    pub fn new(
        db: Db,
        calendar: TradingCalendar,
        scheduler: Scheduler,
        watchlist: WatchlistManager,
        tick_interval: Duration,
    ) -> Self {
        Self {
            db,
            calendar,
            scheduler,
            watchlist,
            tick_interval,
        }
    }

    /// A heartbeat younger than two tick intervals from a different pid means
    /// another instance is alive.
    async fn ensure_single_instance(&self, pid: i64) -> Result<()> {
        if let Some(status) = self.db.get_service_status().await? {
            let age = self.calendar.now().timestamp() - status.last_heartbeat;
            if status.pid != pid && age < 2 * self.tick_interval.as_secs() as i64 {
                bail!(
                    "another instance is running (pid {} on {}, heartbeat {}s ago)",
                    status.pid,
                    status.host,
                    age
                );
            }
        }
        Ok(())
    }

    pub async fn run(&self, shutdown: ShutdownToken) -> Result<()> {
        let pid = std::process::id() as i64;
        self.ensure_single_instance(pid).await?;

        let now = self.calendar.now();
        self.db
            .register_service_start(pid, &hostname(), &self.calendar.local_date_str(now))
            .await?;

        // Single instance: anything still `running` is a crash leftover.
        match self.db.fail_orphaned_runs(now.timestamp() + 1).await {
            Ok(0) => {}
            Ok(n) => warn!(count = n, "failed orphaned runs from previous instance"),
            Err(e) => warn!(error = %e, "orphan sweep failed"),
        }

        info!(pid, tick_secs = self.tick_interval.as_secs(), "service loop started");

        let mut last_tick_ms: i64 = 0;
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let tick_start = Instant::now();
            let now = self.calendar.now();

            if let Err(e) = self
                .db
                .rollover_counters_if_new_day(&self.calendar.local_date_str(now))
                .await
            {
                warn!(error = %e, "counter rollover failed");
            }

            if let Err(e) = self
                .db
                .heartbeat("busy", Some("scheduler pass"), last_tick_ms)
                .await
            {
                warn!(error = %e, "heartbeat failed");
            }

            let summary = self.scheduler.run_pass(now, &shutdown).await;
            if summary.due > 0 {
                info!(
                    due = summary.due,
                    dispatched = summary.dispatched,
                    gated = summary.gated,
                    errors = summary.errors,
                    "scheduler pass finished"
                );
            }

            if let Err(e) = self.watchlist.sweep_expired(now).await {
                warn!(error = %e, "expiry sweep failed");
            }

            last_tick_ms = tick_start.elapsed().as_millis() as i64;
            if let Err(e) = self.db.heartbeat("idle", None, last_tick_ms).await {
                warn!(error = %e, "heartbeat failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.tick_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        if let Err(e) = self.db.heartbeat("stopped", None, last_tick_ms).await {
            warn!(error = %e, "final heartbeat failed");
        }
        info!("service loop stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_instance_refused_while_heartbeat_fresh() {
        let db = Db::open_in_memory().unwrap();
        let calendar = TradingCalendar::new();
        let now = calendar.now();
        db.register_service_start(99_999, "other-host", &calendar.local_date_str(now))
            .await
            .unwrap();
        db.heartbeat("idle", None, 10).await.unwrap();

        let loop_ = ServiceLoop {
            db: db.clone(),
            calendar,
            scheduler: crate::scheduler::Scheduler::new(
                db.clone(),
                crate::settings::Settings::new(db.clone()),
                TradingCalendar::new(),
                std::sync::Arc::new(crate::pipeline::Pipeline::new(
                    db.clone(),
                    crate::settings::Settings::new(db.clone()),
                    TradingCalendar::new(),
                    std::sync::Arc::new(NoopInvoker),
                    None,
                    None,
                    std::env::temp_dir(),
                )),
            ),
            watchlist: WatchlistManager::new(db),
            tick_interval: DEFAULT_TICK_INTERVAL,
        };
        let err = loop_.ensure_single_instance(1).await.unwrap_err();
        assert!(err.to_string().contains("another instance"));
        // Same pid is allowed (restart-in-place).
        loop_.ensure_single_instance(99_999).await.unwrap();
    }

    struct NoopInvoker;
    #[async_trait::async_trait]
    impl crate::reasoning::ReasoningInvoker for NoopInvoker {
        async fn invoke(
            &self,
            req: crate::reasoning::ReasoningRequest,
            _shutdown: &ShutdownToken,
        ) -> Result<String, crate::reasoning::ReasoningError> {
            Ok(format!("[DRY-RUN] {}", req.label))
        }
    }
}
