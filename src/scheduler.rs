//! Scheduler: one pass over due schedules per tick.
//!
//! Gates (market hours, trading day, per-schedule daily cap) skip without
//! state change; dispatch goes through the pipeline; `next_run_at` advances
//! after every processed schedule. One schedule's failure never aborts the
//! pass.

use crate::calendar::TradingCalendar;
use crate::models::{
    AnalysisKind, Frequency, RunStatus, Schedule, Stock, TaskKind, PORTFOLIO_TICKER,
};
use crate::pipeline::Pipeline;
use crate::settings::Settings;
use crate::shutdown::ShutdownToken;
use crate::storage::Db;
use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const WATCHLIST_BATCH_TICKER: &str = "WATCHLIST";

#[derive(Debug, Default, Clone)]
pub struct PassSummary {
    pub due: usize,
    pub dispatched: usize,
    pub gated: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct Scheduler {
    db: Db,
    settings: Settings,
    calendar: TradingCalendar,
    pipeline: Arc<Pipeline>,
}

impl Scheduler {
    pub fn new(
        db: Db,
        settings: Settings,
        calendar: TradingCalendar,
        pipeline: Arc<Pipeline>,
    ) -> Self {
        Self {
            db,
            settings,
            calendar,
            pipeline,
        }
    }

    pub async fn run_pass(&self, now: DateTime<Utc>, shutdown: &ShutdownToken) -> PassSummary {
        let mut summary = PassSummary::default();

        let due = match self.db.list_due_schedules(now).await {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "due-schedule query failed, skipping pass");
                summary.errors += 1;
                return summary;
            }
        };
        summary.due = due.len();

        for schedule in due {
            if shutdown.is_cancelled() {
                break;
            }

            match self.gated(&schedule, now).await {
                Ok(false) => {}
                Ok(true) => {
                    summary.gated += 1;
                    continue;
                }
                Err(e) => {
                    warn!(schedule = %schedule.name, error = %e, "gate check failed");
                    summary.errors += 1;
                    continue;
                }
            }

            debug!(schedule = %schedule.name, task = schedule.task_kind.as_str(), "dispatching");
            if let Err(e) = self.dispatch(&schedule, now, shutdown).await {
                warn!(schedule = %schedule.name, error = %e, "dispatch failed");
                summary.errors += 1;
            } else {
                summary.dispatched += 1;
            }

            if let Err(e) = self.advance(&schedule, now).await {
                warn!(schedule = %schedule.name, error = %e, "next-run advance failed");
                summary.errors += 1;
            }
        }

        summary
    }

    /// Skip-without-state-change gates.
    async fn gated(&self, schedule: &Schedule, now: DateTime<Utc>) -> anyhow::Result<bool> {
        if schedule.market_hours_only && !self.calendar.is_market_hours(now) {
            debug!(schedule = %schedule.name, "outside market hours");
            return Ok(true);
        }
        if schedule.trading_days_only && !self.calendar.is_trading_day(self.calendar.local_date(now))
        {
            debug!(schedule = %schedule.name, "not a trading day");
            return Ok(true);
        }

        let day = self.calendar.local_date(now);
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
        let day_start = self.calendar.at_local(day, midnight).timestamp();
        let day_end = self
            .calendar
            .at_local(day + Duration::days(1), midnight)
            .timestamp();
        let runs_today = self
            .db
            .count_schedule_runs_between(schedule.id, day_start, day_end)
            .await?;
        if runs_today >= schedule.max_runs_per_day {
            debug!(schedule = %schedule.name, runs_today, "daily run cap reached");
            return Ok(true);
        }
        Ok(false)
    }

    async fn dispatch(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
        shutdown: &ShutdownToken,
    ) -> anyhow::Result<()> {
        match schedule.task_kind {
            TaskKind::AnalyzeStock => {
                let Some(ticker) = schedule.ticker.clone() else {
                    anyhow::bail!("analyze_stock schedule without ticker");
                };
                self.pipeline
                    .run_analysis(&ticker, schedule.analysis_kind, Some(schedule), shutdown)
                    .await?;
            }
            TaskKind::AnalyzeWatchlist => {
                self.run_watchlist(schedule, now, shutdown).await?;
            }
            TaskKind::Pipeline => {
                self.run_pipeline_task(schedule, shutdown).await?;
            }
            TaskKind::PortfolioReview => {
                self.pipeline
                    .run_analysis(PORTFOLIO_TICKER, AnalysisKind::Review, Some(schedule), shutdown)
                    .await?;
            }
            TaskKind::Postmortem => {
                let ticker = schedule
                    .ticker
                    .clone()
                    .unwrap_or_else(|| PORTFOLIO_TICKER.to_string());
                self.pipeline
                    .run_analysis(&ticker, AnalysisKind::Postmortem, Some(schedule), shutdown)
                    .await?;
            }
            TaskKind::RunScanner | TaskKind::RunAllScanners | TaskKind::Custom => {
                // External collaborators own these; record the handoff only.
                let target = schedule
                    .scanner_id
                    .clone()
                    .unwrap_or_else(|| "EXTERNAL".to_string());
                let run_id = self.db.mark_schedule_started(schedule, &target, now).await?;
                self.db
                    .mark_schedule_completed(
                        schedule.id,
                        run_id,
                        RunStatus::Skipped,
                        Some("deferred to external collaborator"),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Fan out across the enabled watchlist, bounded by
    /// `max_concurrent_analyses`. Per-ticker runs are independent ad-hoc
    /// runs; one failing never touches the others or the batch status.
    async fn run_watchlist(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
        shutdown: &ShutdownToken,
    ) -> anyhow::Result<()> {
        let run_id = self
            .db
            .mark_schedule_started(schedule, WATCHLIST_BATCH_TICKER, now)
            .await?;

        let stocks: Vec<Stock> = match self.db.list_enabled_stocks().await {
            Ok(s) => s,
            Err(e) => {
                self.db
                    .mark_schedule_completed(schedule.id, run_id, RunStatus::Failed, Some(&e.to_string()))
                    .await?;
                return Err(e.into());
            }
        };
        // A tag set on the schedule narrows the target universe.
        let stocks: Vec<Stock> = stocks
            .into_iter()
            .filter(|s| {
                schedule.tags.is_empty() || s.tags.iter().any(|t| schedule.tags.contains(t))
            })
            .collect();

        let limit = self.settings.max_concurrent_analyses().await.max(1) as usize;
        let sem = Arc::new(Semaphore::new(limit));
        // list_enabled_stocks is already (priority desc, ticker asc); the
        // semaphore is fair, so permits are granted in dispatch order.
        let jobs = stocks.into_iter().map(|stock| {
            let sem = sem.clone();
            let pipeline = self.pipeline.clone();
            let shutdown = shutdown.clone();
            async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return;
                };
                if shutdown.is_cancelled() {
                    return;
                }
                if let Err(e) = pipeline
                    .run_analysis(&stock.ticker, stock.default_analysis_kind, None, &shutdown)
                    .await
                {
                    warn!(ticker = %stock.ticker, error = %e, "watchlist analysis failed");
                }
            }
        });
        join_all(jobs).await;

        let status = if shutdown.is_cancelled() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let error = (status == RunStatus::Failed).then_some("canceled");
        self.db
            .mark_schedule_completed(schedule.id, run_id, status, error)
            .await?;
        Ok(())
    }

    /// Full pipeline task: analysis, then the (out-of-scope) execution stage
    /// behind the gate flag, the auto-execute switch, and the daily cap.
    async fn run_pipeline_task(
        &self,
        schedule: &Schedule,
        shutdown: &ShutdownToken,
    ) -> anyhow::Result<()> {
        let Some(ticker) = schedule.ticker.clone() else {
            anyhow::bail!("pipeline schedule without ticker");
        };
        let outcome = self
            .pipeline
            .run_analysis(&ticker, schedule.analysis_kind, Some(schedule), shutdown)
            .await?;
        let Some(outcome) = outcome else {
            return Ok(());
        };
        if !outcome.record.gate_passed {
            debug!(ticker = %ticker, "gate not passed, no execution");
            return Ok(());
        }
        if !self.settings.auto_execute_enabled().await {
            info!(ticker = %ticker, "gate passed, auto-execute disabled");
            return Ok(());
        }
        let executed = self.db.executions_today().await?;
        if executed >= self.settings.max_daily_executions().await {
            info!(ticker = %ticker, "gate passed, daily execution cap reached");
            return Ok(());
        }

        // Hand-off point to the execution collaborator. The core records the
        // request; order placement itself is outside this system.
        self.db.increment_today_executions().await?;
        self.db
            .log_event(
                "execution.requested",
                "scheduler",
                "run",
                &outcome.run_id.to_string(),
                "ok",
                &serde_json::json!({
                    "ticker": ticker,
                    "recommendation": outcome.record.recommendation.as_str(),
                    "confidence": outcome.record.adjusted_confidence
                        .unwrap_or(outcome.record.confidence),
                }),
            )
            .await?;
        info!(ticker = %ticker, run_id = outcome.run_id, "execution stage requested");
        Ok(())
    }

    /// Compute and persist the next due instant.
    async fn advance(&self, schedule: &Schedule, now: DateTime<Utc>) -> anyhow::Result<()> {
        if schedule.frequency == Frequency::Once {
            self.db.set_next_run(schedule.id, None, Some(false)).await?;
            return Ok(());
        }

        let stock = match schedule.ticker.as_deref() {
            Some(t) if matches!(
                schedule.frequency,
                Frequency::PreEarnings | Frequency::PostEarnings
            ) =>
            {
                self.db.get_stock(t).await?
            }
            _ => None,
        };
        let next = compute_next_run(schedule, stock.as_ref(), now, &self.calendar);
        self.db
            .set_next_run(schedule.id, next.map(|t| t.timestamp()), None)
            .await?;
        Ok(())
    }
}

/// Next-run arithmetic, pure given the calendar.
pub fn compute_next_run(
    schedule: &Schedule,
    stock: Option<&Stock>,
    now: DateTime<Utc>,
    calendar: &TradingCalendar,
) -> Option<DateTime<Utc>> {
    let default_tod = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
    let tod = schedule.time_of_day.unwrap_or(default_tod);

    match schedule.frequency {
        Frequency::Once => None,
        Frequency::Daily => {
            let mut day = calendar.local_date(now) + Duration::days(1);
            if schedule.trading_days_only && !calendar.is_trading_day(day) {
                day = calendar.next_trading_day(day);
            }
            Some(calendar.at_local(day, tod))
        }
        Frequency::Weekly => {
            let target = schedule.day_of_week.unwrap_or(0) as i64 % 7;
            let today = calendar.local_date(now);
            let current = today.weekday().num_days_from_monday() as i64;
            let mut ahead = (target - current).rem_euclid(7);
            if ahead == 0 && calendar.at_local(today, tod) <= now {
                ahead = 7;
            }
            Some(calendar.at_local(today + Duration::days(ahead), tod))
        }
        Frequency::Interval => {
            let minutes = schedule.interval_minutes.unwrap_or(60).max(1);
            Some(now + Duration::minutes(minutes))
        }
        Frequency::PreEarnings => {
            let earnings = stock.and_then(|s| s.next_earnings_date)?;
            let days_before = schedule.days_before_earnings.unwrap_or(1).max(0);
            let mut at = calendar.at_local(earnings - Duration::days(days_before), tod);
            if at <= now {
                at += Duration::days(7);
            }
            Some(at)
        }
        Frequency::PostEarnings => {
            let earnings = stock.and_then(|s| s.next_earnings_date)?;
            let days_after = schedule.days_after_earnings.unwrap_or(1).max(0);
            let mut at = calendar.at_local(earnings + Duration::days(days_after), tod);
            if at <= now {
                at += Duration::days(7);
            }
            Some(at)
        }
    }
}
