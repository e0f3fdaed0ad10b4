//! Four-phase analysis pipeline.
//!
//! Phase 1 generates an unbiased analysis (no retrieval context), phase 2
//! fans the artifact out to the vector and graph stores, phase 3 builds the
//! hybrid retrieval context, phase 4 synthesizes a confidence adjustment and
//! appends the historical comparison. Only phase 1 is fatal; later phases
//! degrade the output but the run still completes.

pub mod ingest;
pub mod synthesis;

pub use ingest::{dual_ingest, IngestReport};
pub use synthesis::{
    compute_adjustment, majority_sentiment, render_synthesis, Adjustment, HistoryRow,
    PatternOutcome,
};

use crate::calendar::TradingCalendar;
use crate::models::{
    AnalysisKind, AnalysisRecord, ParsedAnalysis, Recommendation, RunStatus, Schedule, StockState,
    TaskKind, PORTFOLIO_TICKER,
};
use crate::parser;
use crate::reasoning::{ReasoningInvoker, ReasoningRequest};
use crate::retrieval::{GraphStore, HybridContext, HybridRetriever, VectorStore};
use crate::settings::Settings;
use crate::shutdown::ShutdownToken;
use crate::storage::Db;
use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub run_id: i64,
    pub record: AnalysisRecord,
    pub artifact_path: PathBuf,
}

enum PhaseOutcome<T> {
    Done(T),
    TimedOut,
    Canceled,
}

async fn with_phase_timeout<T>(
    secs: i64,
    shutdown: &ShutdownToken,
    fut: impl Future<Output = T>,
) -> PhaseOutcome<T> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => PhaseOutcome::Canceled,
        res = tokio::time::timeout(Duration::from_secs(secs.max(1) as u64), fut) => match res {
            Ok(v) => PhaseOutcome::Done(v),
            Err(_) => PhaseOutcome::TimedOut,
        },
    }
}

fn capabilities_for(kind: AnalysisKind) -> Vec<String> {
    let mut caps = vec!["mcp__ib__*".to_string(), "mcp__research__*".to_string()];
    if matches!(kind, AnalysisKind::Earnings | AnalysisKind::Postmortem) {
        caps.push("mcp__filings__*".to_string());
    }
    caps
}

/// Skill template for the reasoning engine. `context` carries the formatted
/// knowledge base only in the legacy (kb-enabled) variant.
fn prompt_for(kind: AnalysisKind, ticker: &str, context: Option<&str>) -> String {
    let mut prompt = format!(
        "Run a {} analysis for {}.\n\
         Assess setup quality, expected value, and risk/reward.\n\
         Finish with a fenced ```json block containing: gate_passed, \
         recommendation, confidence, expected_value_pct, entry_price, \
         stop_price, target_price, position_size_pct, trade_structure, \
         rationale, snapshot_price, implied_vol.\n",
        kind.as_str(),
        ticker
    );
    if let Some(kb) = context {
        prompt.push_str("\n## Knowledge Base Context\n\n");
        prompt.push_str(kb);
    }
    prompt
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write via a temporary sibling and rename, so concurrent readers observe
/// either the old or the new content, never a torn file.
async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = tmp_sibling(path);
    if let Err(e) = tokio::fs::write(&tmp, content).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e).with_context(|| format!("write {}", tmp.display()));
    }
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

async fn append_atomic(path: &Path, block: &str) -> Result<()> {
    let existing = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    write_atomic(path, &format!("{existing}{block}")).await
}

#[derive(Clone)]
pub struct Pipeline {
    db: Db,
    settings: Settings,
    calendar: TradingCalendar,
    invoker: Arc<dyn ReasoningInvoker>,
    vector: Option<Arc<dyn VectorStore>>,
    graph: Option<Arc<dyn GraphStore>>,
    retriever: HybridRetriever,
    analyses_dir: PathBuf,
}

impl Pipeline {
    pub fn new(
        db: Db,
        settings: Settings,
        calendar: TradingCalendar,
        invoker: Arc<dyn ReasoningInvoker>,
        vector: Option<Arc<dyn VectorStore>>,
        graph: Option<Arc<dyn GraphStore>>,
        analyses_dir: PathBuf,
    ) -> Self {
        let retriever = HybridRetriever::new(db.clone(), vector.clone(), graph.clone());
        Self {
            db,
            settings,
            calendar,
            invoker,
            vector,
            graph,
            retriever,
            analyses_dir,
        }
    }

    /// Entry point for one analysis attempt. Returns `Ok(None)` for skipped
    /// and failed runs; the run row always reaches a terminal state.
    pub async fn run_analysis(
        &self,
        ticker: &str,
        kind: AnalysisKind,
        schedule: Option<&Schedule>,
        shutdown: &ShutdownToken,
    ) -> Result<Option<AnalysisOutcome>> {
        let now = self.calendar.now();
        let run_id = match schedule {
            Some(s) => self.db.mark_schedule_started(s, ticker, now).await?,
            None => {
                self.db
                    .create_adhoc_run(TaskKind::AnalyzeStock, ticker, kind, now)
                    .await?
            }
        };

        // Guard rails, in order; each short-circuits to a skipped run.
        if ticker != PORTFOLIO_TICKER {
            match self.db.get_stock(ticker).await {
                Ok(Some(stock)) if stock.enabled && stock.state != StockState::Archived => {}
                Ok(_) => {
                    return self
                        .skip(run_id, schedule, "ticker not on watchlist or disabled")
                        .await;
                }
                Err(e) => {
                    self.complete(run_id, schedule, RunStatus::Failed, Some(&e.to_string()))
                        .await;
                    return Ok(None);
                }
            }
        }

        let analyses_today = self.db.analyses_today().await.unwrap_or(0);
        if analyses_today >= self.settings.max_daily_analyses().await {
            return self.skip(run_id, schedule, "daily analysis cap reached").await;
        }

        if let Some(s) = schedule {
            if s.is_tripped() {
                return self.skip(run_id, schedule, "circuit breaker tripped").await;
            }
        }

        if let Err(e) = self.db.increment_today_analyses().await {
            warn!(error = %e, "analysis counter increment failed");
        }

        if self.settings.four_phase_analysis_enabled().await {
            self.four_phase(run_id, schedule, ticker, kind, now, shutdown).await
        } else {
            self.legacy(run_id, schedule, ticker, kind, now, shutdown).await
        }
    }

    async fn four_phase(
        &self,
        run_id: i64,
        schedule: Option<&Schedule>,
        ticker: &str,
        kind: AnalysisKind,
        now: DateTime<Utc>,
        shutdown: &ShutdownToken,
    ) -> Result<Option<AnalysisOutcome>> {
        // Phase 1: unbiased generation. The only fatal phase.
        let _ = self.db.update_run_stage(run_id, "phase1_generation").await;
        let (raw, artifact_path, parsed) = match self
            .generate(ticker, kind, None, now, shutdown)
            .await
        {
            Ok(v) => v,
            Err(msg) => {
                self.complete(run_id, schedule, RunStatus::Failed, Some(&msg)).await;
                return Ok(None);
            }
        };
        if let Err(e) = self
            .db
            .update_run_output(run_id, &parsed, &artifact_path.to_string_lossy(), &raw)
            .await
        {
            self.complete(run_id, schedule, RunStatus::Failed, Some(&e.to_string())).await;
            return Ok(None);
        }

        // Phase 2: dual ingest. Timeout degrades to an empty report.
        let _ = self.db.update_run_stage(run_id, "phase2_ingest").await;
        let p2 = self.settings.phase2_timeout_seconds().await;
        let report = match with_phase_timeout(
            p2,
            shutdown,
            dual_ingest(self.vector.as_ref(), self.graph.as_ref(), &artifact_path),
        )
        .await
        {
            PhaseOutcome::Done(r) => r,
            PhaseOutcome::TimedOut => {
                warn!(ticker, "phase 2 ingest timed out, continuing without doc_id");
                IngestReport::timed_out()
            }
            PhaseOutcome::Canceled => {
                self.complete(run_id, schedule, RunStatus::Failed, Some("canceled")).await;
                return Ok(None);
            }
        };
        if !report.errors.is_empty() {
            warn!(ticker, errors = ?report.errors, "ingest degraded");
        }
        let doc_id = report.doc_id.clone();

        // Phase 3: hybrid retrieval, excluding the document just ingested.
        let _ = self.db.update_run_stage(run_id, "phase3_retrieve").await;
        let p3 = self.settings.phase3_timeout_seconds().await;
        let query = format!("{} analysis historical patterns", kind.as_str());
        let ctx = match with_phase_timeout(
            p3,
            shutdown,
            self.retriever
                .build_context(ticker, &query, kind, doc_id.as_deref()),
        )
        .await
        {
            PhaseOutcome::Done(c) => c,
            PhaseOutcome::TimedOut => {
                warn!(ticker, "phase 3 retrieval timed out, using empty context");
                HybridContext::empty(ticker)
            }
            PhaseOutcome::Canceled => {
                self.complete(run_id, schedule, RunStatus::Failed, Some("canceled")).await;
                return Ok(None);
            }
        };

        // Past results feed the pattern vote; the current run is not yet
        // persisted, so the newest rows here are genuinely historical.
        let recent = self.db.list_recent_results(ticker, 5).await.unwrap_or_default();

        let mut record = self.record_from(run_id, ticker, kind, &parsed, doc_id.clone(), now);
        if let Err(e) = self.db.save_analysis_result(&record).await {
            self.complete(run_id, schedule, RunStatus::Failed, Some(&e.to_string())).await;
            return Ok(None);
        }

        // Phase 4: synthesis. Degrades to the unadjusted record.
        let _ = self.db.update_run_stage(run_id, "phase4_synthesize").await;
        let p4 = self.settings.phase4_timeout_seconds().await;
        let synth = with_phase_timeout(p4, shutdown, async {
            let recents: Vec<Recommendation> = recent.iter().map(|r| r.recommendation).collect();
            let adjustment = compute_adjustment(parsed.confidence, parsed.recommendation, &ctx, &recents);
            let history: Vec<HistoryRow> = recent
                .iter()
                .map(|r| HistoryRow {
                    date: DateTime::<Utc>::from_timestamp(r.created_at, 0)
                        .map(|d| d.format("%Y-%m-%d").to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                    kind: r.analysis_kind.as_str().to_string(),
                    recommendation: r.recommendation.as_str().to_string(),
                    confidence: r.confidence,
                })
                .collect();
            let block = render_synthesis(ticker, parsed.confidence, &adjustment, &ctx, &history);
            append_atomic(&artifact_path, &block).await?;
            self.db
                .update_analysis_confidence(run_id, adjustment.adjusted, &adjustment.modifiers)
                .await?;
            anyhow::Ok(adjustment)
        })
        .await;
        match synth {
            PhaseOutcome::Done(Ok(adjustment)) => {
                record.adjusted_confidence = Some(adjustment.adjusted);
                record.confidence_modifiers = Some(adjustment.modifiers.clone());
                info!(
                    ticker,
                    original = parsed.confidence,
                    adjusted = adjustment.adjusted,
                    pattern = adjustment.pattern.label(),
                    "synthesis complete"
                );
            }
            PhaseOutcome::Done(Err(e)) => {
                warn!(ticker, error = %e, "phase 4 synthesis degraded");
            }
            PhaseOutcome::TimedOut => {
                warn!(ticker, "phase 4 synthesis timed out, keeping original confidence");
            }
            PhaseOutcome::Canceled => {
                self.complete(run_id, schedule, RunStatus::Failed, Some("canceled")).await;
                return Ok(None);
            }
        }

        self.complete(run_id, schedule, RunStatus::Completed, None).await;
        Ok(Some(AnalysisOutcome {
            run_id,
            record,
            artifact_path,
        }))
    }

    /// Pre-four-phase variant, kept for comparison and rollback: retrieval
    /// context is injected into the generation prompt, afterwards a
    /// single-shot vector ingest. No graph ingest, no synthesis, no
    /// confidence adjustment; that asymmetry is deliberate.
    async fn legacy(
        &self,
        run_id: i64,
        schedule: Option<&Schedule>,
        ticker: &str,
        kind: AnalysisKind,
        now: DateTime<Utc>,
        shutdown: &ShutdownToken,
    ) -> Result<Option<AnalysisOutcome>> {
        let _ = self.db.update_run_stage(run_id, "legacy_generation").await;
        let p3 = self.settings.phase3_timeout_seconds().await;
        let query = format!("{} analysis historical patterns", kind.as_str());
        let ctx = match with_phase_timeout(
            p3,
            shutdown,
            self.retriever.build_context(ticker, &query, kind, None),
        )
        .await
        {
            PhaseOutcome::Done(c) => c,
            PhaseOutcome::TimedOut => HybridContext::empty(ticker),
            PhaseOutcome::Canceled => {
                self.complete(run_id, schedule, RunStatus::Failed, Some("canceled")).await;
                return Ok(None);
            }
        };

        let (raw, artifact_path, parsed) = match self
            .generate(ticker, kind, Some(&ctx.formatted), now, shutdown)
            .await
        {
            Ok(v) => v,
            Err(msg) => {
                self.complete(run_id, schedule, RunStatus::Failed, Some(&msg)).await;
                return Ok(None);
            }
        };
        if let Err(e) = self
            .db
            .update_run_output(run_id, &parsed, &artifact_path.to_string_lossy(), &raw)
            .await
        {
            self.complete(run_id, schedule, RunStatus::Failed, Some(&e.to_string())).await;
            return Ok(None);
        }

        let _ = self.db.update_run_stage(run_id, "legacy_ingest").await;
        let p2 = self.settings.phase2_timeout_seconds().await;
        let doc_id = match &self.vector {
            Some(store) => {
                match with_phase_timeout(p2, shutdown, store.embed_document(&artifact_path)).await {
                    PhaseOutcome::Done(Ok(embedded)) => Some(embedded.doc_id),
                    PhaseOutcome::Done(Err(e)) => {
                        warn!(ticker, error = %e, "legacy vector ingest failed");
                        None
                    }
                    PhaseOutcome::TimedOut => {
                        warn!(ticker, "legacy vector ingest timed out");
                        None
                    }
                    PhaseOutcome::Canceled => {
                        self.complete(run_id, schedule, RunStatus::Failed, Some("canceled")).await;
                        return Ok(None);
                    }
                }
            }
            None => None,
        };

        let record = self.record_from(run_id, ticker, kind, &parsed, doc_id, now);
        if let Err(e) = self.db.save_analysis_result(&record).await {
            self.complete(run_id, schedule, RunStatus::Failed, Some(&e.to_string())).await;
            return Ok(None);
        }

        self.complete(run_id, schedule, RunStatus::Completed, None).await;
        Ok(Some(AnalysisOutcome {
            run_id,
            record,
            artifact_path,
        }))
    }

    /// Shared generation step: invoke the engine, persist the artifact
    /// atomically, parse. The error string becomes the run error.
    async fn generate(
        &self,
        ticker: &str,
        kind: AnalysisKind,
        kb_context: Option<&str>,
        now: DateTime<Utc>,
        shutdown: &ShutdownToken,
    ) -> std::result::Result<(String, PathBuf, ParsedAnalysis), String> {
        let timeout = self.settings.claude_timeout_seconds().await;
        let request = ReasoningRequest {
            prompt: prompt_for(kind, ticker, kb_context),
            allowed_capabilities: capabilities_for(kind),
            label: format!("{ticker} {} analysis", kind.as_str()),
            timeout: Duration::from_secs(timeout.max(1) as u64),
        };
        let raw = self
            .invoker
            .invoke(request, shutdown)
            .await
            .map_err(|e| e.to_string())?;

        let stamp = self.calendar.timestamp_label(now);
        let artifact_path = self
            .analyses_dir
            .join(format!("{}_{}_{}.md", ticker, kind.as_str(), stamp));
        write_atomic(&artifact_path, &raw)
            .await
            .map_err(|e| format!("artifact write: {e}"))?;

        let parsed = parser::parse_analysis(&raw);
        Ok((raw, artifact_path, parsed))
    }

    fn record_from(
        &self,
        run_id: i64,
        ticker: &str,
        kind: AnalysisKind,
        parsed: &ParsedAnalysis,
        doc_id: Option<String>,
        now: DateTime<Utc>,
    ) -> AnalysisRecord {
        AnalysisRecord {
            run_id,
            ticker: ticker.to_string(),
            analysis_kind: kind,
            gate_passed: parsed.gate_passed,
            recommendation: parsed.recommendation,
            confidence: parsed.confidence,
            adjusted_confidence: None,
            confidence_modifiers: None,
            expected_value_pct: parsed.expected_value_pct,
            entry_price: parsed.entry_price,
            stop_price: parsed.stop_price,
            target_price: parsed.target_price,
            position_size_pct: parsed.position_size_pct,
            trade_structure: parsed.trade_structure.clone(),
            expiry: parsed.expiry.clone(),
            strikes: parsed.strikes.clone(),
            rationale: parsed.rationale.clone(),
            snapshot_price: parsed.snapshot_price,
            implied_vol: parsed.implied_vol,
            doc_id,
            created_at: now.timestamp(),
        }
    }

    async fn skip(
        &self,
        run_id: i64,
        schedule: Option<&Schedule>,
        reason: &str,
    ) -> Result<Option<AnalysisOutcome>> {
        info!(run_id, reason, "run skipped");
        self.complete(run_id, schedule, RunStatus::Skipped, Some(reason)).await;
        Ok(None)
    }

    async fn complete(
        &self,
        run_id: i64,
        schedule: Option<&Schedule>,
        status: RunStatus,
        error: Option<&str>,
    ) {
        let res = match schedule {
            Some(s) => self.db.mark_schedule_completed(s.id, run_id, status, error).await,
            None => self.db.mark_run_terminal(run_id, status, error).await,
        };
        if let Err(e) = res {
            warn!(run_id, error = %e, "run completion write failed");
        }
    }
}
