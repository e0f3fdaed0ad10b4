//! Shared domain types for the analysis orchestrator.

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Uppercase, alphanumeric plus `.`/`-`, at most 10 chars.
pub fn normalize_ticker(raw: &str) -> Result<String> {
    let t = raw.trim().to_ascii_uppercase();
    if t.is_empty() || t.len() > 10 {
        return Err(anyhow!("invalid ticker length: {raw:?}"));
    }
    if !t
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(anyhow!("invalid ticker characters: {raw:?}"));
    }
    Ok(t)
}

/// Sentinel ticker for portfolio-wide runs; bypasses the watchlist guard.
pub const PORTFOLIO_TICKER: &str = "PORTFOLIO";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockState {
    Analysis,
    Paper,
    /// Display-only. The pipeline never places real orders regardless.
    Live,
    Archived,
}

impl StockState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "analysis" => Some(Self::Analysis),
            "paper" => Some(Self::Paper),
            "live" => Some(Self::Live),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Paper => "paper",
            Self::Live => "live",
            Self::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    Stock,
    Earnings,
    Scan,
    Review,
    Postmortem,
    Custom,
}

impl AnalysisKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stock" => Some(Self::Stock),
            "earnings" => Some(Self::Earnings),
            "scan" => Some(Self::Scan),
            "review" => Some(Self::Review),
            "postmortem" => Some(Self::Postmortem),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stock => "stock",
            Self::Earnings => "earnings",
            Self::Scan => "scan",
            Self::Review => "review",
            Self::Postmortem => "postmortem",
            Self::Custom => "custom",
        }
    }
}

/// Task kinds a schedule can dispatch. Unknown kinds are rejected at schedule
/// creation, so the scheduler's dispatcher can match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    AnalyzeStock,
    AnalyzeWatchlist,
    RunScanner,
    RunAllScanners,
    Pipeline,
    PortfolioReview,
    Postmortem,
    Custom,
}

impl TaskKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "analyze_stock" => Some(Self::AnalyzeStock),
            "analyze_watchlist" => Some(Self::AnalyzeWatchlist),
            "run_scanner" => Some(Self::RunScanner),
            "run_all_scanners" => Some(Self::RunAllScanners),
            "pipeline" => Some(Self::Pipeline),
            "portfolio_review" => Some(Self::PortfolioReview),
            "postmortem" => Some(Self::Postmortem),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnalyzeStock => "analyze_stock",
            Self::AnalyzeWatchlist => "analyze_watchlist",
            Self::RunScanner => "run_scanner",
            Self::RunAllScanners => "run_all_scanners",
            Self::Pipeline => "pipeline",
            Self::PortfolioReview => "portfolio_review",
            Self::Postmortem => "postmortem",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Once,
    Daily,
    Weekly,
    PreEarnings,
    PostEarnings,
    Interval,
}

impl Frequency {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Some(Self::Once),
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "pre_earnings" => Some(Self::PreEarnings),
            "post_earnings" => Some(Self::PostEarnings),
            "interval" => Some(Self::Interval),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::PreEarnings => "pre_earnings",
            Self::PostEarnings => "post_earnings",
            Self::Interval => "interval",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation {
    Buy,
    Sell,
    Hold,
    Wait,
    Bullish,
    Bearish,
    Long,
    Short,
    Unknown,
}

impl Recommendation {
    /// Unrecognized strings map to `Unknown`, never an error.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Self::Buy,
            "SELL" => Self::Sell,
            "HOLD" => Self::Hold,
            "WAIT" => Self::Wait,
            "BULLISH" => Self::Bullish,
            "BEARISH" => Self::Bearish,
            "LONG" => Self::Long,
            "SHORT" => Self::Short,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Hold => "HOLD",
            Self::Wait => "WAIT",
            Self::Bullish => "BULLISH",
            Self::Bearish => "BEARISH",
            Self::Long => "LONG",
            Self::Short => "SHORT",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn sentiment(&self) -> Sentiment {
        match self {
            Self::Buy | Self::Bullish | Self::Long => Sentiment::Bullish,
            Self::Sell | Self::Bearish | Self::Short => Sentiment::Bearish,
            _ => Sentiment::Neutral,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Bullish,
    Bearish,
    Neutral,
}

/// One monitored symbol on the watchlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stock {
    pub ticker: String,
    pub name: Option<String>,
    pub sector: Option<String>,
    pub enabled: bool,
    pub state: StockState,
    pub default_analysis_kind: AnalysisKind,
    /// Clamped to 1..=10 on write.
    pub priority: i64,
    pub next_earnings_date: Option<NaiveDate>,
    pub earnings_confirmed: bool,
    pub has_open_position: bool,
    pub max_position_pct: f64,
    pub tags: Vec<String>,
    pub notes: Option<String>,
    /// Epoch seconds. Past this instant the sweep archives the entry.
    pub expires_at: Option<i64>,
}

/// A recurrence rule that produces pipeline invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub name: String,
    pub task_kind: TaskKind,
    pub ticker: Option<String>,
    pub scanner_id: Option<String>,
    pub tags: Vec<String>,
    pub analysis_kind: AnalysisKind,
    pub frequency: Frequency,
    /// Wall clock in the trading time zone.
    pub time_of_day: Option<chrono::NaiveTime>,
    /// 0 = Monday .. 6 = Sunday.
    pub day_of_week: Option<u8>,
    pub interval_minutes: Option<i64>,
    pub days_before_earnings: Option<i64>,
    pub days_after_earnings: Option<i64>,
    pub market_hours_only: bool,
    pub trading_days_only: bool,
    pub priority: i64,
    pub max_runs_per_day: i64,
    pub timeout_seconds: i64,
    pub enabled: bool,
    pub run_count: i64,
    pub fail_count: i64,
    pub consecutive_fails: i64,
    pub max_consecutive_fails: i64,
    pub last_run_at: Option<i64>,
    pub last_run_status: Option<RunStatus>,
    pub next_run_at: Option<i64>,
}

impl Schedule {
    /// At the failure threshold the schedule is excluded by the due query
    /// until manually reset.
    pub fn is_tripped(&self) -> bool {
        self.consecutive_fails >= self.max_consecutive_fails
    }
}

/// One pipeline invocation attempt. Terminal states are sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub schedule_id: Option<i64>,
    pub task_kind: TaskKind,
    pub ticker: String,
    pub analysis_kind: AnalysisKind,
    pub status: RunStatus,
    pub stage: Option<String>,
    pub gate_passed: bool,
    pub recommendation: Option<Recommendation>,
    pub confidence: Option<i64>,
    pub expected_value_pct: Option<f64>,
    pub order_placed: bool,
    pub order_id: Option<String>,
    pub artifact_path: Option<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub raw_output: Option<String>,
}

/// Structured parse of the reasoning engine's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedAnalysis {
    pub gate_passed: bool,
    pub recommendation: Recommendation,
    pub confidence: i64,
    pub expected_value_pct: f64,
    pub entry_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub position_size_pct: Option<f64>,
    pub trade_structure: Option<String>,
    pub expiry: Option<String>,
    pub strikes: Option<String>,
    pub rationale: Option<String>,
    pub snapshot_price: Option<f64>,
    pub implied_vol: Option<f64>,
}

impl Default for ParsedAnalysis {
    fn default() -> Self {
        Self {
            gate_passed: false,
            recommendation: Recommendation::Unknown,
            confidence: 0,
            expected_value_pct: 0.0,
            entry_price: None,
            stop_price: None,
            target_price: None,
            position_size_pct: None,
            trade_structure: None,
            expiry: None,
            strikes: None,
            rationale: None,
            snapshot_price: None,
            implied_vol: None,
        }
    }
}

/// Persisted analysis row. `doc_id` matches the vector-store document when the
/// ingest succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub run_id: i64,
    pub ticker: String,
    pub analysis_kind: AnalysisKind,
    pub gate_passed: bool,
    pub recommendation: Recommendation,
    pub confidence: i64,
    pub adjusted_confidence: Option<i64>,
    pub confidence_modifiers: Option<BTreeMap<String, i64>>,
    pub expected_value_pct: f64,
    pub entry_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub position_size_pct: Option<f64>,
    pub trade_structure: Option<String>,
    pub expiry: Option<String>,
    pub strikes: Option<String>,
    pub rationale: Option<String>,
    pub snapshot_price: Option<f64>,
    pub implied_vol: Option<f64>,
    pub doc_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BiasWarning {
    pub bias: String,
    pub occurrences: i64,
    pub last_impact: Option<String>,
    pub ticker_specific: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRec {
    pub strategy: String,
    pub win_rate: f64,
    pub sample: i64,
}

/// Singleton service heartbeat row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub started_at: i64,
    pub last_heartbeat: i64,
    pub last_tick_ms: i64,
    pub state: String,
    pub current_task: Option<String>,
    pub pid: i64,
    pub host: String,
    pub total_runs: i64,
    pub total_analyses: i64,
    pub total_executions: i64,
    pub total_errors: i64,
    pub analyses_today: i64,
    pub executions_today: i64,
    pub today_date: String,
}
