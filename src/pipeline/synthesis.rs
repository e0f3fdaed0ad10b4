//! Phase-4 synthesis: deterministic confidence adjustment and the appended
//! historical-comparison block.

use crate::models::{Recommendation, Sentiment};
use crate::retrieval::HybridContext;
use std::collections::BTreeMap;

pub const MOD_FIRST_ANALYSIS: &str = "first_analysis";
pub const MOD_SPARSE_HISTORY: &str = "sparse_history";
pub const MOD_NO_GRAPH: &str = "no_graph";
pub const MOD_BIAS_WARNINGS: &str = "bias_warnings";
pub const MOD_PATTERN_CONFIRMS: &str = "pattern_confirms";
pub const MOD_PATTERN_CONTRADICTS: &str = "pattern_contradicts";

const BIAS_PENALTY_PER_OCCURRENCE: i64 = 3;
const BIAS_PENALTY_CAP: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternOutcome {
    FirstAnalysis,
    Confirms,
    Contradicts,
    NoPattern,
}

impl PatternOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::FirstAnalysis => "First analysis - establishing baseline",
            Self::Confirms => "Confirms recent historical sentiment",
            Self::Contradicts => "⚠️ Contradicts recent historical sentiment",
            Self::NoPattern => "No clear pattern from history",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Adjustment {
    pub adjusted: i64,
    pub modifiers: BTreeMap<String, i64>,
    pub pattern: PatternOutcome,
}

/// Majority sentiment of the vote; ties break toward neutral.
pub fn majority_sentiment(votes: &[Sentiment]) -> Sentiment {
    let bullish = votes.iter().filter(|s| **s == Sentiment::Bullish).count();
    let bearish = votes.iter().filter(|s| **s == Sentiment::Bearish).count();
    let neutral = votes.iter().filter(|s| **s == Sentiment::Neutral).count();
    if bullish > bearish && bullish > neutral {
        Sentiment::Bullish
    } else if bearish > bullish && bearish > neutral {
        Sentiment::Bearish
    } else {
        Sentiment::Neutral
    }
}

/// Apply the modifier ladder. Additive, order-independent, clamped to
/// [0, 100]. `recent` is newest-first; only the first three feed the vote.
pub fn compute_adjustment(
    original: i64,
    current: Recommendation,
    ctx: &HybridContext,
    recent: &[Recommendation],
) -> Adjustment {
    let mut modifiers: BTreeMap<String, i64> = BTreeMap::new();
    let mut pattern = PatternOutcome::NoPattern;

    if ctx.is_first_analysis {
        modifiers.insert(MOD_FIRST_ANALYSIS.to_string(), -10);
        pattern = PatternOutcome::FirstAnalysis;
    } else if (1..=2).contains(&ctx.history_count) {
        modifiers.insert(MOD_SPARSE_HISTORY.to_string(), -5);
    }

    if !ctx.has_graph_data {
        modifiers.insert(MOD_NO_GRAPH.to_string(), -5);
    }

    if !ctx.bias_warnings.is_empty() {
        let occurrences: i64 = ctx.bias_warnings.iter().map(|b| b.occurrences.max(0)).sum();
        let penalty = (occurrences * BIAS_PENALTY_PER_OCCURRENCE).min(BIAS_PENALTY_CAP);
        if penalty > 0 {
            modifiers.insert(MOD_BIAS_WARNINGS.to_string(), -penalty);
        }
    }

    let votes: Vec<Sentiment> = recent.iter().take(3).map(|r| r.sentiment()).collect();
    if !votes.is_empty() {
        let majority = majority_sentiment(&votes);
        let current_sentiment = current.sentiment();
        // Neutral on either side means neither confirmation nor contradiction.
        if current_sentiment != Sentiment::Neutral && majority != Sentiment::Neutral {
            if current_sentiment == majority {
                modifiers.insert(MOD_PATTERN_CONFIRMS.to_string(), 5);
                pattern = PatternOutcome::Confirms;
            } else {
                modifiers.insert(MOD_PATTERN_CONTRADICTS.to_string(), -10);
                pattern = PatternOutcome::Contradicts;
            }
        }
    }

    let delta: i64 = modifiers.values().sum();
    Adjustment {
        adjusted: (original + delta).clamp(0, 100),
        modifiers,
        pattern,
    }
}

/// One row of the synthesis history table.
#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub date: String,
    pub kind: String,
    pub recommendation: String,
    pub confidence: i64,
}

const MAX_HISTORY_ROWS: usize = 5;
const MAX_PEERS: usize = 6;
const MAX_RISKS: usize = 4;

/// The block appended after the phase-1 artifact, behind a horizontal rule.
pub fn render_synthesis(
    ticker: &str,
    original: i64,
    adjustment: &Adjustment,
    ctx: &HybridContext,
    history: &[HistoryRow],
) -> String {
    let mut out = String::new();
    out.push_str("\n---\n\n## Historical Comparison (Auto-Generated)\n\n");

    out.push_str("### Past Recommendations\n");
    if history.is_empty() {
        out.push_str("No prior analyses on record.\n");
    } else {
        out.push_str("| Date | Kind | Recommendation | Confidence |\n");
        out.push_str("|------|------|----------------|------------|\n");
        for row in history.iter().take(MAX_HISTORY_ROWS) {
            out.push_str(&format!(
                "| {} | {} | {} | {}% |\n",
                row.date, row.kind, row.recommendation, row.confidence
            ));
        }
    }

    out.push_str("\n### Bias Warnings\n");
    if ctx.bias_warnings.is_empty() {
        out.push_str("None recorded.\n");
    } else {
        for b in &ctx.bias_warnings {
            out.push_str(&format!("- **{}**: {} occurrence(s)", b.bias, b.occurrences));
            if let Some(impact) = &b.last_impact {
                out.push_str(&format!(", last impact {impact}"));
            }
            out.push('\n');
        }
    }

    out.push_str("\n### Sector Peers\n");
    if ctx.graph_context.peers.is_empty() {
        out.push_str("None known.\n");
    } else {
        let peers: Vec<&str> = ctx
            .graph_context
            .peers
            .iter()
            .take(MAX_PEERS)
            .map(|s| s.as_str())
            .collect();
        out.push_str(&format!("{}\n", peers.join(", ")));
    }

    out.push_str("\n### Known Risks\n");
    if ctx.graph_context.risks.is_empty() {
        out.push_str("None known.\n");
    } else {
        for risk in ctx.graph_context.risks.iter().take(MAX_RISKS) {
            out.push_str(&format!("- {risk}\n"));
        }
    }

    out.push_str("\n### Confidence Adjustment\n");
    out.push_str("| Factor | Adjustment |\n|--------|------------|\n");
    for (factor, value) in &adjustment.modifiers {
        out.push_str(&format!("| {factor} | {value:+} |\n"));
    }
    out.push_str(&format!(
        "\n**{ticker} confidence: {}% → {}%**\n",
        original, adjustment.adjusted
    ));
    out.push_str(&format!(
        "\n**Historical Pattern**: {}\n",
        adjustment.pattern.label()
    ));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BiasWarning;
    use crate::retrieval::GraphContext;

    fn ctx_with(
        history_count: i64,
        peers: Vec<String>,
        bias_warnings: Vec<BiasWarning>,
    ) -> HybridContext {
        let has_history = history_count >= 1;
        let has_graph_data = !peers.is_empty();
        HybridContext {
            vector_results: vec![],
            graph_context: GraphContext {
                peers,
                risks: vec![],
                strategies: vec![],
            },
            bias_warnings,
            strategy_recommendations: vec![],
            has_history,
            history_count,
            has_graph_data,
            is_first_analysis: !has_history && !has_graph_data,
            formatted: String::new(),
        }
    }

    fn bias(name: &str, occurrences: i64) -> BiasWarning {
        BiasWarning {
            bias: name.to_string(),
            occurrences,
            last_impact: None,
            ticker_specific: true,
        }
    }

    #[test]
    fn first_analysis_applies_both_baseline_penalties() {
        let ctx = ctx_with(0, vec![], vec![]);
        let adj = compute_adjustment(76, Recommendation::Buy, &ctx, &[]);
        assert_eq!(adj.adjusted, 61);
        assert_eq!(adj.modifiers.get(MOD_FIRST_ANALYSIS), Some(&-10));
        assert_eq!(adj.modifiers.get(MOD_NO_GRAPH), Some(&-5));
        assert_eq!(adj.modifiers.len(), 2);
        assert_eq!(adj.pattern, PatternOutcome::FirstAnalysis);
    }

    #[test]
    fn confirming_pattern_adds_five() {
        let ctx = ctx_with(3, vec!["AMD".into(), "INTC".into()], vec![]);
        let recent = [
            Recommendation::Buy,
            Recommendation::Buy,
            Recommendation::Wait,
        ];
        let adj = compute_adjustment(70, Recommendation::Buy, &ctx, &recent);
        assert_eq!(adj.adjusted, 75);
        assert_eq!(adj.modifiers.get(MOD_PATTERN_CONFIRMS), Some(&5));
        assert_eq!(adj.modifiers.len(), 1);
        assert_eq!(adj.pattern, PatternOutcome::Confirms);
    }

    #[test]
    fn contradiction_with_capped_bias_penalty() {
        let ctx = ctx_with(
            3,
            vec!["AMD".into()],
            vec![bias("loss-aversion", 2), bias("confirmation-bias", 3)],
        );
        let recent = [
            Recommendation::Sell,
            Recommendation::Bearish,
            Recommendation::Sell,
        ];
        let adj = compute_adjustment(80, Recommendation::Buy, &ctx, &recent);
        assert_eq!(adj.adjusted, 55);
        assert_eq!(adj.modifiers.get(MOD_PATTERN_CONTRADICTS), Some(&-10));
        assert_eq!(adj.modifiers.get(MOD_BIAS_WARNINGS), Some(&-15));
        assert_eq!(adj.pattern, PatternOutcome::Contradicts);
    }

    #[test]
    fn ten_bias_warnings_cap_at_fifteen() {
        let warnings: Vec<BiasWarning> = (0..10).map(|i| bias(&format!("b{i}"), 1)).collect();
        let ctx = ctx_with(3, vec!["AMD".into()], warnings);
        let adj = compute_adjustment(50, Recommendation::Hold, &ctx, &[]);
        assert_eq!(adj.modifiers.get(MOD_BIAS_WARNINGS), Some(&-15));
    }

    #[test]
    fn sparse_history_penalty() {
        let ctx = ctx_with(2, vec!["AMD".into()], vec![]);
        let adj = compute_adjustment(60, Recommendation::Hold, &ctx, &[Recommendation::Buy]);
        assert_eq!(adj.modifiers.get(MOD_SPARSE_HISTORY), Some(&-5));
        // Neutral current sentiment: no pattern adjustment either way.
        assert!(!adj.modifiers.contains_key(MOD_PATTERN_CONFIRMS));
        assert!(!adj.modifiers.contains_key(MOD_PATTERN_CONTRADICTS));
        assert_eq!(adj.pattern, PatternOutcome::NoPattern);
    }

    #[test]
    fn tied_vote_breaks_toward_neutral() {
        let ctx = ctx_with(2, vec!["AMD".into()], vec![]);
        let recent = [Recommendation::Buy, Recommendation::Sell];
        let adj = compute_adjustment(60, Recommendation::Buy, &ctx, &recent);
        assert!(!adj.modifiers.contains_key(MOD_PATTERN_CONFIRMS));
        assert!(!adj.modifiers.contains_key(MOD_PATTERN_CONTRADICTS));
    }

    #[test]
    fn single_directional_vote_counts() {
        let ctx = ctx_with(1, vec!["AMD".into()], vec![]);
        let adj = compute_adjustment(60, Recommendation::Buy, &ctx, &[Recommendation::Long]);
        assert_eq!(adj.modifiers.get(MOD_PATTERN_CONFIRMS), Some(&5));
    }

    #[test]
    fn clamped_at_both_ends() {
        let ctx = ctx_with(0, vec![], vec![bias("b", 5)]);
        let low = compute_adjustment(0, Recommendation::Buy, &ctx, &[]);
        assert_eq!(low.adjusted, 0);

        let confirms = ctx_with(3, vec!["AMD".into()], vec![]);
        let high = compute_adjustment(
            100,
            Recommendation::Buy,
            &confirms,
            &[Recommendation::Buy, Recommendation::Buy, Recommendation::Buy],
        );
        assert_eq!(high.adjusted, 100);
    }

    #[test]
    fn adjusted_equals_original_plus_modifier_sum() {
        let ctx = ctx_with(
            2,
            vec![],
            vec![bias("loss-aversion", 1)],
        );
        let adj = compute_adjustment(
            70,
            Recommendation::Sell,
            &ctx,
            &[Recommendation::Buy, Recommendation::Buy],
        );
        let sum: i64 = adj.modifiers.values().sum();
        assert_eq!(adj.adjusted, (70 + sum).clamp(0, 100));
        // sparse(-5) + no_graph(-5) + bias(-3) + contradicts(-10)
        assert_eq!(sum, -23);
        assert_eq!(adj.adjusted, 47);
    }

    #[test]
    fn synthesis_block_shape() {
        let ctx = ctx_with(3, vec!["AMD".into(), "INTC".into()], vec![bias("anchoring", 2)]);
        let adj = compute_adjustment(
            70,
            Recommendation::Buy,
            &ctx,
            &[Recommendation::Buy, Recommendation::Buy, Recommendation::Wait],
        );
        let history = vec![HistoryRow {
            date: "2026-07-30".to_string(),
            kind: "stock".to_string(),
            recommendation: "BUY".to_string(),
            confidence: 72,
        }];
        let block = render_synthesis("NVDA", 70, &adj, &ctx, &history);
        assert!(block.starts_with("\n---\n\n## Historical Comparison (Auto-Generated)"));
        assert!(block.contains("| 2026-07-30 | stock | BUY | 72% |"));
        assert!(block.contains("AMD, INTC"));
        assert!(block.contains("| pattern_confirms | +5 |"));
        assert!(block.contains("**Historical Pattern**: Confirms recent historical sentiment"));
    }
}
