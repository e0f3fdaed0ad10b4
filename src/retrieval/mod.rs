//! Hybrid retrieval context builder.
//!
//! Combines similarity hits, graph neighbors, and bias/strategy history into
//! one context for synthesis. The two external stores are queried
//! concurrently and each failure degrades to empty defaults; an unreachable
//! store never fails the pipeline.

pub mod graph;
pub mod vector;

pub use graph::{ExtractedGraph, GraphContext, GraphStore, GraphUnavailable};
pub use vector::{EmbeddedDoc, SearchHit, SearchQuery, VectorStore, VectorUnavailable};

use crate::models::{AnalysisKind, BiasWarning, StrategyRec};
use crate::storage::Db;
use std::{cmp::Ordering, collections::HashMap, sync::Arc};
use tracing::warn;

const NOT_AVAILABLE: &str = "N/A";
const DEFAULT_TOP_K: usize = 8;

/// A similarity hit joined with its persisted analysis row. Absent enrichment
/// yields the literal `"N/A"` strings.
#[derive(Debug, Clone)]
pub struct EnrichedHit {
    pub doc_id: String,
    pub file_path: String,
    pub doc_type: String,
    pub ticker: String,
    pub doc_date: String,
    pub section_label: String,
    pub content: String,
    pub similarity: f64,
    pub recommendation: String,
    pub confidence: String,
    pub date: String,
}

#[derive(Debug, Clone)]
pub struct HybridContext {
    pub vector_results: Vec<EnrichedHit>,
    pub graph_context: GraphContext,
    pub bias_warnings: Vec<BiasWarning>,
    pub strategy_recommendations: Vec<StrategyRec>,
    pub has_history: bool,
    pub history_count: i64,
    pub has_graph_data: bool,
    pub is_first_analysis: bool,
    pub formatted: String,
}

impl HybridContext {
    /// Degraded fallback when retrieval is unreachable or times out.
    pub fn empty(ticker: &str) -> Self {
        let mut ctx = Self {
            vector_results: Vec::new(),
            graph_context: GraphContext::default(),
            bias_warnings: Vec::new(),
            strategy_recommendations: Vec::new(),
            has_history: false,
            history_count: 0,
            has_graph_data: false,
            is_first_analysis: true,
            formatted: String::new(),
        };
        ctx.formatted = render_markdown(ticker, &ctx);
        ctx
    }
}

/// `<TICKER>_<KIND>_<YYYYMMDDThhmm>` → `YYYY-MM-DD`.
pub fn date_from_doc_id(doc_id: &str) -> Option<String> {
    let stamp = doc_id.rsplit('_').next()?;
    let bytes = stamp.as_bytes();
    if bytes.len() != 13 || bytes[8] != b'T' {
        return None;
    }
    if !stamp[..8].bytes().all(|b| b.is_ascii_digit())
        || !stamp[9..].bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    Some(format!("{}-{}-{}", &stamp[..4], &stamp[4..6], &stamp[6..8]))
}

#[derive(Clone)]
pub struct HybridRetriever {
    db: Db,
    vector: Option<Arc<dyn VectorStore>>,
    graph: Option<Arc<dyn GraphStore>>,
    top_k: usize,
}

impl HybridRetriever {
    pub fn new(
        db: Db,
        vector: Option<Arc<dyn VectorStore>>,
        graph: Option<Arc<dyn GraphStore>>,
    ) -> Self {
        Self {
            db,
            vector,
            graph,
            top_k: DEFAULT_TOP_K,
        }
    }

    pub async fn build_context(
        &self,
        ticker: &str,
        query: &str,
        kind: AnalysisKind,
        exclude_doc_id: Option<&str>,
    ) -> HybridContext {
        let vector_fut = async {
            let Some(store) = &self.vector else {
                return Vec::new();
            };
            let q = SearchQuery {
                query: query.to_string(),
                ticker: Some(ticker.to_string()),
                kind: Some(kind),
                exclude_doc_id: exclude_doc_id.map(|s| s.to_string()),
                top_k: self.top_k,
            };
            match store.search(&q).await {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(ticker, error = %e, "vector search unavailable");
                    Vec::new()
                }
            }
        };

        let graph_ctx_fut = async {
            let Some(store) = &self.graph else {
                return GraphContext::default();
            };
            match store.get_ticker_context(ticker).await {
                Ok(ctx) => ctx,
                Err(e) => {
                    warn!(ticker, error = %e, "graph context unavailable");
                    GraphContext::default()
                }
            }
        };

        let biases_fut = async {
            let Some(store) = &self.graph else {
                return Vec::new();
            };
            match store.get_bias_warnings(ticker).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(ticker, error = %e, "bias warnings unavailable");
                    Vec::new()
                }
            }
        };

        let strategies_fut = async {
            let Some(store) = &self.graph else {
                return Vec::new();
            };
            match store.get_strategy_recommendations(ticker).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(ticker, error = %e, "strategy recommendations unavailable");
                    Vec::new()
                }
            }
        };

        let (mut hits, graph_context, bias_warnings, strategy_recommendations) =
            tokio::join!(vector_fut, graph_ctx_fut, biases_fut, strategies_fut);

        if let Some(excluded) = exclude_doc_id {
            hits.retain(|h| h.doc_id != excluded);
        }
        // Store similarity order first; deterministic tie-breaks after.
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.doc_date.cmp(&a.doc_date))
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });

        let vector_results = self.enrich(hits).await;

        let history_count = match self.db.count_results(ticker).await {
            Ok(n) => n,
            Err(e) => {
                warn!(ticker, error = %e, "history count unavailable");
                0
            }
        };
        let has_history = history_count >= 1;
        let has_graph_data = !graph_context.peers.is_empty() || !graph_context.risks.is_empty();

        let mut ctx = HybridContext {
            vector_results,
            graph_context,
            bias_warnings,
            strategy_recommendations,
            has_history,
            history_count,
            has_graph_data,
            is_first_analysis: !has_history && !has_graph_data,
            formatted: String::new(),
        };
        ctx.formatted = render_markdown(ticker, &ctx);
        ctx
    }

    async fn enrich(&self, hits: Vec<SearchHit>) -> Vec<EnrichedHit> {
        let doc_ids: Vec<String> = hits.iter().map(|h| h.doc_id.clone()).collect();
        let by_doc_id: HashMap<String, (String, i64)> = match self
            .db
            .get_results_by_doc_ids(&doc_ids)
            .await
        {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|r| {
                    r.doc_id
                        .clone()
                        .map(|id| (id, (r.recommendation.as_str().to_string(), r.confidence)))
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "hit enrichment unavailable");
                HashMap::new()
            }
        };

        hits.into_iter()
            .map(|h| {
                let (recommendation, confidence) = by_doc_id
                    .get(&h.doc_id)
                    .map(|(r, c)| (r.clone(), c.to_string()))
                    .unwrap_or_else(|| (NOT_AVAILABLE.to_string(), NOT_AVAILABLE.to_string()));
                let date =
                    date_from_doc_id(&h.doc_id).unwrap_or_else(|| NOT_AVAILABLE.to_string());
                EnrichedHit {
                    doc_id: h.doc_id,
                    file_path: h.file_path,
                    doc_type: h.doc_type,
                    ticker: h.ticker,
                    doc_date: h.doc_date,
                    section_label: h.section_label,
                    content: h.content,
                    similarity: h.similarity,
                    recommendation,
                    confidence,
                    date,
                }
            })
            .collect()
    }
}

/// Deterministic markdown rendering for downstream consumption.
fn render_markdown(ticker: &str, ctx: &HybridContext) -> String {
    let mut out = String::new();
    out.push_str(&format!("## Retrieved Context: {ticker}\n\n"));

    out.push_str("### Similar Past Analyses\n");
    if ctx.vector_results.is_empty() {
        out.push_str("- none\n");
    } else {
        for hit in &ctx.vector_results {
            out.push_str(&format!(
                "- [{}] {} ({}, sim {:.2}) rec={} conf={}\n",
                hit.date, hit.doc_id, hit.doc_type, hit.similarity, hit.recommendation,
                hit.confidence
            ));
        }
    }

    out.push_str("\n### Graph Context\n");
    if ctx.graph_context.is_empty() {
        out.push_str("- empty\n");
    } else {
        if !ctx.graph_context.peers.is_empty() {
            out.push_str(&format!("- Peers: {}\n", ctx.graph_context.peers.join(", ")));
        }
        if !ctx.graph_context.risks.is_empty() {
            out.push_str(&format!("- Risks: {}\n", ctx.graph_context.risks.join("; ")));
        }
        for s in &ctx.graph_context.strategies {
            out.push_str(&format!(
                "- Strategy: {} (win {:.0}%, n={})\n",
                s.strategy,
                s.win_rate * 100.0,
                s.sample
            ));
        }
    }

    out.push_str("\n### Bias Warnings\n");
    if ctx.bias_warnings.is_empty() {
        out.push_str("- none\n");
    } else {
        for b in &ctx.bias_warnings {
            out.push_str(&format!(
                "- {} (seen {}x{})\n",
                b.bias,
                b.occurrences,
                if b.ticker_specific { ", this ticker" } else { "" }
            ));
        }
    }

    out.push_str("\n### Strategy Performance\n");
    if ctx.strategy_recommendations.is_empty() {
        out.push_str("- none\n");
    } else {
        for s in &ctx.strategy_recommendations {
            out.push_str(&format!(
                "- {} (win {:.0}%, n={})\n",
                s.strategy,
                s.win_rate * 100.0,
                s.sample
            ));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_date_extraction() {
        assert_eq!(
            date_from_doc_id("NVDA_stock_20260801T1005").as_deref(),
            Some("2026-08-01")
        );
        assert_eq!(
            date_from_doc_id("BRK.B_earnings_20251102T0930").as_deref(),
            Some("2025-11-02")
        );
        assert!(date_from_doc_id("no-stamp-here").is_none());
        assert!(date_from_doc_id("NVDA_stock_2026").is_none());
        assert!(date_from_doc_id("NVDA_stock_20260801X1005").is_none());
    }

    #[test]
    fn empty_context_is_first_analysis() {
        let ctx = HybridContext::empty("NVDA");
        assert!(ctx.is_first_analysis);
        assert!(!ctx.has_history);
        assert!(!ctx.has_graph_data);
        assert!(ctx.formatted.contains("## Retrieved Context: NVDA"));
        assert!(ctx.formatted.contains("- none"));
    }
}
