//! Graph-store interface: structural neighbors, bias history, strategy
//! statistics. External engine, minimal surface.

use crate::models::{BiasWarning, StrategyRec};
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("graph store unavailable: {0}")]
pub struct GraphUnavailable(pub String);

/// Structural context for one ticker. All fields empty is the "no data yet"
/// sentinel.
#[derive(Debug, Clone, Default)]
pub struct GraphContext {
    pub peers: Vec<String>,
    pub risks: Vec<String>,
    pub strategies: Vec<StrategyRec>,
}

impl GraphContext {
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty() && self.risks.is_empty() && self.strategies.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractedGraph {
    pub entities: usize,
    pub relations: usize,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn extract_document(
        &self,
        path: &Path,
        commit: bool,
    ) -> Result<ExtractedGraph, GraphUnavailable>;
    async fn get_ticker_context(&self, ticker: &str) -> Result<GraphContext, GraphUnavailable>;
    async fn get_bias_warnings(&self, ticker: &str) -> Result<Vec<BiasWarning>, GraphUnavailable>;
    async fn get_strategy_recommendations(
        &self,
        ticker: &str,
    ) -> Result<Vec<StrategyRec>, GraphUnavailable>;
}
