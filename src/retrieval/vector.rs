//! Vector-store interface. Used, not defined: the embedding engine lives
//! outside the core and is bound in at startup (tests bind in-memory fakes).

use crate::models::AnalysisKind;
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("vector store unavailable: {0}")]
pub struct VectorUnavailable(pub String);

#[derive(Debug, Clone)]
pub struct EmbeddedDoc {
    /// Stable identifier shared with the persisted analysis row.
    pub doc_id: String,
    pub chunk_count: usize,
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub ticker: Option<String>,
    pub kind: Option<AnalysisKind>,
    pub exclude_doc_id: Option<String>,
    pub top_k: usize,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub doc_id: String,
    pub file_path: String,
    pub doc_type: String,
    pub ticker: String,
    pub doc_date: String,
    pub section_label: String,
    pub content: String,
    /// In [0, 1].
    pub similarity: f64,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn embed_document(&self, path: &Path) -> Result<EmbeddedDoc, VectorUnavailable>;
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, VectorUnavailable>;
}
