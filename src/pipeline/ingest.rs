//! Dual ingest of a saved analysis artifact.
//!
//! Vector embed and graph extract run concurrently and fail independently;
//! one store going down must not cost the other's write. External upserts are
//! keyed by `doc_id`, so at-least-once delivery is safe.

use crate::retrieval::{EmbeddedDoc, ExtractedGraph, GraphStore, VectorStore};
use std::{path::Path, sync::Arc};
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub vector: Option<EmbeddedDoc>,
    pub graph: Option<ExtractedGraph>,
    /// Carried forward to retrieval exclusion and the analysis row.
    pub doc_id: Option<String>,
    pub errors: Vec<String>,
}

impl IngestReport {
    pub fn timed_out() -> Self {
        Self {
            errors: vec!["ingest phase timed out".to_string()],
            ..Self::default()
        }
    }
}

pub async fn dual_ingest(
    vector: Option<&Arc<dyn VectorStore>>,
    graph: Option<&Arc<dyn GraphStore>>,
    artifact: &Path,
) -> IngestReport {
    let vector_fut = async {
        match vector {
            Some(store) => Some(store.embed_document(artifact).await),
            None => None,
        }
    };
    let graph_fut = async {
        match graph {
            Some(store) => Some(store.extract_document(artifact, true).await),
            None => None,
        }
    };

    let (vector_res, graph_res) = tokio::join!(vector_fut, graph_fut);

    let mut report = IngestReport::default();
    match vector_res {
        Some(Ok(embedded)) => {
            report.doc_id = Some(embedded.doc_id.clone());
            report.vector = Some(embedded);
        }
        Some(Err(e)) => {
            warn!(artifact = %artifact.display(), error = %e, "vector ingest failed");
            report.errors.push(format!("vector: {e}"));
        }
        None => {}
    }
    match graph_res {
        Some(Ok(extracted)) => report.graph = Some(extracted),
        Some(Err(e)) => {
            warn!(artifact = %artifact.display(), error = %e, "graph ingest failed");
            report.errors.push(format!("graph: {e}"));
        }
        None => {}
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::{GraphUnavailable, SearchHit, SearchQuery, VectorUnavailable};
    use async_trait::async_trait;

    struct OkVector;
    #[async_trait]
    impl VectorStore for OkVector {
        async fn embed_document(&self, _path: &Path) -> Result<EmbeddedDoc, VectorUnavailable> {
            Ok(EmbeddedDoc {
                doc_id: "NVDA_stock_20260801T1005".to_string(),
                chunk_count: 4,
            })
        }
        async fn search(&self, _q: &SearchQuery) -> Result<Vec<SearchHit>, VectorUnavailable> {
            Ok(vec![])
        }
    }

    struct DownVector;
    #[async_trait]
    impl VectorStore for DownVector {
        async fn embed_document(&self, _path: &Path) -> Result<EmbeddedDoc, VectorUnavailable> {
            Err(VectorUnavailable("connection refused".to_string()))
        }
        async fn search(&self, _q: &SearchQuery) -> Result<Vec<SearchHit>, VectorUnavailable> {
            Err(VectorUnavailable("connection refused".to_string()))
        }
    }

    struct OkGraph;
    #[async_trait]
    impl GraphStore for OkGraph {
        async fn extract_document(
            &self,
            _path: &Path,
            _commit: bool,
        ) -> Result<ExtractedGraph, GraphUnavailable> {
            Ok(ExtractedGraph {
                entities: 7,
                relations: 3,
            })
        }
        async fn get_ticker_context(
            &self,
            _t: &str,
        ) -> Result<crate::retrieval::GraphContext, GraphUnavailable> {
            Ok(Default::default())
        }
        async fn get_bias_warnings(
            &self,
            _t: &str,
        ) -> Result<Vec<crate::models::BiasWarning>, GraphUnavailable> {
            Ok(vec![])
        }
        async fn get_strategy_recommendations(
            &self,
            _t: &str,
        ) -> Result<Vec<crate::models::StrategyRec>, GraphUnavailable> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn both_stores_succeed() {
        let vector: Arc<dyn VectorStore> = Arc::new(OkVector);
        let graph: Arc<dyn GraphStore> = Arc::new(OkGraph);
        let report = dual_ingest(Some(&vector), Some(&graph), Path::new("/tmp/a.md")).await;
        assert_eq!(report.doc_id.as_deref(), Some("NVDA_stock_20260801T1005"));
        assert!(report.graph.is_some());
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn vector_failure_does_not_block_graph() {
        let vector: Arc<dyn VectorStore> = Arc::new(DownVector);
        let graph: Arc<dyn GraphStore> = Arc::new(OkGraph);
        let report = dual_ingest(Some(&vector), Some(&graph), Path::new("/tmp/a.md")).await;
        assert!(report.doc_id.is_none());
        assert!(report.graph.is_some());
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("vector:"));
    }

    #[tokio::test]
    async fn unconfigured_stores_are_silent() {
        let report = dual_ingest(None, None, Path::new("/tmp/a.md")).await;
        assert!(report.vector.is_none());
        assert!(report.graph.is_none());
        assert!(report.errors.is_empty());
    }
}
