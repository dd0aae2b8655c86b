//! Cross-encoder reranking of retrieved candidates.
//!
//! A [`Reranker`] scores each `(query, document)` pair jointly, which is
//! slower than vector similarity but more precise. The pipeline over-fetches
//! candidates, reranks them and keeps the best `max_results`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::RetrievalConfig;

#[async_trait]
pub trait Reranker: Send + Sync {
    fn model_name(&self) -> &str;

    /// Relevance of each document to `query`, in input order.
    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}

/// Reranker availability as reported by the health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankerStatus {
    Disabled,
    Ready,
    Error,
}

/// Load the configured reranker, or none when reranking is disabled.
///
/// A model that fails to load is not fatal: the service runs without
/// reranking and reports [`RerankerStatus::Error`].
pub async fn create_reranker(config: &RetrievalConfig) -> (Option<Arc<dyn Reranker>>, RerankerStatus) {
    if !config.rerank_enabled {
        return (None, RerankerStatus::Disabled);
    }

    match load(config).await {
        Ok(reranker) => {
            info!(model = reranker.model_name(), "Reranker ready");
            (Some(reranker), RerankerStatus::Ready)
        }
        Err(e) => {
            warn!(model = %config.rerank_model, error = %e, "Reranker failed to load; reranking disabled");
            (None, RerankerStatus::Error)
        }
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
async fn load(config: &RetrievalConfig) -> Result<Arc<dyn Reranker>> {
    let model = config.rerank_model.clone();
    let reranker = tokio::task::spawn_blocking(move || FastEmbedReranker::new(&model)).await??;
    Ok(Arc::new(reranker))
}

#[cfg(not(feature = "local-embeddings-fastembed"))]
async fn load(_config: &RetrievalConfig) -> Result<Arc<dyn Reranker>> {
    bail!("Reranking requires --features local-embeddings-fastembed")
}

/// fastembed `TextRerank` behind a mutex, run on the blocking pool.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct FastEmbedReranker {
    engine: Arc<std::sync::Mutex<fastembed::TextRerank>>,
    model_name: String,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl FastEmbedReranker {
    /// Load (downloading on first use) the named model. Blocking.
    pub fn new(model_name: &str) -> Result<Self> {
        let model = config_to_reranker_model(model_name)?;
        let options = fastembed::RerankInitOptions::new(model).with_show_download_progress(false);
        let engine = fastembed::TextRerank::try_new(options)
            .map_err(|e| anyhow::anyhow!("Failed to initialize reranker: {}", e))?;

        Ok(Self {
            engine: Arc::new(std::sync::Mutex::new(engine)),
            model_name: model_name.to_string(),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Reranker for FastEmbedReranker {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn score(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let engine = self.engine.clone();
        let query = query.to_owned();
        let documents = documents.to_vec();
        let count = documents.len();

        let results = tokio::task::spawn_blocking(move || {
            let mut engine = engine
                .lock()
                .map_err(|e| anyhow::anyhow!("Reranker mutex poisoned: {}", e))?;
            engine
                .rerank(query, documents, false, None)
                .map_err(|e| anyhow::anyhow!("Rerank failed: {}", e))
        })
        .await??;

        // fastembed returns results sorted by score; restore input order.
        let mut scores = vec![f32::NEG_INFINITY; count];
        for r in results {
            if r.index < count {
                scores[r.index] = r.score;
            }
        }
        Ok(scores)
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_reranker_model(name: &str) -> Result<fastembed::RerankerModel> {
    match name {
        "bge-reranker-base" | "BAAI/bge-reranker-base" => Ok(fastembed::RerankerModel::BGERerankerBase),
        "bge-reranker-v2-m3" | "BAAI/bge-reranker-v2-m3" => Ok(fastembed::RerankerModel::BGERerankerV2M3),
        "jina-reranker-v1-turbo-en" => Ok(fastembed::RerankerModel::JINARerankerV1TurboEn),
        "jina-reranker-v2-base-multilingual" => {
            Ok(fastembed::RerankerModel::JINARerankerV2BaseMultiligual)
        }
        other => bail!(
            "Unknown reranker model: '{}'. Supported models: \
             bge-reranker-base, bge-reranker-v2-m3, \
             jina-reranker-v1-turbo-en, jina-reranker-v2-base-multilingual",
            other
        ),
    }
}
