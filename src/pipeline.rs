//! Cache-first, optionally reranked context retrieval.
//!
//! [`QueryPipeline::answer`] runs one query end to end:
//!
//! 1. Fail fast with [`QueryError::NotReady`] when no generation is
//!    active, before any embedding work.
//! 2. Normalize the query and look up
//!    `(generation, normalized text, max_results, rerank)` in the cache.
//! 3. On a miss, encode the normalized text and search the generation
//!    snapshot taken in step 1. With reranking, over-fetch candidates
//!    (3–5× `max_results`, capped).
//! 4. Rerank: rescore candidates, stable re-sort, truncate.
//! 5. Cache the final list and return it.
//!
//! The whole query uses one generation snapshot, so a concurrent swap is
//! never observed halfway through.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{cache_key, normalize_query, CacheLayer};
use crate::config::{Config, RetrievalConfig};
use crate::embedding::Encoder;
use crate::error::QueryError;
use crate::generation::{IndexGeneration, ScoredChunk};
use crate::rerank::Reranker;
use crate::store::VectorIndexStore;
use crate::workers::WorkerPool;

/// Shortest accepted query, in characters, after normalization.
pub const MIN_QUERY_CHARS: usize = 3;
/// Longest accepted query, in characters, after normalization.
pub const MAX_QUERY_CHARS: usize = 512;

/// One context query.
#[derive(Debug, Clone, Deserialize)]
pub struct ContextQuery {
    pub query: String,
    /// Defaults to `retrieval.default_max_results`; clamped to
    /// `[1, retrieval.max_results]`.
    #[serde(default)]
    pub max_results: Option<usize>,
    /// Overrides `retrieval.rerank_enabled` for this query.
    #[serde(default)]
    pub rerank: Option<bool>,
}

impl ContextQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            max_results: None,
            rerank: None,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn with_rerank(mut self, rerank: bool) -> Self {
        self.rerank = Some(rerank);
        self
    }
}

/// One retrieved chunk. Lists are ordered by descending `score`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub content: String,
    /// Always a JSON object; chunks stored without metadata get `{}`.
    pub metadata: serde_json::Value,
    pub score: f32,
}

impl From<ScoredChunk> for ContextItem {
    fn from(hit: ScoredChunk) -> Self {
        Self {
            content: hit.content,
            metadata: hit.metadata,
            score: hit.score,
        }
    }
}

/// Response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ContextAnswer {
    pub query_id: Uuid,
    pub context: Vec<ContextItem>,
    pub processing_time_ms: u64,
}

/// Knobs the pipeline reads from `[retrieval]` and `[cache]`.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_results: usize,
    pub default_max_results: usize,
    pub rerank_by_default: bool,
    pub rerank_over_fetch: usize,
    pub rerank_max_candidates: usize,
    pub cache_key_prefix: String,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.retrieval, &config.cache.key_prefix)
    }

    pub fn new(retrieval: &RetrievalConfig, cache_key_prefix: &str) -> Self {
        Self {
            max_results: retrieval.max_results,
            default_max_results: retrieval.default_max_results,
            rerank_by_default: retrieval.rerank_enabled,
            rerank_over_fetch: retrieval.rerank_over_fetch,
            rerank_max_candidates: retrieval.rerank_max_candidates,
            cache_key_prefix: cache_key_prefix.to_string(),
        }
    }

    /// Clamp a requested result count into `[1, max_results]`.
    pub fn clamp_max_results(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_max_results)
            .clamp(1, self.max_results.max(1))
    }

    /// How many raw candidates to fetch before reranking down to
    /// `max_results`.
    pub fn rerank_candidates(&self, max_results: usize) -> usize {
        let factor = self.rerank_over_fetch.clamp(3, 5);
        (max_results * factor)
            .min(self.rerank_max_candidates)
            .max(max_results)
    }
}

pub struct QueryPipeline {
    store: Arc<VectorIndexStore>,
    encoder: Arc<dyn Encoder>,
    reranker: Option<Arc<dyn Reranker>>,
    cache: Arc<dyn CacheLayer>,
    workers: WorkerPool,
    settings: PipelineSettings,
}

impl QueryPipeline {
    pub fn new(
        store: Arc<VectorIndexStore>,
        encoder: Arc<dyn Encoder>,
        reranker: Option<Arc<dyn Reranker>>,
        cache: Arc<dyn CacheLayer>,
        workers: WorkerPool,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            encoder,
            reranker,
            cache,
            workers,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn answer(&self, query: &ContextQuery) -> Result<ContextAnswer, QueryError> {
        let started = Instant::now();
        let query_id = Uuid::new_v4();

        let generation = self.store.snapshot().ok_or(QueryError::NotReady)?;

        let normalized = validated_query(&query.query)?;

        let max_results = self.settings.clamp_max_results(query.max_results);
        let wants_rerank = query.rerank.unwrap_or(self.settings.rerank_by_default);
        let reranker = if wants_rerank {
            if self.reranker.is_none() {
                debug!(%query_id, "Rerank requested but no reranker is loaded");
            }
            self.reranker.clone()
        } else {
            None
        };

        let key = cache_key(
            &self.settings.cache_key_prefix,
            generation.id(),
            &normalized,
            max_results,
            reranker.is_some(),
        );

        if let Some(raw) = self.cache.get(&key).await {
            match serde_json::from_str::<Vec<ContextItem>>(&raw) {
                Ok(context) => {
                    debug!(%query_id, results = context.len(), "Cache hit");
                    return Ok(ContextAnswer {
                        query_id,
                        context,
                        processing_time_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(e) => warn!(%query_id, error = %e, "Discarding unreadable cache entry"),
            }
        } else {
            debug!(%query_id, "Cache miss");
        }

        let (context, cacheable) = self
            .compute(&generation, &normalized, max_results, reranker.as_deref())
            .await?;

        if cacheable {
            match serde_json::to_string(&context) {
                Ok(raw) => self.cache.put(&key, &raw).await,
                Err(e) => warn!(%query_id, error = %e, "Could not serialize results for cache"),
            }
        }

        debug!(
            %query_id,
            generation = %generation.id(),
            results = context.len(),
            reranked = reranker.is_some(),
            "Query answered"
        );
        Ok(ContextAnswer {
            query_id,
            context,
            processing_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Encode, search and optionally rerank. The flag is `false` when the
    /// result is a degraded fallback that should not be cached.
    async fn compute(
        &self,
        generation: &Arc<IndexGeneration>,
        normalized: &str,
        max_results: usize,
        reranker: Option<&dyn Reranker>,
    ) -> Result<(Vec<ContextItem>, bool), QueryError> {
        if generation.is_empty() {
            return Ok((Vec::new(), true));
        }

        let vector = self
            .workers
            .run(self.encoder.encode(normalized))
            .await?
            .map_err(|e| QueryError::Internal(format!("encoding failed: {}", e)))?;

        let k = match reranker {
            Some(_) => self.settings.rerank_candidates(max_results),
            None => max_results,
        };
        let k = self.store.clamp_k(k);

        let snapshot = generation.clone();
        let hits = self
            .workers
            .run_blocking(move || snapshot.search(&vector, k))
            .await??;

        let Some(reranker) = reranker else {
            return Ok((hits.into_iter().map(ContextItem::from).collect(), true));
        };

        let documents: Vec<String> = hits.iter().map(|h| h.content.clone()).collect();
        match self
            .workers
            .run(reranker.score(normalized, &documents))
            .await?
        {
            Ok(scores) if scores.len() == hits.len() => {
                Ok((apply_rerank(hits, scores, max_results), true))
            }
            Ok(scores) => {
                warn!(
                    expected = hits.len(),
                    got = scores.len(),
                    "Reranker returned wrong number of scores; using vector order"
                );
                Ok((truncate_hits(hits, max_results), false))
            }
            Err(e) => {
                warn!(error = %e, "Rerank failed; using vector order");
                Ok((truncate_hits(hits, max_results), false))
            }
        }
    }
}

/// Replace scores, stable-sort descending (ties keep vector rank), and
/// keep the top `max_results`.
fn apply_rerank(hits: Vec<ScoredChunk>, scores: Vec<f32>, max_results: usize) -> Vec<ContextItem> {
    let mut items: Vec<ContextItem> = hits
        .into_iter()
        .zip(scores)
        .map(|(hit, score)| ContextItem {
            content: hit.content,
            metadata: hit.metadata,
            score,
        })
        .collect();
    items.sort_by(|a, b| b.score.total_cmp(&a.score));
    items.truncate(max_results);
    items
}

fn truncate_hits(hits: Vec<ScoredChunk>, max_results: usize) -> Vec<ContextItem> {
    hits.into_iter()
        .take(max_results)
        .map(ContextItem::from)
        .collect()
}

/// Collapse whitespace and enforce the query length bounds.
fn validated_query(raw: &str) -> Result<String, QueryError> {
    let normalized = normalize_query(raw);
    let chars = normalized.chars().count();
    if chars == 0 {
        return Err(QueryError::InvalidQuery("query must not be empty".into()));
    }
    if chars < MIN_QUERY_CHARS {
        return Err(QueryError::InvalidQuery(format!(
            "query must be at least {} characters",
            MIN_QUERY_CHARS
        )));
    }
    if chars > MAX_QUERY_CHARS {
        return Err(QueryError::InvalidQuery(format!(
            "query exceeds {} characters",
            MAX_QUERY_CHARS
        )));
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> PipelineSettings {
        PipelineSettings::new(&RetrievalConfig::default(), "t:")
    }

    fn hit(id: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            id: id.into(),
            content: id.into(),
            metadata: serde_json::json!({}),
            score,
        }
    }

    #[test]
    fn max_results_is_clamped() {
        let s = settings();
        assert_eq!(s.clamp_max_results(None), 5);
        assert_eq!(s.clamp_max_results(Some(0)), 1);
        assert_eq!(s.clamp_max_results(Some(500)), 20);
        assert_eq!(s.clamp_max_results(Some(7)), 7);
    }

    #[test]
    fn rerank_over_fetches_within_caps() {
        let mut s = settings();
        assert_eq!(s.rerank_candidates(3), 12);
        assert_eq!(s.rerank_candidates(20), 50);

        s.rerank_over_fetch = 10;
        assert_eq!(s.rerank_candidates(3), 15);
        s.rerank_over_fetch = 1;
        assert_eq!(s.rerank_candidates(3), 9);

        s.rerank_max_candidates = 2;
        assert_eq!(s.rerank_candidates(3), 3);
    }

    #[test]
    fn rerank_resorts_stably_and_truncates() {
        let hits = vec![hit("a", 0.9), hit("b", 0.8), hit("c", 0.7), hit("d", 0.6)];
        let items = apply_rerank(hits, vec![0.1, 0.5, 0.5, 0.9], 3);
        let order: Vec<_> = items.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(order, vec!["d", "b", "c"]);
        assert_eq!(items[0].score, 0.9);
    }

    #[test]
    fn query_length_bounds() {
        assert!(matches!(validated_query("  \t "), Err(QueryError::InvalidQuery(m)) if m.contains("empty")));
        assert!(matches!(validated_query(" ab "), Err(QueryError::InvalidQuery(m)) if m.contains("at least 3")));
        assert_eq!(validated_query("  api   key ").unwrap(), "api key");
        assert_eq!(validated_query("abc").unwrap(), "abc");
        assert!(validated_query(&"x".repeat(MAX_QUERY_CHARS)).is_ok());
        assert!(validated_query(&"x".repeat(MAX_QUERY_CHARS + 1)).is_err());
    }

    #[test]
    fn answer_serializes_ids_as_strings() {
        let answer = ContextAnswer {
            query_id: Uuid::new_v4(),
            context: vec![ContextItem::from(hit("a", 0.5))],
            processing_time_ms: 3,
        };
        let value = serde_json::to_value(&answer).unwrap();
        assert_eq!(value["query_id"], answer.query_id.to_string());
        assert_eq!(value["context"][0]["content"], "a");
    }

    #[test]
    fn context_query_deserializes_with_defaults() {
        let q: ContextQuery = serde_json::from_str(r#"{"query":"rate limiter"}"#).unwrap();
        assert!(q.max_results.is_none());
        assert!(q.rerank.is_none());
        let q: ContextQuery =
            serde_json::from_str(r#"{"query":"x","max_results":3,"rerank":true}"#).unwrap();
        assert_eq!(q.max_results, Some(3));
        assert_eq!(q.rerank, Some(true));
    }
}
