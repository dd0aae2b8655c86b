//! The assembled service: one object owning every long-lived component.
//!
//! [`LibrarianService`] is built once at startup and shared (behind an
//! `Arc`) by every request handler. It owns the encoder, the reranker,
//! the cache, the vector store, the lifecycle controller and the query
//! pipeline, and exposes the operations the outer surfaces need:
//! [`answer`](LibrarianService::answer), [`health`](LibrarianService::health),
//! [`refresh`](LibrarianService::refresh), [`start`](LibrarianService::start)
//! and [`shutdown`](LibrarianService::shutdown).

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{create_cache, CacheLayer, CacheStatus};
use crate::config::Config;
use crate::embedding::{create_encoder, Encoder};
use crate::error::QueryError;
use crate::lifecycle::{
    ArtifactSource, IndexStatus, LifecycleController, LifecycleSettings, RefreshOutcome,
};
use crate::pipeline::{ContextAnswer, ContextQuery, PipelineSettings, QueryPipeline};
use crate::rerank::{create_reranker, Reranker, RerankerStatus};
use crate::resources::{ResourceMonitor, ResourceUsage};
use crate::store::VectorIndexStore;
use crate::workers::WorkerPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: &'static str,
    pub index_status: IndexStatus,
    pub index_last_modified: Option<DateTime<Utc>>,
    pub index_branch: Option<String>,
    pub dataset_name: String,
    pub generation_id: Option<Uuid>,
    pub reranker_status: RerankerStatus,
    pub cache_status: CacheStatus,
    pub resource_usage: ResourceUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

pub struct LibrarianService {
    dataset_name: String,
    controller: Arc<LifecycleController>,
    pipeline: QueryPipeline,
    cache: Arc<dyn CacheLayer>,
    reranker_status: RerankerStatus,
    resources: ResourceMonitor,
    shutdown: watch::Sender<bool>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl LibrarianService {
    /// Build every component from configuration. Loads the embedding
    /// model (and reranker, when enabled); does not fetch the index.
    pub async fn build(config: &Config) -> Result<Self> {
        let encoder = create_encoder(&config.embedding).await?;
        let (reranker, reranker_status) = create_reranker(&config.retrieval).await;
        let cache = create_cache(&config.cache);
        let source = ArtifactSource::from_config(&config.storage)?;

        Ok(Self::from_parts(config, encoder, reranker, reranker_status, cache, source))
    }

    /// Assemble from already-built components.
    pub fn from_parts(
        config: &Config,
        encoder: Arc<dyn Encoder>,
        reranker: Option<Arc<dyn Reranker>>,
        reranker_status: RerankerStatus,
        cache: Arc<dyn CacheLayer>,
        source: ArtifactSource,
    ) -> Self {
        let store = Arc::new(VectorIndexStore::new(config.retrieval.max_search_k));
        let settings = LifecycleSettings::from_config(config, Some(encoder.dims()));
        Self::with_settings(config, encoder, reranker, reranker_status, cache, source, store, settings)
    }

    /// Like [`from_parts`](Self::from_parts) with explicit lifecycle
    /// settings (e.g. a shorter retry backoff).
    #[allow(clippy::too_many_arguments)]
    pub fn with_settings(
        config: &Config,
        encoder: Arc<dyn Encoder>,
        reranker: Option<Arc<dyn Reranker>>,
        reranker_status: RerankerStatus,
        cache: Arc<dyn CacheLayer>,
        source: ArtifactSource,
        store: Arc<VectorIndexStore>,
        settings: LifecycleSettings,
    ) -> Self {
        let controller = Arc::new(LifecycleController::new(source, store.clone(), settings));
        let pipeline = QueryPipeline::new(
            store,
            encoder,
            reranker,
            cache.clone(),
            WorkerPool::new(config.retrieval.max_workers),
            PipelineSettings::from_config(config),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            dataset_name: config.index.dataset_name.clone(),
            controller,
            pipeline,
            cache,
            reranker_status,
            resources: ResourceMonitor::new(),
            shutdown,
            refresher: Mutex::new(None),
        }
    }

    /// Initial index load (bounded by the startup timeout), then periodic
    /// refresh when configured. Never fails: the outcome is in the status.
    pub async fn start(&self) -> IndexStatus {
        let status = self.controller.start().await;
        info!(%status, "Initial index load finished");

        if let Some(handle) = self.controller.spawn_periodic(self.shutdown.subscribe()) {
            if let Ok(mut slot) = self.refresher.lock() {
                *slot = Some(handle);
            }
        }
        status
    }

    pub async fn answer(&self, query: &ContextQuery) -> Result<ContextAnswer, QueryError> {
        self.pipeline.answer(query).await
    }

    /// Run one acquisition attempt now.
    pub async fn refresh(&self) -> RefreshOutcome {
        self.controller.refresh().await
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    pub fn health(&self) -> HealthReport {
        let state = self.controller.state();
        let reranker_ok = self.reranker_status != RerankerStatus::Error;
        // A refresh in flight keeps serving the active generation.
        let serving = match state.status {
            IndexStatus::Loaded => true,
            IndexStatus::Loading => state.generation_id.is_some(),
            _ => false,
        };
        let status = if serving && reranker_ok {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            version: env!("CARGO_PKG_VERSION"),
            index_status: state.status,
            index_last_modified: state.last_modified,
            index_branch: state.index_branch,
            dataset_name: self.dataset_name.clone(),
            generation_id: state.generation_id,
            reranker_status: self.reranker_status,
            cache_status: self.cache.status(),
            resource_usage: self.resources.sample(),
            last_error: state.last_error,
        }
    }

    /// Stop periodic refresh.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handle = self.refresher.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Periodic refresh task ended abnormally");
            }
        }
        info!("Librarian service stopped");
    }
}
