use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::manifest::DistanceMetric;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub index: IndexConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub data_dir: PathBuf,
    pub dataset_name: String,
    #[serde(default)]
    pub distance_metric: DistanceMetric,
    #[serde(default)]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

fn default_startup_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    Local,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    pub branch: String,
    #[serde(default = "default_archive_name")]
    pub archive_name: String,
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
    #[serde(default = "default_profile")]
    pub credentials_profile: String,
    #[serde(default)]
    pub local_root: Option<PathBuf>,
    #[serde(default = "default_fetch_retries")]
    pub max_retries: u32,
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub verify_checksum: bool,
}

fn default_backend() -> StorageBackend {
    StorageBackend::S3
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_archive_name() -> String {
    "index.zip".to_string()
}
fn default_profile() -> String {
    "default".to_string()
}
fn default_fetch_retries() -> u32 {
    3
}
fn default_fetch_timeout_secs() -> u64 {
    300
}
fn default_true() -> bool {
    true
}

impl StorageConfig {
    /// Object key of the packaged index: `indexes/{branch}/latest/{archive_name}`.
    pub fn object_key(&self) -> String {
        format!("indexes/{}/latest/{}", self.branch, self.archive_name)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

fn default_provider() -> String {
    "local".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_default_max_results")]
    pub default_max_results: usize,
    #[serde(default = "default_max_search_k")]
    pub max_search_k: usize,
    #[serde(default)]
    pub rerank_enabled: bool,
    #[serde(default = "default_rerank_model")]
    pub rerank_model: String,
    #[serde(default = "default_rerank_over_fetch")]
    pub rerank_over_fetch: usize,
    #[serde(default = "default_rerank_max_candidates")]
    pub rerank_max_candidates: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            default_max_results: default_default_max_results(),
            max_search_k: default_max_search_k(),
            rerank_enabled: false,
            rerank_model: default_rerank_model(),
            rerank_over_fetch: default_rerank_over_fetch(),
            rerank_max_candidates: default_rerank_max_candidates(),
            max_workers: default_max_workers(),
        }
    }
}

fn default_max_results() -> usize {
    20
}
fn default_default_max_results() -> usize {
    5
}
fn default_max_search_k() -> usize {
    100
}
fn default_rerank_model() -> String {
    "bge-reranker-base".to_string()
}
fn default_rerank_over_fetch() -> usize {
    4
}
fn default_rerank_max_candidates() -> usize {
    50
}
fn default_max_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Redis,
    Memory,
    Disabled,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackend,
    #[serde(default = "default_cache_url")]
    pub url: String,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            url: default_cache_url(),
            ttl_secs: default_cache_ttl_secs(),
            timeout_ms: default_cache_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_cache_backend() -> CacheBackend {
    CacheBackend::Memory
}
fn default_cache_url() -> String {
    "redis://localhost:6379/0".to_string()
}
fn default_cache_ttl_secs() -> u64 {
    3600
}
fn default_cache_timeout_ms() -> u64 {
    250
}
fn default_key_prefix() -> String {
    "librarian:context:".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            log_level: default_log_level(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate a TOML configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.index.dataset_name.trim().is_empty() {
        anyhow::bail!("index.dataset_name must not be empty");
    }

    // Storage
    if config.storage.branch.trim().is_empty() {
        anyhow::bail!("storage.branch must be set to derive the object key");
    }
    if config.storage.archive_name.contains('/') || config.storage.archive_name.is_empty() {
        anyhow::bail!("storage.archive_name must be a plain file name");
    }
    match config.storage.backend {
        StorageBackend::S3 if config.storage.bucket.trim().is_empty() => {
            anyhow::bail!("storage.bucket is required for the s3 backend")
        }
        StorageBackend::Local if config.storage.local_root.is_none() => {
            anyhow::bail!("storage.local_root is required for the local backend")
        }
        _ => {}
    }

    // Embedding
    if config.embedding.model.trim().is_empty() {
        anyhow::bail!("embedding.model must be set");
    }
    match config.embedding.provider.as_str() {
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be local, openai, or ollama.",
            other
        ),
    }

    // Retrieval
    let r = &config.retrieval;
    if r.max_results < 1 {
        anyhow::bail!("retrieval.max_results must be >= 1");
    }
    if r.default_max_results < 1 || r.default_max_results > r.max_results {
        anyhow::bail!("retrieval.default_max_results must be in [1, max_results]");
    }
    if r.max_search_k < r.max_results {
        anyhow::bail!("retrieval.max_search_k must be >= retrieval.max_results");
    }
    if r.max_workers == 0 {
        anyhow::bail!("retrieval.max_workers must be > 0");
    }

    if config.cache.ttl_secs == 0 {
        anyhow::bail!("cache.ttl_secs must be > 0");
    }

    Ok(config)
}
