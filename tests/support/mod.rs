//! Shared fixtures: a keyword encoder, scripted rerankers, slow and flaky
//! object stores, and helpers that publish index archives into a local
//! bucket directory.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use librarian::archive;
use librarian::cache::{CacheLayer, MemoryCache};
use librarian::config::{self, Config};
use librarian::embedding::Encoder;
use librarian::error::FetchError;
use librarian::fetch::{LocalObjectStore, ObjectStore};
use librarian::generation::{write_index_db, IndexedChunk};
use librarian::lifecycle::{ArtifactSource, LifecycleSettings};
use librarian::manifest::{DistanceMetric, IndexManifest, MANIFEST_FILE};
use librarian::rerank::{Reranker, RerankerStatus};
use librarian::service::LibrarianService;
use librarian::store::VectorIndexStore;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const MODEL: &str = "test-model";
pub const DATASET: &str = "codebase_collection";
pub const OBJECT_KEY: &str = "indexes/main/latest/index.zip";

/// Keywords that span the encoder's vector space, one axis each.
const AXES: [&str; 4] = ["rate", "cache", "auth", "deploy"];
pub const DIMS: usize = AXES.len();

pub fn embed(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    AXES.iter()
        .map(|word| lower.matches(word).count() as f32 + 0.01)
        .collect()
}

// ─── Encoder ────────────────────────────────────────────────────────

/// Counts keyword occurrences. Deterministic and counts its calls.
#[derive(Default)]
pub struct KeywordEncoder {
    pub calls: AtomicUsize,
}

impl KeywordEncoder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Encoder for KeywordEncoder {
    fn model_name(&self) -> &str {
        MODEL
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(embed(text))
    }
}

// ─── Rerankers ──────────────────────────────────────────────────────

/// Scores documents mentioning `favourite` at 1.0 and everything else at
/// 0.0. Records every candidate list it sees.
pub struct FavouriteReranker {
    pub favourite: &'static str,
    pub seen: Mutex<Vec<usize>>,
}

impl FavouriteReranker {
    pub fn new(favourite: &'static str) -> Self {
        Self {
            favourite,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn candidate_counts(&self) -> Vec<usize> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reranker for FavouriteReranker {
    fn model_name(&self) -> &str {
        "favourite"
    }

    async fn score(&self, _query: &str, documents: &[String]) -> Result<Vec<f32>> {
        self.seen.lock().unwrap().push(documents.len());
        Ok(documents
            .iter()
            .map(|d| {
                if d.to_lowercase().contains(self.favourite) {
                    1.0
                } else {
                    0.0
                }
            })
            .collect())
    }
}

pub struct BrokenReranker;

#[async_trait]
impl Reranker for BrokenReranker {
    fn model_name(&self) -> &str {
        "broken"
    }

    async fn score(&self, _query: &str, _documents: &[String]) -> Result<Vec<f32>> {
        anyhow::bail!("cross-encoder session crashed")
    }
}

// ─── Object stores ──────────────────────────────────────────────────

/// Delays every fetch before delegating.
pub struct SlowStore {
    pub inner: LocalObjectStore,
    pub delay: Duration,
}

#[async_trait]
impl ObjectStore for SlowStore {
    fn describe(&self, key: &str) -> String {
        self.inner.describe(key)
    }

    async fn fetch(&self, key: &str, destination: &Path) -> Result<u64, FetchError> {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch(key, destination).await
    }
}

/// Fails the first `failures` fetches with a transient error.
pub struct FlakyStore {
    pub inner: LocalObjectStore,
    pub failures: AtomicUsize,
    pub attempts: AtomicUsize,
}

impl FlakyStore {
    pub fn new(root: &Path, failures: usize) -> Self {
        Self {
            inner: LocalObjectStore::new(root),
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    fn describe(&self, key: &str) -> String {
        self.inner.describe(key)
    }

    async fn fetch(&self, key: &str, destination: &Path) -> Result<u64, FetchError> {
        if key == OBJECT_KEY {
            self.attempts.fetch_add(1, Ordering::SeqCst);
        }
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(FetchError::transient(key, "connection reset by peer"));
        }
        self.inner.fetch(key, destination).await
    }
}

// ─── Publishing ─────────────────────────────────────────────────────

pub fn manifest() -> IndexManifest {
    IndexManifest {
        embedding_model: MODEL.to_string(),
        distance_metric: DistanceMetric::Cosine,
        dataset_name: DATASET.to_string(),
        branch: "main".to_string(),
        embedding_dims: Some(DIMS),
        index_file: None,
        created_at: None,
    }
}

pub fn chunk(id: &str, content: &str) -> IndexedChunk {
    IndexedChunk {
        id: id.to_string(),
        content: content.to_string(),
        metadata: serde_json::json!({ "source": format!("{}.md", id) }),
        vector: embed(content),
    }
}

/// A small corpus about a web service.
pub fn corpus(prefix: &str) -> Vec<IndexedChunk> {
    [
        ("rate-limit", "The rate limiter allows 100 requests per minute per rate key"),
        ("cache", "Responses are cached in Redis with a one hour cache TTL"),
        ("auth", "Auth tokens are verified by the auth middleware"),
        ("deploy", "Deploy with the deploy script from the ops repo"),
        ("mixed", "The cache key includes the rate bucket"),
        ("limits", "Per-tenant limits are read at startup"),
    ]
    .iter()
    .map(|(id, text)| chunk(&format!("{}{}", prefix, id), &format!("{}{}", prefix, text)))
    .collect()
}

/// Build an artifact from `manifest` and `chunks` and upload it to the
/// bucket directory under [`OBJECT_KEY`]. Returns the archive path.
pub async fn publish(bucket: &Path, manifest: &IndexManifest, chunks: &[IndexedChunk]) -> PathBuf {
    let build = bucket
        .parent()
        .unwrap()
        .join(format!("build-{}", uuid::Uuid::new_v4().simple()));
    write_index_db(&build, chunks).await.unwrap();
    std::fs::write(
        build.join(MANIFEST_FILE),
        serde_json::to_string_pretty(manifest).unwrap(),
    )
    .unwrap();

    let archive_path = bucket.join(OBJECT_KEY);
    std::fs::create_dir_all(archive_path.parent().unwrap()).unwrap();
    archive::pack_dir(&build, &archive_path).unwrap();
    std::fs::remove_dir_all(&build).unwrap();
    archive_path
}

/// Write a `sha256sum`-style sidecar next to the published archive.
pub fn publish_checksum(bucket: &Path, digest: &str) {
    std::fs::write(
        bucket.join(format!("{}.sha256", OBJECT_KEY)),
        format!("{}  index.zip\n", digest),
    )
    .unwrap();
}

// ─── Service assembly ───────────────────────────────────────────────

pub struct Harness {
    pub tmp: TempDir,
    pub config: Config,
    pub encoder: Arc<KeywordEncoder>,
}

impl Harness {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let bucket = tmp.path().join("bucket");
        std::fs::create_dir_all(&bucket).unwrap();
        let content = format!(
            r#"
[index]
data_dir = "{}"
dataset_name = "{}"
startup_timeout_secs = 10

[storage]
backend = "local"
local_root = "{}"
branch = "main"

[embedding]
model = "{}"

[retrieval]
max_results = 10
default_max_results = 3

[cache]
backend = "memory"
"#,
            tmp.path().join("data").display(),
            DATASET,
            bucket.display(),
            MODEL
        );
        let config = config::parse_config(&content).unwrap();
        Self {
            tmp,
            config,
            encoder: Arc::new(KeywordEncoder::default()),
        }
    }

    pub fn bucket(&self) -> PathBuf {
        self.tmp.path().join("bucket")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.tmp.path().join("data")
    }

    pub fn settings(&self) -> LifecycleSettings {
        let mut settings = LifecycleSettings::from_config(&self.config, Some(DIMS));
        settings.backoff_base = Duration::from_millis(10);
        settings
    }

    pub fn local_source(&self) -> ArtifactSource {
        ArtifactSource::Store(Arc::new(LocalObjectStore::new(self.bucket())))
    }

    pub fn service(&self) -> Arc<LibrarianService> {
        self.service_with(None, self.local_source(), self.settings())
    }

    pub fn service_with_reranker(&self, reranker: Arc<dyn Reranker>) -> Arc<LibrarianService> {
        self.service_with(Some(reranker), self.local_source(), self.settings())
    }

    pub fn service_with(
        &self,
        reranker: Option<Arc<dyn Reranker>>,
        source: ArtifactSource,
        settings: LifecycleSettings,
    ) -> Arc<LibrarianService> {
        let status = if reranker.is_some() {
            RerankerStatus::Ready
        } else {
            RerankerStatus::Disabled
        };
        let cache: Arc<dyn CacheLayer> = Arc::new(MemoryCache::new(Duration::from_secs(3600)));
        let store = Arc::new(VectorIndexStore::new(self.config.retrieval.max_search_k));
        Arc::new(LibrarianService::with_settings(
            &self.config,
            self.encoder.clone(),
            reranker,
            status,
            cache,
            source,
            store,
            settings,
        ))
    }
}

/// Wait for a retired generation's directory to disappear; removal runs
/// on the blocking pool.
pub async fn wait_until_removed(path: &Path) {
    for _ in 0..100 {
        if !path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} was not removed", path.display());
}

/// Entries directly under `dir`, or zero when it does not exist.
pub fn entry_count(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}
