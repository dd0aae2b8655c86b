//! Index acquisition state machine.
//!
//! [`LifecycleController`] drives one acquisition attempt at a time:
//!
//! ```text
//! credentials → fetch (bounded retry) → [checksum] → unpack → manifest → load → activate
//! ```
//!
//! and publishes the outcome as an [`IndexStatus`]:
//!
//! ```text
//! NOT_STARTED → LOADING → LOADED
//!                       ↘ NOT_FOUND   (object absent)
//!                       ↘ FAILED      (anything else)
//! ```
//!
//! Only a `LOADED` outcome touches the [`VectorIndexStore`]; every other
//! outcome leaves the previously active generation serving. Attempts never
//! overlap: a trigger while one is running reports
//! [`RefreshOutcome::AlreadyRunning`].
//!
//! On-disk layout under `index.data_dir`:
//!
//! ```text
//! staging/<uuid>.zip        downloaded archive, removed after every attempt
//! generations/<uuid>/       one unpacked artifact per generation
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive;
use crate::config::{Config, StorageBackend, StorageConfig};
use crate::credentials::CredentialResolver;
use crate::error::{FetchError, LifecycleError, ManifestError, UnpackError};
use crate::fetch::{LocalObjectStore, ObjectStore, S3ObjectStore};
use crate::generation::IndexGeneration;
use crate::manifest::{self, ExpectedIndex};
use crate::store::VectorIndexStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexStatus {
    NotStarted,
    Loading,
    Loaded,
    NotFound,
    Failed,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::NotStarted => "NOT_STARTED",
            IndexStatus::Loading => "LOADING",
            IndexStatus::Loaded => "LOADED",
            IndexStatus::NotFound => "NOT_FOUND",
            IndexStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the controller's state, published on every transition.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleState {
    pub status: IndexStatus,
    /// When the active generation was activated.
    pub last_modified: Option<DateTime<Utc>>,
    pub generation_id: Option<Uuid>,
    /// Branch declared by the active generation's manifest.
    pub index_branch: Option<String>,
    /// Error of the most recent attempt, cleared on success.
    pub last_error: Option<String>,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self {
            status: IndexStatus::NotStarted,
            last_modified: None,
            generation_id: None,
            index_branch: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Completed(IndexStatus),
    AlreadyRunning,
}

/// Where artifacts come from.
pub enum ArtifactSource {
    /// Resolve credentials on every attempt, then fetch over S3.
    S3 {
        storage: StorageConfig,
        resolver: CredentialResolver,
    },
    /// A ready-made store (local directory, or a double in tests).
    Store(Arc<dyn ObjectStore>),
}

impl ArtifactSource {
    pub fn from_config(storage: &StorageConfig) -> anyhow::Result<Self> {
        match storage.backend {
            StorageBackend::S3 => Ok(Self::S3 {
                storage: storage.clone(),
                resolver: CredentialResolver::from_config(storage),
            }),
            StorageBackend::Local => {
                let root = storage
                    .local_root
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("storage.local_root is required for the local backend"))?;
                Ok(Self::Store(Arc::new(LocalObjectStore::new(root))))
            }
        }
    }

    async fn open(&self) -> Result<Arc<dyn ObjectStore>, LifecycleError> {
        match self {
            ArtifactSource::S3 { storage, resolver } => {
                let signer = resolver.resolve().await?;
                Ok(Arc::new(S3ObjectStore::new(storage, signer)?))
            }
            ArtifactSource::Store(store) => Ok(store.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub data_dir: PathBuf,
    pub object_key: String,
    pub expected: ExpectedIndex,
    pub max_retries: u32,
    pub verify_checksum: bool,
    pub startup_timeout: Duration,
    pub refresh_interval: Option<Duration>,
    /// First retry delay; doubles per attempt up to 32×.
    pub backoff_base: Duration,
}

impl LifecycleSettings {
    /// `encoder_dims` is the loaded encoder's output size.
    pub fn from_config(config: &Config, encoder_dims: Option<usize>) -> Self {
        Self {
            data_dir: config.index.data_dir.clone(),
            object_key: config.storage.object_key(),
            expected: ExpectedIndex {
                embedding_model: config.embedding.model.clone(),
                distance_metric: config.index.distance_metric,
                dataset_name: config.index.dataset_name.clone(),
                embedding_dims: encoder_dims.or(config.embedding.dims),
                branch: Some(config.storage.branch.clone()),
            },
            max_retries: config.storage.max_retries,
            verify_checksum: config.storage.verify_checksum,
            startup_timeout: Duration::from_secs(config.index.startup_timeout_secs),
            refresh_interval: match config.index.refresh_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            backoff_base: Duration::from_secs(1),
        }
    }

    fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    fn generations_dir(&self) -> PathBuf {
        self.data_dir.join("generations")
    }
}

/// Removes a staged file when the attempt ends, however it ends.
struct StagedFile(PathBuf);

impl Drop for StagedFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => debug!(path = %self.0.display(), "Staged file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.0.display(), error = %e, "Failed to remove staged file"),
        }
    }
}

pub struct LifecycleController {
    source: ArtifactSource,
    store: Arc<VectorIndexStore>,
    settings: LifecycleSettings,
    state: watch::Sender<LifecycleState>,
    attempt: tokio::sync::Mutex<()>,
}

impl LifecycleController {
    pub fn new(source: ArtifactSource, store: Arc<VectorIndexStore>, settings: LifecycleSettings) -> Self {
        let (state, _) = watch::channel(LifecycleState::default());
        Self {
            source,
            store,
            settings,
            state,
            attempt: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> IndexStatus {
        self.state.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Whether an acquisition attempt is in flight right now.
    pub fn is_refreshing(&self) -> bool {
        self.attempt.try_lock().is_err()
    }

    /// Run one acquisition attempt unless one is already running.
    pub async fn refresh(&self) -> RefreshOutcome {
        let Ok(_running) = self.attempt.try_lock() else {
            info!("Index refresh already in progress");
            return RefreshOutcome::AlreadyRunning;
        };

        self.state.send_modify(|s| s.status = IndexStatus::Loading);
        info!(object = %self.settings.object_key, "Index acquisition started");

        let status = match self.acquire().await {
            Ok(generation) => {
                let id = generation.id();
                let branch = generation.manifest().branch.clone();
                let loaded_at = generation.loaded_at();
                self.store.activate(generation);
                self.state.send_modify(|s| {
                    s.status = IndexStatus::Loaded;
                    s.last_modified = Some(loaded_at);
                    s.generation_id = Some(id);
                    s.index_branch = Some(branch);
                    s.last_error = None;
                });
                IndexStatus::Loaded
            }
            Err(e) => {
                let status = if e.is_not_found() {
                    warn!(error = %e, "Index artifact not published yet");
                    IndexStatus::NotFound
                } else {
                    error!(error = %e, "Index acquisition failed");
                    IndexStatus::Failed
                };
                if self.store.is_ready() {
                    warn!("Previous index generation remains active");
                }
                self.state.send_modify(|s| {
                    s.status = status;
                    s.last_error = Some(e.to_string());
                });
                status
            }
        };

        RefreshOutcome::Completed(status)
    }

    /// Initial load, bounded by the startup timeout.
    ///
    /// On timeout the controller reports FAILED and the attempt keeps
    /// running in the background; it may still complete later.
    pub async fn start(self: &Arc<Self>) -> IndexStatus {
        let removed = self.sweep_stale();
        if removed > 0 {
            info!(removed, "Removed stale generations from a previous run");
        }

        let this = self.clone();
        let attempt = tokio::spawn(async move { this.refresh().await });

        match tokio::time::timeout(self.settings.startup_timeout, attempt).await {
            Ok(Ok(RefreshOutcome::Completed(status))) => status,
            Ok(Ok(RefreshOutcome::AlreadyRunning)) => self.status(),
            Ok(Err(e)) => {
                error!(error = %e, "Index acquisition task panicked");
                self.state.send_modify(|s| {
                    s.status = IndexStatus::Failed;
                    s.last_error = Some(e.to_string());
                });
                IndexStatus::Failed
            }
            Err(_) => {
                let secs = self.settings.startup_timeout.as_secs();
                error!(timeout_secs = secs, "Initial index load timed out; continuing in background");
                self.state.send_modify(|s| {
                    s.status = IndexStatus::Failed;
                    s.last_error = Some(LifecycleError::Timeout(secs).to_string());
                });
                IndexStatus::Failed
            }
        }
    }

    /// Trigger [`refresh`](Self::refresh) every `refresh_interval` until
    /// `shutdown` flips to `true`. `None` when periodic refresh is off.
    pub fn spawn_periodic(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let interval = self.settings.refresh_interval?;
        let this = self.clone();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; the initial load covers it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match this.refresh().await {
                            RefreshOutcome::Completed(status) => debug!(%status, "Periodic refresh finished"),
                            RefreshOutcome::AlreadyRunning => debug!("Periodic refresh skipped; attempt in flight"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Periodic refresh stopped");
                            break;
                        }
                    }
                }
            }
        }))
    }

    /// Delete staged archives and every generation directory except the
    /// active one. Returns the number of entries removed.
    pub fn sweep_stale(&self) -> usize {
        let active = self.store.snapshot().map(|g| g.dir().to_path_buf());
        let mut removed = 0;

        for dir in [self.settings.staging_dir(), self.settings.generations_dir()] {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if active.as_deref() == Some(path.as_path()) {
                    continue;
                }
                let result = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                match result {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale entry"),
                }
            }
        }
        removed
    }

    /// One full attempt, producing a loaded (not yet active) generation.
    async fn acquire(&self) -> Result<Arc<IndexGeneration>, LifecycleError> {
        let object_store = self.source.open().await?;
        let key = &self.settings.object_key;

        let staging = self.settings.staging_dir();
        tokio::fs::create_dir_all(&staging).await?;

        let attempt_id = Uuid::new_v4();
        let archive_path = staging.join(format!("{}.zip", attempt_id.simple()));
        let _staged = StagedFile(archive_path.clone());

        self.fetch_with_retry(object_store.as_ref(), key, &archive_path).await?;

        if self.settings.verify_checksum {
            self.verify_checksum(object_store.as_ref(), key, &archive_path, &staging, attempt_id)
                .await?;
        }

        let generation_id = Uuid::new_v4();
        let target = self.settings.generations_dir().join(generation_id.to_string());
        {
            let archive_path = archive_path.clone();
            let target = target.clone();
            tokio::task::spawn_blocking(move || archive::unpack(&archive_path, &target))
                .await
                .map_err(|e| LifecycleError::Io(std::io::Error::other(e)))??;
        }

        match self.validate_and_load(generation_id, &target).await {
            Ok(generation) => Ok(Arc::new(generation)),
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&target).await {
                    warn!(path = %target.display(), error = %cleanup, "Failed to discard rejected generation");
                }
                Err(e)
            }
        }
    }

    async fn validate_and_load(&self, id: Uuid, dir: &Path) -> Result<IndexGeneration, LifecycleError> {
        let manifest = manifest::validate(dir, &self.settings.expected)?;
        let generation = IndexGeneration::load(id, dir.to_path_buf(), manifest).await?;

        // Manifests may omit embedding_dims; the stored vectors must still
        // match the encoder.
        if let Some(expected) = self.settings.expected.embedding_dims {
            if !generation.is_empty() && generation.dims() != expected {
                return Err(ManifestError::Mismatch {
                    field: "embedding_dims",
                    expected: expected.to_string(),
                    actual: generation.dims().to_string(),
                }
                .into());
            }
        }
        Ok(generation)
    }

    async fn fetch_with_retry(
        &self,
        store: &dyn ObjectStore,
        key: &str,
        destination: &Path,
    ) -> Result<(), LifecycleError> {
        let max_retries = self.settings.max_retries;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay = self.settings.backoff_base * (1u32 << (attempt - 1).min(5));
                info!(attempt, delay_ms = delay.as_millis() as u64, "Retrying index download");
                tokio::time::sleep(delay).await;
            }

            debug!(object = %store.describe(key), attempt, "Downloading index archive");
            match store.fetch(key, destination).await {
                Ok(bytes) => {
                    info!(object = %store.describe(key), bytes, "Index archive downloaded");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < max_retries => {
                    warn!(attempt, error = %e, "Transient download failure");
                }
                Err(e) => return Err(e.into()),
            }
        }

        // The loop always returns on its final iteration.
        Err(FetchError::transient(key, "retries exhausted").into())
    }

    async fn verify_checksum(
        &self,
        store: &dyn ObjectStore,
        key: &str,
        archive_path: &Path,
        staging: &Path,
        attempt_id: Uuid,
    ) -> Result<(), LifecycleError> {
        let sidecar_key = format!("{}.sha256", key);
        let sidecar_path = staging.join(format!("{}.sha256", attempt_id.simple()));
        let _staged = StagedFile(sidecar_path.clone());

        match store.fetch(&sidecar_key, &sidecar_path).await {
            Ok(_) => {}
            Err(FetchError::NotFound(_)) => {
                debug!(object = %store.describe(&sidecar_key), "No checksum sidecar; skipping verification");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let sidecar = tokio::fs::read_to_string(&sidecar_path).await?;
        let archive_path = archive_path.to_path_buf();
        tokio::task::spawn_blocking(move || archive::verify_checksum(&archive_path, &sidecar))
            .await
            .map_err(|e| LifecycleError::Unpack(UnpackError::CorruptArchive(e.to_string())))??;
        info!("Index archive checksum verified");
        Ok(())
    }
}
