//! One immutable, fully loaded index generation.
//!
//! A generation is the in-memory form of one unpacked artifact: every
//! chunk's text, metadata and embedding, read once from the artifact's
//! SQLite file and never mutated afterwards. Queries hold an
//! `Arc<IndexGeneration>` for their whole lifetime, so a generation stays
//! valid while any in-flight query still references it even after a
//! newer one has been activated.
//!
//! When a replaced generation is marked [retired](IndexGeneration::retire),
//! its unpacked directory is deleted as the last reference is dropped.
//!
//! # Index file layout
//!
//! ```sql
//! CREATE TABLE chunks (
//!     id TEXT PRIMARY KEY,
//!     ordinal INTEGER NOT NULL,
//!     content TEXT NOT NULL,
//!     metadata_json TEXT
//! );
//! CREATE TABLE chunk_vectors (
//!     chunk_id TEXT PRIMARY KEY,
//!     embedding BLOB NOT NULL   -- little-endian f32
//! );
//! ```

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::IndexError;
use crate::manifest::{DistanceMetric, IndexManifest, DEFAULT_INDEX_FILE};

/// A chunk as stored in the index.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub id: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub vector: Vec<f32>,
}

/// A search hit. Higher `score` is always better.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub id: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub score: f32,
}

pub struct IndexGeneration {
    id: Uuid,
    dir: PathBuf,
    manifest: IndexManifest,
    chunks: Vec<IndexedChunk>,
    dims: usize,
    loaded_at: DateTime<Utc>,
    retired: AtomicBool,
}

impl std::fmt::Debug for IndexGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexGeneration")
            .field("id", &self.id)
            .field("dir", &self.dir)
            .field("chunks", &self.chunks.len())
            .field("dims", &self.dims)
            .finish()
    }
}

impl IndexGeneration {
    /// Read every chunk and vector from the artifact unpacked at `dir`.
    ///
    /// All vectors must share one dimensionality, which must agree with
    /// the manifest's `embedding_dims` when declared.
    pub async fn load(id: Uuid, dir: PathBuf, manifest: IndexManifest) -> Result<Self, IndexError> {
        let db_path = dir.join(manifest.index_file());
        if !db_path.is_file() {
            return Err(IndexError::Malformed(format!(
                "index file {} not found in artifact",
                manifest.index_file()
            )));
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let rows = sqlx::query(
            r#"
            SELECT c.id, c.content, c.metadata_json, cv.embedding
            FROM chunks c
            JOIN chunk_vectors cv ON cv.chunk_id = c.id
            ORDER BY c.ordinal, c.id
            "#,
        )
        .fetch_all(&pool)
        .await;
        pool.close().await;
        let rows = rows?;

        let mut chunks = Vec::with_capacity(rows.len());
        let mut dims = manifest.embedding_dims;
        for row in &rows {
            let id: String = row.get("id");
            let blob: Vec<u8> = row.get("embedding");
            if blob.len() % 4 != 0 {
                return Err(IndexError::Malformed(format!(
                    "embedding for chunk '{}' is not a whole number of f32 values",
                    id
                )));
            }
            let vector = blob_to_vec(&blob);

            match dims {
                Some(d) if d != vector.len() => {
                    return Err(IndexError::Malformed(format!(
                        "chunk '{}' has {} dimensions, expected {}",
                        id,
                        vector.len(),
                        d
                    )));
                }
                None => dims = Some(vector.len()),
                _ => {}
            }

            let metadata_json: Option<String> = row.get("metadata_json");
            let metadata = match metadata_json {
                Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw).map_err(|e| {
                    IndexError::Malformed(format!("metadata for chunk '{}': {}", id, e))
                })?,
                _ => serde_json::Value::Object(Default::default()),
            };
            if !metadata.is_object() {
                return Err(IndexError::Malformed(format!(
                    "metadata for chunk '{}' is not a JSON object",
                    id
                )));
            }

            chunks.push(IndexedChunk {
                id,
                content: row.get("content"),
                metadata,
                vector,
            });
        }

        let generation = Self {
            id,
            dir,
            manifest,
            chunks,
            dims: dims.unwrap_or(0),
            loaded_at: Utc::now(),
            retired: AtomicBool::new(false),
        };
        info!(
            generation = %generation.id,
            chunks = generation.chunks.len(),
            dims = generation.dims,
            "Index generation loaded"
        );
        Ok(generation)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> &IndexManifest {
        &self.manifest
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Top-`k` chunks by the manifest's distance metric.
    ///
    /// Brute-force scan; ties keep index order. Returns fewer than `k`
    /// hits when the index is smaller, and nothing when it is empty.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>, IndexError> {
        if self.chunks.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                actual: query.len(),
            });
        }

        let metric = self.manifest.distance_metric;
        let mut scored: Vec<(usize, f32)> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (i, score(metric, query, &c.vector)))
            .collect();

        // Stable: equal scores keep index order.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(i, score)| {
                let c = &self.chunks[i];
                ScoredChunk {
                    id: c.id.clone(),
                    content: c.content.clone(),
                    metadata: c.metadata.clone(),
                    score,
                }
            })
            .collect())
    }

    /// Mark this generation for deletion once the last reference drops.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        debug!(generation = %self.id, "Generation retired; awaiting last reader");
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

impl Drop for IndexGeneration {
    fn drop(&mut self) {
        if !self.retired.load(Ordering::SeqCst) {
            return;
        }
        let id = self.id;
        let dir = std::mem::take(&mut self.dir);
        // The last reader is usually an async task; keep the delete off
        // the runtime's worker threads.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_generation_dir(id, &dir));
            }
            Err(_) => remove_generation_dir(id, &dir),
        }
    }
}

fn remove_generation_dir(id: Uuid, dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => info!(generation = %id, dir = %dir.display(), "Retired generation removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(generation = %id, error = %e, "Failed to remove retired generation"),
    }
}

// ============ Scoring ============

/// Similarity under `metric`; higher is better for every metric.
pub fn score(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Cosine => cosine_similarity(a, b),
        DistanceMetric::Dot => dot(a, b),
        DistanceMetric::Euclidean => 1.0 / (1.0 + euclidean_distance(a, b)),
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero-norm input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Encode a float vector as a little-endian BLOB.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ============ Writing ============

/// Write `chunks` into a fresh `index.sqlite` under `dir`.
///
/// Used by publishing tooling and test fixtures; chunk order is preserved
/// as the `ordinal` column.
pub async fn write_index_db(dir: &Path, chunks: &[IndexedChunk]) -> Result<PathBuf, IndexError> {
    std::fs::create_dir_all(dir)?;
    let db_path = dir.join(DEFAULT_INDEX_FILE);
    if db_path.exists() {
        std::fs::remove_file(&db_path)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE chunks (
            id TEXT PRIMARY KEY,
            ordinal INTEGER NOT NULL,
            content TEXT NOT NULL,
            metadata_json TEXT
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    let mut tx = pool.begin().await?;
    for (ordinal, chunk) in chunks.iter().enumerate() {
        let metadata = if chunk.metadata.is_null() {
            None
        } else {
            Some(chunk.metadata.to_string())
        };
        sqlx::query("INSERT INTO chunks (id, ordinal, content, metadata_json) VALUES (?, ?, ?, ?)")
            .bind(&chunk.id)
            .bind(ordinal as i64)
            .bind(&chunk.content)
            .bind(metadata)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO chunk_vectors (chunk_id, embedding) VALUES (?, ?)")
            .bind(&chunk.id)
            .bind(vec_to_blob(&chunk.vector))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    pool.close().await;

    Ok(db_path)
}
