//! The single active index generation, swappable without pausing readers.
//!
//! [`VectorIndexStore`] holds at most one [`IndexGeneration`] behind an
//! [`ArcSwapOption`]. Readers take a snapshot (`Arc` clone) and use it for
//! the whole query; the lifecycle controller publishes a fully loaded
//! replacement with a single atomic store. No reader ever sees a
//! half-loaded generation, and a reader that started on the old one
//! finishes on it.

use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tracing::info;

use crate::error::QueryError;
use crate::generation::{IndexGeneration, ScoredChunk};

pub struct VectorIndexStore {
    active: ArcSwapOption<IndexGeneration>,
    max_k: usize,
}

impl VectorIndexStore {
    /// `max_k` caps every search's `k`.
    pub fn new(max_k: usize) -> Self {
        Self {
            active: ArcSwapOption::empty(),
            max_k: max_k.max(1),
        }
    }

    pub fn clamp_k(&self, k: usize) -> usize {
        k.min(self.max_k)
    }

    /// Make `generation` the active one and return the generation it
    /// replaced, already marked retired.
    pub fn activate(&self, generation: Arc<IndexGeneration>) -> Option<Arc<IndexGeneration>> {
        let id = generation.id();
        let chunks = generation.len();
        let previous = self.active.swap(Some(generation));
        if let Some(ref old) = previous {
            old.retire();
        }
        info!(
            generation = %id,
            chunks,
            replaced = ?previous.as_ref().map(|g| g.id()),
            "Index generation activated"
        );
        previous
    }

    /// The active generation, if any. Hold the returned `Arc` for the
    /// duration of one query.
    pub fn snapshot(&self) -> Option<Arc<IndexGeneration>> {
        self.active.load_full()
    }

    pub fn is_ready(&self) -> bool {
        self.active.load().is_some()
    }

    /// Search the active generation; `k` is clamped to the configured
    /// maximum.
    pub fn search(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>, QueryError> {
        let generation = self.snapshot().ok_or(QueryError::NotReady)?;
        Ok(generation.search(vector, self.clamp_k(k))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{write_index_db, IndexedChunk};
    use crate::manifest::{DistanceMetric, IndexManifest};
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn generation(dir: &std::path::Path, id: &str) -> Arc<IndexGeneration> {
        write_index_db(
            dir,
            &[IndexedChunk {
                id: id.into(),
                content: id.into(),
                metadata: serde_json::Value::Null,
                vector: vec![1.0, 0.0],
            }],
        )
        .await
        .unwrap();
        let manifest = IndexManifest {
            embedding_model: "m".into(),
            distance_metric: DistanceMetric::Cosine,
            dataset_name: "d".into(),
            branch: "main".into(),
            embedding_dims: Some(2),
            index_file: None,
            created_at: None,
        };
        Arc::new(
            IndexGeneration::load(Uuid::new_v4(), dir.to_path_buf(), manifest)
                .await
                .unwrap(),
        )
    }

    #[test]
    fn empty_store_is_not_ready() {
        let store = VectorIndexStore::new(10);
        assert!(!store.is_ready());
        assert!(matches!(store.search(&[1.0, 0.0], 3), Err(QueryError::NotReady)));
    }

    #[tokio::test]
    async fn activate_swaps_and_retires_previous() {
        let tmp = TempDir::new().unwrap();
        let store = VectorIndexStore::new(10);

        let first = generation(&tmp.path().join("one"), "one").await;
        assert!(store.activate(first).is_none());
        assert!(store.is_ready());

        let held = store.snapshot().unwrap();
        let second = generation(&tmp.path().join("two"), "two").await;
        let replaced = store.activate(second).unwrap();

        assert!(replaced.is_retired());
        assert_eq!(replaced.id(), held.id());
        // The held snapshot still answers from the old generation.
        assert_eq!(held.search(&[1.0, 0.0], 1).unwrap()[0].id, "one");
        assert_eq!(store.search(&[1.0, 0.0], 1).unwrap()[0].id, "two");

        drop(replaced);
        assert!(tmp.path().join("one").exists());
        assert_eq!(store.clamp_k(50), 10);
        drop(held);
        // Removal runs on the blocking pool.
        for _ in 0..100 {
            if !tmp.path().join("one").exists() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("retired generation was not removed");
    }
}
