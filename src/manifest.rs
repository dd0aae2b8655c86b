//! Index artifact manifest and its compatibility gate.
//!
//! Every published artifact carries a `manifest.json` at its root that
//! declares the embedding model, distance metric and dataset it was built
//! with. [`validate`] refuses any artifact whose declarations differ from
//! this instance's expectations: a metric or model mismatch would still
//! produce well-formed search results, they would just be meaningless.
//!
//! ```json
//! {
//!   "embedding_model": "all-minilm-l6-v2",
//!   "distance_metric": "cosine",
//!   "dataset_name": "codebase_collection",
//!   "branch": "main",
//!   "embedding_dims": 384,
//!   "index_file": "index.sqlite"
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

use crate::error::ManifestError;

/// File name of the manifest at the artifact root.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Default file name of the vector index inside the artifact.
pub const DEFAULT_INDEX_FILE: &str = "index.sqlite";

/// Similarity function used at build time and query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    #[serde(alias = "ip")]
    Dot,
    #[serde(alias = "l2")]
    Euclidean,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Dot => "dot",
            DistanceMetric::Euclidean => "euclidean",
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata record shipped with an index artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub embedding_model: String,
    pub distance_metric: DistanceMetric,
    pub dataset_name: String,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dims: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl IndexManifest {
    /// File name of the vector index inside the unpacked artifact.
    pub fn index_file(&self) -> &str {
        self.index_file.as_deref().unwrap_or(DEFAULT_INDEX_FILE)
    }
}

/// What this instance requires of an artifact before it may be activated.
#[derive(Debug, Clone)]
pub struct ExpectedIndex {
    pub embedding_model: String,
    pub distance_metric: DistanceMetric,
    pub dataset_name: String,
    /// Encoder output size, when known up front.
    pub embedding_dims: Option<usize>,
    /// Branch the artifact was fetched for. Only used for a warning.
    pub branch: Option<String>,
}

/// Read `manifest.json` from an unpacked artifact and check it against
/// `expected`.
///
/// # Errors
///
/// - [`ManifestError::Missing`] when the file is absent.
/// - [`ManifestError::Invalid`] when it does not parse or names an
///   index file outside the artifact root.
/// - [`ManifestError::Mismatch`] on any model, metric, dataset or
///   dimension disagreement.
pub fn validate(unpacked_dir: &Path, expected: &ExpectedIndex) -> Result<IndexManifest, ManifestError> {
    let path = unpacked_dir.join(MANIFEST_FILE);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ManifestError::Missing(path));
        }
        Err(e) => return Err(ManifestError::Invalid(format!("{}: {}", path.display(), e))),
    };

    let manifest: IndexManifest =
        serde_json::from_str(&raw).map_err(|e| ManifestError::Invalid(e.to_string()))?;

    check(&manifest, expected)?;

    info!(
        model = %manifest.embedding_model,
        metric = %manifest.distance_metric,
        dataset = %manifest.dataset_name,
        branch = %manifest.branch,
        "Index manifest compatibility check passed"
    );
    Ok(manifest)
}

fn check(manifest: &IndexManifest, expected: &ExpectedIndex) -> Result<(), ManifestError> {
    if manifest.embedding_model != expected.embedding_model {
        return Err(ManifestError::Mismatch {
            field: "embedding_model",
            expected: expected.embedding_model.clone(),
            actual: manifest.embedding_model.clone(),
        });
    }
    if manifest.distance_metric != expected.distance_metric {
        return Err(ManifestError::Mismatch {
            field: "distance_metric",
            expected: expected.distance_metric.to_string(),
            actual: manifest.distance_metric.to_string(),
        });
    }
    if manifest.dataset_name != expected.dataset_name {
        return Err(ManifestError::Mismatch {
            field: "dataset_name",
            expected: expected.dataset_name.clone(),
            actual: manifest.dataset_name.clone(),
        });
    }
    if let (Some(want), Some(have)) = (expected.embedding_dims, manifest.embedding_dims) {
        if want != have {
            return Err(ManifestError::Mismatch {
                field: "embedding_dims",
                expected: want.to_string(),
                actual: have.to_string(),
            });
        }
    }

    let index_file = manifest.index_file();
    if index_file.is_empty()
        || index_file.contains('/')
        || index_file.contains('\\')
        || index_file == ".."
    {
        return Err(ManifestError::Invalid(format!(
            "index_file must be a plain file name, got '{}'",
            index_file
        )));
    }

    if let Some(ref branch) = expected.branch {
        if &manifest.branch != branch {
            warn!(
                fetched_for = %branch,
                declared = %manifest.branch,
                "Manifest branch differs from the branch the artifact was fetched for"
            );
        }
    }

    Ok(())
}
