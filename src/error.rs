//! Error taxonomy for the index lifecycle and the query path.
//!
//! Each acquisition stage has its own error type so the lifecycle
//! controller can decide which terminal [`IndexStatus`](crate::lifecycle::IndexStatus)
//! an attempt lands in, and so the query path can tell "not ready" apart
//! from genuine failures.

use std::path::PathBuf;

use thiserror::Error;

/// No usable request signer could be produced for object storage.
#[derive(Debug, Error)]
#[error("no usable object storage credentials: {0}")]
pub struct CredentialError(pub String);

/// Failure while downloading the index archive.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The object does not exist (index not yet published). Never retried.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Network, auth or server-side failure. Eligible for retry by the caller.
    #[error("transient fetch failure for '{key}': {message}")]
    Transient { key: String, message: String },
}

impl FetchError {
    pub fn transient(key: &str, message: impl Into<String>) -> Self {
        Self::Transient {
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Failure while extracting a staged archive.
#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("archive entry escapes the target directory: {0}")]
    UnsafePath(String),

    #[error("I/O error while unpacking into {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl UnpackError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure while reading or checking an artifact's manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest not found at {0}")]
    Missing(PathBuf),

    #[error("manifest is not valid: {0}")]
    Invalid(String),

    /// The artifact was built for a different model, metric or dataset.
    #[error("manifest mismatch on {field}: expected '{expected}', index declares '{actual}'")]
    Mismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },
}

/// Failure while loading or searching a generation.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("index is malformed: {0}")]
    Malformed(String),

    #[error("query vector has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Any failure of one acquisition attempt.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Unpack(#[from] UnpackError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("index load timed out after {0}s")]
    Timeout(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LifecycleError {
    /// `true` only for a missing artifact; every other failure lands in FAILED.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Fetch(FetchError::NotFound(_)))
    }
}

/// Failure answering a context query.
#[derive(Debug, Error)]
pub enum QueryError {
    /// No generation is active yet. Retryable after a delay.
    #[error("index is not loaded yet; retry later")]
    NotReady,

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("query failed: {0}")]
    Internal(String),
}

impl From<IndexError> for QueryError {
    fn from(err: IndexError) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_missing_object_maps_to_not_found() {
        let missing: LifecycleError = FetchError::NotFound("indexes/main/latest/index.zip".into()).into();
        assert!(missing.is_not_found());

        let transient: LifecycleError = FetchError::transient("k", "503").into();
        assert!(!transient.is_not_found());

        let creds: LifecycleError = CredentialError("nothing configured".into()).into();
        assert!(!creds.is_not_found());
    }

    #[test]
    fn mismatch_message_names_both_sides() {
        let err = ManifestError::Mismatch {
            field: "distance_metric",
            expected: "cosine".into(),
            actual: "euclidean".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("distance_metric"));
        assert!(msg.contains("cosine"));
        assert!(msg.contains("euclidean"));
    }
}
