//! Archive download from object storage.
//!
//! [`ObjectStore`] is the seam between the lifecycle controller and the
//! place artifacts are published. Two implementations ship:
//!
//! - [`S3ObjectStore`]: signed `GET` against AWS S3 or an S3-compatible
//!   endpoint (MinIO, LocalStack) using a [`Signer`] from the credential
//!   chain.
//! - [`LocalObjectStore`]: keys resolved under a local directory, for
//!   development and tests.
//!
//! Both write to a `.part` file next to the destination and rename it
//! into place only after the whole object has arrived, so a reader never
//! observes a partially written archive.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::config::StorageConfig;
use crate::credentials::{uri_encode, Signer};
use crate::error::FetchError;

/// Somewhere index artifacts can be downloaded from.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable location of `key`, for logs.
    fn describe(&self, key: &str) -> String;

    /// Download `key` to `destination`, returning the number of bytes
    /// written. `destination` only exists after a complete transfer.
    async fn fetch(&self, key: &str, destination: &Path) -> Result<u64, FetchError>;
}

/// Path of the in-progress download for `destination`.
fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

async fn commit(part: &Path, destination: &Path, key: &str) -> Result<(), FetchError> {
    tokio::fs::rename(part, destination).await.map_err(|e| {
        FetchError::transient(key, format!("cannot move download into place: {}", e))
    })
}

async fn discard(part: &Path) {
    let _ = tokio::fs::remove_file(part).await;
}

// ============ S3 ============

/// Signed downloads from an S3 bucket.
pub struct S3ObjectStore {
    client: reqwest::Client,
    bucket: String,
    region: String,
    endpoint_url: Option<String>,
    signer: Signer,
}

impl S3ObjectStore {
    pub fn new(storage: &StorageConfig, signer: Signer) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(storage.timeout_secs))
            .build()
            .map_err(|e| FetchError::transient("", format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            bucket: storage.bucket.clone(),
            region: storage.region.clone(),
            endpoint_url: storage.endpoint_url.clone(),
            signer,
        })
    }

    /// `(url, host, canonical_uri)` for `key`.
    ///
    /// AWS uses virtual-hosted style (`<bucket>.s3.<region>.amazonaws.com`);
    /// a custom endpoint uses path style (`<endpoint>/<bucket>/<key>`).
    fn locate(&self, key: &str) -> (String, String, String) {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");

        match self.endpoint_url {
            Some(ref endpoint) => {
                let endpoint = endpoint.trim_end_matches('/');
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .to_string();
                let canonical_uri = format!("/{}/{}", uri_encode(&self.bucket), encoded_key);
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                (format!("{}://{}{}", scheme, host, canonical_uri), host, canonical_uri)
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", self.bucket, self.region);
                let canonical_uri = format!("/{}", encoded_key);
                (format!("https://{}{}", host, canonical_uri), host, canonical_uri)
            }
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn describe(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    async fn fetch(&self, key: &str, destination: &Path) -> Result<u64, FetchError> {
        let (url, host, canonical_uri) = self.locate(key);

        let mut req = self.client.get(&url);
        for (name, value) in self.signer.sign_get(&host, &canonical_uri, "", Utc::now()) {
            req = req.header(name, value);
        }

        let mut resp = req
            .send()
            .await
            .map_err(|e| FetchError::transient(key, format!("GET {} failed: {}", url, e)))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(self.describe(key)));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::transient(
                key,
                format!("S3 GetObject failed (HTTP {}): {}", status, body.trim()),
            ));
        }

        let part = part_path(destination);
        let mut file = tokio::fs::File::create(&part)
            .await
            .map_err(|e| FetchError::transient(key, format!("cannot create {}: {}", part.display(), e)))?;

        let mut written: u64 = 0;
        loop {
            let chunk = match resp.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    drop(file);
                    discard(&part).await;
                    return Err(FetchError::transient(key, format!("download interrupted: {}", e)));
                }
            };
            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                discard(&part).await;
                return Err(FetchError::transient(key, format!("write failed: {}", e)));
            }
            written += chunk.len() as u64;
        }

        if let Err(e) = file.sync_all().await {
            drop(file);
            discard(&part).await;
            return Err(FetchError::transient(key, format!("sync failed: {}", e)));
        }
        drop(file);

        commit(&part, destination, key).await?;
        debug!(object = %self.describe(key), bytes = written, "Download complete");
        Ok(written)
    }
}

// ============ Local directory ============

/// Keys resolved as relative paths under `root`.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, FetchError> {
        if key.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return Err(FetchError::transient(key, "key is not a plain relative path"));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn describe(&self, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }

    async fn fetch(&self, key: &str, destination: &Path) -> Result<u64, FetchError> {
        let source = self.resolve(key)?;
        match tokio::fs::metadata(&source).await {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(FetchError::NotFound(self.describe(key))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound(self.describe(key)));
            }
            Err(e) => return Err(FetchError::transient(key, e.to_string())),
        }

        let part = part_path(destination);
        let written = match tokio::fs::copy(&source, &part).await {
            Ok(n) => n,
            Err(e) => {
                discard(&part).await;
                return Err(FetchError::transient(key, format!("copy failed: {}", e)));
            }
        };
        commit(&part, destination, key).await?;
        debug!(object = %self.describe(key), bytes = written, "Copy complete");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::AwsCredentials;
    use tempfile::TempDir;

    fn storage(endpoint: Option<&str>) -> StorageConfig {
        let doc = format!(
            r#"
[index]
data_dir = "/tmp/x"
dataset_name = "d"
[storage]
bucket = "idx-bucket"
region = "eu-central-1"
branch = "main"
{}
[embedding]
model = "m"
"#,
            endpoint
                .map(|e| format!("endpoint_url = \"{}\"", e))
                .unwrap_or_default()
        );
        crate::config::parse_config(&doc).unwrap().storage
    }

    fn signer() -> Signer {
        Signer::new(
            AwsCredentials {
                access_key_id: "AKID".into(),
                secret_access_key: "secret".into(),
                session_token: None,
            },
            "eu-central-1",
        )
    }

    #[test]
    fn aws_urls_are_virtual_hosted() {
        let store = S3ObjectStore::new(&storage(None), signer()).unwrap();
        let (url, host, uri) = store.locate("indexes/main/latest/index.zip");
        assert_eq!(host, "idx-bucket.s3.eu-central-1.amazonaws.com");
        assert_eq!(uri, "/indexes/main/latest/index.zip");
        assert_eq!(url, "https://idx-bucket.s3.eu-central-1.amazonaws.com/indexes/main/latest/index.zip");
    }

    #[test]
    fn custom_endpoint_uses_path_style() {
        let store = S3ObjectStore::new(&storage(Some("http://localhost:9000/")), signer()).unwrap();
        let (url, host, uri) = store.locate("indexes/main/latest/index.zip");
        assert_eq!(host, "localhost:9000");
        assert_eq!(uri, "/idx-bucket/indexes/main/latest/index.zip");
        assert_eq!(url, "http://localhost:9000/idx-bucket/indexes/main/latest/index.zip");
    }

    #[tokio::test]
    async fn local_store_copies_object() {
        let root = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("indexes/main/latest")).unwrap();
        std::fs::write(root.path().join("indexes/main/latest/index.zip"), b"archive").unwrap();

        let store = LocalObjectStore::new(root.path());
        let dest = out.path().join("staged.zip");
        let n = store.fetch("indexes/main/latest/index.zip", &dest).await.unwrap();

        assert_eq!(n, 7);
        assert_eq!(std::fs::read(&dest).unwrap(), b"archive");
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn local_store_reports_missing_object() {
        let root = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let store = LocalObjectStore::new(root.path());
        let dest = out.path().join("staged.zip");

        let err = store.fetch("indexes/main/latest/index.zip", &dest).await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn local_store_rejects_parent_segments() {
        let root = TempDir::new().unwrap();
        let store = LocalObjectStore::new(root.path());
        let err = store
            .fetch("../outside.zip", &root.path().join("x"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
