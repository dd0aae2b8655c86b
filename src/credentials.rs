//! Object storage credentials and AWS Signature V4 request signing.
//!
//! [`CredentialResolver`] walks an ordered list of [`CredentialProvider`]s
//! and returns a [`Signer`] built from the first one that succeeds:
//!
//! 1. **Environment**: `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`,
//!    optional `AWS_SESSION_TOKEN` (workload identity injected by the
//!    orchestrator).
//! 2. **Instance metadata**: IMDSv2 role credentials. Disabled with
//!    `AWS_EC2_METADATA_DISABLED=true`; endpoint overridable with
//!    `AWS_EC2_METADATA_SERVICE_ENDPOINT`.
//! 3. **Credentials file**: an INI file at `storage.credentials_file`,
//!    only tried when configured and only after ambient identity failed.
//!
//! Each step is logged separately so operators can see which path
//! produced the signer.
//!
//! Signing uses HMAC-SHA256 (`hmac` + `sha2`) with no C dependencies.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::error::CredentialError;

type HmacSha256 = Hmac<Sha256>;

/// Hex SHA-256 of an empty payload, sent with every GET.
const EMPTY_PAYLOAD_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// A static key pair, optionally with a session token.
#[derive(Clone)]
pub struct AwsCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One strategy for obtaining credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Short name used in logs (e.g. `"environment"`).
    fn name(&self) -> &str;

    async fn provide(&self) -> Result<AwsCredentials, CredentialError>;
}

// ============ Environment ============

/// Reads the standard `AWS_*` environment variables.
pub struct EnvironmentProvider;

#[async_trait]
impl CredentialProvider for EnvironmentProvider {
    fn name(&self) -> &str {
        "environment"
    }

    async fn provide(&self) -> Result<AwsCredentials, CredentialError> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| CredentialError("AWS_ACCESS_KEY_ID not set".into()))?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| CredentialError("AWS_SECRET_ACCESS_KEY not set".into()))?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(AwsCredentials {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ Instance metadata (IMDSv2) ============

/// Role credentials from the instance metadata service.
pub struct InstanceMetadataProvider {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImdsCredentials {
    access_key_id: String,
    secret_access_key: String,
    token: Option<String>,
}

impl InstanceMetadataProvider {
    pub fn new() -> Self {
        let endpoint = std::env::var("AWS_EC2_METADATA_SERVICE_ENDPOINT")
            .unwrap_or_else(|_| "http://169.254.169.254".to_string());
        Self::with_endpoint(endpoint)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap_or_default();
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    async fn fetch(&self) -> Result<AwsCredentials, String> {
        let token = self
            .client
            .put(format!("{}/latest/api/token", self.endpoint))
            .header("X-aws-ec2-metadata-token-ttl-seconds", "21600")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("token request failed: {}", e))?
            .text()
            .await
            .map_err(|e| e.to_string())?;

        let base = format!("{}/latest/meta-data/iam/security-credentials/", self.endpoint);
        let roles = self
            .client
            .get(&base)
            .header("X-aws-ec2-metadata-token", &token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("role lookup failed: {}", e))?
            .text()
            .await
            .map_err(|e| e.to_string())?;
        let role = roles
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| "no IAM role attached to instance".to_string())?;

        let creds: ImdsCredentials = self
            .client
            .get(format!("{}{}", base, role))
            .header("X-aws-ec2-metadata-token", &token)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("credential request failed: {}", e))?
            .json()
            .await
            .map_err(|e| format!("invalid credential document: {}", e))?;

        Ok(AwsCredentials {
            access_key_id: creds.access_key_id,
            secret_access_key: creds.secret_access_key,
            session_token: creds.token,
        })
    }
}

impl Default for InstanceMetadataProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialProvider for InstanceMetadataProvider {
    fn name(&self) -> &str {
        "instance-metadata"
    }

    async fn provide(&self) -> Result<AwsCredentials, CredentialError> {
        let disabled = std::env::var("AWS_EC2_METADATA_DISABLED")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if disabled {
            return Err(CredentialError("instance metadata disabled".into()));
        }
        self.fetch().await.map_err(CredentialError)
    }
}

// ============ Credentials file ============

/// INI-style credentials file (`[profile]` sections with
/// `aws_access_key_id` / `aws_secret_access_key` / `aws_session_token`).
pub struct ProfileFileProvider {
    path: PathBuf,
    profile: String,
}

impl ProfileFileProvider {
    pub fn new(path: PathBuf, profile: impl Into<String>) -> Self {
        Self {
            path,
            profile: profile.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for ProfileFileProvider {
    fn name(&self) -> &str {
        "credentials-file"
    }

    async fn provide(&self) -> Result<AwsCredentials, CredentialError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            CredentialError(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        parse_profile(&content, &self.profile).ok_or_else(|| {
            CredentialError(format!(
                "profile '{}' in {} has no complete key pair",
                self.profile,
                self.path.display()
            ))
        })
    }
}

/// Extract one profile's key pair from an INI credentials document.
fn parse_profile(content: &str, profile: &str) -> Option<AwsCredentials> {
    let mut in_profile = false;
    let mut access_key_id = None;
    let mut secret_access_key = None;
    let mut session_token = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let section = section.trim();
            let section = section.strip_prefix("profile ").unwrap_or(section).trim();
            in_profile = section == profile;
            continue;
        }
        if !in_profile {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().to_string();
            match key.trim() {
                "aws_access_key_id" => access_key_id = Some(value),
                "aws_secret_access_key" => secret_access_key = Some(value),
                "aws_session_token" => session_token = Some(value),
                _ => {}
            }
        }
    }

    Some(AwsCredentials {
        access_key_id: access_key_id.filter(|v| !v.is_empty())?,
        secret_access_key: secret_access_key.filter(|v| !v.is_empty())?,
        session_token: session_token.filter(|v| !v.is_empty()),
    })
}

// ============ Resolver ============

/// Ordered chain of credential strategies.
pub struct CredentialResolver {
    providers: Vec<Box<dyn CredentialProvider>>,
    region: String,
}

impl CredentialResolver {
    pub fn new(providers: Vec<Box<dyn CredentialProvider>>, region: impl Into<String>) -> Self {
        Self {
            providers,
            region: region.into(),
        }
    }

    /// Ambient identity first, then the configured credentials file.
    pub fn from_config(storage: &StorageConfig) -> Self {
        let mut providers: Vec<Box<dyn CredentialProvider>> = vec![
            Box::new(EnvironmentProvider),
            Box::new(InstanceMetadataProvider::new()),
        ];
        if let Some(ref path) = storage.credentials_file {
            providers.push(Box::new(ProfileFileProvider::new(
                path.clone(),
                storage.credentials_profile.clone(),
            )));
        }
        Self::new(providers, storage.region.clone())
    }

    /// Try each provider in order and build a [`Signer`] from the first
    /// success.
    pub async fn resolve(&self) -> Result<Signer, CredentialError> {
        let mut failures = Vec::with_capacity(self.providers.len());

        for (position, provider) in self.providers.iter().enumerate() {
            debug!(provider = provider.name(), "Trying credential provider");
            match provider.provide().await {
                Ok(credentials) => {
                    if position > 0 {
                        info!(
                            provider = provider.name(),
                            "Using fallback object storage credentials"
                        );
                    } else {
                        info!(provider = provider.name(), "Using object storage credentials");
                    }
                    return Ok(Signer::new(credentials, self.region.clone()));
                }
                Err(e) => {
                    warn!(provider = provider.name(), reason = %e.0, "Credential provider unavailable, falling back");
                    failures.push(format!("{}: {}", provider.name(), e.0));
                }
            }
        }

        Err(CredentialError(if failures.is_empty() {
            "no credential providers configured".to_string()
        } else {
            failures.join("; ")
        }))
    }
}

// ============ SigV4 signer ============

/// Signs S3 requests with AWS Signature Version 4.
#[derive(Debug, Clone)]
pub struct Signer {
    credentials: AwsCredentials,
    region: String,
}

impl Signer {
    pub fn new(credentials: AwsCredentials, region: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Headers to attach to an unsigned-payload `GET` of `canonical_uri`
    /// on `host`. `canonical_query` must already be sorted and encoded.
    pub fn sign_get(
        &self,
        host: &str,
        canonical_uri: &str,
        canonical_query: &str,
        now: DateTime<Utc>,
    ) -> Vec<(&'static str, String)> {
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = vec![
            ("host", host.to_string()),
            ("x-amz-content-sha256", EMPTY_PAYLOAD_SHA256.to_string()),
            ("x-amz-date", amz_date.clone()),
        ];
        if let Some(ref token) = self.credentials.session_token {
            headers.push(("x-amz-security-token", token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(b.0));

        let signed_headers: String = headers.iter().map(|(k, _)| *k).collect::<Vec<_>>().join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "GET\n{}\n{}\n{}\n{}\n{}",
            canonical_uri, canonical_query, canonical_headers, signed_headers, EMPTY_PAYLOAD_SHA256
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key =
            derive_signing_key(&self.credentials.secret_access_key, &date_stamp, &self.region, "s3");
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.credentials.access_key_id, credential_scope, signed_headers, signature
        );

        let mut out: Vec<(&'static str, String)> = headers
            .into_iter()
            .filter(|(k, _)| *k != "host")
            .collect();
        out.push(("authorization", authorization));
        out
    }
}

/// Compute the hex-encoded SHA-256 hash of data.
pub(crate) fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute HMAC-SHA256 of data with the given key.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Derive the SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret_key).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986, leaving `A-Z a-z 0-9 - _ . ~` as is.
pub(crate) fn uri_encode(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => result.push_str(&format!("%{:02X}", byte)),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Scripted {
        name: &'static str,
        succeed: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CredentialProvider for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn provide(&self) -> Result<AwsCredentials, CredentialError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                Ok(AwsCredentials {
                    access_key_id: format!("AKID-{}", self.name),
                    secret_access_key: "secret".into(),
                    session_token: None,
                })
            } else {
                Err(CredentialError(format!("{} unavailable", self.name)))
            }
        }
    }

    #[test]
    fn signing_key_matches_aws_reference_vector() {
        // From the AWS SigV4 documentation ("Examples of how to derive a signing key").
        let key = derive_signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn empty_payload_constant_is_sha256_of_nothing() {
        assert_eq!(hex_sha256(b""), EMPTY_PAYLOAD_SHA256);
    }

    #[test]
    fn uri_encode_keeps_unreserved() {
        assert_eq!(uri_encode("index-v1_2.zip~"), "index-v1_2.zip~");
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn parse_profile_picks_requested_section() {
        let doc = r#"
# comment
[default]
aws_access_key_id = AKIDDEFAULT
aws_secret_access_key = default-secret

[profile ci]
aws_access_key_id=AKIDCI
aws_secret_access_key=ci-secret
aws_session_token=ci-token
"#;
        let default = parse_profile(doc, "default").unwrap();
        assert_eq!(default.access_key_id, "AKIDDEFAULT");
        assert!(default.session_token.is_none());

        let ci = parse_profile(doc, "ci").unwrap();
        assert_eq!(ci.secret_access_key, "ci-secret");
        assert_eq!(ci.session_token.as_deref(), Some("ci-token"));

        assert!(parse_profile(doc, "missing").is_none());
    }

    #[test]
    fn incomplete_profile_is_rejected() {
        let doc = "[default]\naws_access_key_id = AKID\n";
        assert!(parse_profile(doc, "default").is_none());
    }

    #[test]
    fn signed_headers_include_session_token() {
        let signer = Signer::new(
            AwsCredentials {
                access_key_id: "AKID".into(),
                secret_access_key: "secret".into(),
                session_token: Some("tok".into()),
            },
            "eu-west-1",
        );
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let headers = signer.sign_get("bucket.s3.eu-west-1.amazonaws.com", "/indexes/main", "", now);

        let get = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get("x-amz-date"), "20240301T120000Z");
        assert_eq!(get("x-amz-security-token"), "tok");
        let auth = get("authorization");
        assert!(auth.starts_with("AWS4-HMAC-SHA256 Credential=AKID/20240301/eu-west-1/s3/aws4_request"));
        assert!(auth.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date;x-amz-security-token"));
        assert!(!headers.iter().any(|(k, _)| *k == "host"));
    }

    #[tokio::test]
    async fn resolver_falls_back_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = CredentialResolver::new(
            vec![
                Box::new(Scripted { name: "ambient", succeed: false, calls: calls.clone() }),
                Box::new(Scripted { name: "file", succeed: true, calls: calls.clone() }),
                Box::new(Scripted { name: "never", succeed: true, calls: calls.clone() }),
            ],
            "us-east-1",
        );
        let signer = resolver.resolve().await.unwrap();
        assert_eq!(signer.credentials.access_key_id, "AKID-file");
        assert_eq!(signer.region(), "us-east-1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn resolver_reports_every_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = CredentialResolver::new(
            vec![
                Box::new(Scripted { name: "ambient", succeed: false, calls: calls.clone() }),
                Box::new(Scripted { name: "file", succeed: false, calls }),
            ],
            "us-east-1",
        );
        let err = resolver.resolve().await.unwrap_err();
        assert!(err.0.contains("ambient unavailable"));
        assert!(err.0.contains("file unavailable"));
    }
}
