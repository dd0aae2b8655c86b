//! Query encoders.
//!
//! Defines the [`Encoder`] trait and concrete implementations:
//! - **[`LocalEncoder`]**: runs the model in-process via fastembed; no
//!   network calls after the first model download.
//! - **[`OpenAIEncoder`]**: calls the OpenAI embeddings API.
//! - **[`OllamaEncoder`]**: calls a local Ollama instance's `/api/embed`.
//!
//! The encoder is built once at startup by [`create_encoder`] and shared by
//! every query; model weights are never reloaded per request.
//!
//! # Retry Strategy
//!
//! The HTTP encoders use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::EmbeddingConfig;

/// Turns query text into a vector in the index's embedding space.
#[async_trait]
pub trait Encoder: Send + Sync {
    /// Model identifier, compared against the artifact manifest.
    fn model_name(&self) -> &str;

    /// Output dimensionality.
    fn dims(&self) -> usize;

    async fn encode(&self, text: &str) -> Result<Vec<f32>>;
}

/// Build the configured encoder.
///
/// # Errors
///
/// Unknown provider names, missing API keys, and local models that fail
/// to load.
pub async fn create_encoder(config: &EmbeddingConfig) -> Result<Arc<dyn Encoder>> {
    let encoder: Arc<dyn Encoder> = match config.provider.as_str() {
        "openai" => Arc::new(OpenAIEncoder::new(config)?),
        "ollama" => Arc::new(OllamaEncoder::new(config)?),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => {
            let config = config.clone();
            Arc::new(tokio::task::spawn_blocking(move || LocalEncoder::new(&config)).await??)
        }
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    };
    info!(
        provider = %config.provider,
        model = encoder.model_name(),
        dims = encoder.dims(),
        "Encoder ready"
    );
    Ok(encoder)
}

fn check_dims(model: &str, expected: usize, vector: Vec<f32>) -> Result<Vec<f32>> {
    if vector.len() != expected {
        bail!(
            "Model '{}' returned {} dimensions, expected {}",
            model,
            vector.len(),
            expected
        );
    }
    Ok(vector)
}

// ============ HTTP providers ============

/// POST `body` to `url`, retrying rate limits, server errors and network
/// failures with exponential backoff.
async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    label: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut req = client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(token) = bearer {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return Ok(response.json().await?);
                }

                // Rate limited or server error; retry
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!("{} connection error ({}): {}", label, url, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} embedding failed after retries", label)))
}

fn parse_vector(value: &serde_json::Value, what: &str) -> Result<Vec<f32>> {
    Ok(value
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("Invalid {} response: embedding is not an array", what))?
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

/// Encoder backed by `POST https://api.openai.com/v1/embeddings`.
///
/// Requires `OPENAI_API_KEY` in the environment.
pub struct OpenAIEncoder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OpenAIEncoder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        Ok(Self {
            client: http_client(config)?,
            api_key,
            model: config.model.clone(),
            dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Encoder for OpenAIEncoder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({ "model": self.model, "input": [text] });
        let json = post_with_retry(
            &self.client,
            "https://api.openai.com/v1/embeddings",
            Some(&self.api_key),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        check_dims(&self.model, self.dims, parse_openai_response(&json)?)
    }
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let first = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;
    let embedding = first
        .get("embedding")
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;
    parse_vector(embedding, "OpenAI")
}

/// Encoder backed by a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaEncoder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OllamaEncoder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            client: http_client(config)?,
            url: url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Encoder for OllamaEncoder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({ "model": self.model, "input": [text] });
        let json = post_with_retry(
            &self.client,
            &format!("{}/api/embed", self.url),
            None,
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;
        check_dims(&self.model, self.dims, parse_ollama_response(&json)?)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let first = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings array"))?;
    parse_vector(first, "Ollama")
}

// ============ Local provider (fastembed) ============

/// In-process encoder via fastembed.
///
/// `fastembed::TextEmbedding` needs `&mut self` to embed, so the model is
/// wrapped in a mutex and run on the blocking pool.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalEncoder {
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
    model_name: String,
    dims: usize,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalEncoder {
    /// Load (downloading on first use) the configured model. Blocking.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let fastembed_model = config_to_fastembed_model(&config.model)?;
        let mut model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
        )
        .map_err(|e| anyhow::anyhow!("Failed to initialize local embedding model: {}", e))?;

        // Probe dimension via a test embedding
        let probe = model
            .embed(vec!["dimension probe"], None)
            .map_err(|e| anyhow::anyhow!("Failed to probe embedding dimension: {}", e))?;
        let dims = probe
            .first()
            .map(|v| v.len())
            .ok_or_else(|| anyhow::anyhow!("Empty probe embedding"))?;
        if let Some(configured) = config.dims {
            if configured != dims {
                bail!(
                    "embedding.dims = {} but model '{}' produces {}",
                    configured,
                    config.model,
                    dims
                );
            }
        }

        Ok(Self {
            model: Arc::new(std::sync::Mutex::new(model)),
            model_name: config.model.clone(),
            dims,
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl Encoder for LocalEncoder {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        let model = self.model.clone();
        let text = text.to_string();

        let vector = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|e| anyhow::anyhow!("Embedding model mutex poisoned: {}", e))?;
            model
                .embed(vec![text], None)
                .map_err(|e| anyhow::anyhow!("Local embedding failed: {}", e))?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
        })
        .await??;

        check_dims(&self.model_name, self.dims, vector)
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" | "BAAI/bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_openai_payload() {
        let json = serde_json::json!({
            "data": [{ "index": 0, "embedding": [0.5, -0.25, 1.0] }]
        });
        assert_eq!(parse_openai_response(&json).unwrap(), vec![0.5, -0.25, 1.0]);
    }

    #[test]
    fn parses_ollama_payload() {
        let json = serde_json::json!({ "embeddings": [[1.0, 2.0]] });
        assert_eq!(parse_ollama_response(&json).unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(parse_openai_response(&serde_json::json!({ "data": [] })).is_err());
        assert!(parse_ollama_response(&serde_json::json!({ "embeddings": ["x"] })).is_err());
    }

    #[test]
    fn dimension_check() {
        assert!(check_dims("m", 2, vec![1.0, 2.0]).is_ok());
        let err = check_dims("m", 3, vec![1.0]).unwrap_err();
        assert!(err.to_string().contains("expected 3"));
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected() {
        let config = EmbeddingConfig {
            provider: "word2vec".into(),
            model: "m".into(),
            dims: Some(3),
            max_retries: 0,
            timeout_secs: 1,
            url: None,
        };
        assert!(create_encoder(&config).await.is_err());
    }

    #[tokio::test]
    async fn ollama_requires_dims() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            model: "nomic-embed-text".into(),
            dims: None,
            max_retries: 0,
            timeout_secs: 1,
            url: None,
        };
        assert!(OllamaEncoder::new(&config).is_err());
    }
}
