//! Embedding service abstraction and implementations.
//!
//! Defines the [`EmbeddingService`] trait and concrete implementations:
//! - **[`DisabledEmbeddingService`]**: returns errors; used when embeddings are not configured.
//! - **[`hashing::HashingEmbeddingService`]**: offline feature hashing, no model server.
//! - **[`HttpEmbeddingService`]**: calls the OpenAI embeddings API or a local Ollama
//!   instance's `/api/embed` endpoint.
//!
//! Also provides vector utilities used by the SQLite vector index:
//! - [`cosine_similarity`]: compute similarity between two embedding vectors
//! - [`vec_to_blob`]: encode a `Vec<f32>` as little-endian bytes for SQLite BLOB storage
//! - [`blob_to_vec`]: decode a SQLite BLOB back into a `Vec<f32>`
//!
//! # Provider Selection
//!
//! Use [`create_service`] to instantiate the appropriate service based
//! on the configuration:
//!
//! ```rust,no_run
//! # use docket::config::EmbeddingConfig;
//! # use docket::embedding::create_service;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let service = create_service(&config).unwrap();
//! assert_eq!(service.model_name(), "disabled");
//! ```
//!
//! # Failures
//!
//! HTTP services do not retry. A failed call surfaces as
//! [`Error::ExternalService`]; whether to try again is decided by the
//! caller (re-enqueueing the document, re-issuing the query).

pub mod batcher;
pub mod hashing;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result, Service, ServiceResultExt};

/// Interface every embedding backend implements.
///
/// `embed_batch` must return one vector per input text, in input order.
/// The active model can be switched at runtime; calls already in flight
/// keep the model they started with.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Returns the currently active model identifier.
    fn model_name(&self) -> String;

    /// Switch the model used by subsequent calls.
    fn set_model(&self, model: &str);

    /// Embed a batch of texts.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text, e.g. a search query.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::external(Service::Embedding, "empty embedding response"))
    }
}

// ============ Disabled Service ============

/// A no-op embedding service that always returns errors.
///
/// Used when `embedding.provider = "disabled"` in the configuration.
pub struct DisabledEmbeddingService;

#[async_trait]
impl EmbeddingService for DisabledEmbeddingService {
    fn model_name(&self) -> String {
        "disabled".to_string()
    }

    fn set_model(&self, _model: &str) {}

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::external(
            Service::Embedding,
            "embedding provider is disabled",
        ))
    }
}

// ============ HTTP Service ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpProvider {
    OpenAI,
    Ollama,
}

/// Embedding service backed by an HTTP API.
///
/// `OpenAI` calls `POST https://api.openai.com/v1/embeddings` and needs the
/// `OPENAI_API_KEY` environment variable. `Ollama` calls `POST {url}/api/embed`
/// (default `http://localhost:11434`) and needs the model pulled locally.
pub struct HttpEmbeddingService {
    provider: HttpProvider,
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: RwLock<String>,
    dims: usize,
}

impl HttpEmbeddingService {
    /// Create a new HTTP service from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `model` or `dims` is not set in config,
    /// or if `OPENAI_API_KEY` is missing for the OpenAI provider.
    pub fn new(provider: HttpProvider, config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Config("embedding.model is required".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| Error::Config("embedding.dims is required".into()))?;

        let (url, api_key) = match provider {
            HttpProvider::OpenAI => {
                let key = std::env::var("OPENAI_API_KEY").map_err(|_| {
                    Error::Config("OPENAI_API_KEY environment variable not set".into())
                })?;
                ("https://api.openai.com/v1/embeddings".to_string(), Some(key))
            }
            HttpProvider::Ollama => {
                let base = config
                    .url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string());
                (format!("{}/api/embed", base.trim_end_matches('/')), None)
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .service_err(Service::Embedding)?;

        Ok(Self {
            provider,
            client,
            url,
            api_key,
            model: RwLock::new(model),
            dims,
        })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbeddingService {
    fn model_name(&self) -> String {
        match self.model.read() {
            Ok(model) => model.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_model(&self, model: &str) {
        let mut guard = match self.model.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = model.to_string();
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // Captured once so a concurrent `set_model` cannot change this call.
        let model = self.model_name();
        let body = serde_json::json!({
            "model": model,
            "input": texts,
        });

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            Error::external(
                Service::Embedding,
                format!("request to {} failed: {}", self.url, e),
            )
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(Error::external(
                Service::Embedding,
                format!("API error {}: {}", status, body_text),
            ));
        }

        let json: serde_json::Value = response.json().await.service_err(Service::Embedding)?;
        match self.provider {
            HttpProvider::OpenAI => parse_openai_response(&json),
            HttpProvider::Ollama => parse_ollama_response(&json),
        }
    }
}

/// Parse the OpenAI embeddings API response JSON.
///
/// Extracts the `data[].embedding` arrays and orders them by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| invalid_response("missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| invalid_response("missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, to_f32_vec(embedding)));
    }

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| invalid_response("missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .map(|values| to_f32_vec(values))
                .ok_or_else(|| invalid_response("embedding is not an array"))
        })
        .collect()
}

fn to_f32_vec(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

fn invalid_response(what: &str) -> Error {
    Error::external(Service::Embedding, format!("invalid response: {}", what))
}

/// Create the appropriate [`EmbeddingService`] based on configuration.
///
/// | Config Value | Service |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbeddingService`] |
/// | `"hashing"` | [`hashing::HashingEmbeddingService`] |
/// | `"openai"` | [`HttpEmbeddingService`] with [`HttpProvider::OpenAI`] |
/// | `"ollama"` | [`HttpEmbeddingService`] with [`HttpProvider::Ollama`] |
pub fn create_service(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingService>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbeddingService)),
        "hashing" => {
            let service = hashing::HashingEmbeddingService::new(config.dims.unwrap_or(256));
            if let Some(model) = &config.model {
                service.set_model(model);
            }
            Ok(Arc::new(service))
        }
        "openai" => Ok(Arc::new(HttpEmbeddingService::new(
            HttpProvider::OpenAI,
            config,
        )?)),
        "ollama" => Ok(Arc::new(HttpEmbeddingService::new(
            HttpProvider::Ollama,
            config,
        )?)),
        other => Err(Error::Config(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing
/// a BLOB of `vec.len() × 4` bytes.
///
/// # Example
///
/// ```rust
/// use docket::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
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

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or vectors
/// of different lengths.
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_openai_orders_by_index() {
        let body = json!({
            "data": [
                { "index": 1, "embedding": [0.5, 0.5] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_openai_response(&body).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
    }

    #[test]
    fn test_parse_ollama_response() {
        let body = json!({ "embeddings": [[0.25, 0.75], [1.0, 2.0]] });
        let vectors = parse_ollama_response(&body).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1], vec![1.0, 2.0]);
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        assert!(parse_openai_response(&json!({})).is_err());
        assert!(parse_ollama_response(&json!({ "embeddings": [1] })).is_err());
    }

    #[tokio::test]
    async fn test_disabled_service_errors() {
        let service = DisabledEmbeddingService;
        let err = service.embed("query").await.unwrap_err();
        assert_eq!(err.service(), Some(Service::Embedding));
    }

    #[test]
    fn test_ollama_model_switch() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("nomic-embed-text".into()),
            dims: Some(768),
            ..EmbeddingConfig::default()
        };
        let service = HttpEmbeddingService::new(HttpProvider::Ollama, &config).unwrap();
        assert_eq!(service.model_name(), "nomic-embed-text");
        service.set_model("mxbai-embed-large");
        assert_eq!(service.model_name(), "mxbai-embed-large");
        assert_eq!(service.dims(), 768);
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }
}
