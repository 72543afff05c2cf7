//! Embedding provider abstraction and implementations.
//!
//! Defines the async [`EmbeddingProvider`] trait and its backends:
//! - **[`HashingProvider`]**: deterministic feature hashing of word tokens.
//!   Offline, no model download; the default.
//! - **[`OpenAIProvider`]**: any OpenAI-compatible `/v1/embeddings` endpoint.
//! - **[`OllamaProvider`]**: a local Ollama instance's `/api/embed`.
//! - **`LocalProvider`**: fastembed models run in-process
//!   (`local-embeddings-fastembed` feature).
//!
//! Also provides the vector utilities used by the store and retriever:
//! [`cosine_similarity`], [`vec_to_blob`], [`blob_to_vec`].
//!
//! # Errors
//!
//! A provider makes exactly one attempt per call and classifies failures so
//! the caller can retry with [`crate::retry::with_retry`]:
//! - HTTP 429 → [`KbError::RateLimited`]
//! - HTTP 5xx, timeouts, connection errors → [`KbError::SourceUnavailable`]
//! - anything else (4xx, malformed response, wrong dimensionality) →
//!   [`KbError::EmbeddingFailed`]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{KbError, Result};

/// Turns text into fixed-size vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier recorded in the index (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch, returning one vector per input in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| KbError::EmbeddingFailed("empty embedding response".into()))
    }
}

/// Build the provider named by `embedding.provider`.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingProvider::new(
            config.resolved_model(),
            config.resolved_dims(),
        ))),
        "openai" => {
            let api_key = std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| {
                    KbError::Configuration(
                        "OPENAI_API_KEY is not set (required by embedding.provider = \"openai\")"
                            .into(),
                    )
                })?;
            Ok(Arc::new(OpenAIProvider::new(config, api_key)?))
        }
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => Err(KbError::Configuration(
            "embedding.provider = \"local\" requires building with --features local-embeddings-fastembed"
                .into(),
        )),
        other => Err(KbError::Configuration(format!(
            "unknown embedding.provider '{}'",
            other
        ))),
    }
}

// ============ Hashing Provider ============

/// Bag-of-words feature hashing.
///
/// Each lowercase alphanumeric token is hashed with SHA-256; the first eight
/// bytes pick a bucket and the ninth a sign. The resulting vector is
/// L2-normalized, so cosine similarity measures weighted token overlap.
pub struct HashingProvider {
    model: String,
    dims: usize,
}

impl HashingProvider {
    pub fn new(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims: dims.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dims];
        for token in tokenize(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut idx_bytes = [0u8; 8];
            idx_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(idx_bytes) % self.dims as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        normalize(&mut v);
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

// ============ OpenAI Provider ============

/// Embedding provider for OpenAI-compatible APIs.
///
/// `embedding.url` overrides the base URL (default `https://api.openai.com`);
/// a base ending in a version segment (`/v1`, `/v4`) gets `/embeddings`
/// appended, a bare host gets `/v1/embeddings`.
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
    dims: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            api_key,
            endpoint: embeddings_endpoint(&base),
            model: config.resolved_model(),
            dims: config.resolved_dims(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let req = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| transport_error("embedding API", e))?;
        let resp = check_status("embedding API", resp).await?;
        let parsed: OpenAIResponse = resp
            .json()
            .await
            .map_err(|e| KbError::EmbeddingFailed(format!("invalid embedding response: {}", e)))?;

        let mut data = parsed.data;
        if data.iter().all(|d| d.index.is_some()) {
            data.sort_by_key(|d| d.index);
        }
        let vectors: Vec<Vec<f32>> = data.into_iter().map(|d| d.embedding).collect();
        check_shape(&vectors, texts.len(), self.dims)?;
        Ok(vectors)
    }
}

fn embeddings_endpoint(base_url: &str) -> String {
    let normalized = base_url.trim_end_matches('/');
    if normalized.ends_with("/embeddings") {
        return normalized.to_string();
    }
    let versioned = normalized
        .rsplit('/')
        .next()
        .and_then(|seg| seg.strip_prefix('v'))
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()));
    if versioned {
        format!("{}/embeddings", normalized)
    } else {
        format!("{}/v1/embeddings", normalized)
    }
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance (`POST /api/embed`).
pub struct OllamaProvider {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
}

#[derive(Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url: url.trim_end_matches('/').to_string(),
            model: config.resolved_model(),
            dims: config.resolved_dims(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let req = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };
        let resp = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&req)
            .send()
            .await
            .map_err(|e| transport_error(&format!("Ollama at {}", self.url), e))?;
        let resp = check_status("Ollama", resp).await?;
        let parsed: OllamaResponse = resp
            .json()
            .await
            .map_err(|e| KbError::EmbeddingFailed(format!("invalid Ollama response: {}", e)))?;
        check_shape(&parsed.embeddings, texts.len(), self.dims)?;
        Ok(parsed.embeddings)
    }
}

// ============ Local Provider (fastembed) ============

/// In-process embeddings via fastembed.
///
/// The model is downloaded on first use and then cached on disk; inference
/// runs on the blocking pool.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    batch_size: usize,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config.resolved_model();
        // Validate the name up front.
        fastembed_model(&model_name)?;
        Ok(Self {
            dims: config.dims.unwrap_or_else(|| local_model_dims(&model_name)),
            model_name,
            batch_size: config.batch_size,
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn local_model_dims(name: &str) -> usize {
    match name {
        "bge-base-en-v1.5" | "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
        "bge-large-en-v1.5" => 1024,
        _ => 384,
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        other => Err(KbError::Configuration(format!(
            "unknown local embedding model '{}'; supported: all-minilm-l6-v2, \
             bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5",
            other
        ))),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let slot = Arc::clone(&self.model);
        let name = self.model_name.clone();
        let batch_size = self.batch_size;
        let texts = texts.to_vec();

        let vectors = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            let mut guard = slot
                .lock()
                .map_err(|_| KbError::EmbeddingFailed("local model lock poisoned".into()))?;
            if guard.is_none() {
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(fastembed_model(&name)?)
                        .with_show_download_progress(false),
                )
                .map_err(|e| {
                    KbError::EmbeddingFailed(format!("failed to load local model: {}", e))
                })?;
                *guard = Some(model);
            }
            let model = guard
                .as_mut()
                .ok_or_else(|| KbError::EmbeddingFailed("local model not loaded".into()))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| KbError::EmbeddingFailed(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| KbError::EmbeddingFailed(format!("embedding task panicked: {}", e)))??;

        check_shape(&vectors, vectors.len(), self.dims)?;
        Ok(vectors)
    }
}

// ============ Shared HTTP helpers ============

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| KbError::Configuration(format!("failed to build HTTP client: {}", e)))
}

fn transport_error(what: &str, e: reqwest::Error) -> KbError {
    KbError::SourceUnavailable(format!("{} unreachable: {}", what, e))
}

async fn check_status(what: &str, resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let retry_after = retry_after_secs(&resp);
    let body = resp.text().await.unwrap_or_default();
    let message = format!("{} returned {}: {}", what, status, truncate(&body, 200));
    if status.as_u16() == 429 {
        Err(KbError::RateLimited {
            message,
            retry_after,
        })
    } else if status.is_server_error() {
        Err(KbError::SourceUnavailable(message))
    } else {
        Err(KbError::EmbeddingFailed(message))
    }
}

/// `Retry-After` header in whole seconds, if present.
pub(crate) fn retry_after_secs(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn check_shape(vectors: &[Vec<f32>], expected: usize, dims: usize) -> Result<()> {
    if vectors.len() != expected {
        return Err(KbError::EmbeddingFailed(format!(
            "expected {} embeddings, got {}",
            expected,
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(KbError::EmbeddingFailed(format!(
            "expected {}-dimensional embeddings, got {}",
            dims,
            bad.len()
        )));
    }
    Ok(())
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, zero vectors, or mismatched lengths.
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
