//! Embedding provider abstraction and implementations.
//!
//! Defines the [`Embedder`] trait and concrete implementations:
//! - **[`HashEmbedder`]**: deterministic, offline feature hashing; no model download.
//! - **[`OpenAIEmbedder`]**: calls the OpenAI embeddings API.
//! - **[`OllamaEmbedder`]**: calls a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalEmbedder`**: runs models in-process via fastembed (`local-embeddings` feature).
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`] / [`dot_product`]: similarity between two vectors
//! - [`vec_to_blob`] / [`blob_to_vec`]: little-endian `f32` BLOB encoding
//!
//! # Failure policy
//!
//! [`embed_texts`] validates every vector a provider returns: wrong count,
//! wrong dimensionality, non-finite components, or an all-zero vector abort
//! the whole call. A zero vector would silently corrupt similarity rankings.
//!
//! Remote providers retry exactly once on transient failures
//! (timeouts, HTTP 408/429/5xx, connection errors).

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use crate::retry::retry_once;

/// Default dimensionality of the hash embedder.
const HASH_DIMS: usize = 256;

/// A text → vector function, pure in (model version, text).
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Version tag stamped on the index (e.g. `"openai:text-embedding-3-small"`).
    fn model_version(&self) -> &str;
    /// Vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed a batch of texts, returning one vector per text in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a batch and validate the vectors.
pub async fn embed_texts(embedder: &dyn Embedder, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    let vectors = embedder.embed(texts).await?;
    if vectors.len() != texts.len() {
        return Err(Error::InvalidEmbedding(format!(
            "expected {} vectors, got {}",
            texts.len(),
            vectors.len()
        )));
    }
    for v in &vectors {
        validate_vector(v, embedder.dims())?;
    }
    Ok(vectors)
}

/// Embed a single query text.
pub async fn embed_query(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let results = embed_texts(embedder, &[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| Error::InvalidEmbedding("empty embedding response".to_string()))
}

/// Reject vectors that would corrupt similarity ranking.
pub fn validate_vector(v: &[f32], dims: usize) -> Result<()> {
    if v.len() != dims {
        return Err(Error::DimensionMismatch {
            expected: dims,
            actual: v.len(),
        });
    }
    if v.iter().any(|x| !x.is_finite()) {
        return Err(Error::InvalidEmbedding(
            "vector has non-finite components".to_string(),
        ));
    }
    if v.iter().all(|x| *x == 0.0) {
        return Err(Error::InvalidEmbedding("zero vector".to_string()));
    }
    Ok(())
}

// ============ Hash Embedder ============

/// Deterministic bag-of-words embedder using signed feature hashing.
///
/// Each lowercase alphanumeric token (and each adjacent token pair) is
/// hashed with SHA-256 into one of `dims` buckets with a ±1 sign. The
/// result is L2-normalized. Texts with no tokens are rejected.
pub struct HashEmbedder {
    version: String,
    dims: usize,
}

impl HashEmbedder {
    pub fn new(version: impl Into<String>, dims: usize) -> Self {
        Self {
            version: version.into(),
            dims: dims.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let lowered = text.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.is_empty() {
            return Err(Error::InvalidEmbedding(
                "text contains no tokens".to_string(),
            ));
        }

        let mut v = vec![0.0f32; self.dims];
        for token in &tokens {
            self.add_feature(&mut v, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.add_feature(&mut v, &format!("{} {}", pair[0], pair[1]), 0.5);
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm < f32::EPSILON {
            return Err(Error::InvalidEmbedding(
                "hashed features cancelled out".to_string(),
            ));
        }
        Ok(v.into_iter().map(|x| x / norm).collect())
    }

    fn add_feature(&self, v: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let h = u64::from_le_bytes(bytes);
        let bucket = (h % self.dims as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket] += sign * weight;
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_version(&self) -> &str {
        &self.version
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed_one(t)).collect()
    }
}

// ============ OpenAI Embedder ============

/// Embedding provider using the OpenAI API.
///
/// Calls `POST /v1/embeddings` with the configured model. Requires the
/// `OPENAI_API_KEY` environment variable.
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    version: String,
    dims: usize,
    backoff: Duration,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Config("embedding.model required for OpenAI".to_string()))?;
        let dims = config
            .dims
            .ok_or_else(|| Error::Config("embedding.dims required for OpenAI".to_string()))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Config("OPENAI_API_KEY environment variable not set".to_string()))?;

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            api_key,
            model,
            version: config.model_version(),
            dims,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::from_transport("OpenAI embeddings", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::from_status("OpenAI embeddings", status, &text));
        }

        let mut parsed: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| Error::permanent(format!("invalid OpenAI response: {}", e)))?;
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_version(&self) -> &str {
        &self.version
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        retry_once("openai embeddings", self.backoff, || self.request(texts)).await
    }
}

// ============ Ollama Embedder ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default
/// `http://localhost:11434`).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    version: String,
    dims: usize,
    backoff: Duration,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| Error::Config("embedding.model required for Ollama".to_string()))?;
        let dims = config
            .dims
            .ok_or_else(|| Error::Config("embedding.dims required for Ollama".to_string()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            client: http_client(config.timeout_secs)?,
            url,
            model,
            version: config.model_version(),
            dims,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                Error::from_transport(&format!("Ollama at {} (is it running?)", self.url), e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::from_status("Ollama embed", status, &text));
        }

        let parsed: OllamaResponse = response
            .json()
            .await
            .map_err(|e| Error::permanent(format!("invalid Ollama response: {}", e)))?;
        Ok(parsed.embeddings)
    }
}

#[derive(Deserialize)]
struct OllamaResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_version(&self) -> &str {
        &self.version
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        retry_once("ollama embeddings", self.backoff, || self.request(texts)).await
    }
}

// ============ Local Embedder (fastembed) ============

/// In-process embedding via fastembed.
///
/// The model is downloaded on first use from Hugging Face and cached;
/// after that no network calls are made.
#[cfg(feature = "local-embeddings")]
pub struct LocalEmbedder {
    model: Arc<Mutex<fastembed::TextEmbedding>>,
    version: String,
    dims: usize,
    batch_size: usize,
}

#[cfg(feature = "local-embeddings")]
impl LocalEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let name = config
            .model
            .clone()
            .unwrap_or_else(|| "bge-small-en-v1.5".to_string());
        let (model, default_dims) = match name.as_str() {
            "all-minilm-l6-v2" => (fastembed::EmbeddingModel::AllMiniLML6V2, 384),
            "bge-small-en-v1.5" => (fastembed::EmbeddingModel::BGESmallENV15, 384),
            "bge-base-en-v1.5" => (fastembed::EmbeddingModel::BGEBaseENV15, 768),
            "multilingual-e5-small" => (fastembed::EmbeddingModel::MultilingualE5Small, 384),
            other => {
                return Err(Error::Config(format!(
                    "Unknown local embedding model: '{}'. Supported: all-minilm-l6-v2, \
                     bge-small-en-v1.5, bge-base-en-v1.5, multilingual-e5-small",
                    other
                )))
            }
        };
        let embedding = fastembed::TextEmbedding::try_new(fastembed::InitOptions::new(model))
            .map_err(|e| Error::permanent(format!("failed to load local model: {}", e)))?;

        Ok(Self {
            model: Arc::new(Mutex::new(embedding)),
            version: config.model_version(),
            dims: config.dims.unwrap_or(default_dims),
            batch_size: config.batch_size,
        })
    }
}

#[cfg(feature = "local-embeddings")]
#[async_trait]
impl Embedder for LocalEmbedder {
    fn model_version(&self) -> &str {
        &self.version
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        let batch_size = self.batch_size;
        tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| Error::permanent("local embedding model lock poisoned"))?;
            guard
                .embed(texts, Some(batch_size))
                .map_err(|e| Error::permanent(format!("local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| Error::permanent(format!("embedding task panicked: {}", e)))?
    }
}

// ============ Caching wrapper ============

/// Caller-side cache keyed by (model version, SHA-256 of text).
///
/// Useful when the same query text is embedded repeatedly, as in an
/// evaluation run. Vectors are only cached after they pass validation.
pub struct CachingEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Mutex<HashMap<String, Vec<f32>>>,
}

impl CachingEmbedder {
    pub fn new(inner: Arc<dyn Embedder>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.inner.model_version().as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Embedder for CachingEmbedder {
    fn model_version(&self) -> &str {
        self.inner.model_version()
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let keys: Vec<String> = texts.iter().map(|t| self.key(t)).collect();
        let mut out: Vec<Option<Vec<f32>>> = {
            let cache = self
                .cache
                .lock()
                .map_err(|_| Error::permanent("embedding cache lock poisoned"))?;
            keys.iter().map(|k| cache.get(k).cloned()).collect()
        };

        let missing: Vec<usize> = (0..texts.len()).filter(|&i| out[i].is_none()).collect();
        if !missing.is_empty() {
            let batch: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let vectors = embed_texts(self.inner.as_ref(), &batch).await?;
            let mut cache = self
                .cache
                .lock()
                .map_err(|_| Error::permanent("embedding cache lock poisoned"))?;
            for (&i, v) in missing.iter().zip(vectors) {
                cache.insert(keys[i].clone(), v.clone());
                out[i] = Some(v);
            }
        }

        Ok(out.into_iter().flatten().collect())
    }
}

/// Create the configured [`Embedder`].
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (requires the `local-embeddings` feature) |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.model_version(),
            config.dims.unwrap_or(HASH_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAIEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => Err(Error::Config(
            "Local embedding provider requires --features local-embeddings".to_string(),
        )),
        other => Err(Error::Config(format!(
            "Unknown embedding provider: {}",
            other
        ))),
    }
}

fn http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use babytrack_rag::embedding::{vec_to_blob, blob_to_vec};
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

/// Inner product of two equal-length vectors; `0.0` on length mismatch.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty, zero, or
/// different-length vectors.
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
