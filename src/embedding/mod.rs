//! Embedding client abstraction and implementations.
//!
//! Defines the [`EmbeddingClient`] trait and concrete implementations:
//! - **`LocalEmbedder`**: in-process sentence-transformer models via `fastembed`
//!   (feature `local-embeddings-fastembed`, on by default).
//! - **[`OpenAiClient`]**: any OpenAI-compatible `/embeddings` endpoint, with retry and backoff.
//! - **[`OllamaClient`]**: a local Ollama instance's `/api/embed` endpoint.
//! - **[`HashEmbedder`]**: deterministic feature hashing, no model; for tests and smoke runs.
//!
//! Clients are constructed once by [`create_client`] and handed to the
//! ingestion and retrieval services as `Arc<dyn EmbeddingClient>`.
//!
//! Also provides the vector utilities used by the index backends:
//! [`cosine_similarity`], [`dot`], [`normalize`], [`vec_to_blob`] and
//! [`blob_to_vec`].
//!
//! # Retry Strategy
//!
//! The HTTP clients retry transient errors with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and timeouts → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Every failure surfaces as [`RagError::EmbeddingUnavailable`].

mod hash;
mod local;

pub use hash::HashEmbedder;
#[cfg(feature = "local-embeddings-fastembed")]
pub use local::LocalEmbedder;
pub use local::{local_model_dims, supported_local_models, DEFAULT_LOCAL_MODEL};

use async_trait::async_trait;
use futures_util::{stream, FutureExt, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::RagError;

/// Maps text to fixed-dimensionality vectors.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality.
    fn dims(&self) -> usize;

    /// Embed a batch. The output has one vector per input, in input order.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;

    /// Embed a single text (e.g. a retrieval prompt).
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
        self.embed_many(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::EmbeddingUnavailable("empty embedding response".into()))
    }
}

/// Embed `texts` in batches of `batch_size`, running up to `concurrency`
/// batches at once. The result preserves input order.
///
/// Each batch future owns its texts and a handle to the client, so the
/// returned future is `Send` and can be driven from a spawned task.
pub async fn embed_all(
    client: Arc<dyn EmbeddingClient>,
    texts: &[String],
    batch_size: usize,
    concurrency: usize,
) -> Result<Vec<Vec<f32>>, RagError> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }
    let owned: Vec<Vec<String>> = texts.chunks(batch_size.max(1)).map(<[String]>::to_vec).collect();
    let batches: Vec<Vec<Vec<f32>>> = stream::iter(owned)
        .map(|batch| {
            let client = Arc::clone(&client);
            async move {
                let vectors = client.embed_many(&batch).await?;
                check_batch(batch.len(), client.dims(), vectors)
            }
            .boxed()
        })
        .buffered(concurrency.max(1))
        .try_collect()
        .await?;
    Ok(batches.into_iter().flatten().collect())
}

/// Reject responses with the wrong count, wrong dimensionality, or
/// non-finite components.
pub fn check_batch(
    expected: usize,
    dims: usize,
    vectors: Vec<Vec<f32>>,
) -> Result<Vec<Vec<f32>>, RagError> {
    if vectors.len() != expected {
        return Err(RagError::EmbeddingUnavailable(format!(
            "malformed response: expected {} vectors, got {}",
            expected,
            vectors.len()
        )));
    }
    for v in &vectors {
        if v.len() != dims {
            return Err(RagError::EmbeddingUnavailable(format!(
                "malformed response: expected {} dimensions, got {}",
                dims,
                v.len()
            )));
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(RagError::EmbeddingUnavailable(
                "malformed response: non-finite vector component".into(),
            ));
        }
    }
    Ok(vectors)
}

/// Create the configured client.
///
/// | Config Value | Client |
/// |-------------|----------|
/// | `"local"` | `LocalEmbedder` (needs `local-embeddings-fastembed`) |
/// | `"openai"` | [`OpenAiClient`] |
/// | `"ollama"` | [`OllamaClient`] |
/// | `"hash"` | [`HashEmbedder`] |
pub fn create_client(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingClient>, RagError> {
    match config.provider.as_str() {
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => Err(RagError::Validation(
            "provider 'local' requires the local-embeddings-fastembed feature".into(),
        )),
        "openai" => Ok(Arc::new(OpenAiClient::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaClient::new(config)?)),
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dims))),
        other => Err(RagError::Validation(format!(
            "Unknown embedding provider: {}",
            other
        ))),
    }
}

fn build_http_client(timeout_secs: u64) -> Result<reqwest::Client, RagError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| RagError::EmbeddingUnavailable(format!("HTTP client: {}", e)))
}

fn required_model(config: &EmbeddingConfig) -> Result<String, RagError> {
    config.model.clone().ok_or_else(|| {
        RagError::Validation(format!(
            "embedding.model required for provider '{}'",
            config.provider
        ))
    })
}

/// POST `body` to `url`, retrying transient failures with exponential backoff.
async fn post_with_retry(
    http: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    service: &str,
) -> Result<serde_json::Value, RagError> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let mut request = http.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json().await.map_err(|e| {
                        RagError::EmbeddingUnavailable(format!(
                            "{} returned invalid JSON: {}",
                            service, e
                        ))
                    });
                }

                let body_text = response.text().await.unwrap_or_default();
                let err = format!("{} API error {}: {}", service, status, body_text);
                if status.as_u16() == 429 || status.is_server_error() {
                    tracing::warn!(attempt, %status, "{} embedding request failed, retrying", service);
                    last_err = Some(err);
                    continue;
                }
                return Err(RagError::EmbeddingUnavailable(err));
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "{} embedding request failed, retrying", service);
                last_err = Some(format!("{} connection error ({}): {}", service, url, e));
            }
        }
    }

    Err(RagError::EmbeddingUnavailable(last_err.unwrap_or_else(
        || format!("{} embedding failed after retries", service),
    )))
}

// ============ OpenAI-compatible ============

/// Client for `POST {url}/embeddings` in the OpenAI wire format.
///
/// Works against api.openai.com and self-hosted compatible servers (vLLM,
/// text-embeddings-inference). The bearer token is read from the variable
/// named by `embedding.api_key_env`; it may be absent for local servers.
pub struct OpenAiClient {
    http: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    api_key: Option<String>,
    max_retries: u32,
}

impl OpenAiClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, RagError> {
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Ok(Self {
            http: build_http_client(config.timeout_secs)?,
            url: format!("{}/embeddings", base.trim_end_matches('/')),
            model: required_model(config)?,
            dims: config.dims,
            api_key: std::env::var(&config.api_key_env).ok(),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_with_retry(
            &self.http,
            &self.url,
            self.api_key.as_deref(),
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;
        check_batch(texts.len(), self.dims, parse_openai_response(&json)?)
    }
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, RagError> {
    let malformed = |what: &str| {
        RagError::EmbeddingUnavailable(format!("Invalid OpenAI response: {}", what))
    };
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| malformed("missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| malformed("missing embedding"))?;
        indexed.push((index, parse_vector(embedding).ok_or_else(|| malformed("non-numeric embedding"))?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_vector(values: &[serde_json::Value]) -> Option<Vec<f32>> {
    values.iter().map(|v| v.as_f64().map(|f| f as f32)).collect()
}

// ============ Ollama ============

/// Client for a local Ollama instance (`POST {url}/api/embed`).
pub struct OllamaClient {
    http: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OllamaClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, RagError> {
        let base = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            http: build_http_client(config.timeout_secs)?,
            url: format!("{}/api/embed", base.trim_end_matches('/')),
            model: required_model(config)?,
            dims: config.dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingClient for OllamaClient {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = post_with_retry(&self.http, &self.url, None, &body, self.max_retries, "Ollama")
            .await?;
        check_batch(texts.len(), self.dims, parse_ollama_response(&json)?)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, RagError> {
    let malformed = |what: &str| {
        RagError::EmbeddingUnavailable(format!("Invalid Ollama response: {}", what))
    };
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| malformed("missing embeddings array"))?
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .and_then(|values| parse_vector(values))
                .ok_or_else(|| malformed("embedding is not a numeric array"))
        })
        .collect()
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

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Scale `v` to unit length in place. Zero vectors are left unchanged.
pub fn normalize(v: &mut [f32]) {
    let norm = dot(v, v).sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero-magnitude operand.
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Encodes each text's length; records the largest batch seen.
    struct LengthEmbedder {
        calls: AtomicUsize,
        max_batch: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingClient for LengthEmbedder {
        fn model_name(&self) -> &str {
            "length"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.max_batch.fetch_max(texts.len(), Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    #[tokio::test]
    async fn embed_all_preserves_order_across_batches() {
        let client = Arc::new(LengthEmbedder {
            calls: AtomicUsize::new(0),
            max_batch: AtomicUsize::new(0),
        });
        let texts: Vec<String> = (1..=10).map(|n| "x".repeat(n)).collect();
        let vectors = embed_all(client.clone(), &texts, 3, 4).await.unwrap();
        assert_eq!(vectors.len(), 10);
        for (i, v) in vectors.iter().enumerate() {
            assert_eq!(v[0], (i + 1) as f32);
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
        assert_eq!(client.max_batch.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn embed_all_empty_input_makes_no_calls() {
        let client = Arc::new(LengthEmbedder {
            calls: AtomicUsize::new(0),
            max_batch: AtomicUsize::new(0),
        });
        assert!(embed_all(client.clone(), &[], 8, 2).await.unwrap().is_empty());
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn embed_all_runs_on_a_spawned_task() {
        let client = Arc::new(LengthEmbedder {
            calls: AtomicUsize::new(0),
            max_batch: AtomicUsize::new(0),
        });
        let texts: Vec<String> = (1..=5).map(|n| "y".repeat(n)).collect();
        let task_client: Arc<dyn EmbeddingClient> = client.clone();
        let vectors = tokio::spawn(async move { embed_all(task_client, &texts, 2, 2).await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(vectors.len(), 5);
        assert_eq!(vectors[4][0], 5.0);
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn check_batch_rejects_malformed_output() {
        assert!(check_batch(2, 2, vec![vec![1.0, 2.0]]).is_err());
        assert!(check_batch(1, 3, vec![vec![1.0, 2.0]]).is_err());
        assert!(check_batch(1, 2, vec![vec![f32::NAN, 2.0]]).is_err());
        let err = check_batch(1, 2, vec![]).unwrap_err();
        assert!(matches!(err, RagError::EmbeddingUnavailable(_)));
        assert!(check_batch(1, 2, vec![vec![1.0, 2.0]]).is_ok());
    }

    #[test]
    fn openai_response_is_reordered_by_index() {
        let json = serde_json::json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn openai_response_without_data_is_unavailable() {
        let err = parse_openai_response(&serde_json::json!({ "error": "boom" })).unwrap_err();
        assert!(matches!(err, RagError::EmbeddingUnavailable(_)));
    }

    #[test]
    fn ollama_response_parses() {
        let json = serde_json::json!({ "embeddings": [[0.5, 0.25], [1.0, 2.0]] });
        let vectors = parse_ollama_response(&json).unwrap();
        assert_eq!(vectors[1], vec![1.0, 2.0]);
        assert!(parse_ollama_response(&serde_json::json!({ "embeddings": [["a"]] })).is_err());
    }

    #[test]
    fn hash_provider_builds_without_a_model() {
        let config = EmbeddingConfig {
            provider: "hash".to_string(),
            dims: 32,
            ..EmbeddingConfig::default()
        };
        let client = create_client(&config).unwrap();
        assert_eq!(client.model_name(), "hash");
        assert_eq!(client.dims(), 32);
    }

    #[cfg(feature = "local-embeddings-fastembed")]
    #[test]
    fn default_config_builds_the_local_embedder() {
        let client = create_client(&EmbeddingConfig::default()).unwrap();
        assert_eq!(client.model_name(), DEFAULT_LOCAL_MODEL);
        assert_eq!(client.dims(), 384);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = EmbeddingConfig {
            provider: "word2vec".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_client(&config).is_err());
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
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }
}
