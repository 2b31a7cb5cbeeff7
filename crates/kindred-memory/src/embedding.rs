//! Embedding capability.
//!
//! The [`Embedder`] trait turns text into a dense vector. The memory
//! coordinator holds it as an optional capability: when it is absent or fails,
//! turns are still logged but not indexed.
//!
//! | adapter            | backing                                        |
//! |--------------------|------------------------------------------------|
//! | [`HttpEmbedder`]   | OpenAI-compatible `POST /v1/embeddings`        |
//! | [`HashingEmbedder`]| deterministic signed feature hashing, offline  |

use async_trait::async_trait;
use kindred_types::CapabilityError;
use serde::{Deserialize, Serialize};

/// Text-to-vector capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// HttpEmbedder
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// Client for an OpenAI-compatible embeddings endpoint (OpenAI, Ollama,
/// llama.cpp server, ...).
pub struct HttpEmbedder {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            client: reqwest::Client::new(),
        }
    }

    /// Send `Authorization: Bearer <key>` with every request.
    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key.filter(|k| !k.is_empty());
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/embeddings", self.base_url)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: text,
        };
        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response: EmbeddingResponse = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CapabilityError::Unavailable(format!("embedding request: {e}")))?
            .json()
            .await
            .map_err(|e| CapabilityError::Unavailable(format!("embedding response: {e}")))?;

        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| CapabilityError::Unavailable("empty embedding data".into()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HashingEmbedder
// ─────────────────────────────────────────────────────────────────────────────

/// Default width of [`HashingEmbedder`] vectors.
pub const DEFAULT_HASHING_DIMS: usize = 256;

/// Offline embedder using the signed hashing trick over lowercase word
/// unigrams and bigrams. The same text always yields the same unit vector, so
/// texts sharing vocabulary land close together.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dims: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASHING_DIMS)
    }
}

impl HashingEmbedder {
    /// `dims` is raised to 1 if zero.
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Synchronous core of [`Embedder::embed`].
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        let mut v = vec![0.0f32; self.dims];
        let mut add = |feature: &str, weight: f32| {
            let h = fnv1a(feature.as_bytes());
            let slot = (h % self.dims as u64) as usize;
            let sign = if h >> 63 == 1 { -1.0 } else { 1.0 };
            v[slot] += sign * weight;
        };
        for w in &words {
            add(w, 1.0);
        }
        for pair in words.windows(2) {
            add(&format!("{} {}", pair[0], pair[1]), 0.5);
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        Ok(self.embed_sync(text))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |h, b| (h ^ u64::from(*b)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic_index::cosine_similarity;

    #[tokio::test]
    async fn hashing_embedder_is_deterministic_and_normalized() {
        let e = HashingEmbedder::default();
        let a = e.embed("I love rainy afternoons").await.unwrap();
        let b = e.embed("I love rainy afternoons").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), DEFAULT_HASHING_DIMS);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_vocabulary_scores_higher() {
        let e = HashingEmbedder::default();
        let q = e.embed_sync("my dog loves the park");
        let related = e.embed_sync("the dog ran around the park");
        let unrelated = e.embed_sync("quarterly tax filing deadline");
        assert!(cosine_similarity(&q, &related) > cosine_similarity(&q, &unrelated));
    }

    #[test]
    fn case_and_punctuation_are_ignored() {
        let e = HashingEmbedder::new(64);
        assert_eq!(e.embed_sync("Hello, World!"), e.embed_sync("hello world"));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let e = HashingEmbedder::new(8);
        assert!(e.embed_sync("   ").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn http_embedder_endpoint_strips_trailing_slash() {
        let e = HttpEmbedder::new("http://localhost:11434/", "nomic-embed-text");
        assert_eq!(e.endpoint(), "http://localhost:11434/v1/embeddings");
    }

    #[tokio::test]
    async fn http_embedder_unreachable_is_unavailable() {
        let e = HttpEmbedder::new("http://127.0.0.1:1", "m");
        let err = e.embed("hi").await.unwrap_err();
        assert!(matches!(err, CapabilityError::Unavailable(_)));
    }
}
