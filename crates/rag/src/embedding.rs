use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::config::{EmbeddingProvider, RagConfig};
use crate::error::RagError;

/// Text to fixed-length vector. The dimension is a deployment constant.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;
}

#[derive(Clone)]
pub enum EmbeddingBackend {
    Hash(HashEmbedder),
    Ollama(OllamaEmbeddingClient),
}

#[derive(Clone)]
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
    dimensions: usize,
}

impl EmbeddingClient {
    pub fn from_config(config: &RagConfig) -> std::result::Result<Self, RagError> {
        let dimensions = config.embedding_dimensions;
        match config.embedding_provider {
            EmbeddingProvider::Ollama => {
                let base_url = config.ollama_base_url.clone().ok_or_else(|| {
                    RagError::configuration("OLLAMA_BASE_URL must be set for ollama embeddings")
                })?;
                let model = config.embedding_model.clone().ok_or_else(|| {
                    RagError::configuration("OLLAMA_EMBEDDING_MODEL must be set")
                })?;
                Self::ollama(&base_url, &model, dimensions, config.timeout)
                    .map_err(RagError::configuration)
            }
            EmbeddingProvider::Hash => Ok(Self::hash(dimensions)),
        }
    }

    pub fn ollama(
        base_url: &str,
        model: &str,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            backend: EmbeddingBackend::Ollama(OllamaEmbeddingClient::new(base_url, model, timeout)?),
            dimensions,
        })
    }

    pub fn hash(dimensions: usize) -> Self {
        Self {
            backend: EmbeddingBackend::Hash(HashEmbedder::new(dimensions, 1337)),
            dimensions,
        }
    }

    pub fn backend(&self) -> &EmbeddingBackend {
        &self.backend
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    /// Returns whatever width the backend produced; callers compare it against
    /// [`Embedder::dimensions`].
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match &self.backend {
            EmbeddingBackend::Hash(embedder) => Ok(embedder.embed_text(text)),
            EmbeddingBackend::Ollama(client) => client.embed(text).await,
        }
    }

    /// The configured deployment width, not a property of the backend.
    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[derive(Clone)]
pub struct OllamaEmbeddingClient {
    http: Client,
    url: String,
    model: String,
}

impl OllamaEmbeddingClient {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        if base_url.trim().is_empty() || model.trim().is_empty() {
            return Err(anyhow!("ollama embeddings need both a base url and a model"));
        }
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            url: format!("{}/api/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }

    /// A non-success status or a body without a vector is an error; there is
    /// no substitute vector.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let payload = serde_json::json!({
            "model": self.model,
            "prompt": text,
        });
        let response = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("embedding request to {} failed", self.url))?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "ollama embeddings request failed: {}",
                response.status()
            ));
        }
        let parsed: OllamaEmbeddingResponse = response
            .json()
            .await
            .context("failed to decode embedding response")?;
        match parsed.embedding {
            Some(vector) if !vector.is_empty() => Ok(vector),
            _ => Err(anyhow!("embedding response carried no vector")),
        }
    }
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Option<Vec<f32>>,
}

/// Bag-of-words hashing embedder for offline runs and tests.
#[derive(Clone)]
pub struct HashEmbedder {
    dimensions: usize,
    seed: u64,
}

impl HashEmbedder {
    pub fn new(dimensions: usize, seed: u64) -> Self {
        Self {
            dimensions: dimensions.max(1),
            seed,
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        for token in text.split_whitespace() {
            let token = token.trim_matches(|c: char| !c.is_alphanumeric());
            if token.is_empty() {
                continue;
            }
            vector[self.bucket_for(token)] += 1.0;
        }
        normalize(&mut vector);
        vector
    }

    fn bucket_for(&self, token: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        hasher.write_u64(self.seed);
        token.to_lowercase().hash(&mut hasher);
        (hasher.finish() as usize) % self.dimensions
    }
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embeddings_have_configured_dimension() {
        let client = EmbeddingClient::hash(384);
        let vector = client.embed("What is the leave policy?").await.unwrap();
        assert_eq!(vector.len(), 384);
        assert_eq!(client.dimensions(), 384);
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hash_embedder_ignores_case_and_punctuation() {
        let embedder = HashEmbedder::new(64, 7);
        assert_eq!(embedder.embed_text("Policy!"), embedder.embed_text("policy"));
    }

    #[test]
    fn blank_text_embeds_to_zero_vector() {
        let embedder = HashEmbedder::new(16, 7);
        assert!(embedder.embed_text("  ").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn ollama_client_requires_endpoint_and_model() {
        assert!(OllamaEmbeddingClient::new("", "nomic", Duration::from_secs(1)).is_err());
        assert!(OllamaEmbeddingClient::new("http://x", "", Duration::from_secs(1)).is_err());
        let client =
            OllamaEmbeddingClient::new("http://x:11434/", "nomic", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url, "http://x:11434/api/embeddings");
    }

    #[tokio::test]
    async fn width_mismatch_reaches_the_retriever_as_dimension_mismatch() {
        use crate::error::RetrievalError;
        use crate::retriever::Retriever;
        use crate::store::RagStore;
        use std::sync::Arc;

        let dir = tempfile::TempDir::new().unwrap();
        let store = RagStore::open(dir.path().join("emb.sqlite"), 32).unwrap();
        let client = EmbeddingClient {
            backend: EmbeddingBackend::Hash(HashEmbedder::new(16, 1337)),
            dimensions: 32,
        };
        assert_eq!(client.embed("leave policy").await.unwrap().len(), 16);
        let retriever = Retriever::new(Arc::new(client), Arc::new(store), Duration::from_secs(5));
        let err = retriever.retrieve("leave policy", "hr", 5).await.unwrap_err();
        assert!(matches!(
            err,
            RetrievalError::DimensionMismatch {
                expected: 32,
                actual: 16
            }
        ));
    }

    #[tokio::test]
    async fn unreachable_ollama_endpoint_is_an_error() {
        let client =
            EmbeddingClient::ollama("http://127.0.0.1:9", "nomic", 384, Duration::from_secs(2))
                .unwrap();
        assert!(client.embed("hello").await.is_err());
    }
}
