//! Embedding capability.
//!
//! The engine treats the embedding provider as opaque: anything that maps
//! text to a fixed-dimension vector satisfies [`Embedder`]. The bundled
//! [`HttpEmbedder`] talks to any OpenAI-compatible `/embeddings` endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::config::EmbedderSettings;

/// Errors from the embedding provider.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// Transport or provider failure.
    #[error("embedding request failed: {0}")]
    Request(String),
    /// The provider returned a vector of an unexpected dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Text to fixed-dimension vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// The fixed dimension every returned vector has.
    fn dimension(&self) -> usize;
}

/// OpenAI-compatible HTTP embedding provider.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    /// Default embedding dimension (text-embedding-3-small).
    pub const DEFAULT_DIMENSION: usize = 1536;

    /// Create an embedder from settings. The API key is read from
    /// `OPENAI_API_KEY` unless the provider is local (ollama).
    pub fn from_settings(settings: &EmbedderSettings, dimension: usize) -> Self {
        let base_url = settings
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key: std::env::var("OPENAI_API_KEY").ok(),
            model: settings.model.clone(),
            dimension,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&serde_json::json!({
            "model": self.model,
            "input": text,
        }));
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EmbedError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(EmbedError::Request(format!(
                "status {} from {}",
                response.status(),
                url
            )));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbedError::Request(e.to_string()))?;
        let vector = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbedError::Request("empty embedding response".to_string()))?;

        if vector.len() != self.dimension {
            return Err(EmbedError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
