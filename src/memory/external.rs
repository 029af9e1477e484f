//! External memory sidecar.
//!
//! When configured, saves and searches are mirrored to an external provider
//! with identical semantics. Sidecar failures are logged and never affect
//! the primary path; search results are merged with local hits by the
//! manager, deduplicated by id and ordered by score.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::config::MemoryConfig;

/// A hit returned by the external provider.
#[derive(Debug, Clone)]
pub struct ExternalHit {
    pub id: String,
    pub score: f32,
    pub content: String,
}

/// Mirror target for memory saves and searches.
#[async_trait]
pub trait ExternalMemoryProvider: Send + Sync {
    /// Mirror one save. Errors are reported, not fatal.
    async fn save(&self, content: &str, metadata: &HashMap<String, Value>)
        -> Result<(), anyhow::Error>;

    /// Search the external store.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<ExternalHit>, anyhow::Error>;

    /// Clear every mirrored record for this scope.
    async fn reset(&self) -> Result<(), anyhow::Error>;
}

/// mem0 HTTP provider.
pub struct Mem0Provider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    user_id: String,
}

#[derive(Deserialize)]
struct Mem0SearchResponse {
    #[serde(default)]
    results: Vec<Mem0Result>,
}

#[derive(Deserialize)]
struct Mem0Result {
    id: String,
    #[serde(default)]
    memory: String,
    #[serde(default)]
    score: f32,
}

impl Mem0Provider {
    /// Build from memory config. The API key comes from `MEM0_API_KEY`; the
    /// base URL from `MEM0_BASE_URL` (defaults to the hosted service).
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: std::env::var("MEM0_BASE_URL")
                .unwrap_or_else(|_| "https://api.mem0.ai".to_string()),
            api_key: std::env::var("MEM0_API_KEY").ok(),
            user_id: config.user_id.clone().unwrap_or_else(|| "okami".to_string()),
        }
    }
}

#[async_trait]
impl ExternalMemoryProvider for Mem0Provider {
    async fn save(
        &self,
        content: &str,
        metadata: &HashMap<String, Value>,
    ) -> Result<(), anyhow::Error> {
        let url = format!("{}/v1/memories/", self.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&serde_json::json!({
            "messages": [{"role": "user", "content": content}],
            "user_id": self.user_id,
            "metadata": metadata,
        }));
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Token {}", key));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("mem0 save returned status {}", response.status());
        }
        Ok(())
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<ExternalHit>, anyhow::Error> {
        let url = format!("{}/v1/memories/search/", self.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&serde_json::json!({
            "query": query,
            "user_id": self.user_id,
            "limit": k,
        }));
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Token {}", key));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("mem0 search returned status {}", response.status());
        }
        let body: Mem0SearchResponse = response.json().await?;
        Ok(body
            .results
            .into_iter()
            .map(|r| ExternalHit {
                id: r.id,
                score: r.score,
                content: r.memory,
            })
            .collect())
    }

    async fn reset(&self) -> Result<(), anyhow::Error> {
        let url = format!("{}/v1/memories/", self.base_url.trim_end_matches('/'));
        let mut request = self
            .client
            .delete(&url)
            .query(&[("user_id", self.user_id.as_str())]);
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Token {}", key));
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("mem0 reset returned status {}", response.status());
        }
        Ok(())
    }
}
