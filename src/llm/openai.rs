//! OpenAI-compatible chat completion provider.
//!
//! Works against any endpoint exposing the `/chat/completions` shape,
//! which covers OpenAI itself plus the usual local gateways. Status codes
//! are mapped onto the transient/fatal split the executor's retry loop
//! relies on.

use async_trait::async_trait;
use serde::Deserialize;

use crate::llm::{ChatMessage, Completer, CompleterError, Completion, CompletionUsage};

/// HTTP chat completion provider.
pub struct OpenAiCompleter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: Option<f64>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

impl OpenAiCompleter {
    /// Create a provider. The API key falls back to `OPENAI_API_KEY`; the
    /// base URL to the hosted endpoint.
    pub fn new(model: impl Into<String>, api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key: api_key.or_else(|| std::env::var("OPENAI_API_KEY").ok()),
            model: model.into(),
            temperature: None,
        }
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[async_trait]
impl Completer for OpenAiCompleter {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, CompleterError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(temperature) = self.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        let mut request = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            // Connect failures, resets, and client-side timeouts are all
            // worth another attempt.
            CompleterError::Transient(format!("request to {} failed: {}", url, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let message = format!("status {}: {}", status, truncate(&detail, 300));
            return if status.is_server_error()
                || status == reqwest::StatusCode::REQUEST_TIMEOUT
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            {
                Err(CompleterError::Transient(message))
            } else {
                Err(CompleterError::Fatal(message))
            };
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CompleterError::Fatal(format!("malformed completion response: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CompleterError::Fatal("completion response had no choices".to_string()))?;

        Ok(Completion {
            content,
            usage: parsed.usage.map(|u| CompletionUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
