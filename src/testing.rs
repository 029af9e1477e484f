//! Deterministic in-crate stubs for tests.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{ChatMessage, Completer, CompleterError, Completion, CompletionUsage};
use crate::rag::{EmbedError, Embedder};

/// Bag-of-words embedder: identical texts embed identically, texts sharing
/// words score higher than disjoint ones. Deterministic, no I/O.
#[derive(Default)]
pub struct StubEmbedder;

impl StubEmbedder {
    pub const DIMENSION: usize = 16;
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut vector = vec![0.0f32; Self::DIMENSION];
        for word in text.to_lowercase().split_whitespace() {
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            let bucket = (hasher.finish() as usize) % Self::DIMENSION;
            vector[bucket] += 1.0;
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        Self::DIMENSION
    }
}

/// An embedder that always fails, for exercising fail-open paths.
pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
        Err(EmbedError::Request("stub embedder down".to_string()))
    }

    fn dimension(&self) -> usize {
        StubEmbedder::DIMENSION
    }
}

/// Scripted completer: pops one canned response per call and records every
/// prompt it received.
pub struct StubCompleter {
    responses: Mutex<Vec<String>>,
    pub prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl StubCompleter {
    /// Responses are served in the order given.
    pub fn new(responses: Vec<&str>) -> Self {
        let mut scripted: Vec<String> = responses.into_iter().map(String::from).collect();
        scripted.reverse();
        Self {
            responses: Mutex::new(scripted),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Every user-visible prompt text seen so far, concatenated per call.
    pub fn seen_prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .map(|messages| {
                messages
                    .iter()
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .collect()
    }
}

#[async_trait]
impl Completer for StubCompleter {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, CompleterError> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        let content = self
            .responses
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| CompleterError::Fatal("stub completer script exhausted".to_string()))?;
        Ok(Completion {
            content,
            usage: Some(CompletionUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
        })
    }

    fn model(&self) -> &str {
        "stub"
    }
}

/// Echo tool used by executor tests.
pub struct EchoTool;

#[async_trait]
impl crate::tools::Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the provided text back"
    }

    async fn call(
        &self,
        args: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, crate::tools::ToolError> {
        let text = args
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(format!("echo: {}", text))
    }
}

/// Helper: string metadata map.
pub fn metadata(pairs: &[(&str, &str)]) -> HashMap<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
        .collect()
}
