//! Completer capability and the tool-call subprotocol.
//!
//! The engine treats the language model as opaque: anything that maps a
//! message list to text satisfies [`Completer`]. Responses are either a
//! terminal text payload or a JSON object `{"tool": ..., "args": {...}}`;
//! [`parse_agent_response`] decides which.

pub mod openai;

pub use openai::OpenAiCompleter;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Completer failures, split by retry policy.
#[derive(Debug, Error)]
pub enum CompleterError {
    /// 5xx, timeout, connection reset. Retried with backoff.
    #[error("transient completer error: {0}")]
    Transient(String),
    /// Auth, quota, malformed request. Never retried.
    #[error("fatal completer error: {0}")]
    Fatal(String),
}

impl CompleterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CompleterError::Transient(_))
    }
}

/// One chat message.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Token accounting for one completion.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CompletionUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

/// A completer response: the text plus optional usage accounting.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub usage: Option<CompletionUsage>,
}

/// Prompt to text.
#[async_trait]
pub trait Completer: Send + Sync {
    /// Produce a completion for the conversation so far.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, CompleterError>;

    /// Model identifier, for logging and traces.
    fn model(&self) -> &str {
        "unknown"
    }
}

/// A parsed agent response.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentResponse {
    /// The agent's terminal answer.
    Terminal(String),
    /// A tool invocation to resolve before continuing.
    ToolCall { tool: String, args: Map<String, Value> },
}

/// Classify a raw completion as a terminal answer or a tool call.
///
/// A tool call is a JSON object with a string `tool` field, either as the
/// whole payload or inside a fenced ```json block. Anything else is
/// terminal text.
pub fn parse_agent_response(raw: &str) -> AgentResponse {
    let candidate = extract_json_object(raw);
    if let Some(text) = candidate {
        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(&text) {
            if let Some(tool) = object.get("tool").and_then(Value::as_str) {
                let args = object
                    .get("args")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                return AgentResponse::ToolCall {
                    tool: tool.to_string(),
                    args,
                };
            }
        }
    }
    AgentResponse::Terminal(raw.trim().to_string())
}

/// Pull a JSON object out of the raw text: the whole trimmed payload, or
/// the contents of the first fenced code block.
fn extract_json_object(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed.to_string());
    }
    let fence_start = trimmed.find("```")?;
    let after = &trimmed[fence_start + 3..];
    let body_start = after.find('\n')?;
    let body = &after[body_start + 1..];
    let fence_end = body.find("```")?;
    let inner = body[..fence_end].trim();
    if inner.starts_with('{') {
        Some(inner.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_terminal() {
        let response = parse_agent_response("The answer is 42.");
        assert_eq!(response, AgentResponse::Terminal("The answer is 42.".to_string()));
    }

    #[test]
    fn test_tool_call_object() {
        let response = parse_agent_response(r#"{"tool": "search", "args": {"query": "rust"}}"#);
        match response {
            AgentResponse::ToolCall { tool, args } => {
                assert_eq!(tool, "search");
                assert_eq!(args.get("query").and_then(Value::as_str), Some("rust"));
            }
            other => panic!("expected tool call, got {:?}", other),
        }
    }

    #[test]
    fn test_tool_call_in_fenced_block() {
        let raw = "Let me look that up.\n```json\n{\"tool\": \"search\", \"args\": {}}\n```";
        match parse_agent_response(raw) {
            AgentResponse::ToolCall { tool, .. } => assert_eq!(tool, "search"),
            other => panic!("expected tool call, got {:?}", other),
        }
    }

    #[test]
    fn test_json_without_tool_field_is_terminal() {
        let raw = r#"{"result": "done"}"#;
        assert!(matches!(parse_agent_response(raw), AgentResponse::Terminal(_)));
    }

    #[test]
    fn test_missing_args_defaults_to_empty() {
        match parse_agent_response(r#"{"tool": "noop"}"#) {
            AgentResponse::ToolCall { args, .. } => assert!(args.is_empty()),
            other => panic!("expected tool call, got {:?}", other),
        }
    }
}
