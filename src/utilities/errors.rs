//! Core error taxonomy for the engine.
//!
//! Each variant maps to a distinct handling policy: compile failures surface
//! to the caller, transient transport failures are retried with backoff,
//! guardrail rejections consume the task's retry budget, and cancellation
//! freezes a partial trace.

use thiserror::Error;

/// Top-level error type recognized by the orchestrator and its callers.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed spec, cyclic task graph, or unresolved references.
    #[error("validation error: {0}")]
    Validation(String),

    /// An agent's rate bucket could not grant a token within the wait budget.
    #[error("rate budget exceeded for agent '{agent}'")]
    RateBudgetExceeded { agent: String },

    /// Transient completer failure (5xx, timeout, connection reset).
    #[error("completer transient failure: {0}")]
    CompleterTransient(String),

    /// Fatal completer failure (auth, quota, malformed request). Not retried.
    #[error("completer fatal failure: {0}")]
    CompleterFatal(String),

    /// A strict tool failed, or a tool failed past its retry budget.
    #[error("tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    /// All guardrail retry slots were consumed without a passing output.
    #[error("guardrail rejected output: {0}")]
    GuardrailRejected(String),

    /// The agent hit its iteration cap without producing a terminal answer.
    #[error("agent '{agent}' exceeded max_iter={max_iter}")]
    MaxIterExceeded { agent: String, max_iter: u32 },

    /// The request was cancelled by the caller.
    #[error("Cancelled")]
    Cancelled,

    /// The per-task or per-request deadline elapsed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A knowledge mutation failed; the backup has been restored.
    #[error("knowledge write failed: {0}")]
    KnowledgeWrite(String),

    /// The bounded request queue is full; the client may retry.
    #[error("request queue is full")]
    QueueFull,

    /// Filesystem failure outside the knowledge write path.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether the call site may retry after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::CompleterTransient(_)
                | EngineError::RateBudgetExceeded { .. }
                | EngineError::QueueFull
        )
    }

    /// Short machine-readable tag used in traces and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::RateBudgetExceeded { .. } => "rate_budget_exceeded",
            EngineError::CompleterTransient(_) => "completer_transient",
            EngineError::CompleterFatal(_) => "completer_fatal",
            EngineError::Tool { .. } => "tool",
            EngineError::GuardrailRejected(_) => "guardrail_rejected",
            EngineError::MaxIterExceeded { .. } => "max_iter_exceeded",
            EngineError::Cancelled => "cancelled",
            EngineError::DeadlineExceeded => "deadline_exceeded",
            EngineError::KnowledgeWrite(_) => "knowledge_write",
            EngineError::QueueFull => "queue_full",
            EngineError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::CompleterTransient("503".into()).is_retryable());
        assert!(EngineError::QueueFull.is_retryable());
        assert!(!EngineError::CompleterFatal("bad key".into()).is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(!EngineError::Validation("cycle".into()).is_retryable());
    }

    #[test]
    fn test_cancelled_display_matches_api_contract() {
        // The API surfaces this string verbatim in the `error` field.
        assert_eq!(EngineError::Cancelled.to_string(), "Cancelled");
    }
}
