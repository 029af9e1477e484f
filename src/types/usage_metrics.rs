//! Usage metrics tracking for crew execution.

use serde::{Deserialize, Serialize};

/// Aggregated token usage across completer calls for one crew run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetrics {
    /// Total number of tokens used.
    pub total_tokens: i64,
    /// Number of tokens used in prompts.
    pub prompt_tokens: i64,
    /// Number of tokens used in completions.
    pub completion_tokens: i64,
    /// Number of successful requests made.
    pub successful_requests: i64,
}

impl UsageMetrics {
    /// Create a new empty UsageMetrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add usage metrics from another UsageMetrics object.
    pub fn add_usage_metrics(&mut self, other: &UsageMetrics) {
        self.total_tokens += other.total_tokens;
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.successful_requests += other.successful_requests;
    }
}
