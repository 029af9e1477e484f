//! The result of one crew run.

use serde::{Deserialize, Serialize};

use crate::trace::{ExecutionStep, ExecutionTrace, RunStatus};
use crate::types::UsageMetrics;

/// Everything a caller gets back from a kickoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrewResult {
    /// The final output: the last passing task's raw output.
    pub final_output: String,
    /// Per-task steps in execution order, including delegated children.
    pub tasks_output: Vec<ExecutionStep>,
    /// Aggregated token usage across every completer call.
    pub token_usage: UsageMetrics,
    /// The frozen execution trace.
    pub trace: ExecutionTrace,
    /// Terminal status of the run.
    pub status: RunStatus,
    /// Error string locating the failure in the trace, when not completed.
    pub error: Option<String>,
}

impl CrewResult {
    /// Whether the run completed with every task passing.
    pub fn completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}
