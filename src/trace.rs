//! Execution traces: the append-only record of one crew run.
//!
//! A trace is created at run start, mutated only by the orchestrator, and
//! frozen at run end. It is sufficient to reconstruct every prompt, tool
//! call, and guardrail verdict, and its compacted summary is what the
//! evolution crew reads.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::guardrails::Verdict;

/// Maximum lines in a compacted trace summary.
const SUMMARY_MAX_LINES: usize = 40;

/// Maximum characters of an error excerpt in a summary line.
const SUMMARY_ERROR_EXCERPT: usize = 200;

/// One tool invocation inside a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: Map<String, Value>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Terminal verdict of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepVerdict {
    Pass,
    Fail,
}

/// Per-task artifact of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub task_name: String,
    pub agent_name: String,
    /// Guardrail attempts consumed (1 = passed first time).
    pub attempts: u32,
    pub tool_calls: Vec<ToolCall>,
    pub raw_output: String,
    pub guardrail_verdicts: Vec<Verdict>,
    pub final_verdict: StepVerdict,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl ExecutionStep {
    pub fn passed(&self) -> bool {
        self.final_verdict == StepVerdict::Pass
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
    Partial,
}

/// The full record of one crew run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub crew_name: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub inputs: HashMap<String, String>,
    pub steps: Vec<ExecutionStep>,
    pub final_output: Option<String>,
    pub status: RunStatus,
}

impl ExecutionTrace {
    /// Start a trace for a run.
    pub fn new(crew_name: &str, inputs: HashMap<String, String>) -> Self {
        Self {
            crew_name: crew_name.to_string(),
            run_id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            ended_at: None,
            inputs,
            steps: Vec::new(),
            final_output: None,
            status: RunStatus::Failed,
        }
    }

    /// Append one completed step.
    pub fn record_step(&mut self, step: ExecutionStep) {
        self.steps.push(step);
    }

    /// Freeze the trace with its terminal status and output.
    pub fn freeze(&mut self, status: RunStatus, final_output: Option<String>) {
        self.status = status;
        self.final_output = final_output;
        self.ended_at = Some(Utc::now());
    }

    /// Total wall-clock duration, once frozen.
    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }

    /// Compacted plain-text view of the run, bounded for prompt use: one
    /// line per step with agent, attempts, verdicts, and error excerpts.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "Run {} of crew '{}' finished with status {:?}: {} step(s).",
            self.run_id,
            self.crew_name,
            self.status,
            self.steps.len()
        )];

        for step in &self.steps {
            if lines.len() >= SUMMARY_MAX_LINES {
                lines.push(format!(
                    "... {} more step(s) omitted",
                    self.steps.len() - (lines.len() - 1)
                ));
                break;
            }
            let rejections = step
                .guardrail_verdicts
                .iter()
                .filter(|v| !v.passed)
                .count();
            let mut line = format!(
                "- task '{}' by '{}': {:?} after {} attempt(s), {} tool call(s), {} rejection(s), {}ms",
                step.task_name,
                step.agent_name,
                step.final_verdict,
                step.attempts,
                step.tool_calls.len(),
                rejections,
                step.duration_ms,
            );
            if let Some(ref error) = step.error {
                line.push_str(&format!("; error: {}", excerpt(error, SUMMARY_ERROR_EXCERPT)));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

fn excerpt(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
