//! Task specification.
//!
//! Tasks are declarative: a description, an expected-output contract, and
//! references to the agent, context tasks, guardrails, and output schema
//! that are resolved at compile time. Tasks form a DAG via `context`;
//! cycles are rejected when the crew is compiled.

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::utilities::interpolate;

fn default_max_retries() -> u32 {
    3
}

/// A unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique task name within the crew; case-sensitive identity key.
    pub name: String,
    /// What the task is, in full.
    pub description: String,
    /// Contract for what a good output looks like.
    pub expected_output: String,
    /// Agent responsible for execution. May be absent in hierarchical
    /// crews, where the manager resolves it.
    #[serde(default)]
    pub agent: Option<String>,
    /// Names of tasks whose outputs are injected as context, in order.
    #[serde(default)]
    pub context: Vec<String>,
    /// Names of configured guardrails to run; empty means the whole
    /// configured pipeline.
    #[serde(default)]
    pub guardrails: Vec<String>,
    /// Guardrail retry budget: total attempts are `max_retries + 1`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Name of a registered output schema the result must satisfy.
    #[serde(default)]
    pub output_schema: Option<String>,
    /// Whether the task may run in parallel with other async tasks once
    /// its dependencies are satisfied.
    #[serde(default)]
    pub async_execution: bool,
    /// Tool names the agent is limited to for this task; empty means the
    /// agent's own tool set.
    #[serde(default)]
    pub tools: Vec<String>,

    /// Original description before interpolation.
    #[serde(skip)]
    original_description: Option<String>,
    /// Original expected output before interpolation.
    #[serde(skip)]
    original_expected_output: Option<String>,
}

impl TaskSpec {
    /// Create a task with required fields.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        expected_output: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            expected_output: expected_output.into(),
            agent: None,
            context: Vec::new(),
            guardrails: Vec::new(),
            max_retries: default_max_retries(),
            output_schema: None,
            async_execution: false,
            tools: Vec::new(),
            original_description: None,
            original_expected_output: None,
        }
    }

    /// Assign the executing agent.
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    /// Add context dependencies.
    pub fn with_context(mut self, context: Vec<&str>) -> Self {
        self.context = context.into_iter().map(String::from).collect();
        self
    }

    /// Set the guardrail retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The task body of the prompt: description plus the output contract.
    pub fn prompt(&self) -> String {
        format!(
            "{}\n\nExpected Output: {}",
            self.description, self.expected_output
        )
    }

    /// Stable identity key: MD5 of the uninterpolated
    /// description|expected_output pair.
    pub fn key(&self) -> String {
        let description = self
            .original_description
            .as_deref()
            .unwrap_or(&self.description);
        let expected = self
            .original_expected_output
            .as_deref()
            .unwrap_or(&self.expected_output);
        let mut hasher = Md5::new();
        hasher.update(format!("{}|{}", description, expected).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Interpolate `{key}` placeholders from the inputs map into the
    /// description and expected output. Idempotent across kickoffs: the
    /// originals are retained and re-interpolated each time.
    pub fn interpolate_inputs(&mut self, inputs: &HashMap<String, String>) {
        if self.original_description.is_none() {
            self.original_description = Some(self.description.clone());
        }
        if self.original_expected_output.is_none() {
            self.original_expected_output = Some(self.expected_output.clone());
        }
        if inputs.is_empty() {
            return;
        }
        if let Some(ref original) = self.original_description {
            self.description = interpolate(original, inputs);
        }
        if let Some(ref original) = self.original_expected_output {
            self.expected_output = interpolate(original, inputs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_contains_contract() {
        let task = TaskSpec::new("t", "Do the thing", "A done thing");
        let prompt = task.prompt();
        assert!(prompt.contains("Do the thing"));
        assert!(prompt.contains("Expected Output: A done thing"));
    }

    #[test]
    fn test_key_is_stable_across_interpolation() {
        let mut task = TaskSpec::new("t", "Research {topic}", "Notes on {topic}");
        let key_before = task.key();
        let mut inputs = HashMap::new();
        inputs.insert("topic".to_string(), "rust".to_string());
        task.interpolate_inputs(&inputs);
        assert_eq!(task.description, "Research rust");
        assert_eq!(task.key(), key_before);
    }

    #[test]
    fn test_interpolation_is_repeatable() {
        let mut task = TaskSpec::new("t", "Research {topic}", "Notes");
        let mut inputs = HashMap::new();
        inputs.insert("topic".to_string(), "rust".to_string());
        task.interpolate_inputs(&inputs);
        inputs.insert("topic".to_string(), "tokio".to_string());
        task.interpolate_inputs(&inputs);
        assert_eq!(task.description, "Research tokio");
    }

    #[test]
    fn test_deserializes_with_defaults() {
        let yaml = r#"
name: research
description: Research the topic
expected_output: Bullet notes
"#;
        let task: TaskSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(task.max_retries, 3);
        assert!(task.context.is_empty());
        assert!(!task.async_execution);
    }
}
