//! Agent specification and prompt assembly.
//!
//! An agent is a configured role: identity and templates, a tool set, an
//! iteration cap, a rate limit, and a delegation permission. Specs are
//! immutable once a run is compiled; the executor binds them to the
//! Completer at runtime.

pub mod delegation;
pub mod executor;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::task::TaskSpec;
use crate::utilities::interpolate;

/// Default iteration cap per task.
fn default_max_iter() -> u32 {
    25
}

fn default_memory_enabled() -> bool {
    true
}

/// Template used when an agent has no `system_template` of its own.
pub const DEFAULT_SYSTEM_TEMPLATE: &str = "You are {role}. {backstory}\n\
Your personal goal is: {goal}\n\
Give a complete, final answer when you are done; do not pad it with commentary.";

/// Template used when an agent has no `prompt_template` of its own.
pub const DEFAULT_PROMPT_TEMPLATE: &str = "\
Current task:\n{description}\n{context}{memory}{knowledge}{tools}";

/// A configured worker role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Unique agent name; case-sensitive identity key.
    pub name: String,
    /// Role of the agent.
    pub role: String,
    /// Objective of the agent.
    pub goal: String,
    /// Backstory framing how the agent approaches work.
    pub backstory: String,
    /// Override for the system prompt template.
    #[serde(default)]
    pub system_template: Option<String>,
    /// Override for the task prompt template.
    #[serde(default)]
    pub prompt_template: Option<String>,
    /// Tools at the agent's disposal.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Maximum completer iterations per task. Must be at least 1.
    #[serde(default = "default_max_iter")]
    pub max_iter: u32,
    /// Requests-per-minute cap; 0 means unlimited (or the engine default).
    #[serde(default)]
    pub max_rpm: u32,
    /// Whether other agents may delegate work to this one.
    #[serde(default)]
    pub allow_delegation: bool,
    /// Whether memory context is assembled for this agent's tasks.
    #[serde(default = "default_memory_enabled")]
    pub memory_enabled: bool,
    /// Knowledge references: category names scoping retrieval for this
    /// agent's tasks.
    #[serde(default)]
    pub knowledge: Vec<String>,

    /// Original role before interpolation.
    #[serde(skip)]
    original_role: Option<String>,
    /// Original goal before interpolation.
    #[serde(skip)]
    original_goal: Option<String>,
    /// Original backstory before interpolation.
    #[serde(skip)]
    original_backstory: Option<String>,
}

impl AgentSpec {
    /// Create an agent with required fields.
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        goal: impl Into<String>,
        backstory: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            goal: goal.into(),
            backstory: backstory.into(),
            system_template: None,
            prompt_template: None,
            tools: Vec::new(),
            max_iter: default_max_iter(),
            max_rpm: 0,
            allow_delegation: false,
            memory_enabled: true,
            knowledge: Vec::new(),
            original_role: None,
            original_goal: None,
            original_backstory: None,
        }
    }

    /// Cap completer iterations per task.
    pub fn with_max_iter(mut self, max_iter: u32) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Permit delegation to this agent.
    pub fn with_delegation(mut self) -> Self {
        self.allow_delegation = true;
        self
    }

    /// Grant tools by name.
    pub fn with_tools(mut self, tools: Vec<&str>) -> Self {
        self.tools = tools.into_iter().map(String::from).collect();
        self
    }

    /// Stable identity key: MD5 of role|goal|backstory.
    pub fn key(&self) -> String {
        let role = self.original_role.as_deref().unwrap_or(&self.role);
        let goal = self.original_goal.as_deref().unwrap_or(&self.goal);
        let backstory = self.original_backstory.as_deref().unwrap_or(&self.backstory);
        let mut hasher = Md5::new();
        hasher.update(format!("{}|{}|{}", role, goal, backstory).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Render the system prompt from the agent's template (or the default).
    pub fn system_prompt(&self) -> String {
        let template = self
            .system_template
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_TEMPLATE);
        let mut bindings = HashMap::new();
        bindings.insert("role".to_string(), self.role.clone());
        bindings.insert("goal".to_string(), self.goal.clone());
        bindings.insert("backstory".to_string(), self.backstory.clone());
        interpolate(template, &bindings)
    }

    /// Interpolate `{key}` placeholders into role, goal, and backstory.
    pub fn interpolate_inputs(&mut self, inputs: &HashMap<String, String>) {
        if self.original_role.is_none() {
            self.original_role = Some(self.role.clone());
        }
        if self.original_goal.is_none() {
            self.original_goal = Some(self.goal.clone());
        }
        if self.original_backstory.is_none() {
            self.original_backstory = Some(self.backstory.clone());
        }
        if inputs.is_empty() {
            return;
        }
        if let Some(ref original) = self.original_role {
            self.role = interpolate(original, inputs);
        }
        if let Some(ref original) = self.original_goal {
            self.goal = interpolate(original, inputs);
        }
        if let Some(ref original) = self.original_backstory {
            self.backstory = interpolate(original, inputs);
        }
    }
}

/// The retrieval-augmented blocks assembled around a task prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptBlocks {
    /// Ordered concatenation of dependency outputs.
    pub context: String,
    /// Memory layer block (recent + relevant + historical + entities).
    pub memory: String,
    /// Knowledge retrieval block.
    pub knowledge: String,
    /// Tool manifest for the agent's allowed tools.
    pub tools: String,
    /// Pre-computed plan text, when planning is enabled.
    pub plan: String,
}

/// Render the full user prompt for a task.
///
/// Composition order: task description and contract, then prior
/// dependencies' outputs, then the retrieval-augmented blocks, then the
/// tool manifest.
pub fn build_task_prompt(agent: &AgentSpec, task: &TaskSpec, blocks: &PromptBlocks) -> String {
    let template = agent
        .prompt_template
        .as_deref()
        .unwrap_or(DEFAULT_PROMPT_TEMPLATE);

    let mut bindings = HashMap::new();
    bindings.insert("description".to_string(), task.prompt());
    bindings.insert(
        "context".to_string(),
        labeled_block("Context from earlier tasks", &blocks.context),
    );
    bindings.insert(
        "memory".to_string(),
        labeled_block("Memory", &blocks.memory),
    );
    bindings.insert(
        "knowledge".to_string(),
        labeled_block("Knowledge", &blocks.knowledge),
    );
    bindings.insert("tools".to_string(), labeled_block("", &blocks.tools));

    let mut prompt = interpolate(template, &bindings);
    if !blocks.plan.is_empty() {
        prompt = format!("Plan for this run:\n{}\n\n{}", blocks.plan, prompt);
    }
    prompt
}

fn labeled_block(label: &str, content: &str) -> String {
    if content.is_empty() {
        return String::new();
    }
    if label.is_empty() {
        format!("\n\n{}", content)
    } else {
        format!("\n\n{}:\n{}", label, content)
    }
}
