//! Engine configuration.
//!
//! Deserializable from YAML or JSON. Every section has serde defaults so a
//! partial document is valid; unknown keys are collected and logged as
//! warnings rather than rejected, matching the behavior of persisted spec
//! documents.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::process::Process;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Orchestration discipline for the default crew.
    pub process_type: Process,
    /// Manager agent name; required when `process_type` is hierarchical.
    pub manager_agent: Option<String>,
    /// Cap on recursive delegation depth.
    pub max_delegation_depth: u32,
    /// Whether the memory layer is active.
    pub memory_enabled: bool,
    /// Memory provider selection.
    pub memory_config: MemoryConfig,
    /// Embedding provider settings.
    pub embedder: EmbedderSettings,
    /// Ordered guardrail pipeline configuration.
    pub guardrails: Vec<GuardrailSettings>,
    /// Rate limit defaults.
    pub rate_limits: RateLimitSettings,
    /// Evolution loop settings.
    pub evolution: EvolutionSettings,
    /// Retry budgets per failure class.
    pub retries: RetrySettings,
    /// Task and request deadlines.
    pub timeouts: TimeoutSettings,
    /// Unrecognized keys, preserved for diagnostics.
    #[serde(flatten)]
    pub unknown: HashMap<String, Value>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            process_type: Process::Sequential,
            manager_agent: None,
            max_delegation_depth: 3,
            memory_enabled: true,
            memory_config: MemoryConfig::default(),
            embedder: EmbedderSettings::default(),
            guardrails: Vec::new(),
            rate_limits: RateLimitSettings::default(),
            evolution: EvolutionSettings::default(),
            retries: RetrySettings::default(),
            timeouts: TimeoutSettings::default(),
            unknown: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Log a warning for every unrecognized top-level key.
    pub fn warn_unknown(&self) {
        for key in self.unknown.keys() {
            log::warn!("ignoring unrecognized configuration key '{}'", key);
        }
    }

    /// Parse from YAML, warning on unknown keys.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        let config: Self = serde_yaml::from_str(text)?;
        config.warn_unknown();
        Ok(config)
    }
}

/// Memory provider selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// `basic` uses only the local vector-backed tiers; `mem0` mirrors
    /// saves and searches to the external provider.
    pub provider: MemoryProvider,
    /// User scope forwarded to the external provider.
    pub user_id: Option<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            provider: MemoryProvider::Basic,
            user_id: None,
        }
    }
}

/// Supported memory providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryProvider {
    /// Local vector-backed memory only.
    Basic,
    /// Local memory mirrored to a mem0 sidecar.
    Mem0,
}

/// Embedding provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderSettings {
    /// Provider identifier (e.g. "openai", "ollama").
    pub provider: String,
    /// Model name passed to the provider.
    pub model: String,
    /// Override for the provider's API base URL.
    pub base_url: Option<String>,
}

impl Default for EmbedderSettings {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            base_url: None,
        }
    }
}

/// One configured guardrail in the ordered pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailSettings {
    /// Guardrail type: quality, relevance, safety, or hallucination.
    #[serde(rename = "type")]
    pub guardrail_type: String,
    /// Optional name tasks can reference; defaults to the type.
    pub name: Option<String>,
    /// Fail closed on internal errors instead of failing open.
    #[serde(default)]
    pub strict: bool,
    /// Type-specific parameters.
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

impl GuardrailSettings {
    /// The name tasks use to reference this guardrail.
    pub fn effective_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.guardrail_type)
    }
}

/// Rate limit defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Default requests-per-minute cap for agents without their own.
    /// Zero means unlimited.
    pub max_rpm_default: u32,
    /// How long an agent may block waiting for a token, in milliseconds.
    pub rpm_wait_budget_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_rpm_default: 0,
            rpm_wait_budget_ms: 30_000,
        }
    }
}

impl RateLimitSettings {
    /// Wait budget as a [`Duration`].
    pub fn wait_budget(&self) -> Duration {
        Duration::from_millis(self.rpm_wait_budget_ms)
    }
}

/// Evolution loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionSettings {
    /// Whether the evolution pipeline runs after primary tasks.
    pub enabled: bool,
    /// Maximum changes applied per evolution run; surplus become proposals.
    pub max_changes: usize,
    /// When false, every parsed change is demoted to a proposal.
    pub auto_apply: bool,
    /// Cosine similarity above which an added document is a duplicate.
    pub dedup_threshold: f32,
}

impl Default for EvolutionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_changes: 10,
            auto_apply: true,
            dedup_threshold: 0.92,
        }
    }
}

/// Retry budgets per failure class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts for transient completer failures.
    pub completer: u32,
    /// Attempts for transient tool transport failures.
    pub tool: u32,
    /// Default guardrail retry budget for tasks that do not set their own.
    pub guardrail: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            completer: 5,
            tool: 3,
            guardrail: 3,
        }
    }
}

/// Task and request deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Per-task deadline in milliseconds.
    pub task_ms: u64,
    /// Per-request deadline in milliseconds.
    pub request_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            task_ms: 300_000,
            request_ms: 600_000,
        }
    }
}

impl TimeoutSettings {
    /// Effective per-task deadline: the smaller of task and request budgets.
    pub fn task_deadline(&self) -> Duration {
        Duration::from_millis(self.task_ms.min(self.request_ms))
    }

    /// Per-request deadline as a [`Duration`].
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }
}
