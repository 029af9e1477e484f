//! Tool capability and registry.
//!
//! Tools form a closed built-in set plus an open extension point: user
//! tools register at startup under unique names. Dispatch returns the tool
//! result as a transcript string; failures come back as structured errors
//! the agent can read and recover from, unless the tool is strict.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

/// Reserved tool name the manager uses to delegate work.
pub const DELEGATE_TOOL: &str = "delegate";

/// A failed tool invocation.
#[derive(Debug, Clone)]
pub struct ToolError {
    pub tool: String,
    pub message: String,
    /// Transport-level failures worth retrying with backoff.
    pub retryable: bool,
}

impl ToolError {
    pub fn new(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            message: message.into(),
            retryable: true,
        }
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tool '{}' failed: {}", self.tool, self.message)
    }
}

impl std::error::Error for ToolError {}

/// A callable capability an agent may use mid-task.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name agents reference.
    fn name(&self) -> &str;

    /// One-line description shown in the agent's tool manifest.
    fn description(&self) -> &str;

    /// Strict tools fail the task when they error instead of returning a
    /// structured error into the agent loop.
    fn strict(&self) -> bool {
        false
    }

    /// Invoke the tool.
    async fn call(&self, args: &Map<String, Value>) -> Result<String, ToolError>;
}

/// Startup-time tool registry.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. The delegation name is reserved, and names must be
    /// unique.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), String> {
        let name = tool.name().to_string();
        if name == DELEGATE_TOOL {
            return Err(format!("'{}' is a reserved tool name", DELEGATE_TOOL));
        }
        if self.tools.contains_key(&name) {
            return Err(format!("tool '{}' is already registered", name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|t| t.value().clone())
    }

    /// Whether a name resolves, counting the reserved delegation tool.
    pub fn knows(&self, name: &str) -> bool {
        name == DELEGATE_TOOL || self.tools.contains_key(name)
    }

    /// Render the manifest block for an agent's allowed tool names.
    ///
    /// Unknown names are listed as unavailable so the prompt never invites
    /// a call that cannot be dispatched.
    pub fn manifest(&self, names: &[String]) -> String {
        if names.is_empty() {
            return String::new();
        }
        let mut lines = vec![
            "You may call tools by replying with JSON: {\"tool\": \"<name>\", \"args\": {...}}"
                .to_string(),
            "Available tools:".to_string(),
        ];
        for name in names {
            match self.get(name) {
                Some(tool) => lines.push(format!("- {}: {}", tool.name(), tool.description())),
                None => log::warn!("tool '{}' referenced but not registered", name),
            }
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::EchoTool;

    #[test]
    fn test_register_and_lookup() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert!(registry.knows("delegate"));
    }

    #[test]
    fn test_duplicate_and_reserved_names_rejected() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        assert!(registry.register(Arc::new(EchoTool)).is_err());

        struct Impostor;
        #[async_trait]
        impl Tool for Impostor {
            fn name(&self) -> &str {
                DELEGATE_TOOL
            }
            fn description(&self) -> &str {
                "not allowed"
            }
            async fn call(&self, _args: &Map<String, Value>) -> Result<String, ToolError> {
                Ok(String::new())
            }
        }
        assert!(registry.register(Arc::new(Impostor)).is_err());
    }

    #[test]
    fn test_manifest_lists_registered_tools() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let manifest = registry.manifest(&["echo".to_string()]);
        assert!(manifest.contains("- echo:"));
        assert!(registry.manifest(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_echo_tool_call() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let tool = registry.get("echo").unwrap();
        let mut args = Map::new();
        args.insert("text".to_string(), Value::String("hi".to_string()));
        assert_eq!(tool.call(&args).await.unwrap(), "echo: hi");
    }
}
