//! Manager delegation.
//!
//! Hierarchical crews route work through a manager agent that emits
//! `delegate` tool calls. Each delegation is resolved synchronously: a
//! child task is built on the fly and driven through the same execution
//! loop, recursing up to the configured depth cap. Rejected delegations
//! come back to the manager as structured errors and count against its
//! iteration budget like any other tool round.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::{Map, Value};

use crate::agent::executor::{execute_task, DelegationScope, ExecutorEnv};
use crate::agent::{AgentSpec, PromptBlocks};
use crate::task::TaskSpec;
use crate::tools::DELEGATE_TOOL;
use crate::trace::{ExecutionStep, ToolCall};
use crate::types::UsageMetrics;

/// What a resolved (or rejected) delegation hands back to the manager loop.
pub struct DelegateOutcome {
    /// Message appended to the manager's transcript.
    pub transcript_message: String,
    /// The recorded tool call.
    pub tool_call: ToolCall,
    /// Steps of the child execution, including its own delegations.
    pub children: Vec<ExecutionStep>,
    /// Token usage consumed by the child.
    pub usage: UsageMetrics,
}

/// Render the worker inventory and delegation instructions appended to a
/// delegating agent's prompt.
pub fn inventory_block(workers: &HashMap<String, AgentSpec>) -> String {
    if workers.is_empty() {
        return String::new();
    }
    let mut names: Vec<&String> = workers.keys().collect();
    names.sort();
    let mut lines = vec![
        format!(
            "You may delegate work by replying with JSON: \
             {{\"tool\": \"{}\", \"args\": {{\"agent\": \"<name>\", \"task\": \"<description>\", \"context\": \"<optional>\"}}}}",
            DELEGATE_TOOL
        ),
        "Workers available for delegation:".to_string(),
    ];
    for name in names {
        let worker = &workers[name];
        lines.push(format!("- {}: {} ({})", worker.name, worker.role, worker.goal));
    }
    lines.join("\n")
}

/// Resolve one `delegate` tool call.
pub async fn handle_delegate(
    env: &ExecutorEnv,
    scope: DelegationScope<'_>,
    args: &Map<String, Value>,
) -> DelegateOutcome {
    let started = Instant::now();
    let rejected = |message: String| DelegateOutcome {
        transcript_message: format!("Delegation error: {}", message),
        tool_call: ToolCall {
            name: DELEGATE_TOOL.to_string(),
            args: args.clone(),
            result: None,
            error: Some(message),
            duration_ms: started.elapsed().as_millis() as u64,
        },
        children: Vec::new(),
        usage: UsageMetrics::new(),
    };

    let Some(target_name) = args.get("agent").and_then(Value::as_str) else {
        return rejected("missing 'agent' argument".to_string());
    };
    let Some(task_description) = args.get("task").and_then(Value::as_str) else {
        return rejected("missing 'task' argument".to_string());
    };

    if scope.depth + 1 > scope.max_depth {
        return rejected(format!(
            "delegation depth limit of {} reached",
            scope.max_depth
        ));
    }

    let Some(target) = scope.workers.get(target_name) else {
        let mut known: Vec<&String> = scope.workers.keys().collect();
        known.sort();
        return rejected(format!(
            "unknown agent '{}'; available: {}",
            target_name,
            known.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        ));
    };
    if !target.allow_delegation {
        return rejected(format!("agent '{}' does not accept delegated work", target_name));
    }

    let expected = args
        .get("expected")
        .and_then(Value::as_str)
        .unwrap_or("A complete, direct answer to the delegated task.");
    let child_task = TaskSpec::new(
        format!("delegate:{}", target_name),
        task_description,
        expected,
    );
    let child_blocks = PromptBlocks {
        context: args
            .get("context")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        ..PromptBlocks::default()
    };

    log::debug!(
        "delegating '{}' to agent '{}' at depth {}",
        task_description,
        target_name,
        scope.depth + 1
    );

    let child_scope = DelegationScope {
        workers: scope.workers,
        depth: scope.depth + 1,
        max_depth: scope.max_depth,
    };
    let execution = execute_task(env, target, &child_task, &child_blocks, Some(child_scope)).await;

    let mut children = vec![execution.step.clone()];
    children.extend(execution.children);

    let (transcript_message, tool_call) = if execution.step.passed() {
        (
            format!(
                "Agent '{}' completed the delegated task:\n{}",
                target_name, execution.step.raw_output
            ),
            ToolCall {
                name: DELEGATE_TOOL.to_string(),
                args: args.clone(),
                result: Some(execution.step.raw_output.clone()),
                error: None,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        )
    } else {
        let reason = execution
            .step
            .error
            .clone()
            .unwrap_or_else(|| "delegated task failed".to_string());
        (
            format!("Delegation error: agent '{}' failed: {}", target_name, reason),
            ToolCall {
                name: DELEGATE_TOOL.to_string(),
                args: args.clone(),
                result: None,
                error: Some(reason),
                duration_ms: started.elapsed().as_millis() as u64,
            },
        )
    };

    DelegateOutcome {
        transcript_message,
        tool_call,
        children,
        usage: execution.usage,
    }
}
