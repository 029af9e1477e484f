//! Per-task execution loop.
//!
//! One call drives a single task to its terminal verdict: completer
//! iterations bounded by the agent's `max_iter`, tool dispatch through the
//! registry, schema checking, and the guardrail retry loop bounded by the
//! task's `max_retries`. Delegation is available when the caller passes a
//! [`DelegationScope`]; resolved delegations recurse through this same
//! loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::agent::{build_task_prompt, delegation, AgentSpec, PromptBlocks};
use crate::guardrails::{corrective_hint, GuardrailContext, GuardrailPipeline, Verdict};
use crate::llm::{parse_agent_response, AgentResponse, ChatMessage, Completer, CompleterError};
use crate::schema::SchemaRegistry;
use crate::task::TaskSpec;
use crate::tools::{ToolError, ToolRegistry, DELEGATE_TOOL};
use crate::trace::{ExecutionStep, StepVerdict, ToolCall};
use crate::types::UsageMetrics;
use crate::utilities::{retry_with_backoff, EngineError, RetryPolicy, RpmController};

/// Everything the loop needs besides the task and agent.
pub struct ExecutorEnv {
    pub completer: Arc<dyn Completer>,
    pub tools: Arc<ToolRegistry>,
    pub rpm: Arc<RpmController>,
    /// The full configured pipeline; tasks select their subset by name.
    pub guardrails: GuardrailPipeline,
    pub schemas: Arc<SchemaRegistry>,
    pub completer_retry: RetryPolicy,
    pub tool_retry: RetryPolicy,
    pub cancel: CancellationToken,
}

/// Delegation permissions for the current loop.
#[derive(Clone, Copy)]
pub struct DelegationScope<'a> {
    pub workers: &'a HashMap<String, AgentSpec>,
    pub depth: u32,
    pub max_depth: u32,
}

/// The loop's result: the task's step, any delegated child steps, and the
/// token usage consumed.
pub struct TaskExecution {
    pub step: ExecutionStep,
    pub children: Vec<ExecutionStep>,
    pub usage: UsageMetrics,
}

/// Drive a task to completion. Boxed so delegation can recurse.
pub fn execute_task<'a>(
    env: &'a ExecutorEnv,
    agent: &'a AgentSpec,
    task: &'a TaskSpec,
    blocks: &'a PromptBlocks,
    delegation: Option<DelegationScope<'a>>,
) -> BoxFuture<'a, TaskExecution> {
    Box::pin(async move {
        let started = Instant::now();
        let mut usage = UsageMetrics::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut verdicts: Vec<Verdict> = Vec::new();
        let mut children: Vec<ExecutionStep> = Vec::new();
        let mut hints: Vec<String> = Vec::new();

        let pipeline = env.guardrails.select(&task.guardrails);
        let guardrail_context = GuardrailContext {
            task_description: &task.description,
            expected_output: &task.expected_output,
        };

        let system = ChatMessage::system(agent.system_prompt());
        let mut base_prompt = build_task_prompt(agent, task, blocks);
        if let Some(scope) = delegation {
            let inventory = delegation::inventory_block(scope.workers);
            if !inventory.is_empty() {
                base_prompt.push_str("\n\n");
                base_prompt.push_str(&inventory);
            }
        }

        let finish = |attempts: u32,
                      raw_output: String,
                      verdicts: Vec<Verdict>,
                      tool_calls: Vec<ToolCall>,
                      final_verdict: StepVerdict,
                      error: Option<String>| ExecutionStep {
            task_name: task.name.clone(),
            agent_name: agent.name.clone(),
            attempts,
            tool_calls,
            raw_output,
            guardrail_verdicts: verdicts,
            final_verdict,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
        };

        let max_attempts = task.max_retries + 1;
        let mut attempts: u32 = 0;

        'attempt: while attempts < max_attempts {
            attempts += 1;

            let mut user_prompt = base_prompt.clone();
            for hint in &hints {
                user_prompt.push_str("\n\n");
                user_prompt.push_str(hint);
            }
            let mut messages = vec![system.clone(), ChatMessage::user(user_prompt)];
            let mut iterations: u32 = 0;

            loop {
                if env.cancel.is_cancelled() {
                    let step = finish(
                        attempts,
                        String::new(),
                        verdicts,
                        tool_calls,
                        StepVerdict::Fail,
                        Some(EngineError::Cancelled.to_string()),
                    );
                    return TaskExecution { step, children, usage };
                }

                iterations += 1;
                let completion = match complete_with_retry(env, agent, &messages).await {
                    Ok(completion) => completion,
                    Err(e) => {
                        let step = finish(
                            attempts,
                            String::new(),
                            verdicts,
                            tool_calls,
                            StepVerdict::Fail,
                            Some(e.to_string()),
                        );
                        return TaskExecution { step, children, usage };
                    }
                };
                if let Some(ref u) = completion.usage {
                    usage.add_usage_metrics(&UsageMetrics {
                        total_tokens: u.total_tokens,
                        prompt_tokens: u.prompt_tokens,
                        completion_tokens: u.completion_tokens,
                        successful_requests: 1,
                    });
                }

                match parse_agent_response(&completion.content) {
                    AgentResponse::ToolCall { tool, args } => {
                        // Consuming a tool result costs another iteration;
                        // with no budget left the tool is never invoked.
                        if iterations >= agent.max_iter {
                            let error = EngineError::MaxIterExceeded {
                                agent: agent.name.clone(),
                                max_iter: agent.max_iter,
                            };
                            let step = finish(
                                attempts,
                                String::new(),
                                verdicts,
                                tool_calls,
                                StepVerdict::Fail,
                                Some(error.to_string()),
                            );
                            return TaskExecution { step, children, usage };
                        }

                        let transcript_entry = if tool == DELEGATE_TOOL {
                            match delegation {
                                Some(scope) => {
                                    let outcome =
                                        delegation::handle_delegate(env, scope, &args).await;
                                    usage.add_usage_metrics(&outcome.usage);
                                    children.extend(outcome.children);
                                    tool_calls.push(outcome.tool_call);
                                    outcome.transcript_message
                                }
                                None => {
                                    tool_calls.push(ToolCall {
                                        name: tool.clone(),
                                        args: args.clone(),
                                        result: None,
                                        error: Some("delegation is not available here".to_string()),
                                        duration_ms: 0,
                                    });
                                    "Tool error: delegation is not available for this task."
                                        .to_string()
                                }
                            }
                        } else {
                            let (call, strict_failure) = dispatch_tool(env, &tool, &args).await;
                            let entry = match (&call.result, &call.error) {
                                (Some(result), _) => {
                                    format!("Tool '{}' result:\n{}", tool, result)
                                }
                                (None, Some(error)) => {
                                    format!("Tool '{}' error: {}", tool, error)
                                }
                                (None, None) => format!("Tool '{}' returned nothing.", tool),
                            };
                            tool_calls.push(call);
                            if let Some(error) = strict_failure {
                                let step = finish(
                                    attempts,
                                    String::new(),
                                    verdicts,
                                    tool_calls,
                                    StepVerdict::Fail,
                                    Some(error.to_string()),
                                );
                                return TaskExecution { step, children, usage };
                            }
                            entry
                        };

                        messages.push(ChatMessage::assistant(completion.content.clone()));
                        messages.push(ChatMessage::user(transcript_entry));
                    }
                    AgentResponse::Terminal(candidate) => {
                        if let Some(ref schema_name) = task.output_schema {
                            if let Some(schema) = env.schemas.get(schema_name) {
                                if let Err(reason) = schema.check(&candidate) {
                                    let verdict = Verdict::fail("output_schema", reason);
                                    let hint = corrective_hint(&verdict);
                                    verdicts.push(verdict);
                                    if attempts < max_attempts {
                                        hints.push(hint);
                                        continue 'attempt;
                                    }
                                    let step = finish(
                                        attempts,
                                        candidate,
                                        verdicts,
                                        tool_calls,
                                        StepVerdict::Fail,
                                        Some("output did not satisfy its schema".to_string()),
                                    );
                                    return TaskExecution { step, children, usage };
                                }
                            }
                        }

                        let result = pipeline.validate(&candidate, &guardrail_context).await;
                        let failure_hint = result.failure().map(corrective_hint);
                        verdicts.extend(result.verdicts);

                        if result.passed {
                            let step = finish(
                                attempts,
                                candidate,
                                verdicts,
                                tool_calls,
                                StepVerdict::Pass,
                                None,
                            );
                            return TaskExecution { step, children, usage };
                        }

                        if attempts < max_attempts {
                            if let Some(hint) = failure_hint {
                                hints.push(hint);
                            }
                            continue 'attempt;
                        }

                        let reason = verdicts
                            .iter()
                            .rev()
                            .find(|v| !v.passed)
                            .and_then(|v| v.reason.clone())
                            .unwrap_or_else(|| "guardrail rejected output".to_string());
                        let step = finish(
                            attempts,
                            candidate,
                            verdicts,
                            tool_calls,
                            StepVerdict::Fail,
                            Some(EngineError::GuardrailRejected(reason).to_string()),
                        );
                        return TaskExecution { step, children, usage };
                    }
                }
            }
        }

        // The retry loop always returns from inside; this is unreachable
        // with max_attempts >= 1 but keeps the compiler satisfied.
        let step = finish(
            attempts,
            String::new(),
            verdicts,
            tool_calls,
            StepVerdict::Fail,
            Some("no attempts were made".to_string()),
        );
        TaskExecution { step, children, usage }
    })
}

/// One completer call with rate limiting, cancellation, and transient
/// retry.
async fn complete_with_retry(
    env: &ExecutorEnv,
    agent: &AgentSpec,
    messages: &[ChatMessage],
) -> Result<crate::llm::Completion, EngineError> {
    retry_with_backoff(&env.completer_retry, EngineError::is_retryable, || async {
        if env.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        env.rpm.acquire(&agent.name, agent.max_rpm).await?;
        tokio::select! {
            _ = env.cancel.cancelled() => Err(EngineError::Cancelled),
            result = env.completer.complete(messages) => result.map_err(|e| match e {
                CompleterError::Transient(message) => EngineError::CompleterTransient(message),
                CompleterError::Fatal(message) => EngineError::CompleterFatal(message),
            }),
        }
    })
    .await
}

/// Dispatch a tool call. Unknown tools and non-strict failures come back
/// as structured errors inside the [`ToolCall`]; a strict tool's failure
/// also returns the task-fatal error.
async fn dispatch_tool(
    env: &ExecutorEnv,
    name: &str,
    args: &serde_json::Map<String, serde_json::Value>,
) -> (ToolCall, Option<EngineError>) {
    let started = Instant::now();
    let Some(tool) = env.tools.get(name) else {
        return (
            ToolCall {
                name: name.to_string(),
                args: args.clone(),
                result: None,
                error: Some(format!("unknown tool '{}'", name)),
                duration_ms: started.elapsed().as_millis() as u64,
            },
            None,
        );
    };

    let result = retry_with_backoff(
        &env.tool_retry,
        |e: &ToolError| e.retryable,
        || tool.call(args),
    )
    .await;

    match result {
        Ok(output) => (
            ToolCall {
                name: name.to_string(),
                args: args.clone(),
                result: Some(output),
                error: None,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            None,
        ),
        Err(e) => {
            let strict_failure = tool.strict().then(|| EngineError::Tool {
                tool: name.to_string(),
                message: e.message.clone(),
            });
            (
                ToolCall {
                    name: name.to_string(),
                    args: args.clone(),
                    result: None,
                    error: Some(e.message),
                    duration_ms: started.elapsed().as_millis() as u64,
                },
                strict_failure,
            )
        }
    }
}
