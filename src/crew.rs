//! Crew orchestration.
//!
//! A [`CrewOrchestrator`] owns one compiled crew and drives it to
//! completion under its process discipline: sequential runs walk the task
//! DAG in topological order (batching adjacent async tasks), hierarchical
//! runs route every task through the manager's delegation loop. The
//! orchestrator is the only writer of the run's [`ExecutionTrace`].

use std::collections::HashMap;
use std::sync::Arc;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agent::executor::{execute_task, DelegationScope, ExecutorEnv, TaskExecution};
use crate::agent::{AgentSpec, PromptBlocks};
use crate::config::EngineConfig;
use crate::crews::{CompiledCrew, CrewResult};
use crate::guardrails::GuardrailPipeline;
use crate::knowledge::{Category, KnowledgeFilter, KnowledgeStore};
use crate::llm::{ChatMessage, Completer};
use crate::memory::MemoryManager;
use crate::process::Process;
use crate::schema::SchemaRegistry;
use crate::tools::ToolRegistry;
use crate::trace::{ExecutionStep, ExecutionTrace, RunStatus, StepVerdict};
use crate::types::UsageMetrics;
use crate::utilities::{EngineError, RetryPolicy, RpmController};

/// Knowledge hits retrieved per task prompt.
const KNOWLEDGE_K: usize = 3;

/// Characters of each knowledge hit included in a prompt.
const KNOWLEDGE_EXCERPT: usize = 400;

fn default_memory_enabled() -> bool {
    true
}

/// Declarative crew description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrewSpec {
    /// Unique crew name; case-sensitive identity key.
    pub name: String,
    /// Orchestration discipline.
    #[serde(default)]
    pub process: Process,
    /// Ordered worker agent names.
    pub agents: Vec<String>,
    /// Ordered task names.
    pub tasks: Vec<String>,
    /// Manager agent name; required iff hierarchical, and must not appear
    /// in `agents`.
    #[serde(default)]
    pub manager_agent: Option<String>,
    /// Whether the memory layer participates in this crew's runs.
    #[serde(default = "default_memory_enabled")]
    pub memory_enabled: bool,
    /// Knowledge categories scoping crew-level retrieval.
    #[serde(default)]
    pub knowledge_sources: Vec<String>,
    /// Whether a planning pre-pass runs before the first task.
    #[serde(default)]
    pub planning_enabled: bool,
    /// Unrecognized keys, preserved for diagnostics.
    #[serde(flatten)]
    pub unknown: HashMap<String, Value>,
}

impl CrewSpec {
    /// Create a spec with required fields.
    pub fn new(name: impl Into<String>, agents: Vec<&str>, tasks: Vec<&str>) -> Self {
        Self {
            name: name.into(),
            process: Process::default(),
            agents: agents.into_iter().map(String::from).collect(),
            tasks: tasks.into_iter().map(String::from).collect(),
            manager_agent: None,
            memory_enabled: true,
            knowledge_sources: Vec::new(),
            planning_enabled: false,
            unknown: HashMap::new(),
        }
    }

    /// Log a warning for every unrecognized key.
    pub fn warn_unknown(&self) {
        for key in self.unknown.keys() {
            log::warn!("crew '{}': ignoring unrecognized key '{}'", self.name, key);
        }
    }
}

impl CompiledCrew {
    /// Stable identity key: MD5 over agent keys and task keys.
    pub fn key(&self) -> String {
        let mut source: Vec<String> = self.agents.iter().map(|a| a.key()).collect();
        for task in &self.tasks {
            source.push(task.key());
        }
        let mut hasher = Md5::new();
        hasher.update(source.join("|").as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Drives one compiled crew.
pub struct CrewOrchestrator {
    crew: CompiledCrew,
    completer: Arc<dyn Completer>,
    tools: Arc<ToolRegistry>,
    guardrails: GuardrailPipeline,
    schemas: Arc<SchemaRegistry>,
    memory: Option<Arc<MemoryManager>>,
    knowledge: Option<Arc<KnowledgeStore>>,
    rpm: Arc<RpmController>,
    config: EngineConfig,
}

impl CrewOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        crew: CompiledCrew,
        completer: Arc<dyn Completer>,
        tools: Arc<ToolRegistry>,
        guardrails: GuardrailPipeline,
        schemas: Arc<SchemaRegistry>,
        memory: Option<Arc<MemoryManager>>,
        knowledge: Option<Arc<KnowledgeStore>>,
        config: EngineConfig,
    ) -> Self {
        let rpm = Arc::new(RpmController::new(
            config.rate_limits.max_rpm_default,
            config.rate_limits.wait_budget(),
        ));
        Self {
            crew,
            completer,
            tools,
            guardrails,
            schemas,
            memory,
            knowledge,
            rpm,
            config,
        }
    }

    /// The compiled crew this orchestrator drives.
    pub fn crew(&self) -> &CompiledCrew {
        &self.crew
    }

    /// Execute the crew's workflow.
    pub async fn kickoff(
        &self,
        inputs: HashMap<String, String>,
        cancel: CancellationToken,
    ) -> CrewResult {
        let mut crew = self.crew.clone();
        crew.interpolate_inputs(&inputs);

        let mut trace = ExecutionTrace::new(&crew.spec.name, inputs);
        let mut usage = UsageMetrics::new();

        let env = ExecutorEnv {
            completer: self.completer.clone(),
            tools: self.tools.clone(),
            rpm: self.rpm.clone(),
            guardrails: self.guardrails.clone(),
            schemas: self.schemas.clone(),
            completer_retry: RetryPolicy::with_attempts(self.config.retries.completer.max(1)),
            tool_retry: RetryPolicy::with_attempts(self.config.retries.tool.max(1)),
            cancel,
        };

        let plan = if crew.spec.planning_enabled {
            self.plan_run(&crew).await.unwrap_or_default()
        } else {
            String::new()
        };

        let workers = crew.worker_map();
        let abort = match crew.spec.process {
            Process::Sequential => {
                self.run_sequential(&crew, &env, &mut trace, &mut usage, &plan).await
            }
            Process::Hierarchical => {
                self.run_hierarchical(&crew, &env, &mut trace, &mut usage, &plan, &workers)
                    .await
            }
        };

        let final_output = trace
            .steps
            .iter()
            .rev()
            .find(|s| s.passed())
            .map(|s| s.raw_output.clone())
            .unwrap_or_default();

        let all_passed = !trace.steps.is_empty() && trace.steps.iter().all(ExecutionStep::passed);
        let status = if abort.is_some() {
            RunStatus::Failed
        } else if all_passed {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };

        let error = abort.clone().or_else(|| {
            trace
                .steps
                .iter()
                .find(|s| !s.passed())
                .and_then(|s| s.error.clone())
        });

        trace.freeze(status, Some(final_output.clone()));

        if status != RunStatus::Failed {
            self.finish_memory(&crew, &trace).await;
        }

        CrewResult {
            final_output,
            tasks_output: trace.steps.clone(),
            token_usage: usage,
            trace,
            status,
            error,
        }
    }

    /// Sequential process: topological order, batching adjacent async
    /// tasks whose dependencies are all satisfied.
    async fn run_sequential(
        &self,
        crew: &CompiledCrew,
        env: &ExecutorEnv,
        trace: &mut ExecutionTrace,
        usage: &mut UsageMetrics,
        plan: &str,
    ) -> Option<String> {
        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut position = 0;

        while position < crew.order.len() {
            if env.cancel.is_cancelled() {
                return Some(EngineError::Cancelled.to_string());
            }

            // Collect a run of async tasks that are ready now.
            let mut batch = Vec::new();
            while position < crew.order.len() {
                let index = crew.order[position];
                let task = &crew.tasks[index];
                if task.async_execution
                    && task.context.iter().all(|d| outputs.contains_key(d))
                {
                    batch.push(index);
                    position += 1;
                } else {
                    break;
                }
            }

            if !batch.is_empty() {
                let executions = futures::future::join_all(
                    batch
                        .iter()
                        .map(|&index| self.run_worker_task(crew, env, index, &outputs, plan, &trace.run_id)),
                )
                .await;
                for execution in executions {
                    if let Some(abort) =
                        self.absorb(crew, trace, usage, &mut outputs, execution).await
                    {
                        return Some(abort);
                    }
                }
                continue;
            }

            let index = crew.order[position];
            position += 1;
            let execution = self
                .run_worker_task(crew, env, index, &outputs, plan, &trace.run_id)
                .await;
            if let Some(abort) = self.absorb(crew, trace, usage, &mut outputs, execution).await {
                return Some(abort);
            }
        }
        None
    }

    /// Hierarchical process: every task runs through the manager's
    /// delegation loop; unassigned tasks fall to the manager itself.
    async fn run_hierarchical(
        &self,
        crew: &CompiledCrew,
        env: &ExecutorEnv,
        trace: &mut ExecutionTrace,
        usage: &mut UsageMetrics,
        plan: &str,
        workers: &HashMap<String, AgentSpec>,
    ) -> Option<String> {
        let Some(manager) = crew.manager.as_ref() else {
            return Some("hierarchical crew compiled without a manager".to_string());
        };
        let mut outputs: HashMap<String, String> = HashMap::new();

        for &index in &crew.order {
            if env.cancel.is_cancelled() {
                return Some(EngineError::Cancelled.to_string());
            }
            let task = &crew.tasks[index];
            let agent = task
                .agent
                .as_deref()
                .and_then(|name| crew.worker(name))
                .unwrap_or(manager);

            let blocks = self
                .prompt_blocks(crew, task, agent, &outputs, plan, &trace.run_id)
                .await;
            let scope = DelegationScope {
                workers,
                depth: 0,
                max_depth: self.config.max_delegation_depth,
            };
            let execution = self
                .with_deadline(execute_task(env, agent, task, &blocks, Some(scope)))
                .await;

            usage.add_usage_metrics(&execution.usage);
            outputs.insert(task.name.clone(), execution.step.raw_output.clone());
            self.record_memory(crew, agent, &execution.step, &trace.run_id).await;

            let step_error = execution.step.error.clone();
            trace.record_step(execution.step);
            for child in execution.children {
                trace.record_step(child);
            }

            // The manager stays active through worker failures; only
            // cancellation and deadlines stop the run.
            if let Some(error) = step_error {
                if error == EngineError::Cancelled.to_string()
                    || error == EngineError::DeadlineExceeded.to_string()
                {
                    return Some(error);
                }
            }
        }
        None
    }

    /// Execute one worker task for the sequential process.
    async fn run_worker_task(
        &self,
        crew: &CompiledCrew,
        env: &ExecutorEnv,
        index: usize,
        outputs: &HashMap<String, String>,
        plan: &str,
        run_id: &str,
    ) -> TaskExecution {
        let task = &crew.tasks[index];
        // Compilation guarantees the agent resolves in sequential crews.
        let Some(agent) = task.agent.as_deref().and_then(|name| crew.worker(name)) else {
            return TaskExecution {
                step: synthetic_failure(task, "unassigned", "task has no resolvable agent"),
                children: Vec::new(),
                usage: UsageMetrics::new(),
            };
        };
        let blocks = self
            .prompt_blocks(crew, task, agent, outputs, plan, run_id)
            .await;
        self.with_deadline(execute_task(env, agent, task, &blocks, None))
            .await
    }

    /// Record a finished execution into the trace, outputs, and memory,
    /// and decide whether the sequential run must abort.
    async fn absorb(
        &self,
        crew: &CompiledCrew,
        trace: &mut ExecutionTrace,
        usage: &mut UsageMetrics,
        outputs: &mut HashMap<String, String>,
        execution: TaskExecution,
    ) -> Option<String> {
        usage.add_usage_metrics(&execution.usage);
        outputs.insert(
            execution.step.task_name.clone(),
            execution.step.raw_output.clone(),
        );

        if let Some(agent) = crew.worker(&execution.step.agent_name) {
            self.record_memory(crew, agent, &execution.step, &trace.run_id).await;
        }

        let abort = abort_reason(&execution.step);
        trace.record_step(execution.step);
        for child in execution.children {
            trace.record_step(child);
        }
        abort
    }

    /// Assemble the prompt blocks for one task: ordered dependency
    /// outputs, the memory block, the knowledge block, and the tool
    /// manifest.
    async fn prompt_blocks(
        &self,
        crew: &CompiledCrew,
        task: &crate::task::TaskSpec,
        agent: &AgentSpec,
        outputs: &HashMap<String, String>,
        plan: &str,
        run_id: &str,
    ) -> PromptBlocks {
        let context = task
            .context
            .iter()
            .filter_map(|dep| outputs.get(dep).cloned())
            .collect::<Vec<String>>()
            .join("\n\n---\n\n");

        let memory = match self.memory {
            Some(ref memory) if crew.spec.memory_enabled && agent.memory_enabled => {
                memory.context_block(run_id, &task.description).await
            }
            _ => String::new(),
        };

        let knowledge = match self.knowledge {
            Some(ref store) => self.knowledge_block(store, crew, agent, task).await,
            None => String::new(),
        };

        let tool_names = if task.tools.is_empty() {
            &agent.tools
        } else {
            &task.tools
        };

        PromptBlocks {
            context,
            memory,
            knowledge,
            tools: self.tools.manifest(tool_names),
            plan: plan.to_string(),
        }
    }

    async fn knowledge_block(
        &self,
        store: &KnowledgeStore,
        crew: &CompiledCrew,
        agent: &AgentSpec,
        task: &crate::task::TaskSpec,
    ) -> String {
        // Agent-level knowledge refs win; crew-level sources are the
        // fallback scope.
        let category = agent
            .knowledge
            .first()
            .or_else(|| crew.spec.knowledge_sources.first())
            .and_then(|c| c.parse::<Category>().ok());
        let filter = category.map(|category| KnowledgeFilter {
            category: Some(category),
            tag: None,
        });
        match store.search(&task.description, KNOWLEDGE_K, filter.as_ref()).await {
            Ok(hits) if !hits.is_empty() => hits
                .iter()
                .map(|h| format!("- {}", excerpt(&h.document, KNOWLEDGE_EXCERPT)))
                .collect::<Vec<String>>()
                .join("\n"),
            Ok(_) => String::new(),
            Err(e) => {
                log::warn!("knowledge retrieval failed: {}", e);
                String::new()
            }
        }
    }

    /// Planning pre-pass: one completer call over the task inventory.
    async fn plan_run(&self, crew: &CompiledCrew) -> Option<String> {
        let inventory: Vec<String> = crew
            .order
            .iter()
            .map(|&i| {
                let task = &crew.tasks[i];
                format!("- {}: {}", task.name, task.description)
            })
            .collect();
        let messages = vec![
            ChatMessage::system(
                "You are a planning assistant. Produce a short numbered plan, nothing else.",
            ),
            ChatMessage::user(format!(
                "Plan the execution of these tasks in order:\n{}",
                inventory.join("\n")
            )),
        ];
        match self.completer.complete(&messages).await {
            Ok(completion) => Some(completion.content),
            Err(e) => {
                log::warn!("planning pre-pass failed, continuing without a plan: {}", e);
                None
            }
        }
    }

    async fn record_memory(
        &self,
        crew: &CompiledCrew,
        agent: &AgentSpec,
        step: &ExecutionStep,
        run_id: &str,
    ) {
        if !step.passed() {
            return;
        }
        if let Some(ref memory) = self.memory {
            if crew.spec.memory_enabled && agent.memory_enabled {
                if let Err(e) = memory
                    .record_task_output(run_id, &step.task_name, &step.agent_name, &step.raw_output)
                    .await
                {
                    log::warn!("failed to record task output in memory: {}", e);
                }
            }
        }
    }

    async fn finish_memory(&self, crew: &CompiledCrew, trace: &ExecutionTrace) {
        let Some(ref memory) = self.memory else {
            return;
        };
        if !crew.spec.memory_enabled {
            return;
        }
        let facts: Vec<(String, String)> = trace
            .steps
            .iter()
            .filter(|s| s.passed())
            .map(|s| {
                (
                    s.agent_name.clone(),
                    format!("Task '{}' produced: {}", s.task_name, excerpt(&s.raw_output, 500)),
                )
            })
            .collect();
        if let Err(e) = memory
            .finish_run(
                &trace.run_id,
                &trace.crew_name,
                trace.final_output.as_deref().unwrap_or_default(),
                &facts,
            )
            .await
        {
            log::warn!("failed to finish memory for run {}: {}", trace.run_id, e);
        }
    }

    async fn with_deadline(
        &self,
        execution: impl std::future::Future<Output = TaskExecution>,
    ) -> TaskExecution {
        let deadline = self.config.timeouts.task_deadline();
        match tokio::time::timeout(deadline, execution).await {
            Ok(execution) => execution,
            Err(_) => TaskExecution {
                step: ExecutionStep {
                    task_name: "(timed out)".to_string(),
                    agent_name: "(timed out)".to_string(),
                    attempts: 0,
                    tool_calls: Vec::new(),
                    raw_output: String::new(),
                    guardrail_verdicts: Vec::new(),
                    final_verdict: StepVerdict::Fail,
                    duration_ms: deadline.as_millis() as u64,
                    error: Some(EngineError::DeadlineExceeded.to_string()),
                },
                children: Vec::new(),
                usage: UsageMetrics::new(),
            },
        }
    }
}

/// Unrecoverable runtime errors abort a sequential run; guardrail
/// rejections only mark the step and let other tasks continue.
fn abort_reason(step: &ExecutionStep) -> Option<String> {
    let error = step.error.as_deref()?;
    if error.starts_with("guardrail rejected") {
        return None;
    }
    Some(error.to_string())
}

fn synthetic_failure(task: &crate::task::TaskSpec, agent: &str, message: &str) -> ExecutionStep {
    ExecutionStep {
        task_name: task.name.clone(),
        agent_name: agent.to_string(),
        attempts: 0,
        tool_calls: Vec::new(),
        raw_output: String::new(),
        guardrail_verdicts: Vec::new(),
        final_verdict: StepVerdict::Fail,
        duration_ms: 0,
        error: Some(message.to_string()),
    }
}

fn excerpt(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
