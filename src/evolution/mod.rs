//! The evolution loop.
//!
//! After a primary crew run returns, the coordinator runs a reviewer crew
//! over the execution trace, parses the structured improvement proposals
//! it emits, applies the write-safe ones to the knowledge store, and
//! records per-type metrics. It fires at most once per run and stays off
//! the synchronous path: callers spawn [`EvolutionCoordinator::run_after`]
//! after the primary response has been produced.

pub mod applier;
pub mod parser;

pub use applier::{ChangeOutcome, ChangeReport, ImprovementApplier};
pub use parser::{Change, ImprovementParser, ProposedChange};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentSpec;
use crate::config::{EngineConfig, EvolutionSettings};
use crate::crew::{CrewOrchestrator, CrewSpec};
use crate::crews::compile;
use crate::guardrails::GuardrailPipeline;
use crate::knowledge::KnowledgeStore;
use crate::llm::Completer;
use crate::schema::SchemaRegistry;
use crate::task::TaskSpec;
use crate::tools::ToolRegistry;
use crate::trace::ExecutionTrace;
use crate::utilities::EngineError;

const REVIEWER_AGENT: &str = "improvement_reviewer";

const REVIEWER_BACKSTORY: &str = "You review execution traces of agent crews and distill \
durable lessons into the knowledge base. You only ever propose changes in the documented \
JSON contract and you never invent facts that the trace does not support.";

const REVIEWER_TASK_DESCRIPTION: &str = "Review the following exchange and execution trace, \
then propose knowledge improvements.\n\n\
User input:\n{user_input}\n\n\
Main response:\n{main_response}\n\n\
Trace:\n{trace_summary}\n\n\
Reply with a JSON object of the form:\n\
{\"changes\": [\n\
  {\"type\": \"add_knowledge\", \"category\": \"agents|crew|system|domain|general\", \
\"file\": \"knowledge/<category>/<slug>.md\", \"title\": \"...\", \"content\": \"...\", \
\"tags\": [\"...\"], \"reason\": \"...\"},\n\
  {\"type\": \"update_knowledge\", \"file\": \"...\", \"section\": \"...\", \
\"content\": \"...\", \"operation\": \"append|replace|insert\", \"reason\": \"...\"}\n\
]}\n\
Return an empty changes array when the trace teaches nothing new.";

/// Per-change-type counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TypeMetrics {
    pub attempted: u64,
    pub applied: u64,
}

/// Aggregate evolution metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvolutionMetrics {
    /// Evolution runs that completed the pipeline.
    pub runs: u64,
    pub applied: u64,
    pub proposed: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Outcome counters per change type tag.
    pub by_type: HashMap<String, TypeMetrics>,
}

impl EvolutionMetrics {
    /// Success rate for a change type, if any were attempted.
    pub fn success_rate(&self, type_tag: &str) -> Option<f64> {
        self.by_type
            .get(type_tag)
            .filter(|m| m.attempted > 0)
            .map(|m| m.applied as f64 / m.attempted as f64)
    }
}

/// Runs the evolution pipeline after primary crew runs.
pub struct EvolutionCoordinator {
    settings: EvolutionSettings,
    reviewer: CrewOrchestrator,
    applier: ImprovementApplier,
    metrics: Mutex<EvolutionMetrics>,
}

impl EvolutionCoordinator {
    /// Build the coordinator and its single-reviewer crew.
    pub fn new(
        completer: Arc<dyn Completer>,
        store: Arc<KnowledgeStore>,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        let mut agent_pool = HashMap::new();
        agent_pool.insert(
            REVIEWER_AGENT.to_string(),
            AgentSpec::new(
                REVIEWER_AGENT,
                "Improvement Reviewer",
                "turn execution traces into safe knowledge improvements",
                REVIEWER_BACKSTORY,
            ),
        );
        let mut task_pool = HashMap::new();
        task_pool.insert(
            "propose_improvements".to_string(),
            TaskSpec::new(
                "propose_improvements",
                REVIEWER_TASK_DESCRIPTION,
                "A JSON object with a top-level 'changes' array.",
            )
            .with_agent(REVIEWER_AGENT)
            .with_max_retries(0),
        );
        let mut spec = CrewSpec::new(
            "evolution",
            vec![REVIEWER_AGENT],
            vec!["propose_improvements"],
        );
        spec.memory_enabled = false;

        let compiled = compile(
            spec,
            &agent_pool,
            &task_pool,
            &GuardrailPipeline::default(),
            &SchemaRegistry::new(),
        )?;
        let reviewer = CrewOrchestrator::new(
            compiled,
            completer,
            Arc::new(ToolRegistry::new()),
            GuardrailPipeline::default(),
            Arc::new(SchemaRegistry::new()),
            None,
            None,
            config.clone(),
        );

        Ok(Self {
            settings: config.evolution.clone(),
            applier: ImprovementApplier::new(store, config.evolution.clone()),
            reviewer,
            metrics: Mutex::new(EvolutionMetrics::default()),
        })
    }

    /// Whether the pipeline is enabled.
    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Snapshot of the aggregate metrics.
    pub fn metrics(&self) -> EvolutionMetrics {
        self.metrics.lock().clone()
    }

    /// Run the pipeline once for a finished primary run. Returns the
    /// per-change reports, or `None` when disabled or when the reviewer
    /// produced nothing usable.
    pub async fn run_after(
        &self,
        user_input: &str,
        main_response: &str,
        trace: &ExecutionTrace,
    ) -> Option<Vec<ChangeReport>> {
        if !self.settings.enabled {
            return None;
        }

        let mut inputs = HashMap::new();
        inputs.insert("user_input".to_string(), user_input.to_string());
        inputs.insert("main_response".to_string(), main_response.to_string());
        inputs.insert("trace_summary".to_string(), trace.summary());

        let result = self.reviewer.kickoff(inputs, CancellationToken::new()).await;
        if result.final_output.is_empty() {
            log::warn!(
                "evolution reviewer produced no output for run {}: {:?}",
                trace.run_id,
                result.error
            );
            return None;
        }

        let changes = ImprovementParser::parse(&result.final_output);
        let reports = self.applier.apply(changes).await;
        self.record_metrics(&reports);
        log::info!(
            "evolution run for {} finished: {} change(s) processed",
            trace.run_id,
            reports.len()
        );
        Some(reports)
    }

    fn record_metrics(&self, reports: &[ChangeReport]) {
        let mut metrics = self.metrics.lock();
        metrics.runs += 1;
        for report in reports {
            let type_tag = report.change.type_tag().to_string();
            {
                let per_type = metrics.by_type.entry(type_tag).or_default();
                per_type.attempted += 1;
                if let ChangeOutcome::Applied = report.outcome {
                    per_type.applied += 1;
                }
            }
            match report.outcome {
                ChangeOutcome::Applied => metrics.applied += 1,
                ChangeOutcome::Proposed => metrics.proposed += 1,
                ChangeOutcome::Skipped { .. } => metrics.skipped += 1,
                ChangeOutcome::Failed { .. } => metrics.failed += 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::InMemoryVectorIndex;
    use crate::testing::{StubCompleter, StubEmbedder};
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> Arc<KnowledgeStore> {
        let index = Arc::new(InMemoryVectorIndex::new(StubEmbedder::DIMENSION));
        Arc::new(
            KnowledgeStore::open(
                dir.path().join("knowledge"),
                dir.path().join("backups"),
                index,
                Arc::new(StubEmbedder::default()),
                0.92,
            )
            .await
            .unwrap(),
        )
    }

    fn trace() -> ExecutionTrace {
        let mut trace = ExecutionTrace::new("primary", HashMap::new());
        trace.freeze(crate::trace::RunStatus::Completed, Some("done".to_string()));
        trace
    }

    const REVIEW_RESPONSE: &str = r#"{"changes": [
        {"type": "add_knowledge", "category": "agents", "file": "knowledge/agents/x.md",
         "title": "X guidance on Y", "content": "Agent X should ground topic Y answers in primary sources.",
         "tags": ["x", "y"], "reason": "agent X failed on topic Y"},
        {"type": "update_agent_parameter", "agent": "research", "parameter": "max_iter", "value": 50}
    ]}"#;

    #[tokio::test]
    async fn test_run_after_applies_and_demotes() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let completer = Arc::new(StubCompleter::new(vec![REVIEW_RESPONSE]));
        let coordinator =
            EvolutionCoordinator::new(completer, store.clone(), &EngineConfig::default()).unwrap();

        let reports = coordinator
            .run_after("research X", "the answer", &trace())
            .await
            .unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].outcome, ChangeOutcome::Applied);
        assert_eq!(reports[1].outcome, ChangeOutcome::Proposed);

        assert!(store.get("agents/x.md").is_some());
        assert_eq!(store.proposals().unwrap().len(), 1);

        let metrics = coordinator.metrics();
        assert_eq!(metrics.runs, 1);
        assert_eq!(metrics.applied, 1);
        assert_eq!(metrics.proposed, 1);
        assert_eq!(metrics.success_rate("add_knowledge"), Some(1.0));
        assert_eq!(metrics.success_rate("update_agent_parameter"), Some(0.0));
    }

    #[tokio::test]
    async fn test_reviewer_sees_trace_summary() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let stub = Arc::new(StubCompleter::new(vec![r#"{"changes": []}"#]));
        let coordinator =
            EvolutionCoordinator::new(stub.clone(), store, &EngineConfig::default()).unwrap();

        let reports = coordinator
            .run_after("the question", "the response", &trace())
            .await
            .unwrap();
        assert!(reports.is_empty());
        let prompts = stub.seen_prompts();
        assert!(prompts[0].contains("the question"));
        assert!(prompts[0].contains("the response"));
        assert!(prompts[0].contains("crew 'primary'"));
    }

    #[tokio::test]
    async fn test_disabled_coordinator_is_inert() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let completer = Arc::new(StubCompleter::new(vec![REVIEW_RESPONSE]));
        let mut config = EngineConfig::default();
        config.evolution.enabled = false;
        let coordinator = EvolutionCoordinator::new(completer, store, &config).unwrap();

        assert!(!coordinator.enabled());
        assert!(coordinator
            .run_after("input", "response", &trace())
            .await
            .is_none());
        assert_eq!(coordinator.metrics().runs, 0);
    }
}
