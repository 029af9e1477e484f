//! # OKAMI core
//!
//! A multi-agent task orchestration and self-evolution engine. Crews of
//! LLM-backed agents execute task graphs under a sequential or
//! hierarchical process, gated by a guardrail pipeline, backed by
//! vector-indexed memory and knowledge, and followed by an evolution pass
//! that distills execution traces into bounded, backed-up knowledge
//! changes.

pub mod agent;
pub mod config;
pub mod crew;
pub mod crews;
pub mod evolution;
pub mod guardrails;
pub mod knowledge;
pub mod llm;
pub mod memory;
pub mod process;
pub mod rag;
pub mod schema;
pub mod server;
pub mod task;
pub mod tools;
pub mod trace;
pub mod types;
pub mod utilities;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::AgentSpec;
pub use config::EngineConfig;
pub use crew::{CrewOrchestrator, CrewSpec};
pub use crews::{compile, CompiledCrew, CrewResult};
pub use evolution::EvolutionCoordinator;
pub use guardrails::GuardrailPipeline;
pub use knowledge::KnowledgeStore;
pub use llm::Completer;
pub use memory::MemoryManager;
pub use process::Process;
pub use task::TaskSpec;
pub use trace::ExecutionTrace;
pub use utilities::EngineError;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
