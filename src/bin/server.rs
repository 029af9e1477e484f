//! OKAMI HTTP server binary.
//!
//! Wires a default general-purpose crew to the OpenAI-compatible
//! completer and embedder, opens the knowledge store, and serves the task
//! API.
//!
//! # Environment Variables
//!
//! - `PORT` — HTTP port (default: 8080)
//! - `OKAMI_CONFIG` — path to a YAML engine configuration
//! - `OKAMI_MODEL` — completer model (default: gpt-4o-mini)
//! - `OKAMI_KNOWLEDGE_ROOT` — knowledge directory (default: ./knowledge)
//! - `OKAMI_BACKUP_ROOT` — backup directory (default: ./backups)
//! - `OPENAI_API_KEY` — completer/embedder credential
//! - `RUST_LOG` — tracing filter (default: "info")

use std::collections::HashMap;
use std::sync::Arc;

use okami::agent::AgentSpec;
use okami::config::EngineConfig;
use okami::crew::{CrewOrchestrator, CrewSpec};
use okami::crews::compile;
use okami::evolution::EvolutionCoordinator;
use okami::guardrails::GuardrailPipeline;
use okami::knowledge::KnowledgeStore;
use okami::llm::OpenAiCompleter;
use okami::memory::MemoryManager;
use okami::rag::{HttpEmbedder, InMemoryVectorIndex};
use okami::schema::SchemaRegistry;
use okami::server::{app_router, EngineState};
use okami::task::TaskSpec;
use okami::tools::ToolRegistry;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,okami=debug".into()),
        )
        .init();

    let config = match std::env::var("OKAMI_CONFIG") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)
                .unwrap_or_else(|e| panic!("failed to read config '{}': {}", path, e));
            EngineConfig::from_yaml(&text)
                .unwrap_or_else(|e| panic!("failed to parse config '{}': {}", path, e))
        }
        Err(_) => EngineConfig::default(),
    };

    let model = std::env::var("OKAMI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
    let completer = Arc::new(OpenAiCompleter::new(model, None, None));
    let embedder = Arc::new(HttpEmbedder::from_settings(
        &config.embedder,
        HttpEmbedder::DEFAULT_DIMENSION,
    ));
    let index = Arc::new(InMemoryVectorIndex::new(HttpEmbedder::DEFAULT_DIMENSION));

    let knowledge_root =
        std::env::var("OKAMI_KNOWLEDGE_ROOT").unwrap_or_else(|_| "knowledge".to_string());
    let backup_root = std::env::var("OKAMI_BACKUP_ROOT").unwrap_or_else(|_| "backups".to_string());
    let knowledge = Arc::new(
        KnowledgeStore::open(
            &knowledge_root,
            &backup_root,
            index.clone(),
            embedder.clone(),
            config.evolution.dedup_threshold,
        )
        .await
        .expect("failed to open knowledge store"),
    );

    let memory = config.memory_enabled.then(|| {
        Arc::new(
            MemoryManager::new(index.clone(), embedder.clone(), &config.memory_config)
                .with_knowledge(knowledge.clone()),
        )
    });

    let guardrails = GuardrailPipeline::from_settings(
        &config.guardrails,
        embedder.clone(),
        Some(knowledge.clone()),
    )
    .expect("invalid guardrail configuration");
    let schemas = Arc::new(SchemaRegistry::new());
    let tools = Arc::new(ToolRegistry::new());

    // Default crew: one assistant handling the submitted task verbatim.
    let mut agents = HashMap::new();
    agents.insert(
        "assistant".to_string(),
        AgentSpec::new(
            "assistant",
            "General Assistant",
            "resolve the user's request completely and accurately",
            "A careful generalist who answers with grounded, verifiable detail.",
        ),
    );
    let mut tasks = HashMap::new();
    tasks.insert(
        "handle_request".to_string(),
        TaskSpec::new(
            "handle_request",
            "Handle this request: {task}",
            "A complete, direct answer to the request.",
        )
        .with_agent("assistant"),
    );
    let compiled = compile(
        CrewSpec::new("default", vec!["assistant"], vec!["handle_request"]),
        &agents,
        &tasks,
        &guardrails,
        &schemas,
    )
    .expect("failed to compile the default crew");

    let orchestrator = Arc::new(CrewOrchestrator::new(
        compiled,
        completer.clone(),
        tools,
        guardrails,
        schemas,
        memory.clone(),
        Some(knowledge.clone()),
        config.clone(),
    ));

    let evolution = Arc::new(
        EvolutionCoordinator::new(completer, knowledge, &config)
            .expect("failed to build the evolution coordinator"),
    );

    let mut state = EngineState::new("default", config.timeouts.request_deadline())
        .with_evolution(evolution);
    if let Some(ref memory) = memory {
        state = state.with_memory(memory.clone());
    }
    state.register_crew("default", orchestrator);
    let state = Arc::new(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let bind_addr = format!("0.0.0.0:{}", port);
    let app = app_router(state);

    tracing::info!("okami server starting on {}", bind_addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health        — liveness probe");
    tracing::info!("  POST /tasks         — submit a task");
    tracing::info!("  GET  /tasks/:id     — fetch a task record");
    tracing::info!("  POST /memory/reset  — reset memory, external, or knowledge");

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .expect("Server failed");
}
