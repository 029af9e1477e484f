//! Axum route handlers for the task-submission surface.
//!
//! # Routes
//!
//! - `GET  /health`        — liveness probe
//! - `POST /tasks`         — submit a task; sync by default, async on request
//! - `GET  /tasks/:id`     — fetch the terminal record of an async submission
//! - `POST /memory/reset`  — reset a memory tier, the external mirror, or knowledge

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::crew::CrewOrchestrator;
use crate::evolution::EvolutionCoordinator;
use crate::memory::MemoryManager;
use crate::trace::{ExecutionStep, RunStatus};
use crate::types::UsageMetrics;

/// Default bound on in-flight requests.
const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Shared application state.
pub struct EngineState {
    /// Registered crews by name.
    pub crews: DashMap<String, Arc<CrewOrchestrator>>,
    /// Crew used when a submission names none.
    pub default_crew: String,
    /// Task records by id.
    pub records: DashMap<String, TaskRecord>,
    /// Bounded admission queue.
    pub queue: Arc<Semaphore>,
    /// Evolution coordinator, when enabled.
    pub evolution: Option<Arc<EvolutionCoordinator>>,
    /// Memory manager, when memory is enabled; backs `/memory/reset`.
    pub memory: Option<Arc<MemoryManager>>,
    /// Per-request deadline.
    pub request_deadline: std::time::Duration,
}

/// Handle shared across handlers.
pub type AppState = Arc<EngineState>;

impl EngineState {
    /// Create state with the default queue capacity.
    pub fn new(default_crew: impl Into<String>, request_deadline: std::time::Duration) -> Self {
        Self {
            crews: DashMap::new(),
            default_crew: default_crew.into(),
            records: DashMap::new(),
            queue: Arc::new(Semaphore::new(DEFAULT_QUEUE_CAPACITY)),
            evolution: None,
            memory: None,
            request_deadline,
        }
    }

    /// Bound the admission queue.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue = Arc::new(Semaphore::new(capacity));
        self
    }

    /// Attach the evolution coordinator.
    pub fn with_evolution(mut self, evolution: Arc<EvolutionCoordinator>) -> Self {
        self.evolution = Some(evolution);
        self
    }

    /// Attach the memory manager so `/memory/reset` can reach it.
    pub fn with_memory(mut self, memory: Arc<MemoryManager>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Register a crew under its name.
    pub fn register_crew(&self, name: impl Into<String>, orchestrator: Arc<CrewOrchestrator>) {
        self.crews.insert(name.into(), orchestrator);
    }
}

/// Task submission body.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSubmission {
    /// The free-form request, interpolated into the crew as `{task}`.
    pub task: String,
    /// Crew to run; the default crew when absent.
    #[serde(default)]
    pub crew_name: Option<String>,
    /// When true, return immediately and expose the record at
    /// `GET /tasks/{id}`.
    #[serde(default)]
    pub async_execution: bool,
    /// Extra interpolation inputs.
    #[serde(default)]
    pub inputs: Option<HashMap<String, String>>,
    /// Extra context values, merged into the inputs.
    #[serde(default)]
    pub context: Option<HashMap<String, String>>,
}

/// The result payload inside a task record.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResultBody {
    pub raw: String,
    pub tasks_output: Vec<ExecutionStep>,
    pub token_usage: UsageMetrics,
}

/// Terminal (or in-flight) record of one submission.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub status: String,
    pub result: Option<TaskResultBody>,
    pub error: Option<String>,
    pub execution_time: f64,
}

/// Build the axum router.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/tasks", post(submit_task_handler))
        .route("/tasks/:id", get(get_task_handler))
        .route("/memory/reset", post(reset_memory_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// GET /health — liveness probe.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "okami",
    }))
}

/// POST /tasks — submit a task for the named (or default) crew.
async fn submit_task_handler(
    State(state): State<AppState>,
    Json(submission): Json<TaskSubmission>,
) -> Result<Json<TaskRecord>, (StatusCode, Json<Value>)> {
    let crew_name = submission
        .crew_name
        .clone()
        .unwrap_or_else(|| state.default_crew.clone());
    let Some(orchestrator) = state.crews.get(&crew_name).map(|c| c.value().clone()) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": format!("unknown crew '{}'", crew_name)})),
        ));
    };

    // Bounded admission: fail fast when the queue is full.
    let Ok(permit) = state.queue.clone().try_acquire_owned() else {
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({"error": "request queue is full"})),
        ));
    };

    let mut inputs = submission.inputs.clone().unwrap_or_default();
    if let Some(context) = submission.context.clone() {
        inputs.extend(context);
    }
    inputs.insert("task".to_string(), submission.task.clone());

    let task_id = Uuid::new_v4().to_string();
    let record = TaskRecord {
        task_id: task_id.clone(),
        status: "processing".to_string(),
        result: None,
        error: None,
        execution_time: 0.0,
    };
    state.records.insert(task_id.clone(), record.clone());

    if submission.async_execution {
        let state_clone = state.clone();
        let task_id_clone = task_id.clone();
        let task_text = submission.task.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let record =
                run_crew(&state_clone, &orchestrator, inputs, &task_id_clone, &task_text).await;
            state_clone.records.insert(task_id_clone, record);
        });
        return Ok(Json(record));
    }

    let record = {
        let _permit = permit;
        run_crew(&state, &orchestrator, inputs, &task_id, &submission.task).await
    };
    state.records.insert(task_id, record.clone());
    Ok(Json(record))
}

/// Memory reset request body.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryResetRequest {
    /// One of: short, long, entity, external, knowledge, all.
    pub kind: String,
}

/// POST /memory/reset — reset a memory tier, the external mirror, or the
/// knowledge store.
async fn reset_memory_handler(
    State(state): State<AppState>,
    Json(request): Json<MemoryResetRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(ref memory) = state.memory else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "memory is not enabled"})),
        ));
    };
    match memory.reset(&request.kind).await {
        Ok(()) => Ok(Json(serde_json::json!({
            "status": "reset",
            "kind": request.kind,
        }))),
        Err(e) => Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": e.to_string()})),
        )),
    }
}

/// GET /tasks/:id — fetch a submission record.
async fn get_task_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskRecord>, (StatusCode, Json<Value>)> {
    match state.records.get(&id) {
        Some(record) => Ok(Json(record.clone())),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": format!("unknown task '{}'", id)})),
        )),
    }
}

/// Run a crew to completion and build its record. The evolution pipeline
/// is spawned after the result exists, off the response path.
async fn run_crew(
    state: &AppState,
    orchestrator: &Arc<CrewOrchestrator>,
    inputs: HashMap<String, String>,
    task_id: &str,
    task_text: &str,
) -> TaskRecord {
    let started = Instant::now();

    let cancel = CancellationToken::new();
    let watchdog = cancel.clone();
    let deadline = state.request_deadline;
    let watchdog_handle = tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        watchdog.cancel();
    });

    let result = orchestrator.kickoff(inputs, cancel).await;
    watchdog_handle.abort();

    if let Some(ref evolution) = state.evolution {
        if evolution.enabled() {
            let evolution = evolution.clone();
            let user_input = task_text.to_string();
            let main_response = result.final_output.clone();
            let trace = result.trace.clone();
            tokio::spawn(async move {
                evolution.run_after(&user_input, &main_response, &trace).await;
            });
        }
    }

    let status = match result.status {
        RunStatus::Completed => "completed",
        RunStatus::Partial => "completed",
        RunStatus::Failed => "failed",
    };

    TaskRecord {
        task_id: task_id.to_string(),
        status: status.to_string(),
        result: Some(TaskResultBody {
            raw: result.final_output,
            tasks_output: result.tasks_output,
            token_usage: result.token_usage,
        }),
        error: result.error,
        execution_time: started.elapsed().as_secs_f64(),
    }
}
