//! HTTP surface: task submission and retrieval over axum.

pub mod routes;

pub use routes::{app_router, AppState, EngineState, MemoryResetRequest, TaskRecord, TaskSubmission};
