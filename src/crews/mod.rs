//! Crew compilation and run results.

pub mod crew_output;
pub mod plan;

pub use crew_output::CrewResult;
pub use plan::{compile, CompiledCrew};
