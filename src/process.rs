//! Process types for crew execution.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the different disciplines a crew can follow to tackle its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Process {
    /// Tasks are executed in dependency order along the task DAG.
    Sequential,
    /// A manager agent decomposes the work and delegates to worker agents.
    Hierarchical,
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Process::Sequential => write!(f, "sequential"),
            Process::Hierarchical => write!(f, "hierarchical"),
        }
    }
}

impl Default for Process {
    fn default() -> Self {
        Process::Sequential
    }
}
