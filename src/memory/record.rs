//! Memory record types shared by the three tiers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Which tier a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// Scoped to one run; discarded at run end unless promoted.
    Short,
    /// Persistent, cross-run.
    Long,
    /// Keyed by entity name; persistent.
    Entity,
}

impl MemoryKind {
    /// Stable string used in index metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Short => "short",
            MemoryKind::Long => "long",
            MemoryKind::Entity => "entity",
        }
    }
}

/// One saved memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique record id.
    pub id: String,
    /// Tier the record lives in.
    pub kind: MemoryKind,
    /// The remembered text.
    pub content: String,
    /// Scalar metadata (agent, task, run_id, promote, ...).
    pub metadata: HashMap<String, Value>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl MemoryRecord {
    /// Create a record with a fresh id.
    pub fn new(kind: MemoryKind, content: String, metadata: HashMap<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            content,
            metadata,
            created_at: Utc::now(),
        }
    }

    /// Whether the record is marked for promotion to long-term.
    pub fn promoted(&self) -> bool {
        self.metadata
            .get("promote")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
