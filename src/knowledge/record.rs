//! Knowledge record types and the on-disk catalog shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Category a knowledge document belongs to. Categories map to directories
/// under the knowledge root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Agents,
    Crew,
    System,
    Domain,
    General,
}

impl Category {
    /// Directory name under the knowledge root.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Agents => "agents",
            Category::Crew => "crew",
            Category::System => "system",
            Category::Domain => "domain",
            Category::General => "general",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "agents" => Ok(Category::Agents),
            "crew" => Ok(Category::Crew),
            "system" => Ok(Category::System),
            "domain" => Ok(Category::Domain),
            "general" => Ok(Category::General),
            other => Err(format!("unknown knowledge category '{}'", other)),
        }
    }
}

/// One entry of `index.json`: the catalog row for a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Path relative to the knowledge root.
    pub path: String,
    /// Category directory the document lives in.
    pub category: Category,
    /// Free-form tags for filtered retrieval.
    pub tags: Vec<String>,
    /// First write timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

/// A full knowledge document as returned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    pub id: String,
    pub category: Category,
    /// Path relative to the knowledge root; `(category, path)` is unique.
    pub path: String,
    /// Section the last mutation targeted, if any.
    pub section: Option<String>,
    pub content: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
