//! Vector index capability and the default in-memory backend.
//!
//! The index is assumed internally concurrent-safe; the in-memory backend
//! uses a `parking_lot::RwLock` over the entry map. The embedding dimension
//! is fixed per deployment: upserting a vector of a different dimension is
//! rejected.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

/// One indexed item: id, vector, metadata, and the raw document.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: HashMap<String, Value>,
    pub document: String,
}

/// A query hit with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredHit {
    pub id: String,
    pub score: f32,
    pub metadata: HashMap<String, Value>,
    pub document: String,
}

/// Equality filter over metadata: every key must match exactly.
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter(pub HashMap<String, Value>);

impl MetadataFilter {
    /// Filter on a single key/value pair.
    pub fn on(key: &str, value: impl Into<Value>) -> Self {
        let mut map = HashMap::new();
        map.insert(key.to_string(), value.into());
        Self(map)
    }

    /// Add another key/value requirement.
    pub fn and(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    /// Whether the entry's metadata satisfies every requirement.
    pub fn matches(&self, metadata: &HashMap<String, Value>) -> bool {
        self.0
            .iter()
            .all(|(key, expected)| metadata.get(key) == Some(expected))
    }
}

/// Upsert/query over (id, vector, metadata, document).
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace entries by id.
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), anyhow::Error>;

    /// Top-k entries by cosine similarity, optionally filtered by metadata.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredHit>, anyhow::Error>;

    /// Remove entries by id. Unknown ids are ignored.
    async fn delete(&self, ids: &[String]) -> Result<(), anyhow::Error>;

    /// Drop every entry.
    async fn reset(&self) -> Result<(), anyhow::Error>;
}

/// Cosine similarity between two equal-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// In-memory vector index over a locked entry map.
pub struct InMemoryVectorIndex {
    dimension: usize,
    entries: RwLock<HashMap<String, IndexEntry>>,
}

impl InMemoryVectorIndex {
    /// Create an index that accepts vectors of `dimension`.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, new_entries: Vec<IndexEntry>) -> Result<(), anyhow::Error> {
        for entry in &new_entries {
            if entry.vector.len() != self.dimension {
                anyhow::bail!(
                    "vector dimension {} does not match index dimension {}",
                    entry.vector.len(),
                    self.dimension
                );
            }
        }
        let mut entries = self.entries.write();
        for entry in new_entries {
            entries.insert(entry.id.clone(), entry);
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredHit>, anyhow::Error> {
        if vector.len() != self.dimension {
            anyhow::bail!(
                "query dimension {} does not match index dimension {}",
                vector.len(),
                self.dimension
            );
        }
        let entries = self.entries.read();
        let mut hits: Vec<ScoredHit> = entries
            .values()
            .filter(|entry| filter.map_or(true, |f| f.matches(&entry.metadata)))
            .map(|entry| ScoredHit {
                id: entry.id.clone(),
                score: cosine_similarity(vector, &entry.vector),
                metadata: entry.metadata.clone(),
                document: entry.document.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete(&self, ids: &[String]) -> Result<(), anyhow::Error> {
        let mut entries = self.entries.write();
        for id in ids {
            entries.remove(id);
        }
        Ok(())
    }

    async fn reset(&self) -> Result<(), anyhow::Error> {
        self.entries.write().clear();
        Ok(())
    }
}
