//! Long-term memory: unbounded, cross-run, vector-indexed.
//!
//! Written at run end with a summary of the final output plus distilled
//! facts tagged with agent names; promoted short-term records also land
//! here.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::memory::record::{MemoryKind, MemoryRecord};
use crate::rag::{Embedder, IndexEntry, MetadataFilter, ScoredHit, VectorIndex};

/// Persistent cross-run store.
pub struct LongTermMemory {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
}

impl LongTermMemory {
    pub fn new(index: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>) -> Self {
        Self { index, embedder }
    }

    /// Save one record.
    pub async fn save(
        &self,
        content: &str,
        mut metadata: HashMap<String, Value>,
    ) -> Result<MemoryRecord, anyhow::Error> {
        metadata.insert(
            "kind".to_string(),
            Value::String(MemoryKind::Long.as_str().to_string()),
        );
        let record = MemoryRecord::new(MemoryKind::Long, content.to_string(), metadata);
        let vector = self.embedder.embed(content).await?;
        self.index
            .upsert(vec![IndexEntry {
                id: record.id.clone(),
                vector,
                metadata: record.metadata.clone(),
                document: record.content.clone(),
            }])
            .await?;
        Ok(record)
    }

    /// Top-k semantic hits, optionally narrowed by extra metadata.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        extra: Option<&HashMap<String, Value>>,
    ) -> Result<Vec<ScoredHit>, anyhow::Error> {
        let vector = self.embedder.embed(query).await?;
        let mut filter = MetadataFilter::on("kind", MemoryKind::Long.as_str());
        if let Some(extra) = extra {
            for (key, value) in extra {
                filter = filter.and(key, value.clone());
            }
        }
        self.index.query(&vector, k, Some(&filter)).await
    }

    /// Drop every long-term record.
    pub async fn reset(&self) -> Result<(), anyhow::Error> {
        // The index is shared across tiers, so collect ids by filter first.
        let probe = vec![0.0; self.embedder.dimension()];
        let filter = MetadataFilter::on("kind", MemoryKind::Long.as_str());
        let hits = self.index.query(&probe, usize::MAX, Some(&filter)).await?;
        let ids: Vec<String> = hits.into_iter().map(|h| h.id).collect();
        self.index.delete(&ids).await
    }
}
