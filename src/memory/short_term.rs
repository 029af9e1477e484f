//! Short-term memory: a bounded ring per run, mirrored into the vector
//! index for semantic recall within the same run.
//!
//! Records never outlive their run unless `metadata.promote = true`, in
//! which case [`ShortTermMemory::end_run`] hands them back for promotion to
//! long-term before the run's entries are dropped from the index.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::memory::record::{MemoryKind, MemoryRecord};
use crate::rag::{Embedder, IndexEntry, MetadataFilter, ScoredHit, VectorIndex};

/// Default ring capacity per run.
const DEFAULT_CAPACITY: usize = 100;

/// Per-run short-term store.
pub struct ShortTermMemory {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    capacity: usize,
    rings: DashMap<String, VecDeque<MemoryRecord>>,
}

impl ShortTermMemory {
    /// Create a short-term store over the shared index and embedder.
    pub fn new(index: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            index,
            embedder,
            capacity: DEFAULT_CAPACITY,
            rings: DashMap::new(),
        }
    }

    /// Override the per-run ring capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Save one record into the run's ring and the index.
    pub async fn save(
        &self,
        run_id: &str,
        content: &str,
        mut metadata: HashMap<String, Value>,
    ) -> Result<MemoryRecord, anyhow::Error> {
        metadata.insert("run_id".to_string(), Value::String(run_id.to_string()));
        metadata.insert(
            "kind".to_string(),
            Value::String(MemoryKind::Short.as_str().to_string()),
        );
        let record = MemoryRecord::new(MemoryKind::Short, content.to_string(), metadata);

        let vector = self.embedder.embed(content).await?;
        self.index
            .upsert(vec![IndexEntry {
                id: record.id.clone(),
                vector,
                metadata: record.metadata.clone(),
                document: record.content.clone(),
            }])
            .await?;

        let mut ring = self.rings.entry(run_id.to_string()).or_default();
        if ring.len() == self.capacity {
            if let Some(evicted) = ring.pop_front() {
                // Evicted from the ring but kept in the index until run end;
                // only the "recent" window shrinks.
                log::trace!("short-term ring evicted record {}", evicted.id);
            }
        }
        ring.push_back(record.clone());
        Ok(record)
    }

    /// The last `n` records for a run, oldest first.
    pub fn recent(&self, run_id: &str, n: usize) -> Vec<MemoryRecord> {
        self.rings
            .get(run_id)
            .map(|ring| {
                let skip = ring.len().saturating_sub(n);
                ring.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Top-k semantic hits within the run.
    pub async fn search(
        &self,
        run_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredHit>, anyhow::Error> {
        let vector = self.embedder.embed(query).await?;
        let filter = MetadataFilter::on("kind", MemoryKind::Short.as_str()).and("run_id", run_id);
        self.index.query(&vector, k, Some(&filter)).await
    }

    /// Close out a run: drop its records from the index and return the ones
    /// marked for promotion.
    pub async fn end_run(&self, run_id: &str) -> Result<Vec<MemoryRecord>, anyhow::Error> {
        let records: Vec<MemoryRecord> = self
            .rings
            .remove(run_id)
            .map(|(_, ring)| ring.into_iter().collect())
            .unwrap_or_default();

        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        self.index.delete(&ids).await?;

        Ok(records.into_iter().filter(|r| r.promoted()).collect())
    }

    /// Drop every run's records.
    pub async fn reset(&self) -> Result<(), anyhow::Error> {
        let run_ids: Vec<String> = self.rings.iter().map(|e| e.key().clone()).collect();
        for run_id in run_ids {
            let _ = self.end_run(&run_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubEmbedder;
    use crate::rag::InMemoryVectorIndex;

    fn store() -> ShortTermMemory {
        let index = Arc::new(InMemoryVectorIndex::new(StubEmbedder::DIMENSION));
        let embedder = Arc::new(StubEmbedder::default());
        ShortTermMemory::new(index, embedder)
    }

    #[tokio::test]
    async fn test_recent_returns_last_n_in_order() {
        let memory = store();
        for i in 0..5 {
            memory
                .save("run-1", &format!("entry {}", i), HashMap::new())
                .await
                .unwrap();
        }
        let recent = memory.recent("run-1", 3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content, "entry 2");
        assert_eq!(recent[2].content, "entry 4");
    }

    #[tokio::test]
    async fn test_ring_capacity_bounds_recent_window() {
        let memory = store().with_capacity(2);
        for i in 0..4 {
            memory
                .save("run-1", &format!("entry {}", i), HashMap::new())
                .await
                .unwrap();
        }
        let recent = memory.recent("run-1", 10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "entry 2");
    }

    #[tokio::test]
    async fn test_search_is_run_scoped() {
        let memory = store();
        memory
            .save("run-1", "the sky is blue", HashMap::new())
            .await
            .unwrap();
        memory
            .save("run-2", "the sky is blue", HashMap::new())
            .await
            .unwrap();

        let hits = memory.search("run-1", "the sky is blue", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(
            hits[0].metadata.get("run_id"),
            Some(&Value::String("run-1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_end_run_returns_promoted_and_clears_index() {
        let memory = store();
        let mut promote = HashMap::new();
        promote.insert("promote".to_string(), Value::Bool(true));
        memory.save("run-1", "keep me", promote).await.unwrap();
        memory.save("run-1", "drop me", HashMap::new()).await.unwrap();

        let promoted = memory.end_run("run-1").await.unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].content, "keep me");

        // Nothing remains searchable for the closed run.
        let hits = memory.search("run-1", "keep me", 10).await.unwrap();
        assert!(hits.is_empty());
        assert!(memory.recent("run-1", 10).is_empty());
    }
}
