//! Entity memory: facts keyed by normalized entity name.
//!
//! Writing the same entity twice merges the new facts into the existing
//! document under a timestamp instead of creating a second record; reading
//! returns the full merged fact sheet.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;

use crate::memory::record::MemoryKind;
use crate::rag::{Embedder, IndexEntry, MetadataFilter, ScoredHit, VectorIndex};

/// Entity-keyed persistent store.
pub struct EntityMemory {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    /// Authoritative merged documents, keyed by normalized entity name.
    documents: DashMap<String, EntityDocument>,
}

/// The merged fact sheet for one entity.
#[derive(Debug, Clone)]
pub struct EntityDocument {
    pub entity_name: String,
    pub entity_type: String,
    pub facts: String,
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

impl EntityMemory {
    pub fn new(index: Arc<dyn VectorIndex>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            index,
            embedder,
            documents: DashMap::new(),
        }
    }

    /// Save facts about an entity, merging into any existing document.
    pub async fn save(
        &self,
        entity_name: &str,
        entity_type: &str,
        facts: &str,
    ) -> Result<(), anyhow::Error> {
        let key = normalize(entity_name);
        let stamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let addition = format!("[{}] {}", stamp, facts.trim());

        let document = match self.documents.get(&key) {
            Some(existing) => EntityDocument {
                entity_name: existing.entity_name.clone(),
                entity_type: existing.entity_type.clone(),
                facts: format!("{}\n{}", existing.facts, addition),
            },
            None => EntityDocument {
                entity_name: entity_name.trim().to_string(),
                entity_type: entity_type.to_string(),
                facts: addition,
            },
        };

        let mut metadata = HashMap::new();
        metadata.insert(
            "kind".to_string(),
            Value::String(MemoryKind::Entity.as_str().to_string()),
        );
        metadata.insert(
            "entity_name".to_string(),
            Value::String(document.entity_name.clone()),
        );
        metadata.insert(
            "entity_type".to_string(),
            Value::String(document.entity_type.clone()),
        );

        let indexed = format!("{}\n{}", document.entity_name, document.facts);
        let vector = self.embedder.embed(&indexed).await?;
        self.index
            .upsert(vec![IndexEntry {
                id: format!("entity::{}", key),
                vector,
                metadata,
                document: indexed,
            }])
            .await?;

        self.documents.insert(key, document);
        Ok(())
    }

    /// All facts for a matched entity, if known.
    pub fn facts(&self, entity_name: &str) -> Option<EntityDocument> {
        self.documents
            .get(&normalize(entity_name))
            .map(|d| d.value().clone())
    }

    /// Top-k entities semantically related to the query.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredHit>, anyhow::Error> {
        let vector = self.embedder.embed(query).await?;
        let filter = MetadataFilter::on("kind", MemoryKind::Entity.as_str());
        self.index.query(&vector, k, Some(&filter)).await
    }

    /// Drop every entity record.
    pub async fn reset(&self) -> Result<(), anyhow::Error> {
        let ids: Vec<String> = self
            .documents
            .iter()
            .map(|e| format!("entity::{}", e.key()))
            .collect();
        self.index.delete(&ids).await?;
        self.documents.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::InMemoryVectorIndex;
    use crate::testing::StubEmbedder;

    fn store() -> EntityMemory {
        let index = Arc::new(InMemoryVectorIndex::new(StubEmbedder::DIMENSION));
        EntityMemory::new(index, Arc::new(StubEmbedder::default()))
    }

    #[tokio::test]
    async fn test_duplicate_names_merge_facts() {
        let memory = store();
        memory.save("Ada Lovelace", "person", "wrote the first program").await.unwrap();
        memory.save("  ada lovelace ", "person", "worked with Babbage").await.unwrap();

        let doc = memory.facts("ADA LOVELACE").unwrap();
        assert!(doc.facts.contains("wrote the first program"));
        assert!(doc.facts.contains("worked with Babbage"));
        // Merged, not duplicated: one indexed entry per entity.
        let hits = memory.search("Ada Lovelace", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_facts_unknown_entity() {
        let memory = store();
        assert!(memory.facts("nobody").is_none());
    }

    #[tokio::test]
    async fn test_search_returns_entity_document() {
        let memory = store();
        memory.save("tokio", "library", "async runtime for rust").await.unwrap();
        let hits = memory.search("tokio async runtime", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].document.contains("async runtime for rust"));
    }

    #[tokio::test]
    async fn test_reset() {
        let memory = store();
        memory.save("tokio", "library", "async runtime").await.unwrap();
        memory.reset().await.unwrap();
        assert!(memory.facts("tokio").is_none());
        assert!(memory.search("tokio", 5).await.unwrap().is_empty());
    }
}
