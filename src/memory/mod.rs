//! Memory layer: short-term, long-term, and entity tiers over a shared
//! vector index, with an optional external sidecar mirror.
//!
//! Retrieval is tier-scoped: each query targets exactly one tier unless the
//! caller explicitly selects another. Short-term records never surface in
//! long-term results unless they were promoted at run end.

pub mod entity;
pub mod external;
pub mod long_term;
pub mod record;
pub mod short_term;

pub use entity::EntityMemory;
pub use external::{ExternalHit, ExternalMemoryProvider, Mem0Provider};
pub use long_term::LongTermMemory;
pub use record::{MemoryKind, MemoryRecord};
pub use short_term::ShortTermMemory;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::config::{MemoryConfig, MemoryProvider};
use crate::knowledge::KnowledgeStore;
use crate::rag::{Embedder, ScoredHit, VectorIndex};

/// Entries of recent short-term context emitted per task.
const RECENT_WINDOW: usize = 20;

/// Semantic hits per tier emitted per task.
const SEMANTIC_K: usize = 5;

/// Entity hits emitted per task.
const ENTITY_K: usize = 3;

/// The three tiers plus the optional sidecar, behind one faucet.
pub struct MemoryManager {
    short_term: ShortTermMemory,
    long_term: LongTermMemory,
    entity: EntityMemory,
    external: Option<Arc<dyn ExternalMemoryProvider>>,
    /// Knowledge store reference, used only by `reset("knowledge")`.
    knowledge: Option<Arc<KnowledgeStore>>,
}

impl MemoryManager {
    /// Build the tiers over a shared index and embedder.
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        config: &MemoryConfig,
    ) -> Self {
        let external: Option<Arc<dyn ExternalMemoryProvider>> = match config.provider {
            MemoryProvider::Basic => None,
            MemoryProvider::Mem0 => Some(Arc::new(Mem0Provider::from_config(config))),
        };
        Self {
            short_term: ShortTermMemory::new(index.clone(), embedder.clone()),
            long_term: LongTermMemory::new(index.clone(), embedder.clone()),
            entity: EntityMemory::new(index, embedder),
            external,
            knowledge: None,
        }
    }

    /// Replace the external provider (used by embedders of the engine and
    /// by tests).
    pub fn with_external(mut self, provider: Arc<dyn ExternalMemoryProvider>) -> Self {
        self.external = Some(provider);
        self
    }

    /// Attach the knowledge store so `reset("knowledge")` can reach it.
    pub fn with_knowledge(mut self, store: Arc<KnowledgeStore>) -> Self {
        self.knowledge = Some(store);
        self
    }

    /// Direct access to the entity tier.
    pub fn entities(&self) -> &EntityMemory {
        &self.entity
    }

    /// Record a completed task output into short-term memory, mirroring to
    /// the sidecar when configured.
    pub async fn record_task_output(
        &self,
        run_id: &str,
        task_name: &str,
        agent_name: &str,
        output: &str,
    ) -> Result<(), anyhow::Error> {
        let mut metadata = HashMap::new();
        metadata.insert("task".to_string(), Value::String(task_name.to_string()));
        metadata.insert("agent".to_string(), Value::String(agent_name.to_string()));

        self.short_term.save(run_id, output, metadata.clone()).await?;
        self.mirror_save(output, &metadata).await;
        Ok(())
    }

    /// Assemble the retrieval-augmented memory block for a task prompt:
    /// the last N short-term entries, the top-K run-scoped semantic hits,
    /// the top-K long-term hits (unioned with external hits), and matching
    /// entities.
    pub async fn context_block(&self, run_id: &str, task_description: &str) -> String {
        let mut sections: Vec<String> = Vec::new();

        let recent = self.short_term.recent(run_id, RECENT_WINDOW);
        if !recent.is_empty() {
            let lines: Vec<String> =
                recent.iter().map(|r| format!("- {}", r.content)).collect();
            sections.push(format!("Recent context:\n{}", lines.join("\n")));
        }

        match self.short_term.search(run_id, task_description, SEMANTIC_K).await {
            Ok(hits) if !hits.is_empty() => {
                sections.push(format_hits("Relevant context:", &hits));
            }
            Ok(_) => {}
            Err(e) => log::warn!("short-term search failed: {}", e),
        }

        match self.search_long_term(task_description, SEMANTIC_K).await {
            Ok(hits) if !hits.is_empty() => {
                sections.push(format_hits("Historical context:", &hits));
            }
            Ok(_) => {}
            Err(e) => log::warn!("long-term search failed: {}", e),
        }

        match self.entity.search(task_description, ENTITY_K).await {
            Ok(hits) if !hits.is_empty() => {
                sections.push(format_hits("Entities:", &hits));
            }
            Ok(_) => {}
            Err(e) => log::warn!("entity search failed: {}", e),
        }

        sections.join("\n\n")
    }

    /// Long-term search unioned with external hits: deduplicated by id,
    /// ordered by score.
    pub async fn search_long_term(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredHit>, anyhow::Error> {
        let mut hits = self.long_term.search(query, k, None).await?;

        if let Some(ref external) = self.external {
            match external.search(query, k).await {
                Ok(external_hits) => {
                    let seen: HashSet<String> = hits.iter().map(|h| h.id.clone()).collect();
                    for hit in external_hits {
                        if !seen.contains(&hit.id) {
                            hits.push(ScoredHit {
                                id: hit.id,
                                score: hit.score,
                                metadata: HashMap::new(),
                                document: hit.content,
                            });
                        }
                    }
                    hits.sort_by(|a, b| {
                        b.score
                            .partial_cmp(&a.score)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                    hits.truncate(k);
                }
                Err(e) => log::warn!("external memory search failed: {}", e),
            }
        }

        Ok(hits)
    }

    /// Close out a run: promote flagged short-term records, then write the
    /// run summary and per-agent distilled facts into long-term memory.
    pub async fn finish_run(
        &self,
        run_id: &str,
        crew_name: &str,
        final_output: &str,
        agent_facts: &[(String, String)],
    ) -> Result<(), anyhow::Error> {
        for record in self.short_term.end_run(run_id).await? {
            self.long_term.save(&record.content, record.metadata).await?;
        }

        let mut metadata = HashMap::new();
        metadata.insert("crew".to_string(), Value::String(crew_name.to_string()));
        metadata.insert("run_id".to_string(), Value::String(run_id.to_string()));
        let summary = format!("Run summary for crew '{}': {}", crew_name, final_output);
        self.long_term.save(&summary, metadata).await?;

        for (agent, fact) in agent_facts {
            let mut metadata = HashMap::new();
            metadata.insert("agent".to_string(), Value::String(agent.clone()));
            metadata.insert("run_id".to_string(), Value::String(run_id.to_string()));
            self.long_term.save(fact, metadata.clone()).await?;
            self.mirror_save(fact, &metadata).await;
        }
        Ok(())
    }

    /// Reset specific or all memory tiers, the external mirror, or the
    /// attached knowledge store.
    ///
    /// Valid kinds: "short", "long", "entity", "external", "knowledge",
    /// "all". Kinds targeting a layer that is not configured are a
    /// logged no-op.
    pub async fn reset(&self, kind: &str) -> Result<(), anyhow::Error> {
        match kind {
            "short" => self.short_term.reset().await?,
            "long" => self.long_term.reset().await?,
            "entity" => self.entity.reset().await?,
            "external" => self.reset_external().await?,
            "knowledge" => self.reset_knowledge().await?,
            "all" => {
                self.short_term.reset().await?;
                self.long_term.reset().await?;
                self.entity.reset().await?;
                self.reset_external().await?;
                self.reset_knowledge().await?;
            }
            other => anyhow::bail!(
                "invalid memory kind '{}'; must be one of: \
                 short, long, entity, external, knowledge, all",
                other
            ),
        }
        log::info!("{} memory has been reset", kind);
        Ok(())
    }

    async fn reset_external(&self) -> Result<(), anyhow::Error> {
        match self.external {
            Some(ref external) => external.reset().await,
            None => {
                log::debug!("no external memory provider configured; nothing to reset");
                Ok(())
            }
        }
    }

    async fn reset_knowledge(&self) -> Result<(), anyhow::Error> {
        match self.knowledge {
            Some(ref store) => store.reset().await,
            None => {
                log::debug!("no knowledge store attached; nothing to reset");
                Ok(())
            }
        }
    }

    async fn mirror_save(&self, content: &str, metadata: &HashMap<String, Value>) {
        if let Some(ref external) = self.external {
            if let Err(e) = external.save(content, metadata).await {
                log::warn!("external memory save failed: {}", e);
            }
        }
    }
}

fn format_hits(header: &str, hits: &[ScoredHit]) -> String {
    let lines: Vec<String> = hits.iter().map(|h| format!("- {}", h.document)).collect();
    format!("{}\n{}", header, lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::InMemoryVectorIndex;
    use crate::testing::StubEmbedder;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn manager() -> MemoryManager {
        let index = Arc::new(InMemoryVectorIndex::new(StubEmbedder::DIMENSION));
        MemoryManager::new(index, Arc::new(StubEmbedder::default()), &MemoryConfig::default())
    }

    struct RecordingProvider {
        saves: Mutex<Vec<String>>,
        hits: Vec<ExternalHit>,
        fail: bool,
    }

    #[async_trait]
    impl ExternalMemoryProvider for RecordingProvider {
        async fn save(
            &self,
            content: &str,
            _metadata: &HashMap<String, Value>,
        ) -> Result<(), anyhow::Error> {
            if self.fail {
                anyhow::bail!("sidecar down");
            }
            self.saves.lock().unwrap().push(content.to_string());
            Ok(())
        }

        async fn search(&self, _query: &str, _k: usize) -> Result<Vec<ExternalHit>, anyhow::Error> {
            if self.fail {
                anyhow::bail!("sidecar down");
            }
            Ok(self.hits.clone())
        }

        async fn reset(&self) -> Result<(), anyhow::Error> {
            if self.fail {
                anyhow::bail!("sidecar down");
            }
            self.saves.lock().unwrap().clear();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_context_block_contains_recent_and_relevant() {
        let manager = manager();
        manager
            .record_task_output("run-1", "research", "analyst", "rust is memory safe")
            .await
            .unwrap();

        let block = manager.context_block("run-1", "tell me about rust").await;
        assert!(block.contains("Recent context:"));
        assert!(block.contains("rust is memory safe"));
    }

    #[tokio::test]
    async fn test_short_term_does_not_leak_across_runs() {
        let manager = manager();
        manager
            .record_task_output("run-1", "research", "analyst", "secret from run one")
            .await
            .unwrap();

        let block = manager.context_block("run-2", "secret from run one").await;
        assert!(!block.contains("secret from run one"));
    }

    #[tokio::test]
    async fn test_promoted_records_survive_into_long_term() {
        let manager = manager();
        let mut metadata = HashMap::new();
        metadata.insert("promote".to_string(), Value::Bool(true));
        manager
            .short_term
            .save("run-1", "promoted wisdom", metadata)
            .await
            .unwrap();
        manager.finish_run("run-1", "crew", "done", &[]).await.unwrap();

        let hits = manager.search_long_term("promoted wisdom", 5).await.unwrap();
        assert!(hits.iter().any(|h| h.document == "promoted wisdom"));
    }

    #[tokio::test]
    async fn test_unpromoted_records_are_discarded() {
        let manager = manager();
        manager
            .record_task_output("run-1", "research", "analyst", "ephemeral detail")
            .await
            .unwrap();
        manager.finish_run("run-1", "crew", "done", &[]).await.unwrap();

        let hits = manager.search_long_term("ephemeral detail", 5).await.unwrap();
        assert!(!hits.iter().any(|h| h.document == "ephemeral detail"));
    }

    #[tokio::test]
    async fn test_external_union_dedup_and_order() {
        let index = Arc::new(InMemoryVectorIndex::new(StubEmbedder::DIMENSION));
        let manager = MemoryManager::new(
            index,
            Arc::new(StubEmbedder::default()),
            &MemoryConfig::default(),
        );
        let local = manager.long_term.save("shared fact", HashMap::new()).await.unwrap();
        let provider = Arc::new(RecordingProvider {
            saves: Mutex::new(Vec::new()),
            hits: vec![
                ExternalHit {
                    id: local.id.clone(),
                    score: 0.99,
                    content: "shared fact".to_string(),
                },
                ExternalHit {
                    id: "ext-1".to_string(),
                    score: 0.42,
                    content: "external only".to_string(),
                },
            ],
            fail: false,
        });
        let manager = manager.with_external(provider);

        let hits = manager.search_long_term("shared fact", 5).await.unwrap();
        // The duplicate id is dropped; the external-only hit is appended.
        assert_eq!(hits.iter().filter(|h| h.id == local.id).count(), 1);
        assert!(hits.iter().any(|h| h.id == "ext-1"));
    }

    #[tokio::test]
    async fn test_external_failure_does_not_break_primary_path() {
        let provider = Arc::new(RecordingProvider {
            saves: Mutex::new(Vec::new()),
            hits: Vec::new(),
            fail: true,
        });
        let manager = manager().with_external(provider);

        manager
            .record_task_output("run-1", "t", "a", "still saved locally")
            .await
            .unwrap();
        let hits = manager.search_long_term("anything", 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_reset_rejects_unknown_kind() {
        let manager = manager();
        assert!(manager.reset("everything").await.is_err());
        assert!(manager.reset("all").await.is_ok());
    }

    #[tokio::test]
    async fn test_reset_external_clears_the_sidecar() {
        let provider = Arc::new(RecordingProvider {
            saves: Mutex::new(Vec::new()),
            hits: Vec::new(),
            fail: false,
        });
        let manager = manager().with_external(provider.clone());
        manager
            .record_task_output("run-1", "t", "a", "mirrored fact")
            .await
            .unwrap();
        assert_eq!(provider.saves.lock().unwrap().len(), 1);

        manager.reset("external").await.unwrap();
        assert!(provider.saves.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_knowledge_clears_the_attached_store() {
        use crate::knowledge::{Category, KnowledgeStore};
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let index = Arc::new(InMemoryVectorIndex::new(StubEmbedder::DIMENSION));
        let store = Arc::new(
            KnowledgeStore::open(
                dir.path().join("knowledge"),
                dir.path().join("backups"),
                index.clone(),
                Arc::new(StubEmbedder::default()),
                0.92,
            )
            .await
            .unwrap(),
        );
        store
            .add(Category::Domain, None, "Notes", "Scheduling heuristics worth keeping.", &[])
            .await
            .unwrap();

        let manager = MemoryManager::new(
            index,
            Arc::new(StubEmbedder::default()),
            &MemoryConfig::default(),
        )
        .with_knowledge(store.clone());

        manager.reset("knowledge").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_reset_unconfigured_layers_is_a_noop() {
        // Neither an external provider nor a knowledge store is attached.
        let manager = manager();
        assert!(manager.reset("external").await.is_ok());
        assert!(manager.reset("knowledge").await.is_ok());
    }
}
