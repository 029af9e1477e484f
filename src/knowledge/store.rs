//! The knowledge store: a categorized markdown corpus on disk, mirrored
//! into the vector index for retrieval, with section-addressable updates
//! and backup/restore around every mutation.
//!
//! Write discipline: a document mutation takes the per-file lock, writes a
//! timestamped backup of the prior content, applies the edit via a temp
//! file and rename, re-embeds, and updates `index.json`. Any failure after
//! the backup restores the prior bytes, so a file is either fully updated
//! (file + index) or untouched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::knowledge::record::{CatalogEntry, Category, KnowledgeRecord};
use crate::rag::{Embedder, IndexEntry, MetadataFilter, ScoredHit, VectorIndex};
use crate::utilities::paths::{
    self, backup_dir_name, INDEX_FILE, PROPOSALS_LOG_FILE,
};

/// How a section update is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionOp {
    /// Insert text at the end of the named section, creating it if absent.
    Append,
    /// Replace the entire named section body.
    Replace,
    /// Place text immediately after the named section header.
    Insert,
}

/// Outcome of a knowledge write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "outcome")]
pub enum WriteOutcome {
    /// The document was created or updated.
    Applied { id: String, path: String },
    /// Nothing was written; the reason says why.
    Skipped { reason: String },
}

impl WriteOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, WriteOutcome::Applied { .. })
    }
}

/// Optional narrowing for [`KnowledgeStore::search`].
#[derive(Debug, Clone, Default)]
pub struct KnowledgeFilter {
    pub category: Option<Category>,
    pub tag: Option<String>,
}

/// Categorized, section-addressable corpus backed by disk and the vector
/// index.
pub struct KnowledgeStore {
    root: PathBuf,
    backup_root: PathBuf,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    catalog: RwLock<HashMap<String, CatalogEntry>>,
    file_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    dedup_threshold: f32,
}

impl KnowledgeStore {
    /// Open (or create) a store at `root`. The catalog is loaded from
    /// `index.json` and every cataloged document is re-embedded into the
    /// index; documents that fail to read or embed are skipped with a
    /// warning so one bad file cannot block startup.
    pub async fn open(
        root: impl Into<PathBuf>,
        backup_root: impl Into<PathBuf>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        dedup_threshold: f32,
    ) -> Result<Self, anyhow::Error> {
        let root = root.into();
        let backup_root = backup_root.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(&backup_root)?;

        let catalog_path = root.join(INDEX_FILE);
        let catalog: HashMap<String, CatalogEntry> = if catalog_path.exists() {
            let text = std::fs::read_to_string(&catalog_path)?;
            serde_json::from_str(&text).unwrap_or_else(|e| {
                log::warn!("corrupt {}, starting empty: {}", INDEX_FILE, e);
                HashMap::new()
            })
        } else {
            HashMap::new()
        };

        let store = Self {
            root,
            backup_root,
            index,
            embedder,
            catalog: RwLock::new(catalog),
            file_locks: DashMap::new(),
            dedup_threshold,
        };

        let entries: Vec<(String, CatalogEntry)> = store
            .catalog
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();
        for (id, entry) in entries {
            if let Err(e) = store.reindex(&id, &entry).await {
                log::warn!("failed to reindex knowledge document '{}': {}", entry.path, e);
            }
        }

        Ok(store)
    }

    /// The knowledge root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a knowledge-relative path.
    pub fn absolute(&self, rel_path: &str) -> PathBuf {
        self.root.join(rel_path)
    }

    /// Whether a logical path is confined to the knowledge root.
    pub fn contains_path(&self, candidate: &str) -> bool {
        paths::is_within_root(&self.root, Path::new(candidate))
    }

    /// Normalize a target to a knowledge-relative path, rejecting escapes.
    pub fn relative_path(&self, candidate: &str) -> Option<String> {
        paths::relative_to_root(&self.root, Path::new(candidate))
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }

    // -----------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------

    /// Embed the query and return the top-k documents with scores.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&KnowledgeFilter>,
    ) -> Result<Vec<ScoredHit>, anyhow::Error> {
        let vector = self.embedder.embed(query).await?;
        let metadata_filter = filter.and_then(|f| {
            f.category
                .map(|c| MetadataFilter::on("category", c.as_str()))
        });
        // Over-fetch when a tag post-filter applies.
        let fetch = if filter.map_or(false, |f| f.tag.is_some()) {
            k.saturating_mul(4).max(k)
        } else {
            k
        };
        let mut hits = self.index.query(&vector, fetch, metadata_filter.as_ref()).await?;

        if let Some(tag) = filter.and_then(|f| f.tag.as_deref()) {
            hits.retain(|hit| {
                hit.metadata
                    .get("tags")
                    .and_then(Value::as_array)
                    .map_or(false, |tags| tags.iter().any(|t| t.as_str() == Some(tag)))
            });
            hits.truncate(k);
        }
        Ok(hits)
    }

    // -----------------------------------------------------------------
    // Add
    // -----------------------------------------------------------------

    /// Create a new document. A near-duplicate in the same category (cosine
    /// at or above the dedup threshold) or an existing document at the same
    /// path yields a skip, leaving the store unchanged.
    pub async fn add(
        &self,
        category: Category,
        rel_path: Option<&str>,
        title: &str,
        content: &str,
        tags: &[String],
    ) -> Result<WriteOutcome, anyhow::Error> {
        let rel_path = match rel_path {
            Some(p) => match self.relative_path(p) {
                Some(rel) => rel,
                None => {
                    return Ok(WriteOutcome::Skipped {
                        reason: format!("path '{}' escapes the knowledge root", p),
                    })
                }
            },
            None => format!("{}/{}.md", category.as_str(), paths::slugify(title)),
        };

        if self.entry_for_path(&rel_path).is_some() {
            return Ok(WriteOutcome::Skipped {
                reason: format!("document already exists at '{}'", rel_path),
            });
        }

        let body = format!("# {}\n\n{}\n", title, content.trim_end());
        let vector = self.embedder.embed(&body).await?;

        let category_filter = MetadataFilter::on("category", category.as_str());
        let near = self.index.query(&vector, 3, Some(&category_filter)).await?;
        if let Some(top) = near.first() {
            if top.score >= self.dedup_threshold {
                return Ok(WriteOutcome::Skipped {
                    reason: format!(
                        "duplicate of '{}' (similarity {:.2})",
                        top.metadata
                            .get("path")
                            .and_then(Value::as_str)
                            .unwrap_or("?"),
                        top.score
                    ),
                });
            }
        }

        let absolute = self.absolute(&rel_path);
        let lock = self.file_lock(&absolute);
        let _guard = lock.lock().await;

        write_atomic(&absolute, &body)?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let entry = CatalogEntry {
            path: rel_path.clone(),
            category,
            tags: tags.to_vec(),
            created_at: now,
            updated_at: now,
        };

        self.index
            .upsert(vec![IndexEntry {
                id: id.clone(),
                vector,
                metadata: index_metadata(&entry),
                document: body,
            }])
            .await?;

        self.catalog.write().insert(id.clone(), entry);
        self.persist_catalog()?;

        log::info!("knowledge document added at '{}'", rel_path);
        Ok(WriteOutcome::Applied { id, path: rel_path })
    }

    // -----------------------------------------------------------------
    // Update
    // -----------------------------------------------------------------

    /// Atomically modify a file section. A missing file is created; a
    /// missing section is created at the end of the file. A timestamped
    /// backup of the prior content is written before mutation, and on any
    /// failure the file is restored from it byte-for-byte.
    pub async fn update(
        &self,
        target_path: &str,
        section: Option<&str>,
        op: SectionOp,
        content: &str,
    ) -> Result<WriteOutcome, anyhow::Error> {
        let rel_path = match self.relative_path(target_path) {
            Some(rel) => rel,
            None => {
                return Ok(WriteOutcome::Skipped {
                    reason: format!("path '{}' escapes the knowledge root", target_path),
                })
            }
        };
        let absolute = self.absolute(&rel_path);
        let lock = self.file_lock(&absolute);
        let _guard = lock.lock().await;

        let original = if absolute.exists() {
            Some(std::fs::read_to_string(&absolute)?)
        } else {
            None
        };

        let updated = apply_section_edit(original.as_deref().unwrap_or(""), section, op, content);
        if Some(updated.as_str()) == original.as_deref() {
            return Ok(WriteOutcome::Skipped {
                reason: "content is already in place".to_string(),
            });
        }

        let backup = match original {
            Some(ref prior) => Some(self.write_backup(&rel_path, prior)?),
            None => None,
        };

        let result = self
            .commit_update(&rel_path, &absolute, &updated, section)
            .await;
        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.restore(&absolute, backup.as_deref())?;
                log::warn!("knowledge update of '{}' failed and was rolled back: {}", rel_path, e);
                Err(e)
            }
        }
    }

    async fn commit_update(
        &self,
        rel_path: &str,
        absolute: &Path,
        updated: &str,
        section: Option<&str>,
    ) -> Result<WriteOutcome, anyhow::Error> {
        write_atomic(absolute, updated)?;

        // Verify post-state before declaring the write visible.
        let on_disk = std::fs::read_to_string(absolute)?;
        if on_disk != updated {
            anyhow::bail!("post-write verification failed for '{}'", rel_path);
        }

        let vector = self.embedder.embed(updated).await?;
        let (id, entry) = self.upsert_catalog(rel_path)?;
        self.index
            .upsert(vec![IndexEntry {
                id: id.clone(),
                vector,
                metadata: index_metadata(&entry),
                document: updated.to_string(),
            }])
            .await?;
        self.persist_catalog()?;

        log::info!(
            "knowledge document '{}' updated{}",
            rel_path,
            section.map(|s| format!(" (section '{}')", s)).unwrap_or_default()
        );
        Ok(WriteOutcome::Applied {
            id,
            path: rel_path.to_string(),
        })
    }

    // -----------------------------------------------------------------
    // Proposals log
    // -----------------------------------------------------------------

    /// Append a demoted change to `proposals_log.json`.
    pub fn record_proposal(&self, proposal: Value) -> Result<(), anyhow::Error> {
        let path = self.root.join(PROPOSALS_LOG_FILE);
        let mut entries: Vec<Value> = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text).unwrap_or_else(|e| {
                log::warn!("corrupt {}, starting empty: {}", PROPOSALS_LOG_FILE, e);
                Vec::new()
            })
        } else {
            Vec::new()
        };
        entries.push(proposal);
        write_atomic(&path, &serde_json::to_string_pretty(&entries)?)?;
        Ok(())
    }

    /// Every recorded proposal.
    pub fn proposals(&self) -> Result<Vec<Value>, anyhow::Error> {
        let path = self.root.join(PROPOSALS_LOG_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    // -----------------------------------------------------------------
    // Reset
    // -----------------------------------------------------------------

    /// Remove every cataloged document from disk and the index, and
    /// persist the emptied catalog. Backups and the proposals log are
    /// left in place.
    pub async fn reset(&self) -> Result<(), anyhow::Error> {
        let entries: Vec<(String, CatalogEntry)> = self
            .catalog
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        let ids: Vec<String> = entries.iter().map(|(id, _)| id.clone()).collect();
        self.index.delete(&ids).await?;

        for (_, entry) in &entries {
            let absolute = self.absolute(&entry.path);
            let lock = self.file_lock(&absolute);
            let _guard = lock.lock().await;
            if absolute.exists() {
                std::fs::remove_file(&absolute)?;
            }
        }

        self.catalog.write().clear();
        self.persist_catalog()?;
        log::info!("knowledge store reset: {} document(s) removed", entries.len());
        Ok(())
    }

    // -----------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------

    /// Fetch a full record by knowledge-relative path.
    pub fn get(&self, rel_path: &str) -> Option<KnowledgeRecord> {
        let (id, entry) = self.entry_for_path(rel_path)?;
        let content = std::fs::read_to_string(self.absolute(rel_path)).ok()?;
        Some(KnowledgeRecord {
            id,
            category: entry.category,
            path: entry.path,
            section: None,
            content,
            tags: entry.tags,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        })
    }

    /// Number of cataloged documents.
    pub fn len(&self) -> usize {
        self.catalog.read().len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.catalog.read().is_empty()
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        self.file_locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn entry_for_path(&self, rel_path: &str) -> Option<(String, CatalogEntry)> {
        self.catalog
            .read()
            .iter()
            .find(|(_, entry)| entry.path == rel_path)
            .map(|(id, entry)| (id.clone(), entry.clone()))
    }

    /// Existing catalog row for the path, or a fresh one with the category
    /// inferred from the leading path component.
    fn upsert_catalog(&self, rel_path: &str) -> Result<(String, CatalogEntry), anyhow::Error> {
        if let Some((id, mut entry)) = self.entry_for_path(rel_path) {
            entry.updated_at = Utc::now();
            self.catalog.write().insert(id.clone(), entry.clone());
            return Ok((id, entry));
        }
        let category = rel_path
            .split('/')
            .next()
            .and_then(|c| c.parse::<Category>().ok())
            .unwrap_or(Category::General);
        let now = Utc::now();
        let entry = CatalogEntry {
            path: rel_path.to_string(),
            category,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let id = Uuid::new_v4().to_string();
        self.catalog.write().insert(id.clone(), entry.clone());
        Ok((id, entry))
    }

    async fn reindex(&self, id: &str, entry: &CatalogEntry) -> Result<(), anyhow::Error> {
        let content = std::fs::read_to_string(self.absolute(&entry.path))?;
        let vector = self.embedder.embed(&content).await?;
        self.index
            .upsert(vec![IndexEntry {
                id: id.to_string(),
                vector,
                metadata: index_metadata(entry),
                document: content,
            }])
            .await
    }

    fn write_backup(&self, rel_path: &str, content: &str) -> Result<PathBuf, anyhow::Error> {
        let backup_path = self.backup_root.join(backup_dir_name()).join(rel_path);
        if let Some(parent) = backup_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&backup_path, content)?;
        Ok(backup_path)
    }

    fn restore(&self, absolute: &Path, backup: Option<&Path>) -> Result<(), anyhow::Error> {
        match backup {
            Some(backup) => {
                std::fs::copy(backup, absolute)?;
            }
            None => {
                // The file did not exist before this mutation.
                if absolute.exists() {
                    std::fs::remove_file(absolute)?;
                }
            }
        }
        Ok(())
    }

    fn persist_catalog(&self) -> Result<(), anyhow::Error> {
        let catalog = self.catalog.read();
        let text = serde_json::to_string_pretty(&*catalog)?;
        write_atomic(&self.root.join(INDEX_FILE), &text)
    }
}

fn index_metadata(entry: &CatalogEntry) -> HashMap<String, Value> {
    let mut metadata = HashMap::new();
    metadata.insert(
        "category".to_string(),
        Value::String(entry.category.as_str().to_string()),
    );
    metadata.insert("path".to_string(), Value::String(entry.path.clone()));
    metadata.insert(
        "tags".to_string(),
        Value::Array(entry.tags.iter().cloned().map(Value::String).collect()),
    );
    metadata
}

/// Write via a sibling temp file and rename so readers never observe a
/// half-written document.
fn write_atomic(path: &Path, content: &str) -> Result<(), anyhow::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Apply a section edit to markdown content.
///
/// A section is a `#`-heading line plus everything up to the next heading
/// of the same or higher level. With `section = None` the whole file is the
/// section. Missing sections are created at the end of the file.
pub fn apply_section_edit(
    original: &str,
    section: Option<&str>,
    op: SectionOp,
    text: &str,
) -> String {
    let Some(section) = section else {
        return match op {
            SectionOp::Append => {
                if original.trim().is_empty() {
                    format!("{}\n", text.trim_end())
                } else {
                    format!("{}\n{}\n", original.trim_end(), text.trim_end())
                }
            }
            SectionOp::Replace => format!("{}\n", text.trim_end()),
            SectionOp::Insert => {
                if original.trim().is_empty() {
                    format!("{}\n", text.trim_end())
                } else {
                    format!("{}\n{}\n", text.trim_end(), original.trim_end())
                }
            }
        };
    };

    let lines: Vec<&str> = original.lines().collect();
    let Some((start, level)) = find_heading(&lines, section) else {
        // Create the section at the end of the file.
        let mut out = original.trim_end().to_string();
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&format!("## {}\n\n{}\n", section, text.trim_end()));
        return out;
    };

    let end = lines
        .iter()
        .enumerate()
        .skip(start + 1)
        .find(|(_, line)| heading_level(line).map_or(false, |l| l <= level))
        .map(|(i, _)| i)
        .unwrap_or(lines.len());

    let mut out: Vec<String> = Vec::new();
    out.extend(lines[..=start].iter().map(|s| s.to_string()));
    match op {
        SectionOp::Insert => {
            out.push(text.trim_end().to_string());
            out.extend(lines[start + 1..end].iter().map(|s| s.to_string()));
        }
        SectionOp::Append => {
            let body: Vec<String> = lines[start + 1..end]
                .iter()
                .map(|s| s.to_string())
                .collect();
            let trimmed_len = body
                .iter()
                .rposition(|l| !l.trim().is_empty())
                .map(|i| i + 1)
                .unwrap_or(0);
            out.extend(body[..trimmed_len].iter().cloned());
            out.push(text.trim_end().to_string());
            out.extend(body[trimmed_len..].iter().cloned());
        }
        SectionOp::Replace => {
            out.push(String::new());
            out.push(text.trim_end().to_string());
            if end < lines.len() {
                out.push(String::new());
            }
        }
    }
    out.extend(lines[end..].iter().map(|s| s.to_string()));
    let mut result = out.join("\n");
    result.push('\n');
    result
}

fn heading_level(line: &str) -> Option<usize> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if hashes > 0 && trimmed.chars().nth(hashes).map_or(true, |c| c == ' ') {
        Some(hashes)
    } else {
        None
    }
}

fn find_heading(lines: &[&str], section: &str) -> Option<(usize, usize)> {
    lines.iter().enumerate().find_map(|(i, line)| {
        let level = heading_level(line)?;
        let title = line.trim_start().trim_start_matches('#').trim();
        if title.eq_ignore_ascii_case(section.trim()) {
            Some((i, level))
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::InMemoryVectorIndex;
    use crate::testing::{FailingEmbedder, StubEmbedder};
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> KnowledgeStore {
        let index = Arc::new(InMemoryVectorIndex::new(StubEmbedder::DIMENSION));
        KnowledgeStore::open(
            dir.path().join("knowledge"),
            dir.path().join("backups"),
            index,
            Arc::new(StubEmbedder::default()),
            0.92,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_add_creates_file_catalog_and_hit() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let outcome = store
            .add(
                Category::Agents,
                None,
                "Research guidance",
                "Prefer primary sources.",
                &["research".to_string()],
            )
            .await
            .unwrap();
        assert!(outcome.applied());

        let record = store.get("agents/research-guidance.md").unwrap();
        assert!(record.content.contains("Prefer primary sources."));
        assert_eq!(record.category, Category::Agents);

        let hits = store.search("Prefer primary sources.", 3, None).await.unwrap();
        assert_eq!(hits.len(), 1);

        // index.json exists and round-trips.
        let catalog_text =
            std::fs::read_to_string(dir.path().join("knowledge").join(INDEX_FILE)).unwrap();
        assert!(catalog_text.contains("agents/research-guidance.md"));
    }

    #[tokio::test]
    async fn test_add_duplicate_content_is_skipped() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store
            .add(Category::Agents, None, "Guidance", "Prefer primary sources.", &[])
            .await
            .unwrap();
        let outcome = store
            .add(
                Category::Agents,
                Some("agents/guidance-copy.md"),
                "Guidance",
                "Prefer primary sources.",
                &[],
            )
            .await
            .unwrap();
        match outcome {
            WriteOutcome::Skipped { reason } => assert!(reason.contains("duplicate")),
            other => panic!("expected skip, got {:?}", other),
        }
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_add_same_content_other_category_is_allowed() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        store
            .add(Category::Agents, None, "Guidance", "Prefer primary sources.", &[])
            .await
            .unwrap();
        let outcome = store
            .add(Category::Domain, None, "Guidance", "Prefer primary sources.", &[])
            .await
            .unwrap();
        assert!(outcome.applied());
    }

    #[tokio::test]
    async fn test_add_rejects_escape() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let outcome = store
            .add(Category::System, Some("../outside.md"), "Escape", "nope", &[])
            .await
            .unwrap();
        assert!(!outcome.applied());
    }

    #[tokio::test]
    async fn test_update_append_creates_file_and_section() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let outcome = store
            .update(
                "system/config_suggestions.md",
                Some("Suggestions"),
                SectionOp::Append,
                "- raise max_iter for research",
            )
            .await
            .unwrap();
        assert!(outcome.applied());

        let content = std::fs::read_to_string(store.absolute("system/config_suggestions.md")).unwrap();
        assert!(content.contains("## Suggestions"));
        assert!(content.contains("- raise max_iter for research"));
    }

    #[tokio::test]
    async fn test_update_replace_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store
            .add(Category::Domain, Some("domain/notes.md"), "Notes", "## Facts\n\nold body", &[])
            .await
            .unwrap();

        let first = store
            .update("domain/notes.md", Some("Facts"), SectionOp::Replace, "new body")
            .await
            .unwrap();
        assert!(first.applied());
        let after_first = std::fs::read_to_string(store.absolute("domain/notes.md")).unwrap();

        let second = store
            .update("domain/notes.md", Some("Facts"), SectionOp::Replace, "new body")
            .await
            .unwrap();
        assert!(!second.applied());
        let after_second = std::fs::read_to_string(store.absolute("domain/notes.md")).unwrap();
        assert_eq!(after_first, after_second);
        assert!(!after_second.contains("old body"));
    }

    #[tokio::test]
    async fn test_update_writes_backup_before_mutation() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store
            .add(Category::Domain, Some("domain/notes.md"), "Notes", "original", &[])
            .await
            .unwrap();
        let original = std::fs::read_to_string(store.absolute("domain/notes.md")).unwrap();

        store
            .update("domain/notes.md", None, SectionOp::Append, "more")
            .await
            .unwrap();

        // One timestamped backup dir holding the prior bytes.
        let backups: Vec<_> = std::fs::read_dir(dir.path().join("backups"))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(backups.len(), 1);
        let backed_up =
            std::fs::read_to_string(backups[0].path().join("domain/notes.md")).unwrap();
        assert_eq!(backed_up, original);
    }

    #[tokio::test]
    async fn test_failed_update_restores_backup_byte_for_byte() {
        let dir = TempDir::new().unwrap();
        {
            let store = store(&dir).await;
            store
                .add(Category::Domain, Some("domain/notes.md"), "Notes", "original", &[])
                .await
                .unwrap();
        }
        let original = std::fs::read_to_string(
            dir.path().join("knowledge").join("domain/notes.md"),
        )
        .unwrap();

        // Re-open with a broken embedder: the file write succeeds but the
        // re-embed fails, forcing a rollback.
        let index = Arc::new(InMemoryVectorIndex::new(StubEmbedder::DIMENSION));
        let broken = KnowledgeStore::open(
            dir.path().join("knowledge"),
            dir.path().join("backups"),
            index,
            Arc::new(FailingEmbedder),
            0.92,
        )
        .await
        .unwrap();

        let result = broken
            .update("domain/notes.md", None, SectionOp::Append, "more")
            .await;
        assert!(result.is_err());
        let after = std::fs::read_to_string(
            dir.path().join("knowledge").join("domain/notes.md"),
        )
        .unwrap();
        assert_eq!(after, original);
    }

    #[tokio::test]
    async fn test_search_with_category_and_tag_filter() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store
            .add(Category::Agents, None, "Alpha", "alpha knowledge body", &["x".to_string()])
            .await
            .unwrap();
        store
            .add(Category::Domain, None, "Beta", "alpha knowledge body variant", &[])
            .await
            .unwrap();

        let filter = KnowledgeFilter {
            category: Some(Category::Agents),
            tag: Some("x".to_string()),
        };
        let hits = store.search("alpha knowledge body", 5, Some(&filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(
            hits[0].metadata.get("category"),
            Some(&Value::String("agents".to_string()))
        );
    }

    #[tokio::test]
    async fn test_reset_clears_documents_but_keeps_proposals() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store
            .add(Category::Agents, None, "Guidance", "Prefer primary sources.", &[])
            .await
            .unwrap();
        store
            .record_proposal(serde_json::json!({"type": "update_agent_parameter"}))
            .unwrap();

        store.reset().await.unwrap();

        assert!(store.is_empty());
        assert!(store.get("agents/guidance.md").is_none());
        assert!(!store.absolute("agents/guidance.md").exists());
        assert!(store.search("Prefer primary sources.", 3, None).await.unwrap().is_empty());
        // The proposals log survives a reset.
        assert_eq!(store.proposals().unwrap().len(), 1);
        // The emptied catalog is persisted.
        let catalog_text =
            std::fs::read_to_string(dir.path().join("knowledge").join(INDEX_FILE)).unwrap();
        assert_eq!(catalog_text.trim(), "{}");
    }

    #[tokio::test]
    async fn test_proposals_log_appends() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store
            .record_proposal(serde_json::json!({"type": "update_agent_parameter"}))
            .unwrap();
        store
            .record_proposal(serde_json::json!({"type": "create_agent"}))
            .unwrap();
        let proposals = store.proposals().unwrap();
        assert_eq!(proposals.len(), 2);
    }

    #[test]
    fn test_section_edit_append_to_named_section() {
        let original = "# Doc\n\n## Facts\n\n- one\n\n## Other\n\n- rest\n";
        let updated = apply_section_edit(original, Some("Facts"), SectionOp::Append, "- two");
        let facts_idx = updated.find("- two").unwrap();
        let other_idx = updated.find("## Other").unwrap();
        assert!(facts_idx < other_idx);
    }

    #[test]
    fn test_section_edit_insert_after_header() {
        let original = "## Facts\n\n- one\n";
        let updated = apply_section_edit(original, Some("Facts"), SectionOp::Insert, "- zero");
        let zero_idx = updated.find("- zero").unwrap();
        let one_idx = updated.find("- one").unwrap();
        assert!(zero_idx < one_idx);
    }

    #[test]
    fn test_section_edit_replace_keeps_other_sections() {
        let original = "## Facts\n\n- one\n\n## Other\n\n- rest\n";
        let updated = apply_section_edit(original, Some("Facts"), SectionOp::Replace, "- new");
        assert!(!updated.contains("- one"));
        assert!(updated.contains("- new"));
        assert!(updated.contains("## Other"));
        assert!(updated.contains("- rest"));
    }

    #[test]
    fn test_section_edit_whole_file_when_section_none() {
        assert_eq!(
            apply_section_edit("old\n", None, SectionOp::Replace, "new"),
            "new\n"
        );
        assert_eq!(
            apply_section_edit("old\n", None, SectionOp::Append, "new"),
            "old\nnew\n"
        );
        assert_eq!(
            apply_section_edit("old\n", None, SectionOp::Insert, "new"),
            "new\nold\n"
        );
    }

    #[test]
    fn test_section_edit_creates_missing_section() {
        let updated = apply_section_edit("# Doc\n", Some("Facts"), SectionOp::Append, "- one");
        assert!(updated.contains("## Facts"));
        assert!(updated.contains("- one"));
    }
}
