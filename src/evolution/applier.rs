//! Improvement application.
//!
//! The applier executes knowledge changes atomically against the store and
//! demotes everything else to the proposals log. A process-wide advisory
//! lock serializes applier runs so two evolution passes never touch the
//! same file concurrently.

use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::EvolutionSettings;
use crate::evolution::parser::Change;
use crate::knowledge::{KnowledgeStore, SectionOp, WriteOutcome};

/// Serializes applier runs process-wide.
static APPLIER_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Shortest content accepted as a real knowledge artifact.
const MIN_CONTENT_CHARS: usize = 16;

/// Logical file that accumulates demoted configuration suggestions.
const CONFIG_SUGGESTIONS_FILE: &str = "system/config_suggestions.md";

/// Section of the suggestions file that demoted changes append to.
const CONFIG_SUGGESTIONS_SECTION: &str = "Suggestions";

/// Terminal state of one change.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "lowercase", tag = "outcome")]
pub enum ChangeOutcome {
    Applied,
    Skipped { reason: String },
    Failed { reason: String },
    Proposed,
}

/// One change with its outcome.
#[derive(Debug)]
pub struct ChangeReport {
    pub change: Change,
    pub outcome: ChangeOutcome,
}

/// Applies parsed changes to the knowledge store.
pub struct ImprovementApplier {
    store: Arc<KnowledgeStore>,
    settings: EvolutionSettings,
}

impl ImprovementApplier {
    pub fn new(store: Arc<KnowledgeStore>, settings: EvolutionSettings) -> Self {
        Self { store, settings }
    }

    /// Apply a batch of changes under the advisory lock. At most
    /// `max_changes` are applied; the surplus, every non-knowledge change,
    /// and (with `auto_apply` off) everything become proposals.
    pub async fn apply(&self, changes: Vec<Change>) -> Vec<ChangeReport> {
        let _guard = APPLIER_LOCK.lock().await;
        let mut reports = Vec::with_capacity(changes.len());
        let mut applied = 0usize;

        for change in changes {
            let outcome = self.apply_one(change.clone(), &mut applied).await;
            reports.push(ChangeReport { change, outcome });
        }
        reports
    }

    async fn apply_one(&self, change: Change, applied: &mut usize) -> ChangeOutcome {
        if let Change::Proposed(_) = change {
            return self.demote(&change).await;
        }
        if !self.settings.auto_apply {
            log::info!("auto_apply is off; demoting '{}'", change.describe());
            return self.demote(&change).await;
        }
        if *applied >= self.settings.max_changes {
            log::info!(
                "change limit of {} reached; demoting '{}'",
                self.settings.max_changes,
                change.describe()
            );
            return self.demote(&change).await;
        }

        match change {
            Change::AddKnowledge {
                category,
                ref file,
                ref title,
                ref content,
                ref tags,
                ..
            } => {
                if let Some(reason) = content_rejection(content) {
                    return ChangeOutcome::Skipped { reason };
                }
                if let Some(file) = file {
                    if !self.store.contains_path(file) {
                        return self.demote_escaping(&change, file).await;
                    }
                }
                match self
                    .store
                    .add(category, file.as_deref(), title, content, tags)
                    .await
                {
                    Ok(WriteOutcome::Applied { .. }) => {
                        *applied += 1;
                        ChangeOutcome::Applied
                    }
                    Ok(WriteOutcome::Skipped { reason }) => ChangeOutcome::Skipped { reason },
                    Err(e) => ChangeOutcome::Failed {
                        reason: e.to_string(),
                    },
                }
            }
            Change::UpdateKnowledge {
                ref file,
                ref section,
                ref content,
                operation,
                ..
            } => {
                if let Some(reason) = content_rejection(content) {
                    return ChangeOutcome::Skipped { reason };
                }
                if !self.store.contains_path(file) {
                    return self.demote_escaping(&change, file).await;
                }
                match self
                    .store
                    .update(file, section.as_deref(), operation, content)
                    .await
                {
                    Ok(WriteOutcome::Applied { .. }) => {
                        *applied += 1;
                        ChangeOutcome::Applied
                    }
                    Ok(WriteOutcome::Skipped { reason }) => ChangeOutcome::Skipped { reason },
                    Err(e) => ChangeOutcome::Failed {
                        reason: e.to_string(),
                    },
                }
            }
            Change::Proposed(_) => unreachable!("handled above"),
        }
    }

    async fn demote_escaping(&self, change: &Change, target: &str) -> ChangeOutcome {
        log::warn!(
            "change targets '{}' outside the knowledge root; demoting to proposal",
            target
        );
        self.demote(change).await
    }

    /// Record a change in the proposals log and append a human-readable
    /// suggestion to the config-suggestions document. The referenced
    /// target is never touched.
    async fn demote(&self, change: &Change) -> ChangeOutcome {
        let entry = json!({
            "recorded_at": Utc::now().to_rfc3339(),
            "change": change.to_value(),
            "description": change.describe(),
        });
        if let Err(e) = self.store.record_proposal(entry) {
            log::warn!("failed to record proposal: {}", e);
        }

        let suggestion = format!("- {}", change.describe());
        if let Err(e) = self
            .store
            .update(
                CONFIG_SUGGESTIONS_FILE,
                Some(CONFIG_SUGGESTIONS_SECTION),
                SectionOp::Append,
                &suggestion,
            )
            .await
        {
            log::warn!("failed to append config suggestion: {}", e);
        }
        ChangeOutcome::Proposed
    }
}

/// Reject content that is a path or stub rather than a real artifact.
fn content_rejection(content: &str) -> Option<String> {
    let trimmed = content.trim();
    let looks_like_path = !trimmed.contains(char::is_whitespace)
        && (trimmed.contains('/') || trimmed.ends_with(".md"));
    if trimmed.chars().count() < MIN_CONTENT_CHARS || looks_like_path {
        return Some("content appears to be a path or stub".to_string());
    }
    None
}
