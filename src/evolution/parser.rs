//! Improvement parsing.
//!
//! The evolution crew returns a JSON payload with a top-level `changes`
//! array. Each entry becomes a typed [`Change`]; malformed entries are
//! logged and dropped, and entries of any type the applier is not allowed
//! to execute are demoted to proposals rather than rejected.

use serde_json::{json, Value};

use crate::knowledge::{Category, SectionOp};

/// A typed change proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Create a new knowledge document.
    AddKnowledge {
        category: Category,
        /// Target file, relative to the knowledge root; derived from the
        /// title when absent.
        file: Option<String>,
        title: String,
        content: String,
        tags: Vec<String>,
        reason: String,
    },
    /// Modify a section of an existing document.
    UpdateKnowledge {
        file: String,
        section: Option<String>,
        content: String,
        operation: SectionOp,
        reason: String,
    },
    /// Anything the applier must not execute: config mutations, agent
    /// creation, unknown types. Always recorded as a proposal.
    Proposed(ProposedChange),
}

/// A demoted change, kept verbatim for the proposals log.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedChange {
    /// The declared type, e.g. `update_agent_parameter`.
    pub change_type: String,
    /// Target the change wanted to touch, when stated.
    pub target_path: Option<String>,
    pub reason: Option<String>,
    /// The original entry, untouched.
    pub raw: Value,
}

impl Change {
    /// The wire-format type tag.
    pub fn type_tag(&self) -> &str {
        match self {
            Change::AddKnowledge { .. } => "add_knowledge",
            Change::UpdateKnowledge { .. } => "update_knowledge",
            Change::Proposed(p) => &p.change_type,
        }
    }

    /// One-line description used in the proposals log and suggestions
    /// document.
    pub fn describe(&self) -> String {
        match self {
            Change::AddKnowledge { category, title, reason, .. } => {
                format!("add_knowledge '{}' in {} ({})", title, category, reason)
            }
            Change::UpdateKnowledge { file, section, operation, reason, .. } => format!(
                "update_knowledge {} of '{}'{} ({})",
                match operation {
                    SectionOp::Append => "append",
                    SectionOp::Replace => "replace",
                    SectionOp::Insert => "insert",
                },
                file,
                section
                    .as_deref()
                    .map(|s| format!(" section '{}'", s))
                    .unwrap_or_default(),
                reason
            ),
            Change::Proposed(p) => format!(
                "{} targeting {} ({})",
                p.change_type,
                p.target_path.as_deref().unwrap_or("unspecified target"),
                p.reason.as_deref().unwrap_or("no reason given")
            ),
        }
    }

    /// Serialize back to the wire format. Parsing a payload and
    /// serializing it again yields an equivalent set of changes.
    pub fn to_value(&self) -> Value {
        match self {
            Change::AddKnowledge { category, file, title, content, tags, reason } => {
                let mut object = json!({
                    "type": "add_knowledge",
                    "category": category.as_str(),
                    "title": title,
                    "content": content,
                    "tags": tags,
                    "reason": reason,
                });
                if let Some(file) = file {
                    object["file"] = json!(file);
                }
                object
            }
            Change::UpdateKnowledge { file, section, content, operation, reason } => {
                let mut object = json!({
                    "type": "update_knowledge",
                    "file": file,
                    "content": content,
                    "operation": operation,
                    "reason": reason,
                });
                if let Some(section) = section {
                    object["section"] = json!(section);
                }
                object
            }
            Change::Proposed(p) => p.raw.clone(),
        }
    }
}

/// Parses evolution payloads into change lists.
pub struct ImprovementParser;

impl ImprovementParser {
    /// Parse a raw evolution payload. Returns every well-formed change;
    /// malformed entries are logged and skipped.
    pub fn parse(payload: &str) -> Vec<Change> {
        let Some(root) = extract_payload(payload) else {
            log::warn!("evolution payload contained no JSON object");
            return Vec::new();
        };
        let Some(entries) = root.get("changes").and_then(Value::as_array) else {
            log::warn!("evolution payload has no 'changes' array");
            return Vec::new();
        };

        let mut changes = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            match parse_change(entry) {
                Ok(change) => changes.push(change),
                Err(reason) => {
                    log::warn!("dropping malformed change #{}: {}", i, reason);
                }
            }
        }
        changes
    }
}

fn parse_change(entry: &Value) -> Result<Change, String> {
    let object = entry.as_object().ok_or("entry is not an object")?;
    let change_type = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or("missing 'type'")?;

    match change_type {
        "add_knowledge" => {
            let category: Category = required_str(object, "category")?
                .parse()
                .map_err(|e: String| e)?;
            let title = required_str(object, "title")?.to_string();
            let content = required_str(object, "content")?.to_string();
            Ok(Change::AddKnowledge {
                category,
                file: object.get("file").and_then(Value::as_str).map(String::from),
                title,
                content,
                tags: object
                    .get("tags")
                    .and_then(Value::as_array)
                    .map(|tags| {
                        tags.iter()
                            .filter_map(Value::as_str)
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default(),
                reason: object
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified")
                    .to_string(),
            })
        }
        "update_knowledge" => {
            let file = required_str(object, "file")?.to_string();
            let content = required_str(object, "content")?.to_string();
            let operation = match object.get("operation").and_then(Value::as_str) {
                Some("append") | None => SectionOp::Append,
                Some("replace") => SectionOp::Replace,
                Some("insert") => SectionOp::Insert,
                Some(other) => return Err(format!("unknown operation '{}'", other)),
            };
            Ok(Change::UpdateKnowledge {
                file,
                section: object.get("section").and_then(Value::as_str).map(String::from),
                content,
                operation,
                reason: object
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified")
                    .to_string(),
            })
        }
        other => Ok(Change::Proposed(ProposedChange {
            change_type: other.to_string(),
            target_path: object
                .get("target_path")
                .or_else(|| object.get("file"))
                .and_then(Value::as_str)
                .map(String::from),
            reason: object.get("reason").and_then(Value::as_str).map(String::from),
            raw: entry.clone(),
        })),
    }
}

fn required_str<'a>(
    object: &'a serde_json::Map<String, Value>,
    key: &str,
) -> Result<&'a str, String> {
    let value = object
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing '{}'", key))?;
    if value.trim().is_empty() {
        return Err(format!("'{}' is empty", key));
    }
    Ok(value)
}

/// Find the JSON object in a payload that may wrap it in prose or fences.
fn extract_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    // Fenced block.
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(body_start) = after.find('\n') {
            let body = &after[body_start + 1..];
            if let Some(end) = body.find("```") {
                if let Ok(value) = serde_json::from_str::<Value>(body[..end].trim()) {
                    return Some(value);
                }
            }
        }
    }
    // First balanced brace span.
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    serde_json::from_str::<Value>(&trimmed[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{
        "changes": [
            {"type": "add_knowledge", "category": "agents", "file": "knowledge/agents/x.md",
             "title": "X guidance on Y", "content": "When handling topic Y, consult primary sources first.",
             "tags": ["x", "y"], "reason": "gap"},
            {"type": "update_knowledge", "file": "knowledge/system/notes.md", "section": "Lessons",
             "content": "- verify before summarizing", "operation": "append", "reason": "trace"},
            {"type": "update_agent_parameter", "agent": "research", "parameter": "max_iter", "value": 50}
        ]
    }"#;

    #[test]
    fn test_parse_typed_changes() {
        let changes = ImprovementParser::parse(PAYLOAD);
        assert_eq!(changes.len(), 3);
        assert!(matches!(changes[0], Change::AddKnowledge { .. }));
        assert!(matches!(changes[1], Change::UpdateKnowledge { .. }));
        match &changes[2] {
            Change::Proposed(p) => assert_eq!(p.change_type, "update_agent_parameter"),
            other => panic!("expected proposed change, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_fenced_payload() {
        let fenced = format!("Here are my suggestions:\n```json\n{}\n```", PAYLOAD);
        assert_eq!(ImprovementParser::parse(&fenced).len(), 3);
    }

    #[test]
    fn test_malformed_entries_are_dropped_not_fatal() {
        let payload = r#"{"changes": [
            {"type": "add_knowledge", "category": "agents", "title": "", "content": "x"},
            {"type": "add_knowledge", "category": "nonsense", "title": "t", "content": "c"},
            "not an object",
            {"no_type": true},
            {"type": "update_knowledge", "file": "knowledge/a.md", "content": "ok", "operation": "append"}
        ]}"#;
        let changes = ImprovementParser::parse(payload);
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0], Change::UpdateKnowledge { .. }));
    }

    #[test]
    fn test_empty_or_prose_payload_yields_nothing() {
        assert!(ImprovementParser::parse("no changes needed").is_empty());
        assert!(ImprovementParser::parse(r#"{"verdict": "fine"}"#).is_empty());
    }

    #[test]
    fn test_round_trip_preserves_type_and_fields() {
        let changes = ImprovementParser::parse(PAYLOAD);
        let serialized = serde_json::to_string(&json!({
            "changes": changes.iter().map(Change::to_value).collect::<Vec<_>>()
        }))
        .unwrap();
        let reparsed = ImprovementParser::parse(&serialized);
        assert_eq!(changes, reparsed);
    }

    #[test]
    fn test_unknown_operation_is_malformed() {
        let payload = r#"{"changes": [
            {"type": "update_knowledge", "file": "a.md", "content": "x", "operation": "obliterate"}
        ]}"#;
        assert!(ImprovementParser::parse(payload).is_empty());
    }
}
