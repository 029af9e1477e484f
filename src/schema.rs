//! Structured output schemas.
//!
//! Tasks may name a schema their output must satisfy. Schemas are
//! registered at startup and resolved at compile time; at runtime a parse
//! failure is a guardrail-style reject that consumes a retry slot.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Accepted JSON types for a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
        }
    }
}

/// One required top-level field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

/// A named output contract: a JSON object with required typed fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSchema {
    pub name: String,
    pub fields: Vec<SchemaField>,
}

impl OutputSchema {
    /// Parse and validate a raw output against this schema.
    pub fn check(&self, raw: &str) -> Result<Value, String> {
        let candidate = extract_json(raw).unwrap_or_else(|| raw.trim().to_string());
        let value: Value = serde_json::from_str(&candidate)
            .map_err(|e| format!("output is not valid JSON: {}", e))?;
        let object = value
            .as_object()
            .ok_or_else(|| "output is not a JSON object".to_string())?;
        for field in &self.fields {
            match object.get(&field.name) {
                None => return Err(format!("missing required field '{}'", field.name)),
                Some(v) if !field.field_type.matches(v) => {
                    return Err(format!(
                        "field '{}' is not of type {:?}",
                        field.name, field.field_type
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(value)
    }
}

/// Startup-time registry of named schemas.
#[derive(Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, OutputSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, schema: OutputSchema) {
        self.schemas.write().insert(schema.name.clone(), schema);
    }

    pub fn get(&self, name: &str) -> Option<OutputSchema> {
        self.schemas.read().get(name).cloned()
    }

    pub fn knows(&self, name: &str) -> bool {
        self.schemas.read().contains_key(name)
    }
}

/// Pull a JSON payload out of raw text: the trimmed whole, or the first
/// fenced code block.
fn extract_json(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Some(trimmed.to_string());
    }
    let fence_start = trimmed.find("```")?;
    let after = &trimmed[fence_start + 3..];
    let body_start = after.find('\n')?;
    let body = &after[body_start + 1..];
    let fence_end = body.find("```")?;
    Some(body[..fence_end].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> OutputSchema {
        OutputSchema {
            name: "memo".to_string(),
            fields: vec![
                SchemaField {
                    name: "title".to_string(),
                    field_type: FieldType::String,
                },
                SchemaField {
                    name: "sections".to_string(),
                    field_type: FieldType::Array,
                },
            ],
        }
    }

    #[test]
    fn test_valid_output_passes() {
        let value = schema()
            .check(r#"{"title": "Q3", "sections": ["intro"]}"#)
            .unwrap();
        assert_eq!(value["title"], "Q3");
    }

    #[test]
    fn test_fenced_output_passes() {
        let raw = "Here is the memo:\n```json\n{\"title\": \"Q3\", \"sections\": []}\n```";
        assert!(schema().check(raw).is_ok());
    }

    #[test]
    fn test_missing_field_fails() {
        let err = schema().check(r#"{"title": "Q3"}"#).unwrap_err();
        assert!(err.contains("sections"));
    }

    #[test]
    fn test_wrong_type_fails() {
        let err = schema()
            .check(r#"{"title": 3, "sections": []}"#)
            .unwrap_err();
        assert!(err.contains("title"));
    }

    #[test]
    fn test_non_json_fails() {
        assert!(schema().check("plain prose").is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = SchemaRegistry::new();
        registry.register(schema());
        assert!(registry.knows("memo"));
        assert!(!registry.knows("missing"));
        assert_eq!(registry.get("memo").unwrap().fields.len(), 2);
    }
}
