//! Safety guardrail: prohibited-pattern matching plus a sensitive-topics
//! list that only annotates warnings without failing the output.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::config::GuardrailSettings;
use crate::guardrails::{Guardrail, GuardrailContext, Verdict};
use crate::utilities::EngineError;

pub struct SafetyGuardrail {
    name: String,
    strict: bool,
    prohibited_patterns: Vec<Regex>,
    prohibited_terms: Vec<String>,
    sensitive_topics: Vec<String>,
}

impl SafetyGuardrail {
    pub fn new(
        prohibited_patterns: Vec<Regex>,
        prohibited_terms: Vec<String>,
        sensitive_topics: Vec<String>,
    ) -> Self {
        Self {
            name: "safety".to_string(),
            strict: false,
            prohibited_patterns,
            prohibited_terms,
            sensitive_topics,
        }
    }

    /// Build from config. Bad regexes are a validation error at compile
    /// time rather than a runtime surprise.
    pub fn from_settings(settings: &GuardrailSettings) -> Result<Self, EngineError> {
        let patterns = string_list(&settings.params, "prohibited_patterns");
        let mut prohibited_patterns = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let regex = Regex::new(&pattern).map_err(|e| {
                EngineError::Validation(format!("bad safety pattern '{}': {}", pattern, e))
            })?;
            prohibited_patterns.push(regex);
        }
        Ok(Self {
            name: settings.effective_name().to_string(),
            strict: settings.strict,
            prohibited_patterns,
            prohibited_terms: string_list(&settings.params, "prohibited_terms"),
            sensitive_topics: string_list(&settings.params, "sensitive_topics"),
        })
    }
}

fn string_list(params: &std::collections::HashMap<String, Value>, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl Guardrail for SafetyGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn strict(&self) -> bool {
        self.strict
    }

    async fn validate(
        &self,
        output: &str,
        _context: &GuardrailContext<'_>,
    ) -> Result<Verdict, anyhow::Error> {
        let lowered = output.to_lowercase();

        for pattern in &self.prohibited_patterns {
            if pattern.is_match(output) {
                return Ok(Verdict::fail(
                    &self.name,
                    format!("output matches prohibited pattern '{}'", pattern.as_str()),
                ));
            }
        }

        for term in &self.prohibited_terms {
            if lowered.contains(&term.to_lowercase()) {
                return Ok(Verdict::fail(
                    &self.name,
                    format!("output contains prohibited term '{}'", term),
                ));
            }
        }

        let warnings: Vec<Value> = self
            .sensitive_topics
            .iter()
            .filter(|topic| lowered.contains(&topic.to_lowercase()))
            .map(|topic| Value::String(format!("touches sensitive topic '{}'", topic)))
            .collect();

        let mut verdict = Verdict::pass(&self.name);
        if !warnings.is_empty() {
            verdict = verdict.with_detail("warnings", Value::Array(warnings));
        }
        Ok(verdict)
    }
}
