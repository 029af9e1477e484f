//! Guardrail pipeline: ordered output checks with short-circuit semantics.
//!
//! A guardrail that returns an internal error is fail-open (logged,
//! treated as a pass) so one broken check cannot veto every output; a
//! guardrail marked strict fails closed instead.

pub mod hallucination;
pub mod quality;
pub mod relevance;
pub mod safety;

pub use hallucination::HallucinationGuardrail;
pub use quality::QualityGuardrail;
pub use relevance::RelevanceGuardrail;
pub use safety::SafetyGuardrail;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::GuardrailSettings;
use crate::knowledge::KnowledgeStore;
use crate::rag::Embedder;
use crate::utilities::EngineError;

/// The result of one guardrail check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// Which guardrail produced this verdict.
    pub guardrail: String,
    pub passed: bool,
    pub score: Option<f64>,
    pub reason: Option<String>,
    #[serde(default)]
    pub details: HashMap<String, Value>,
}

impl Verdict {
    pub fn pass(guardrail: &str) -> Self {
        Self {
            guardrail: guardrail.to_string(),
            passed: true,
            score: None,
            reason: None,
            details: HashMap::new(),
        }
    }

    pub fn fail(guardrail: &str, reason: impl Into<String>) -> Self {
        Self {
            guardrail: guardrail.to_string(),
            passed: false,
            score: None,
            reason: Some(reason.into()),
            details: HashMap::new(),
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// What the guardrail sees besides the output itself.
#[derive(Debug, Clone, Copy)]
pub struct GuardrailContext<'a> {
    pub task_description: &'a str,
    pub expected_output: &'a str,
}

/// A predicate on a task's output.
#[async_trait]
pub trait Guardrail: Send + Sync {
    /// Name used in verdicts and task guardrail references.
    fn name(&self) -> &str;

    /// Strict guardrails fail closed on internal errors.
    fn strict(&self) -> bool {
        false
    }

    /// Check the output. `Err` means the guardrail itself broke, which is
    /// distinct from a failing verdict.
    async fn validate(
        &self,
        output: &str,
        context: &GuardrailContext<'_>,
    ) -> Result<Verdict, anyhow::Error>;
}

/// Aggregate outcome of a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// Verdicts in evaluation order, ending at the first failure.
    pub verdicts: Vec<Verdict>,
    pub passed: bool,
}

impl PipelineResult {
    /// The verdict that vetoed the output, if any.
    pub fn failure(&self) -> Option<&Verdict> {
        self.verdicts.iter().find(|v| !v.passed)
    }
}

/// Ordered guardrail list with short-circuit evaluation.
#[derive(Default, Clone)]
pub struct GuardrailPipeline {
    guardrails: Vec<Arc<dyn Guardrail>>,
}

impl GuardrailPipeline {
    pub fn new(guardrails: Vec<Arc<dyn Guardrail>>) -> Self {
        Self { guardrails }
    }

    /// Build the pipeline described by configuration. Unknown types are a
    /// validation error; parameters fall back to their documented defaults.
    pub fn from_settings(
        settings: &[GuardrailSettings],
        embedder: Arc<dyn Embedder>,
        knowledge: Option<Arc<KnowledgeStore>>,
    ) -> Result<Self, EngineError> {
        let mut guardrails: Vec<Arc<dyn Guardrail>> = Vec::with_capacity(settings.len());
        for setting in settings {
            let guardrail: Arc<dyn Guardrail> = match setting.guardrail_type.as_str() {
                "quality" => Arc::new(QualityGuardrail::from_settings(setting)),
                "relevance" => {
                    Arc::new(RelevanceGuardrail::from_settings(setting, embedder.clone()))
                }
                "safety" => Arc::new(SafetyGuardrail::from_settings(setting)?),
                "hallucination" => Arc::new(HallucinationGuardrail::from_settings(
                    setting,
                    knowledge.clone(),
                )),
                other => {
                    return Err(EngineError::Validation(format!(
                        "unknown guardrail type '{}'",
                        other
                    )))
                }
            };
            guardrails.push(guardrail);
        }
        Ok(Self { guardrails })
    }

    /// Number of configured guardrails.
    pub fn len(&self) -> usize {
        self.guardrails.len()
    }

    /// Whether the pipeline has no guardrails.
    pub fn is_empty(&self) -> bool {
        self.guardrails.is_empty()
    }

    /// Subset of this pipeline matching the given names, preserving the
    /// configured order. An empty selection keeps the whole pipeline.
    pub fn select(&self, names: &[String]) -> Self {
        if names.is_empty() {
            return self.clone();
        }
        Self {
            guardrails: self
                .guardrails
                .iter()
                .filter(|g| names.iter().any(|n| n == g.name()))
                .cloned()
                .collect(),
        }
    }

    /// Whether every named guardrail resolves in this pipeline.
    pub fn resolves(&self, names: &[String]) -> Result<(), String> {
        for name in names {
            if !self.guardrails.iter().any(|g| g.name() == name) {
                return Err(format!("guardrail '{}' is not configured", name));
            }
        }
        Ok(())
    }

    /// Run the checks in order, stopping at the first failure.
    pub async fn validate(&self, output: &str, context: &GuardrailContext<'_>) -> PipelineResult {
        let mut verdicts = Vec::with_capacity(self.guardrails.len());
        for guardrail in &self.guardrails {
            let verdict = match guardrail.validate(output, context).await {
                Ok(verdict) => verdict,
                Err(e) if guardrail.strict() => {
                    log::warn!("strict guardrail '{}' errored, failing closed: {}", guardrail.name(), e);
                    Verdict::fail(guardrail.name(), format!("guardrail error: {}", e))
                }
                Err(e) => {
                    log::warn!("guardrail '{}' errored, failing open: {}", guardrail.name(), e);
                    Verdict::pass(guardrail.name())
                        .with_detail("error", e.to_string())
                }
            };
            let failed = !verdict.passed;
            verdicts.push(verdict);
            if failed {
                return PipelineResult {
                    verdicts,
                    passed: false,
                };
            }
        }
        PipelineResult {
            verdicts,
            passed: true,
        }
    }
}

/// Render a failing verdict as the corrective instruction appended to the
/// agent's next prompt.
pub fn corrective_hint(verdict: &Verdict) -> String {
    let mut hint = format!(
        "Your previous answer was rejected by the '{}' check: {}.",
        verdict.guardrail,
        verdict.reason.as_deref().unwrap_or("no reason given")
    );
    if !verdict.details.is_empty() {
        if let Ok(details) = serde_json::to_string(&verdict.details) {
            hint.push_str(&format!(" Details: {}", details));
        }
    }
    hint.push_str(" Produce a corrected answer.");
    hint
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubEmbedder;

    struct AlwaysFail {
        strict: bool,
    }

    #[async_trait]
    impl Guardrail for AlwaysFail {
        fn name(&self) -> &str {
            "broken"
        }
        fn strict(&self) -> bool {
            self.strict
        }
        async fn validate(
            &self,
            _output: &str,
            _context: &GuardrailContext<'_>,
        ) -> Result<Verdict, anyhow::Error> {
            anyhow::bail!("internal failure")
        }
    }

    struct Rejector;

    #[async_trait]
    impl Guardrail for Rejector {
        fn name(&self) -> &str {
            "rejector"
        }
        async fn validate(
            &self,
            _output: &str,
            _context: &GuardrailContext<'_>,
        ) -> Result<Verdict, anyhow::Error> {
            Ok(Verdict::fail("rejector", "always rejects"))
        }
    }

    fn context() -> GuardrailContext<'static> {
        GuardrailContext {
            task_description: "describe rust",
            expected_output: "a paragraph",
        }
    }

    #[tokio::test]
    async fn test_internal_error_fails_open() {
        let pipeline = GuardrailPipeline::new(vec![Arc::new(AlwaysFail { strict: false })]);
        let result = pipeline.validate("output", &context()).await;
        assert!(result.passed);
        assert!(result.verdicts[0].details.contains_key("error"));
    }

    #[tokio::test]
    async fn test_strict_internal_error_fails_closed() {
        let pipeline = GuardrailPipeline::new(vec![Arc::new(AlwaysFail { strict: true })]);
        let result = pipeline.validate("output", &context()).await;
        assert!(!result.passed);
    }

    #[tokio::test]
    async fn test_short_circuits_on_first_failure() {
        let pipeline = GuardrailPipeline::new(vec![
            Arc::new(Rejector),
            Arc::new(AlwaysFail { strict: true }),
        ]);
        let result = pipeline.validate("output", &context()).await;
        assert!(!result.passed);
        // The second guardrail never ran.
        assert_eq!(result.verdicts.len(), 1);
        assert_eq!(result.failure().unwrap().guardrail, "rejector");
    }

    #[test]
    fn test_from_settings_rejects_unknown_type() {
        let settings = vec![GuardrailSettings {
            guardrail_type: "vibes".to_string(),
            name: None,
            strict: false,
            params: HashMap::new(),
        }];
        let result =
            GuardrailPipeline::from_settings(&settings, Arc::new(StubEmbedder::default()), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_select_preserves_order_and_filters() {
        let pipeline = GuardrailPipeline::new(vec![Arc::new(Rejector), Arc::new(AlwaysFail { strict: false })]);
        let subset = pipeline.select(&["broken".to_string()]);
        assert_eq!(subset.len(), 1);
        let all = pipeline.select(&[]);
        assert_eq!(all.len(), 2);
        assert!(pipeline.resolves(&["rejector".to_string()]).is_ok());
        assert!(pipeline.resolves(&["missing".to_string()]).is_err());
    }

    #[test]
    fn test_corrective_hint_mentions_reason_and_details() {
        let verdict = Verdict::fail("relevance", "cosine 0.31 below 0.50")
            .with_detail("cosine", 0.31);
        let hint = corrective_hint(&verdict);
        assert!(hint.contains("relevance"));
        assert!(hint.contains("cosine 0.31 below 0.50"));
        assert!(hint.contains("\"cosine\""));
    }
}
