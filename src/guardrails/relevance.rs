//! Relevance guardrail: cosine similarity between the task description and
//! the output. An embedding failure is reported upward and the pipeline's
//! fail-open handling converts it into a pass for non-strict instances.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::GuardrailSettings;
use crate::guardrails::{Guardrail, GuardrailContext, Verdict};
use crate::rag::{cosine_similarity, Embedder};

/// Default relevance floor.
const DEFAULT_MIN_RELEVANCE: f64 = 0.5;

pub struct RelevanceGuardrail {
    name: String,
    strict: bool,
    min_relevance: f64,
    embedder: Arc<dyn Embedder>,
}

impl RelevanceGuardrail {
    pub fn new(embedder: Arc<dyn Embedder>, min_relevance: f64) -> Self {
        Self {
            name: "relevance".to_string(),
            strict: false,
            min_relevance,
            embedder,
        }
    }

    pub fn from_settings(settings: &GuardrailSettings, embedder: Arc<dyn Embedder>) -> Self {
        let min_relevance = settings
            .params
            .get("min_relevance")
            .and_then(|v| v.as_f64())
            .unwrap_or(DEFAULT_MIN_RELEVANCE);
        Self {
            name: settings.effective_name().to_string(),
            strict: settings.strict,
            min_relevance,
            embedder,
        }
    }
}

#[async_trait]
impl Guardrail for RelevanceGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn strict(&self) -> bool {
        self.strict
    }

    async fn validate(
        &self,
        output: &str,
        context: &GuardrailContext<'_>,
    ) -> Result<Verdict, anyhow::Error> {
        let task_vector = self.embedder.embed(context.task_description).await?;
        let output_vector = self.embedder.embed(output).await?;
        let cosine = cosine_similarity(&task_vector, &output_vector) as f64;

        if cosine < self.min_relevance {
            Ok(Verdict::fail(
                &self.name,
                format!("cosine {:.2} below {:.2}", cosine, self.min_relevance),
            )
            .with_score(cosine)
            .with_detail("cosine", cosine)
            .with_detail("min_relevance", self.min_relevance))
        } else {
            Ok(Verdict::pass(&self.name).with_score(cosine))
        }
    }
}
