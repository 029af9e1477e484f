//! Hallucination guardrail: a composite factuality score from lexical
//! overlap with the task's keywords and, when a knowledge store is
//! available, grounding hits for the output's claim spans.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::GuardrailSettings;
use crate::guardrails::{Guardrail, GuardrailContext, Verdict};
use crate::knowledge::KnowledgeStore;

/// Default composite score floor.
const DEFAULT_THRESHOLD: f64 = 0.7;

/// Claim spans sampled from the output for grounding checks.
const MAX_CLAIM_SPANS: usize = 5;

/// Similarity at which a knowledge hit counts as grounding a claim.
const GROUNDING_SCORE_FLOOR: f32 = 0.5;

/// Words too common to count as task keywords.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "about", "your",
    "their", "have", "will", "would", "should", "each", "when", "then", "than",
];

pub struct HallucinationGuardrail {
    name: String,
    strict: bool,
    threshold: f64,
    knowledge: Option<Arc<KnowledgeStore>>,
}

impl HallucinationGuardrail {
    pub fn new(threshold: f64, knowledge: Option<Arc<KnowledgeStore>>) -> Self {
        Self {
            name: "hallucination".to_string(),
            strict: false,
            threshold,
            knowledge,
        }
    }

    pub fn from_settings(
        settings: &GuardrailSettings,
        knowledge: Option<Arc<KnowledgeStore>>,
    ) -> Self {
        let threshold = settings
            .params
            .get("threshold")
            .and_then(|v| v.as_f64())
            .unwrap_or(DEFAULT_THRESHOLD);
        Self {
            name: settings.effective_name().to_string(),
            strict: settings.strict,
            threshold,
            knowledge,
        }
    }

    fn keywords(text: &str) -> HashSet<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 3 && !STOPWORDS.contains(w))
            .map(String::from)
            .collect()
    }

    fn lexical_overlap(task: &str, output: &str) -> f64 {
        let task_keywords = Self::keywords(task);
        if task_keywords.is_empty() {
            return 1.0;
        }
        let output_keywords = Self::keywords(output);
        let present = task_keywords
            .iter()
            .filter(|k| output_keywords.contains(*k))
            .count();
        present as f64 / task_keywords.len() as f64
    }

    fn claim_spans(output: &str) -> Vec<&str> {
        output
            .split(['.', '\n'])
            .map(str::trim)
            .filter(|span| span.len() >= 40)
            .take(MAX_CLAIM_SPANS)
            .collect()
    }

    async fn grounding_score(
        &self,
        store: &KnowledgeStore,
        output: &str,
    ) -> Result<Option<f64>, anyhow::Error> {
        let spans = Self::claim_spans(output);
        if spans.is_empty() {
            return Ok(None);
        }
        let mut grounded = 0usize;
        for span in &spans {
            let hits = store.search(span, 1, None).await?;
            if hits.iter().any(|h| h.score >= GROUNDING_SCORE_FLOOR) {
                grounded += 1;
            }
        }
        Ok(Some(grounded as f64 / spans.len() as f64))
    }
}

#[async_trait]
impl Guardrail for HallucinationGuardrail {
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
        let lexical = Self::lexical_overlap(context.task_description, output);

        let grounding = match self.knowledge {
            Some(ref store) if !store.is_empty() => self.grounding_score(store, output).await?,
            _ => None,
        };

        let composite = match grounding {
            Some(grounding) => (lexical + grounding) / 2.0,
            None => lexical,
        };

        let mut verdict = if composite < self.threshold {
            Verdict::fail(
                &self.name,
                format!(
                    "factuality score {:.2} below threshold {:.2}",
                    composite, self.threshold
                ),
            )
        } else {
            Verdict::pass(&self.name)
        };
        verdict = verdict
            .with_score(composite)
            .with_detail("lexical_overlap", lexical);
        if let Some(grounding) = grounding {
            verdict = verdict.with_detail("grounding", grounding);
        }
        Ok(verdict)
    }
}
