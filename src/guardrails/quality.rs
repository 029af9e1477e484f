//! Quality guardrail: rejects trivially short outputs, unbalanced code
//! fences, and outputs that merely echo the task.

use async_trait::async_trait;

use crate::config::GuardrailSettings;
use crate::guardrails::{Guardrail, GuardrailContext, Verdict};

/// Default minimum output length in characters.
const DEFAULT_MIN_CHARS: usize = 20;

pub struct QualityGuardrail {
    name: String,
    strict: bool,
    min_chars: usize,
}

impl QualityGuardrail {
    pub fn new(min_chars: usize) -> Self {
        Self {
            name: "quality".to_string(),
            strict: false,
            min_chars,
        }
    }

    pub fn from_settings(settings: &GuardrailSettings) -> Self {
        let min_chars = settings
            .params
            .get("min_chars")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MIN_CHARS);
        Self {
            name: settings.effective_name().to_string(),
            strict: settings.strict,
            min_chars,
        }
    }
}

#[async_trait]
impl Guardrail for QualityGuardrail {
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
        let trimmed = output.trim();

        if trimmed.chars().count() < self.min_chars {
            return Ok(Verdict::fail(
                &self.name,
                format!(
                    "output is {} characters, below the minimum of {}",
                    trimmed.chars().count(),
                    self.min_chars
                ),
            ));
        }

        if trimmed.matches("```").count() % 2 != 0 {
            return Ok(Verdict::fail(&self.name, "output has an unclosed code fence"));
        }

        if trimmed == context.task_description.trim() {
            return Ok(Verdict::fail(&self.name, "output merely echoes the task input"));
        }

        Ok(Verdict::pass(&self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> GuardrailContext<'static> {
        GuardrailContext {
            task_description: "summarize the rust borrow checker",
            expected_output: "a summary",
        }
    }

    #[tokio::test]
    async fn test_rejects_short_output() {
        let guardrail = QualityGuardrail::new(20);
        let verdict = guardrail.validate("too short", &context()).await.unwrap();
        assert!(!verdict.passed);
    }

    #[tokio::test]
    async fn test_rejects_unbalanced_fence() {
        let guardrail = QualityGuardrail::new(5);
        let output = "here is code:\n```rust\nfn main() {}";
        let verdict = guardrail.validate(output, &context()).await.unwrap();
        assert!(!verdict.passed);
        assert!(verdict.reason.unwrap().contains("fence"));
    }

    #[tokio::test]
    async fn test_rejects_echo() {
        let guardrail = QualityGuardrail::new(5);
        let verdict = guardrail
            .validate("summarize the rust borrow checker", &context())
            .await
            .unwrap();
        assert!(!verdict.passed);
    }

    #[tokio::test]
    async fn test_passes_substantive_output() {
        let guardrail = QualityGuardrail::new(20);
        let verdict = guardrail
            .validate(
                "The borrow checker enforces aliasing rules at compile time.",
                &context(),
            )
            .await
            .unwrap();
        assert!(verdict.passed);
    }
}
