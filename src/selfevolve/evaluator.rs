//! Evaluator role: quality assessment with stop-token convergence detection.
//!
//! The evaluator reads the original question (never the refined prompt) and
//! the current answer, and produces textual feedback.  Convergence is
//! signalled by a standalone stop token in that feedback; the detector is
//! deliberately conservative so instructional mentions of the token, or
//! feedback that reports errors, never terminate the loop early.

use crate::selfevolve::agent::{
    context_keys, Agent, AgentContext, AgentError, AgentMetadata, AgentResult,
};
use crate::selfevolve::prompts;
use crate::selfevolve::provider::{CompletionOptions, Provider};
use async_trait::async_trait;
use log::{error, info};
use regex::Regex;
use std::sync::Arc;

/// Phrases that mark a stop-token mention as guideline text rather than a
/// verdict ("remember to use the stop token...").
const GUIDELINE_PHRASES: &[&str] = &[
    "remember to use",
    "use the",
    "token when",
    "requires you to use",
    "should use",
    "need to use",
    "supposed to use",
];

/// Evaluator agent.  Runs at temperature 0.0 for consistent judgements.
pub struct EvaluatorAgent {
    provider: Arc<dyn Provider>,
    system_prompt: String,
    temperature: f32,
    stop_token: String,
    stop_re: Regex,
}

impl EvaluatorAgent {
    /// Create an evaluator using the default stop token `<stop>`.
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self::with_stop_token(provider, "<stop>")
    }

    /// Create an evaluator with a custom stop-token literal.
    pub fn with_stop_token(provider: Arc<dyn Provider>, stop_token: impl Into<String>) -> Self {
        let stop_token = stop_token.into();
        // Standalone occurrences only: the token must sit at a whitespace or
        // punctuation boundary on both sides.
        let pattern = format!(
            r"(?:^|\s){}(?:$|[\s.,!?;:])",
            regex::escape(&stop_token)
        );
        let stop_re = Regex::new(&pattern).expect("stop-token pattern is always valid");
        Self {
            provider,
            system_prompt: prompts::evaluator_system_prompt(&stop_token),
            temperature: 0.0,
            stop_token,
            stop_re,
        }
    }

    /// Replace the system prompt (builder pattern).
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// The configured stop-token literal.
    pub fn stop_token(&self) -> &str {
        &self.stop_token
    }

    /// Decide whether `text` carries a genuine stop verdict.
    ///
    /// Requires a boundary-anchored occurrence of the token, no mention of
    /// "error" anywhere in the text, and none of the guideline phrases that
    /// indicate the feedback is explaining how the token should be used.
    pub fn detect_stop_token(&self, text: &str) -> bool {
        // A trailing token with nothing after it: the boundary regex needs a
        // terminator class or end-of-text, which `$` provides.
        if !self.stop_re.is_match(text) {
            return false;
        }

        let lower = text.to_lowercase();
        if lower.contains("error") {
            return false;
        }
        for phrase in GUIDELINE_PHRASES {
            if lower.contains(phrase) {
                return false;
            }
        }
        true
    }

    fn non_stopping_result(output: &str, feedback: &str, error_text: Option<String>) -> AgentResult {
        AgentResult {
            output: output.to_string(),
            feedback: Some(feedback.to_string()),
            metadata: AgentMetadata {
                should_stop: false,
                error: error_text,
                ..Default::default()
            },
            tokens_used: 0,
        }
    }
}

#[async_trait]
impl Agent for EvaluatorAgent {
    fn role(&self) -> &str {
        "evaluator"
    }

    async fn run(&self, context: &AgentContext) -> Result<AgentResult, AgentError> {
        let answer = match context.output.as_deref().filter(|o| !o.trim().is_empty()) {
            Some(answer) => answer,
            None => {
                error!("No output provided for evaluation");
                return Ok(Self::non_stopping_result(
                    "Cannot evaluate: no answer provided",
                    "No answer to evaluate",
                    None,
                ));
            }
        };

        let evaluation_prompt = prompts::build_evaluation_prompt(
            &context.prompt,
            answer,
            context.extra(context_keys::CONSTRAINTS),
            context.extra(context_keys::GENERATOR_REASONING),
        );

        let completion = self
            .provider
            .complete_with_functions(&evaluation_prompt, &self.system_prompt, self.temperature, &[])
            .await
            .map(|r| r.content);

        let evaluation = match completion {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                error!("Evaluation failed: {}; falling back to rating prompt", e);
                let fallback_prompt = format!(
                    "Rate this answer and explain its weaknesses. Q: {} A: {}",
                    context.prompt, answer
                );
                match self
                    .provider
                    .complete(&fallback_prompt, &self.system_prompt, 0.0, &CompletionOptions::default())
                    .await
                {
                    Ok(text) => {
                        let tokens_used = self.provider.count_tokens(&fallback_prompt)
                            + self.provider.count_tokens(&text);
                        return Ok(AgentResult {
                            output: text.clone(),
                            feedback: Some(text),
                            metadata: AgentMetadata {
                                fallback: true,
                                error: Some(e.to_string()),
                                ..Default::default()
                            },
                            tokens_used,
                        });
                    }
                    Err(fallback_error) => {
                        error!("Fallback evaluation also failed: {}", fallback_error);
                        return Ok(Self::non_stopping_result(
                            "Evaluation failed",
                            "Unable to evaluate answer",
                            Some(fallback_error.to_string()),
                        ));
                    }
                }
            }
        };

        // An empty or placeholder evaluation must never trigger stoppage.
        if evaluation.is_empty() || evaluation == "Cannot evaluate: no answer provided" {
            error!("Invalid evaluation: empty or placeholder response");
            let mut result = Self::non_stopping_result(
                "Evaluation failed",
                "Invalid evaluation: empty or placeholder response",
                None,
            );
            result.metadata.status = Some("invalid_evaluation".to_string());
            return Ok(result);
        }

        let tokens_used =
            self.provider.count_tokens(&evaluation_prompt) + self.provider.count_tokens(&evaluation);
        let should_stop = self.detect_stop_token(&evaluation);
        let reasoning_summary = self.provider.last_reasoning_summary().await;
        let reasoning_tokens = self.provider.last_reasoning_tokens().await;

        info!(
            "Evaluation complete. Should stop: {}, tokens: {}",
            should_stop, tokens_used
        );

        Ok(AgentResult {
            output: evaluation.clone(),
            feedback: Some(evaluation),
            metadata: AgentMetadata {
                should_stop,
                reasoning_summary: if reasoning_summary.is_empty() {
                    None
                } else {
                    Some(reasoning_summary)
                },
                reasoning_tokens,
                ..Default::default()
            },
            tokens_used,
        })
    }
}
