//! Refiner role: prompt refinement between iterations.
//!
//! Given the prompt that produced the current answer, the answer itself, and
//! the evaluator's feedback, the refiner writes the prompt for the next
//! iteration.  A refined prompt preserves approaches that worked, addresses
//! the identified weaknesses, and keeps accumulated context.  When AI-based
//! refinement fails, a deterministic rule-based refiner keyed off feedback
//! keywords takes over, so the loop never stalls on a refinement failure.

use crate::selfevolve::agent::{
    context_keys, Agent, AgentContext, AgentError, AgentMetadata, AgentResult,
};
use crate::selfevolve::prompts;
use crate::selfevolve::provider::{CompletionOptions, Provider};
use async_trait::async_trait;
use log::warn;
use std::sync::Arc;

/// Refiner agent.
pub struct RefinerAgent {
    provider: Arc<dyn Provider>,
    system_prompt: String,
    temperature: f32,
}

impl RefinerAgent {
    /// Create a refiner with the default system prompt and temperature 0.7.
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            system_prompt: prompts::refiner_system_prompt(),
            temperature: 0.7,
        }
    }

    /// Replace the system prompt (builder pattern).
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Override the sampling temperature (builder pattern).
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Deterministic fallback refinement.
///
/// Maps common feedback keywords onto corrective instructions, adds
/// iteration-specific guidance, appends the feedback verbatim, and closes
/// with the original question so nothing established so far is lost.
pub fn rule_based_refine(
    original_question: &str,
    evaluation_feedback: &str,
    iteration: usize,
) -> String {
    let feedback_lower = evaluation_feedback.to_lowercase();
    let mut refined_parts: Vec<String> = Vec::new();

    if feedback_lower.contains("unclear") || feedback_lower.contains("ambiguous") {
        refined_parts.push("Please provide a clear and detailed solution.".to_string());
    }
    if feedback_lower.contains("incomplete") || feedback_lower.contains("missing") {
        refined_parts
            .push("Make sure to address ALL aspects of the problem completely.".to_string());
    }
    if feedback_lower.contains("calculation") || feedback_lower.contains("mathematical") {
        refined_parts.push(
            "Show all calculation steps clearly and verify your mathematical work.".to_string(),
        );
    }
    if feedback_lower.contains("logical") || feedback_lower.contains("reasoning") {
        refined_parts.push(
            "Explain your reasoning step-by-step with clear logical connections.".to_string(),
        );
    }

    let guidance = match iteration {
        1 => {
            "Previous attempt had issues. Please read the problem more carefully and provide a \
             comprehensive solution."
        }
        2 => {
            "The previous attempts were incomplete. Please ensure you fully understand the \
             problem and provide a complete, verified solution."
        }
        _ => {
            "Focus on accuracy and completeness. Double-check your work before presenting the \
             final answer."
        }
    };
    refined_parts.push(guidance.to_string());
    refined_parts.push(format!(
        "Specific issues to address: {}",
        evaluation_feedback
    ));

    format!("{}\n\n{}", refined_parts.join("\n"), original_question)
}

#[async_trait]
impl Agent for RefinerAgent {
    fn role(&self) -> &str {
        "refiner"
    }

    async fn run(&self, context: &AgentContext) -> Result<AgentResult, AgentError> {
        let feedback = context.feedback.as_deref().unwrap_or("");
        let current_answer = context.extra(context_keys::CURRENT_ANSWER).unwrap_or("");
        let iteration: usize = context
            .extra(context_keys::ITERATION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        let refinement_prompt = prompts::build_refinement_prompt(
            &context.prompt,
            current_answer,
            feedback,
            iteration,
            context.extra(context_keys::EVALUATOR_REASONING),
        );

        match self
            .provider
            .complete(
                &refinement_prompt,
                &self.system_prompt,
                self.temperature,
                &CompletionOptions::default(),
            )
            .await
        {
            Ok(refined) if !refined.trim().is_empty() => {
                let refined = refined.trim().to_string();
                let tokens_used = self.provider.count_tokens(&refinement_prompt)
                    + self.provider.count_tokens(&refined);
                let reasoning_summary = self.provider.last_reasoning_summary().await;
                let reasoning_tokens = self.provider.last_reasoning_tokens().await;
                Ok(AgentResult {
                    output: refined,
                    feedback: None,
                    metadata: AgentMetadata {
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
            Ok(_) => {
                warn!("AI refinement returned empty text; using rule-based refinement");
                Ok(Self::rule_based_result(&context.prompt, feedback, iteration, None))
            }
            Err(e) => {
                warn!("AI refinement failed: {}; using rule-based refinement", e);
                Ok(Self::rule_based_result(
                    &context.prompt,
                    feedback,
                    iteration,
                    Some(e.to_string()),
                ))
            }
        }
    }
}

impl RefinerAgent {
    fn rule_based_result(
        original_question: &str,
        feedback: &str,
        iteration: usize,
        error: Option<String>,
    ) -> AgentResult {
        AgentResult {
            output: rule_based_refine(original_question, feedback, iteration),
            feedback: None,
            metadata: AgentMetadata {
                fallback: true,
                error,
                status: Some("rule_based".to_string()),
                ..Default::default()
            },
            tokens_used: 0,
        }
    }
}
