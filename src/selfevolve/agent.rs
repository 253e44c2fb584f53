//! Agent roles over a shared provider.
//!
//! An agent is the minimal wrapper `{role name, provider, system prompt,
//! temperature}` with role-specific post-processing of the provider
//! response.  Roles are concrete implementers of the [`Agent`] trait
//! differing only in prompt and metadata extraction; there is no
//! inheritance hierarchy, per the capability-set design.
//!
//! This module holds the trait and shared context/result types plus the two
//! generation roles ([`GeneratorAgent`], [`SpecialistAgent`]); the
//! evaluator, refiner, and professor live in their own modules.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use selfevolve::agent::{Agent, AgentContext, GeneratorAgent};
//! use selfevolve::providers::openai::OpenAiCompatProvider;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = Arc::new(OpenAiCompatProvider::new("key", "gpt-4.1-mini"));
//! let generator = GeneratorAgent::new(provider);
//! let result = generator
//!     .run(&AgentContext::from_prompt("What is the 10th Fibonacci number?"))
//!     .await?;
//! println!("{}", result.output);
//! # Ok(())
//! # }
//! ```

use crate::selfevolve::professor::SpecialistConsultation;
use crate::selfevolve::prompts;
use crate::selfevolve::provider::{CompletionOptions, Provider, ProviderError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Keys recognised in [`AgentContext::additional`].
pub mod context_keys {
    /// Problem constraints, forwarded verbatim.
    pub const CONSTRAINTS: &str = "constraints";
    /// Additional problem context, forwarded verbatim.
    pub const CONTEXT: &str = "context";
    /// Reasoning summary captured from the generator, offered to the
    /// evaluator.
    pub const GENERATOR_REASONING: &str = "generator_reasoning_summary";
    /// Reasoning summary captured from the evaluator, offered to the
    /// refiner.
    pub const EVALUATOR_REASONING: &str = "evaluator_reasoning_summary";
    /// Current answer text, offered to the refiner.
    pub const CURRENT_ANSWER: &str = "current_answer";
    /// One-based iteration index, offered to the refiner.
    pub const ITERATION: &str = "iteration";
}

/// Input carried into an [`Agent::run`] call.
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    /// The prompt this role should operate on.
    pub prompt: String,
    /// Prior output under evaluation (set for the evaluator).
    pub output: Option<String>,
    /// Evaluator feedback (set for the refiner).
    pub feedback: Option<String>,
    /// Role-specific extras; see [`context_keys`].
    pub additional: HashMap<String, String>,
}

impl AgentContext {
    /// Create a context holding only a prompt.
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Attach the output under evaluation (builder pattern).
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Attach evaluator feedback (builder pattern).
    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = Some(feedback.into());
        self
    }

    /// Attach an additional key/value pair (builder pattern).
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional.insert(key.into(), value.into());
        self
    }

    /// Fetch an additional value by key, treating empty strings as absent.
    pub fn extra(&self, key: &str) -> Option<&str> {
        self.additional
            .get(key)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Metadata attached to an [`AgentResult`].
///
/// Most fields stay at their defaults for most roles: only the evaluator
/// sets `should_stop`, and only the professor populates the specialist
/// fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetadata {
    /// Evaluator verdict that the loop should terminate.
    #[serde(default)]
    pub should_stop: bool,
    /// Reasoning summary captured from the provider for this call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_summary: Option<String>,
    /// Reasoning tokens billed for this call.
    #[serde(default)]
    pub reasoning_tokens: usize,
    /// Set when the role fell back from its primary strategy (rule-based
    /// refinement, plain-completion professor fallback, rating-prompt
    /// evaluation).
    #[serde(default)]
    pub fallback: bool,
    /// Error text when the role absorbed a failure instead of surfacing it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Role-specific status marker (e.g. `"skipped_invalid_output"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Number of specialist consultations performed (professor only).
    #[serde(default)]
    pub specialist_consultations: usize,
    /// Full consultation records (professor only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub specialist_results: Vec<SpecialistConsultation>,
    /// Set when prompt material was compacted to fit the context window,
    /// here or in any child run.
    #[serde(default)]
    pub context_truncated: bool,
}

/// Output of an [`Agent::run`] call.
#[derive(Debug, Clone, Default)]
pub struct AgentResult {
    /// The role's primary text output.
    pub output: String,
    /// Feedback channel (the evaluator mirrors its output here).
    pub feedback: Option<String>,
    /// Role metadata; see [`AgentMetadata`].
    pub metadata: AgentMetadata,
    /// Tokens attributed to this call.
    pub tokens_used: usize,
}

/// Failure surfaced from an agent.
///
/// Generation roles propagate provider failures so the engine's retry
/// policy can engage; the evaluator and refiner absorb failures into
/// fallback results instead.
#[derive(Debug)]
pub enum AgentError {
    /// The underlying provider call failed.
    Provider(ProviderError),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Provider(e) => write!(f, "Agent provider failure: {}", e),
        }
    }
}

impl Error for AgentError {}

impl From<ProviderError> for AgentError {
    fn from(e: ProviderError) -> Self {
        AgentError::Provider(e)
    }
}

/// A named role that wraps a provider.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable role name (`"generator"`, `"evaluator"`, `"refiner"`,
    /// `"specialist"`, `"professor"`).
    fn role(&self) -> &str;

    /// Execute the role against the given context.
    async fn run(&self, context: &AgentContext) -> Result<AgentResult, AgentError>;
}

/// Generator role: answers the prompt it is given.
///
/// No stop detection: `should_stop` is never set by this role.
pub struct GeneratorAgent {
    provider: Arc<dyn Provider>,
    system_prompt: String,
    temperature: f32,
}

impl GeneratorAgent {
    /// Create a generator with the default system prompt and temperature 0.7.
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            system_prompt: prompts::generator_system_prompt(),
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

#[async_trait]
impl Agent for GeneratorAgent {
    fn role(&self) -> &str {
        "generator"
    }

    async fn run(&self, context: &AgentContext) -> Result<AgentResult, AgentError> {
        let output = self
            .provider
            .complete(
                &context.prompt,
                &self.system_prompt,
                self.temperature,
                &CompletionOptions::default(),
            )
            .await?;

        let reasoning_summary = self.provider.last_reasoning_summary().await;
        let reasoning_tokens = self.provider.last_reasoning_tokens().await;
        let tokens_used =
            self.provider.count_tokens(&context.prompt) + self.provider.count_tokens(&output);

        Ok(AgentResult {
            output,
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
}

/// Specialist role: a generator bound to a domain, used for
/// professor-delegated sub-problems.
pub struct SpecialistAgent {
    domain: String,
    provider: Arc<dyn Provider>,
    system_prompt: String,
    temperature: f32,
}

impl SpecialistAgent {
    /// Create a specialist for the given domain.
    pub fn new(domain: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        let domain = domain.into();
        let system_prompt = prompts::specialist_system_prompt(&domain);
        Self {
            domain,
            provider,
            system_prompt,
            temperature: 0.5,
        }
    }

    /// The specialist's domain tag.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Override the sampling temperature (builder pattern).
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl Agent for SpecialistAgent {
    fn role(&self) -> &str {
        "specialist"
    }

    async fn run(&self, context: &AgentContext) -> Result<AgentResult, AgentError> {
        let output = self
            .provider
            .complete(
                &context.prompt,
                &self.system_prompt,
                self.temperature,
                &CompletionOptions::default(),
            )
            .await?;

        let reasoning_summary = self.provider.last_reasoning_summary().await;
        let reasoning_tokens = self.provider.last_reasoning_tokens().await;
        let tokens_used =
            self.provider.count_tokens(&context.prompt) + self.provider.count_tokens(&output);

        Ok(AgentResult {
            output,
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
}
