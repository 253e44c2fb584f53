//! Shared primitives for provider-agnostic LLM access.
//!
//! Everything above the transport layer interacts with language models
//! through the [`Provider`] trait and the lightweight data types defined in
//! this module.  The trait abstracts over concrete vendor implementations
//! while the supporting structs describe completion options, tool
//! specifications, and structured function-call responses.
//!
//! Two accounting channels are exposed per provider instance:
//!
//! - **Token counting** via [`Provider::count_tokens`], a deterministic
//!   approximation used by agents to attribute cost to each role.
//! - **Reasoning traces** via [`Provider::last_reasoning_summary`] and
//!   [`Provider::last_reasoning_tokens`], slot-backed accessors that reflect
//!   the most recent call on the instance.  Implementations that surface
//!   reasoning data override [`Provider::reasoning_slot`]; the default
//!   reports nothing.
//!
//! # Implementing a provider
//!
//! ```rust
//! use async_trait::async_trait;
//! use selfevolve::provider::{CompletionOptions, Provider, ProviderError};
//!
//! struct EchoProvider;
//!
//! #[async_trait]
//! impl Provider for EchoProvider {
//!     async fn complete(
//!         &self,
//!         prompt: &str,
//!         _system_prompt: &str,
//!         _temperature: f32,
//!         _options: &CompletionOptions,
//!     ) -> Result<String, ProviderError> {
//!         Ok(prompt.to_string())
//!     }
//!
//!     fn model_name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     fn provider_name(&self) -> &str {
//!         "echo"
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;

/// Classified failure from a provider call.
///
/// Providers retry transient conditions internally (see the retry policy on
/// the concrete implementations); an `Err` surfaced through the trait means
/// the configured ceiling was exhausted or the failure is not retryable.
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// Network failures, timeouts, HTTP 5xx, or empty-content responses that
    /// persisted past the retry ceiling.
    Transient(String),

    /// HTTP 429 or an equivalent throttling signal that persisted past the
    /// retry ceiling.
    RateLimited(String),

    /// A response body or tool-call argument string that could not be parsed
    /// even with the tolerant strategies.
    Parse(String),

    /// A non-retryable request failure (HTTP 4xx other than 429, malformed
    /// configuration, unsupported operation).
    Request(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Transient(msg) => write!(f, "Transient provider error: {}", msg),
            ProviderError::RateLimited(msg) => write!(f, "Rate limited: {}", msg),
            ProviderError::Parse(msg) => write!(f, "Parse error: {}", msg),
            ProviderError::Request(msg) => write!(f, "Request error: {}", msg),
        }
    }
}

impl Error for ProviderError {}

/// Per-call options accepted by [`Provider::complete`].
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    /// Request a streamed response.  Providers that cannot stream, or whose
    /// stream fails mid-flight, transparently fall back to a non-streaming
    /// request for the same logical call.
    pub stream: bool,
    /// Upper bound on generated tokens, when the endpoint supports one.
    pub max_tokens: Option<u32>,
    /// Per-call deadline override.  `None` uses the provider's configured
    /// timeout.
    pub timeout: Option<Duration>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            stream: false,
            max_tokens: None,
            timeout: None,
        }
    }
}

/// Provider-agnostic tool schema forwarded with a function-calling request.
///
/// Serialised as an OpenAI-compatible `tools` array entry before
/// transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name as it will appear in the API `tools` array.
    pub name: String,
    /// Human-readable description surfaced to the LLM to aid tool selection.
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters_schema: serde_json::Value,
    /// Request strict schema adherence from providers that support it.
    pub strict: bool,
}

/// A single structured tool call extracted from a provider response.
///
/// `arguments` always holds the parsed form; `parse_strategy` records which
/// tolerant strategy produced it (see
/// [`providers::lenient`](crate::selfevolve::providers::lenient)) so that
/// repair rates are observable downstream.  A call whose arguments defeated
/// every strategy is kept with `Value::Null` arguments and the `"failed"`
/// label; orchestrators skip it and proceed with the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Tool name matching one of the [`ToolSpec`]s sent in the request.
    pub name: String,
    /// Parsed JSON arguments supplied by the LLM for this call.
    pub arguments: serde_json::Value,
    /// Label of the parse strategy that produced `arguments`.
    pub parse_strategy: String,
}

/// Structured response from [`Provider::complete_with_functions`].
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    /// Assistant text content.  May be empty when the model chose to only
    /// emit tool calls.
    pub content: String,
    /// Ordered tool calls requested by the model.
    pub function_calls: Vec<FunctionCall>,
}

/// Reasoning data captured from the most recent call on a provider instance.
#[derive(Debug, Clone, Default)]
pub struct ReasoningTrace {
    /// Model-produced reasoning summary, empty when none was returned.
    pub summary: String,
    /// Billed reasoning tokens, zero when the endpoint reports none.
    pub tokens: usize,
}

/// Deterministic token-count approximation shared by providers that do not
/// ship a tokenizer: one token per four characters, with the word count as a
/// floor so terse inputs are not undercounted.
pub fn approx_token_count(text: &str) -> usize {
    let by_chars = (text.chars().count() + 3) / 4;
    let by_words = text.split_whitespace().count();
    by_chars.max(by_words)
}

/// Trait-driven abstraction over a concrete LLM endpoint.
///
/// Implementations must be thread-safe (`Send + Sync`) so one instance can
/// be shared by the agents of an engine.  The engine never issues parallel
/// calls for a single job, but independent jobs run concurrently and
/// instantiate their own providers.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Plain text completion.
    ///
    /// Implementations update their reasoning slot (if any) atomically with
    /// the call, and apply the reasoning-fallback rule: a response with empty
    /// textual content but non-empty reasoning text returns the reasoning
    /// text as the content.
    async fn complete(
        &self,
        prompt: &str,
        system_prompt: &str,
        temperature: f32,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError>;

    /// Structured tool-call completion.
    ///
    /// The default implementation falls back to [`Provider::complete`] and
    /// returns the text with no function calls, which is the documented
    /// behaviour for providers lacking native function-calling support.
    async fn complete_with_functions(
        &self,
        prompt: &str,
        system_prompt: &str,
        temperature: f32,
        _tools: &[ToolSpec],
    ) -> Result<ProviderResponse, ProviderError> {
        let content = self
            .complete(prompt, system_prompt, temperature, &CompletionOptions::default())
            .await?;
        Ok(ProviderResponse {
            content,
            function_calls: Vec::new(),
        })
    }

    /// Approximate token count for `text`.  Deterministic for a given text
    /// and provider.
    fn count_tokens(&self, text: &str) -> usize {
        approx_token_count(text)
    }

    /// Identifier used to select the upstream model (e.g. `"gpt-4.1"`).
    fn model_name(&self) -> &str;

    /// Short name of the provider family (e.g. `"openai"`).
    fn provider_name(&self) -> &str;

    /// Shared mutable slot where the implementation persists reasoning data.
    ///
    /// By default providers report no reasoning trace.  Implementations that
    /// extract reasoning summaries or token counts return
    /// `Some(&Mutex<ReasoningTrace>)` so the accessor methods can surface the
    /// recorded values.
    fn reasoning_slot(&self) -> Option<&Mutex<ReasoningTrace>> {
        None
    }

    /// Reasoning summary from the most recent call, or an empty string.
    async fn last_reasoning_summary(&self) -> String {
        match self.reasoning_slot() {
            Some(slot) => slot.lock().await.summary.clone(),
            None => String::new(),
        }
    }

    /// Reasoning tokens billed for the most recent call, or zero.
    async fn last_reasoning_tokens(&self) -> usize {
        match self.reasoning_slot() {
            Some(slot) => slot.lock().await.tokens,
            None => 0,
        }
    }

    /// Whether the provider keeps server-stored conversation state and can
    /// honour true continuations.  When `false`, the continuation operations
    /// below fall back to fresh conversations starting from the latest text.
    fn supports_conversation_state(&self) -> bool {
        false
    }

    /// Continue the current conversation with a follow-up message.
    ///
    /// Default: a fresh completion seeded with the follow-up text.
    async fn continue_conversation(
        &self,
        follow_up: &str,
        system_prompt: &str,
        temperature: f32,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        self.complete(follow_up, system_prompt, temperature, options).await
    }

    /// Continue a function-calling exchange by submitting tool outputs.
    ///
    /// Default: a fresh completion seeded with the serialized outputs.
    async fn continue_function_calling(
        &self,
        function_outputs: &str,
        system_prompt: &str,
        temperature: f32,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        self.complete(function_outputs, system_prompt, temperature, options)
            .await
    }
}
