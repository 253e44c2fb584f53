//! OpenAI-compatible chat-completions provider.
//!
//! [`OpenAiCompatProvider`] speaks the `/chat/completions` wire format used
//! by OpenAI and by the many endpoints that mirror it (OpenRouter, LM
//! Studio, vLLM, Anthropic's compatibility surface).  It implements the full
//! [`Provider`] contract:
//!
//! - plain and function-calling completions with bearer authentication;
//! - streaming over SSE with a transparent non-streaming retry when the
//!   stream fails mid-flight;
//! - bounded retries with exponential backoff and jitter for transient
//!   failures, honouring `Retry-After` on HTTP 429;
//! - empty-content responses treated as errors so the retry policy engages,
//!   except when the reasoning-fallback applies;
//! - reasoning summary/token extraction into the instance's
//!   [`ReasoningTrace`] slot;
//! - tolerant tool-call argument parsing with recorded repair strategies.
//!
//! # Example
//!
//! ```rust,no_run
//! use selfevolve::provider::{CompletionOptions, Provider};
//! use selfevolve::providers::openai::OpenAiCompatProvider;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = OpenAiCompatProvider::new(&std::env::var("OPENAI_API_KEY")?, "gpt-4.1-mini");
//! let text = provider
//!     .complete(
//!         "Summarise the Riemann hypothesis in two sentences.",
//!         "You are a concise mathematician.",
//!         0.7,
//!         &CompletionOptions::default(),
//!     )
//!     .await?;
//! println!("{}", text);
//! # Ok(())
//! # }
//! ```

use crate::selfevolve::provider::{
    CompletionOptions, FunctionCall, Provider, ProviderError, ProviderResponse, ReasoningTrace,
    ToolSpec,
};
use crate::selfevolve::providers::common::{
    backoff_delay, get_shared_http_client, retry_after_delay, SseScanner,
};
use crate::selfevolve::providers::lenient::parse_tool_arguments;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, warn};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::Mutex;

/// Parsed outcome of a single chat-completions round trip.
#[derive(Debug, Default)]
struct ChatOutcome {
    content: String,
    reasoning_summary: String,
    reasoning_tokens: usize,
    function_calls: Vec<FunctionCall>,
}

/// Provider for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiCompatProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    provider_label: String,
    max_retries: usize,
    timeout: Duration,
    reasoning: Mutex<ReasoningTrace>,
}

impl OpenAiCompatProvider {
    /// Create a provider against the default OpenAI base URL.
    pub fn new(api_key: &str, model: &str) -> Self {
        Self::new_with_base_url(api_key, model, "https://api.openai.com/v1")
    }

    /// Create a provider against a custom OpenAI-compatible base URL.
    pub fn new_with_base_url(api_key: &str, model: &str, base_url: &str) -> Self {
        Self {
            http: get_shared_http_client().clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            provider_label: "openai-compat".to_string(),
            max_retries: 3,
            timeout: Duration::from_secs(1_200),
            reasoning: Mutex::new(ReasoningTrace::default()),
        }
    }

    /// Override the retry ceiling for transient failures.
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the provider label reported by
    /// [`Provider::provider_name`].
    pub fn with_provider_label(mut self, label: impl Into<String>) -> Self {
        self.provider_label = label.into();
        self
    }

    fn build_body(
        &self,
        prompt: &str,
        system_prompt: &str,
        temperature: f32,
        options: &CompletionOptions,
        tools: Option<&[ToolSpec]>,
    ) -> Value {
        let mut messages = Vec::new();
        if !system_prompt.is_empty() {
            messages.push(json!({"role": "system", "content": system_prompt}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
        });
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(tools) = tools {
            let wire_tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters_schema,
                            "strict": t.strict,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(wire_tools);
            body["tool_choice"] = json!("auto");
        }
        body
    }

    /// Issue the request with the retry policy applied.
    ///
    /// Streaming, when requested, is attempted first on every round; a
    /// mid-flight stream failure falls straight through to a non-streaming
    /// request for the same logical call before the attempt is counted as
    /// failed.
    async fn request_with_retries(
        &self,
        body: Value,
        options: &CompletionOptions,
    ) -> Result<ChatOutcome, ProviderError> {
        let timeout = options.timeout.unwrap_or(self.timeout);
        let mut last_error = ProviderError::Transient("no attempts made".to_string());

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }

            let result = if options.stream {
                match self.send_streaming(&body, timeout).await {
                    Ok(outcome) => Ok(outcome),
                    Err(stream_err) => {
                        warn!(
                            "streaming request failed ({}); retrying the same call without streaming",
                            stream_err
                        );
                        self.send_blocking(&body, timeout).await
                    }
                }
            } else {
                self.send_blocking(&body, timeout).await
            };

            match result {
                Ok(outcome) => {
                    if outcome.content.is_empty()
                        && outcome.function_calls.is_empty()
                        && outcome.reasoning_summary.is_empty()
                    {
                        last_error =
                            ProviderError::Transient("provider returned empty content".to_string());
                        continue;
                    }
                    self.record_reasoning(&outcome).await;
                    return Ok(outcome);
                }
                Err(err @ ProviderError::Request(_)) => return Err(err),
                Err(ProviderError::RateLimited(msg)) => {
                    if let Some(delay) = msg
                        .rsplit("retry-after=")
                        .next()
                        .and_then(retry_after_delay)
                    {
                        tokio::time::sleep(delay).await;
                    }
                    last_error = ProviderError::RateLimited(msg);
                }
                Err(err) => last_error = err,
            }
        }

        Err(last_error)
    }

    async fn send_blocking(
        &self,
        body: &Value,
        timeout: Duration,
    ) -> Result<ChatOutcome, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .http
            .post(&url)
            .timeout(timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            return Err(ProviderError::RateLimited(format!(
                "HTTP 429 from {} retry-after={}",
                url, retry_after
            )));
        }

        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        if status.is_server_error() {
            return Err(ProviderError::Transient(format!(
                "HTTP {} from {}: {}",
                status, url, text
            )));
        }
        if !status.is_success() {
            return Err(ProviderError::Request(format!(
                "HTTP {} from {}: {}",
                status, url, text
            )));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::Transient(format!("malformed response body: {}", e)))?;
        Ok(Self::parse_chat_document(&parsed))
    }

    async fn send_streaming(
        &self,
        body: &Value,
        timeout: Duration,
    ) -> Result<ChatOutcome, ProviderError> {
        let mut stream_body = body.clone();
        stream_body["stream"] = json!(true);

        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .http
            .post(&url)
            .timeout(timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&stream_body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Transient(format!(
                "HTTP {} from {} (streaming): {}",
                status, url, text
            )));
        }

        let mut scanner = SseScanner::new();
        let mut outcome = ChatOutcome::default();
        let mut byte_stream = resp.bytes_stream();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.map_err(|e| ProviderError::Transient(e.to_string()))?;
            let chunk_text = String::from_utf8_lossy(&chunk);
            for frame in scanner.push(&chunk_text) {
                Self::absorb_stream_frame(&frame, &mut outcome);
            }
        }
        if let Some(frame) = scanner.finish() {
            Self::absorb_stream_frame(&frame, &mut outcome);
        }

        Ok(outcome)
    }

    fn absorb_stream_frame(frame: &str, outcome: &mut ChatOutcome) {
        let doc: Value = match serde_json::from_str(frame) {
            Ok(doc) => doc,
            Err(e) => {
                // Partial frames from flaky proxies are dropped, not fatal.
                debug!("discarding unparseable stream frame: {}", e);
                return;
            }
        };
        if let Some(delta) = doc
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
        {
            if let Some(piece) = delta.get("content").and_then(|v| v.as_str()) {
                outcome.content.push_str(piece);
            }
            for key in &["reasoning", "reasoning_content"] {
                if let Some(piece) = delta.get(*key).and_then(|v| v.as_str()) {
                    outcome.reasoning_summary.push_str(piece);
                }
            }
        }
        if let Some(tokens) = doc
            .get("usage")
            .and_then(|u| u.get("completion_tokens_details"))
            .and_then(|d| d.get("reasoning_tokens"))
            .and_then(|v| v.as_u64())
        {
            outcome.reasoning_tokens = tokens as usize;
        }
    }

    fn parse_chat_document(doc: &Value) -> ChatOutcome {
        let message = doc
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"));

        let content = message
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let reasoning_summary = message
            .and_then(|m| {
                m.get("reasoning")
                    .or_else(|| m.get("reasoning_content"))
            })
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let reasoning_tokens = doc
            .get("usage")
            .and_then(|u| u.get("completion_tokens_details"))
            .and_then(|d| d.get("reasoning_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;

        let function_calls = message
            .and_then(|m| m.get("tool_calls"))
            .and_then(|tc| tc.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|tc| {
                        let func = tc.get("function")?;
                        let name = func.get("name")?.as_str()?.to_string();
                        let raw_args = func.get("arguments").cloned().unwrap_or(Value::Null);
                        let (arguments, strategy) = parse_tool_arguments(&raw_args);
                        Some(FunctionCall {
                            name,
                            arguments,
                            parse_strategy: strategy.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        ChatOutcome {
            content,
            reasoning_summary,
            reasoning_tokens,
            function_calls,
        }
    }

    async fn record_reasoning(&self, outcome: &ChatOutcome) {
        let mut slot = self.reasoning.lock().await;
        slot.summary = outcome.reasoning_summary.clone();
        slot.tokens = outcome.reasoning_tokens;
    }

    fn resolve_content(outcome: ChatOutcome) -> String {
        // Reasoning-fallback: some reasoning models return all of their text
        // through the reasoning channel and leave content blank.
        if outcome.content.is_empty() && !outcome.reasoning_summary.is_empty() {
            outcome.reasoning_summary
        } else {
            outcome.content
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    async fn complete(
        &self,
        prompt: &str,
        system_prompt: &str,
        temperature: f32,
        options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        let body = self.build_body(prompt, system_prompt, temperature, options, None);
        let outcome = self.request_with_retries(body, options).await?;
        Ok(Self::resolve_content(outcome))
    }

    async fn complete_with_functions(
        &self,
        prompt: &str,
        system_prompt: &str,
        temperature: f32,
        tools: &[ToolSpec],
    ) -> Result<ProviderResponse, ProviderError> {
        let options = CompletionOptions::default();
        let body = self.build_body(prompt, system_prompt, temperature, &options, Some(tools));
        let outcome = self.request_with_retries(body, &options).await?;
        let function_calls = outcome.function_calls.clone();
        Ok(ProviderResponse {
            content: Self::resolve_content(outcome),
            function_calls,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        &self.provider_label
    }

    fn reasoning_slot(&self) -> Option<&Mutex<ReasoningTrace>> {
        Some(&self.reasoning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_document_parsing_extracts_content_and_calls() {
        let doc = json!({
            "choices": [{
                "message": {
                    "content": "hello",
                    "reasoning": "thought about it",
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {
                            "name": "consult_graduate_specialist",
                            "arguments": "{\"specialization\": \"algebra\"}"
                        }
                    }]
                }
            }],
            "usage": {"completion_tokens_details": {"reasoning_tokens": 42}}
        });
        let outcome = OpenAiCompatProvider::parse_chat_document(&doc);
        assert_eq!(outcome.content, "hello");
        assert_eq!(outcome.reasoning_summary, "thought about it");
        assert_eq!(outcome.reasoning_tokens, 42);
        assert_eq!(outcome.function_calls.len(), 1);
        assert_eq!(outcome.function_calls[0].parse_strategy, "json");
        assert_eq!(
            outcome.function_calls[0].arguments["specialization"],
            "algebra"
        );
    }

    #[test]
    fn reasoning_fallback_promotes_reasoning_to_content() {
        let outcome = ChatOutcome {
            content: String::new(),
            reasoning_summary: "all reasoning, no content".to_string(),
            reasoning_tokens: 7,
            function_calls: Vec::new(),
        };
        assert_eq!(
            OpenAiCompatProvider::resolve_content(outcome),
            "all reasoning, no content"
        );
    }

    #[test]
    fn unparseable_arguments_are_kept_with_failed_label() {
        let doc = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "function": {"name": "consult_graduate_specialist", "arguments": "%%%"}
                    }]
                }
            }]
        });
        let outcome = OpenAiCompatProvider::parse_chat_document(&doc);
        assert_eq!(outcome.function_calls.len(), 1);
        assert_eq!(outcome.function_calls[0].parse_strategy, "failed");
        assert!(outcome.function_calls[0].arguments.is_null());
    }
}
