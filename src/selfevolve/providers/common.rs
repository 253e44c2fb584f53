//! Shared transport utilities used across provider implementations.
//!
//! Provides a tuned, connection-pooled [`reqwest`] client, the jittered
//! exponential-backoff schedule applied to transient failures, `Retry-After`
//! parsing for throttled responses, and [`SseScanner`], a lenient
//! server-sent-events line scanner for streamed completions.

use lazy_static::lazy_static;
use rand::Rng;
use std::time::Duration;

lazy_static! {
    /// Process-wide HTTP client shared by every provider instance.
    ///
    /// An engine issues exactly one provider call at a time, so the pool
    /// only needs to cover the handful of jobs a worker process runs side
    /// by side: a few warm connections per host, held through the minutes
    /// an evaluator or refiner turn can sit between generator calls.
    ///
    /// No overall request timeout is set on the client.  Reasoning-model
    /// completions routinely run past any sane transport-level cap, and
    /// every call already carries its own deadline
    /// (`Settings::provider_timeout`, or the per-call override in
    /// `CompletionOptions::timeout`).
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(600)))
            .pool_max_idle_per_host(4)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the process-wide [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Backoff delay before retry number `attempt` (zero-based).
///
/// Exponential from a one-second base, capped at thirty seconds, with up to
/// 500ms of random jitter so clustered workers do not retry in lockstep.
pub fn backoff_delay(attempt: usize) -> Duration {
    let exp = 1u64 << attempt.min(5) as u64;
    let base = Duration::from_secs(exp.min(30));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
    base + jitter
}

/// Parse a `Retry-After` header value into a delay, accepting the
/// delta-seconds form.  HTTP-date forms are ignored (callers fall back to
/// the normal backoff schedule).
pub fn retry_after_delay(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Incremental scanner for server-sent-event payloads.
///
/// Feeds of raw bytes arrive in arbitrary chunk boundaries; the scanner
/// buffers incomplete lines and yields only complete `data:` payloads.
/// Comment lines (leading `:`), blank keep-alive lines, and the `[DONE]`
/// sentinel are discarded.
///
/// # Example
///
/// ```rust
/// use selfevolve::providers::common::SseScanner;
///
/// let mut scanner = SseScanner::new();
/// let mut frames = scanner.push("data: {\"a\":1}\n\n: keep-alive\nda");
/// frames.extend(scanner.push("ta: {\"b\":2}\ndata: [DONE]\n"));
///
/// assert_eq!(frames, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct SseScanner {
    buffer: String,
}

impl SseScanner {
    /// Create an empty scanner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the response body; returns any complete data payloads.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(frame) = Self::payload_of(line.trim_end_matches(|c| c == '\n' || c == '\r'))
            {
                frames.push(frame);
            }
        }
        frames
    }

    /// Drain the trailing, unterminated line if it holds a payload.
    ///
    /// Streams occasionally end without a final newline; call this once the
    /// byte stream is exhausted.
    pub fn finish(mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        Self::payload_of(rest.trim_end())
    }

    fn payload_of(line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return None;
        }
        let data = line.strip_prefix("data:")?.trim();
        if data.is_empty() || data == "[DONE]" {
            return None;
        }
        Some(data.to_string())
    }
}
