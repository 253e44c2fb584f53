//! Configuration for the Self-Evolve engine and its runners.
//!
//! [`Settings`] carries every tunable recognised by the core: iteration caps
//! for the three solve modes, retry ceilings, the stop-token and answer-tag
//! literals, validity thresholds, and the partial-result/locking knobs used
//! by the worker layer.  Users construct it manually; no config-file parsing
//! dependencies are introduced.
//!
//! # Example
//!
//! ```rust
//! use selfevolve::config::Settings;
//!
//! let settings = Settings::default()
//!     .with_max_iters(5)
//!     .with_stop_token("<done>");
//!
//! assert_eq!(settings.max_iters, 5);
//! assert_eq!(settings.stop_token, "<done>");
//! ```

use std::time::Duration;

/// Tunables for engines, agents, runners, and workers.
///
/// All fields have the defaults documented on [`Settings::default`]; the
/// `with_*` builders override individual values.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Iteration cap for basic-mode Self-Evolve loops.
    pub max_iters: usize,
    /// Iteration cap for the enhanced-mode outer (professor) loop.
    pub professor_max_iters: usize,
    /// Iteration cap for the specialist Self-Evolve loops spawned by the professor.
    pub specialist_max_iters: usize,
    /// When `true`, a run whose later iterations keep producing invalid output
    /// falls back to the most recent valid iteration instead of failing.
    pub allow_continuation_fallback: bool,
    /// Literal the evaluator emits, standalone, to signal convergence.
    pub stop_token: String,
    /// Tag name whose `<tag>...</tag>` contents are treated as the extracted
    /// final answer (matched case-insensitively).
    pub answer_tag: String,
    /// Minimum whitespace-separated word count for a generator output to be
    /// considered a real iteration.
    pub invalid_output_min_words: usize,
    /// Additional generation attempts per iteration after the first one.
    pub max_retries_per_iteration: usize,
    /// Retry ceiling applied inside providers for transient failures.
    pub provider_max_retries: usize,
    /// Fraction of the context window at which prompts are compacted before
    /// submission.
    pub context_summarization_threshold: f64,
    /// Approximate context window of the backing model, in tokens.
    pub context_window_tokens: usize,
    /// Write per-iteration snapshots to the job store when a job id and store
    /// are bound to the engine.
    pub partial_result_write_enabled: bool,
    /// Treat three consecutive iterations with identical answer-tag values as
    /// convergence even without an evaluator stop.
    pub answer_convergence_shortcut: bool,
    /// TTL for single-flight job locks.  Must be at least the job hard
    /// deadline.
    pub lock_ttl: Duration,
    /// Per-call deadline applied to provider requests.
    pub provider_timeout: Duration,
}

impl Default for Settings {
    /// Defaults: `max_iters` 3, `professor_max_iters` 2,
    /// `specialist_max_iters` 4, continuation fallback on, stop token
    /// `<stop>`, answer tag `answer`, 10-word validity floor, 4 retries per
    /// iteration, 3 provider retries, compaction at 80% of a 128k window,
    /// partial writes on, convergence shortcut off, 3h lock TTL, 20m
    /// provider timeout.
    fn default() -> Self {
        Self {
            max_iters: 3,
            professor_max_iters: 2,
            specialist_max_iters: 4,
            allow_continuation_fallback: true,
            stop_token: "<stop>".to_string(),
            answer_tag: "answer".to_string(),
            invalid_output_min_words: 10,
            max_retries_per_iteration: 4,
            provider_max_retries: 3,
            context_summarization_threshold: 0.8,
            context_window_tokens: 128_000,
            partial_result_write_enabled: true,
            answer_convergence_shortcut: false,
            lock_ttl: Duration::from_secs(10_800),
            provider_timeout: Duration::from_secs(1_200),
        }
    }
}

impl Settings {
    /// Override the basic-mode iteration cap.
    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    /// Override the enhanced-mode outer-loop iteration cap.
    pub fn with_professor_max_iters(mut self, max_iters: usize) -> Self {
        self.professor_max_iters = max_iters;
        self
    }

    /// Override the specialist-loop iteration cap.
    pub fn with_specialist_max_iters(mut self, max_iters: usize) -> Self {
        self.specialist_max_iters = max_iters;
        self
    }

    /// Enable or disable the continuation fallback.
    pub fn with_continuation_fallback(mut self, allow: bool) -> Self {
        self.allow_continuation_fallback = allow;
        self
    }

    /// Replace the evaluator stop-token literal.
    pub fn with_stop_token(mut self, token: impl Into<String>) -> Self {
        self.stop_token = token.into();
        self
    }

    /// Replace the answer-tag name.
    pub fn with_answer_tag(mut self, tag: impl Into<String>) -> Self {
        self.answer_tag = tag.into();
        self
    }

    /// Override the validity word floor.
    pub fn with_invalid_output_min_words(mut self, min_words: usize) -> Self {
        self.invalid_output_min_words = min_words;
        self
    }

    /// Override the per-iteration generation retry count.
    pub fn with_max_retries_per_iteration(mut self, retries: usize) -> Self {
        self.max_retries_per_iteration = retries;
        self
    }

    /// Override the provider retry ceiling.
    pub fn with_provider_max_retries(mut self, retries: usize) -> Self {
        self.provider_max_retries = retries;
        self
    }

    /// Enable or disable partial-result writes.
    pub fn with_partial_result_writes(mut self, enabled: bool) -> Self {
        self.partial_result_write_enabled = enabled;
        self
    }

    /// Enable or disable the answer-tag convergence shortcut.
    pub fn with_answer_convergence_shortcut(mut self, enabled: bool) -> Self {
        self.answer_convergence_shortcut = enabled;
        self
    }

    /// Override the single-flight lock TTL.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Override the provider call deadline.
    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }
}
