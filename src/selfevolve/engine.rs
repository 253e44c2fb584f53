//! The Self-Evolve engine: iterative improvement through a
//! Generate → Evaluate → Refine loop.
//!
//! Each iteration asks the generator for an answer (with validity-gated
//! retries), the evaluator for feedback and a stop verdict, and, unless the
//! loop is terminating, the refiner for the next iteration's prompt.  The
//! engine owns the evolution history for the duration of a run, persists
//! per-iteration snapshots when bound to a job store, observes cancellation
//! at every suspension point, and applies the continuation-fallback policy
//! when later iterations stop producing valid output.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use selfevolve::agent::GeneratorAgent;
//! use selfevolve::engine::{Problem, SelfEvolve};
//! use selfevolve::evaluator::EvaluatorAgent;
//! use selfevolve::providers::openai::OpenAiCompatProvider;
//! use selfevolve::refiner::RefinerAgent;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = Arc::new(OpenAiCompatProvider::new("key", "gpt-4.1-mini"));
//!
//! let engine = SelfEvolve::new(
//!     Arc::new(GeneratorAgent::new(provider.clone())),
//!     Arc::new(EvaluatorAgent::new(provider.clone())),
//!     Arc::new(RefinerAgent::new(provider)),
//! )
//! .with_max_iters(3);
//!
//! let solution = engine
//!     .solve(&Problem::new("Prove that sqrt(2) is irrational."))
//!     .await?;
//! println!("{} ({} iterations)", solution.output, solution.iterations);
//! # Ok(())
//! # }
//! ```

use crate::selfevolve::agent::{context_keys, Agent, AgentContext, AgentResult};
use crate::selfevolve::config::Settings;
use crate::selfevolve::professor::SpecialistConsultation;
use crate::selfevolve::provider::approx_token_count;
use crate::selfevolve::store::{fields, JobStore};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Input problem for a solve run.  Immutable once created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Problem {
    /// The problem or question to solve.  Non-empty.
    pub question: String,
    /// Additional context, forwarded to every role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Constraints or requirements, forwarded to every role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<String>,
    /// Free-form metadata carried through to the solution.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Problem {
    /// Create a problem from its question text.
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Default::default()
        }
    }

    /// Attach context (builder pattern).
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Attach constraints (builder pattern).
    pub fn with_constraints(mut self, constraints: impl Into<String>) -> Self {
        self.constraints = Some(constraints.into());
        self
    }

    /// Attach a metadata entry (builder pattern).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Per-role accounting captured inside an [`IterationRecord`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleRecord {
    /// Tokens attributed to the role for this iteration.
    #[serde(default)]
    pub tokens_used: usize,
    /// Reasoning tokens billed for the role's call.
    #[serde(default)]
    pub reasoning_tokens: usize,
    /// Reasoning summary, when the provider surfaced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_summary: Option<String>,
    /// Status marker for skipped or degraded executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// The role's stop verdict (evaluator only).
    #[serde(default)]
    pub should_stop: bool,
}

impl RoleRecord {
    fn from_result(result: &AgentResult) -> Self {
        Self {
            tokens_used: result.tokens_used,
            reasoning_tokens: result.metadata.reasoning_tokens,
            reasoning_summary: result.metadata.reasoning_summary.clone(),
            status: result.metadata.status.clone(),
            should_stop: result.metadata.should_stop,
        }
    }

    fn skipped(status: &str) -> Self {
        Self {
            status: Some(status.to_string()),
            ..Default::default()
        }
    }
}

/// Nested per-role metadata for one iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IterationMetadata {
    /// Generator accounting.
    pub generator: RoleRecord,
    /// Evaluator accounting.
    pub evaluator: RoleRecord,
    /// Refiner accounting, absent on the final iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refiner: Option<RoleRecord>,
    /// Specialist consultations performed inside this iteration's
    /// generation (professor runs only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consultations: Vec<SpecialistConsultation>,
}

/// One completed iteration of the loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationRecord {
    /// One-based iteration index.
    pub iteration: usize,
    /// Prompt used as generator input for this iteration.
    pub prompt: String,
    /// Generated output.
    pub output: String,
    /// Evaluator feedback.
    pub feedback: String,
    /// Whether the evaluator signalled convergence.
    pub should_stop: bool,
    /// Per-role sub-records.
    #[serde(default)]
    pub metadata: IterationMetadata,
    /// Prompt emitted by the refiner for the next iteration, when one ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refined_prompt: Option<String>,
    /// UTC timestamp of record creation.
    pub timestamp: DateTime<Utc>,
}

/// Why a run terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The evaluator signalled convergence.
    EvaluatorStop,
    /// The iteration cap was reached without a stop verdict.
    MaxIterations,
    /// Later iterations failed and the best valid iteration was returned.
    FallbackToBest,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::EvaluatorStop => "evaluator_stop",
            StopReason::MaxIterations => "max_iterations",
            StopReason::FallbackToBest => "fallback_to_best",
        };
        write!(f, "{}", s)
    }
}

/// Solution metadata.
///
/// `converged` is always equivalent to `stop_reason` being
/// [`StopReason::EvaluatorStop`] or [`StopReason::FallbackToBest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionMetadata {
    /// Whether the run converged.
    pub converged: bool,
    /// Termination cause.
    pub stop_reason: StopReason,
    /// Whether the continuation fallback produced this solution.
    #[serde(default)]
    pub fallback_used: bool,
    /// Human-readable diagnostic attached when the fallback fired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_diagnostic: Option<String>,
    /// Aggregate reasoning tokens across all roles and iterations.
    #[serde(default)]
    pub reasoning_tokens: usize,
    /// Specialist consultations performed (professor-generated runs only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialist_consultations: Option<usize>,
    /// Consultation records from the final professor iteration.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub specialist_results: Vec<SpecialistConsultation>,
    /// Set when the answer-tag convergence shortcut terminated the run.
    #[serde(default)]
    pub answer_converged: bool,
    /// Set when any prompt was compacted to fit the context window.
    #[serde(default)]
    pub context_truncated: bool,
}

/// Terminal output of a solve run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Solution {
    /// Final answer text.
    pub output: String,
    /// Number of completed iterations (always equals the history length).
    pub iterations: usize,
    /// Full evolution history, ordered by iteration.
    pub evolution_history: Vec<IterationRecord>,
    /// Total tokens across all roles and iterations.  Retries that produced
    /// invalid outputs contribute nothing.
    pub total_tokens: usize,
    /// Status metadata; see [`SolutionMetadata`].
    pub metadata: SolutionMetadata,
}

/// Terminal failure of a solve run.
///
/// Everything else (provider errors, invalid outputs, failed refinements)
/// is absorbed by retries and fallbacks and produces a [`Solution`].
#[derive(Debug, Clone)]
pub enum SolveError {
    /// Cancellation was observed at a checkpoint.
    Cancelled,
    /// The input evolution history was unusable.
    Validation(String),
    /// Every retry of the current iteration failed and no fallback was
    /// possible.
    NoValidIteration(String),
}

impl fmt::Display for SolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveError::Cancelled => write!(f, "Self-Evolve was cancelled"),
            SolveError::Validation(msg) => write!(f, "{}", msg),
            SolveError::NoValidIteration(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error for SolveError {}

/// Progress callback: `(current_iteration, max_iterations, phase)`.
pub type EngineProgress = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

/// Shareable cancellation flag for a running engine.
///
/// Cancellation is cooperative: the engine checks the flag at every
/// suspension point (before each provider call, after each role, and before
/// finalisation) and aborts with [`SolveError::Cancelled`].
#[derive(Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Create an un-cancelled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.  Takes effect at the engine's next checkpoint.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Validity predicate for generator outputs.
///
/// An output counts as a real iteration only if, after trimming, it is
/// non-empty, is not a placeholder, contains none of the known error
/// sentinels, and has at least `min_words` whitespace-separated words.
pub fn is_valid_output(output: &str, min_words: usize) -> bool {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return false;
    }

    const PLACEHOLDERS: &[&str] = &["...", "\u{2026}", "[content continues]", "[generating...]"];
    if PLACEHOLDERS.contains(&trimmed) {
        return false;
    }

    const ERROR_PATTERNS: &[&str] = &[
        "i apologize, but i encountered an error",
        "i'm sorry, but an error occurred",
        "unable to generate",
        "generation failed",
        "error generating",
        "cannot process",
        "failed to process",
    ];
    let lower = trimmed.to_lowercase();
    for pattern in ERROR_PATTERNS {
        if lower.contains(pattern) {
            return false;
        }
    }

    trimmed.split_whitespace().count() >= min_words
}

/// Extract the contents of the first `<tag>...</tag>` pair, matched
/// case-insensitively across lines.
pub fn extract_answer_tag(text: &str, tag: &str) -> Option<String> {
    let pattern = format!(r"(?is)<{0}>(.*?)</{0}>", regex::escape(tag));
    let re = Regex::new(&pattern).ok()?;
    re.captures(text)
        .map(|caps| caps[1].trim().to_string())
}

/// Compact a prompt that exceeds the configured share of the context
/// window, keeping the head and tail and dropping the middle.
fn maybe_compact_prompt(prompt: &str, settings: &Settings) -> (String, bool) {
    let budget = (settings.context_window_tokens as f64 * settings.context_summarization_threshold)
        as usize;
    if budget == 0 || approx_token_count(prompt) <= budget {
        return (prompt.to_string(), false);
    }

    let chars: Vec<char> = prompt.chars().collect();
    let target_chars = budget.saturating_mul(4);
    let keep_head = target_chars * 3 / 4;
    let keep_tail = target_chars / 4;
    if keep_head + keep_tail >= chars.len() {
        return (prompt.to_string(), false);
    }

    let head: String = chars[..keep_head].iter().collect();
    let tail: String = chars[chars.len() - keep_tail..].iter().collect();
    let compacted = format!(
        "{}\n\n[... earlier material truncated to fit the context window ...]\n\n{}",
        head, tail
    );
    (compacted, true)
}

/// The Self-Evolve engine.
///
/// Construction is builder-style; [`SelfEvolve::solve`] runs a fresh loop
/// and [`SelfEvolve::resume_solve`] continues from an existing history.
pub struct SelfEvolve {
    generator: Arc<dyn Agent>,
    evaluator: Arc<dyn Agent>,
    refiner: Arc<dyn Agent>,
    max_iters: usize,
    progress: Option<EngineProgress>,
    allow_continuation_fallback: bool,
    job_id: Option<String>,
    store: Option<Arc<dyn JobStore>>,
    settings: Settings,
    cancelled: CancelHandle,
}

impl SelfEvolve {
    /// Create an engine over the three role agents with default settings.
    pub fn new(
        generator: Arc<dyn Agent>,
        evaluator: Arc<dyn Agent>,
        refiner: Arc<dyn Agent>,
    ) -> Self {
        let settings = Settings::default();
        Self {
            generator,
            evaluator,
            refiner,
            max_iters: settings.max_iters,
            progress: None,
            allow_continuation_fallback: settings.allow_continuation_fallback,
            job_id: None,
            store: None,
            settings,
            cancelled: CancelHandle::new(),
        }
    }

    /// Replace the engine settings (builder pattern).  Also adopts the
    /// settings' iteration cap and fallback flag unless overridden later.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.max_iters = settings.max_iters;
        self.allow_continuation_fallback = settings.allow_continuation_fallback;
        self.settings = settings;
        self
    }

    /// Override the iteration cap (builder pattern).
    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters.max(1);
        self
    }

    /// Attach a progress callback (builder pattern).
    pub fn with_progress(mut self, progress: EngineProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Enable or disable the continuation fallback (builder pattern).
    pub fn with_continuation_fallback(mut self, allow: bool) -> Self {
        self.allow_continuation_fallback = allow;
        self
    }

    /// Bind a job id and store for partial-result persistence (builder
    /// pattern).
    pub fn with_job_binding(mut self, job_id: impl Into<String>, store: Arc<dyn JobStore>) -> Self {
        self.job_id = Some(job_id.into());
        self.store = Some(store);
        self
    }

    /// Share an externally owned cancellation flag (builder pattern).
    pub fn with_cancel_handle(mut self, handle: CancelHandle) -> Self {
        self.cancelled = handle;
        self
    }

    /// Obtain a handle that can cancel this engine from another task.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancelled.clone()
    }

    /// Request cancellation of the current run.
    pub fn cancel(&self) {
        self.cancelled.cancel();
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    /// The configured iteration cap.
    pub fn max_iters(&self) -> usize {
        self.max_iters
    }

    /// Solve a problem from scratch.
    pub async fn solve(&self, problem: &Problem) -> Result<Solution, SolveError> {
        self.solve_internal(problem, Vec::new(), 1).await
    }

    /// Continue a previous run from its evolution history.
    ///
    /// A non-empty history with no valid output fails with
    /// [`SolveError::Validation`]; an empty history behaves exactly like
    /// [`SelfEvolve::solve`].
    pub async fn resume_solve(
        &self,
        problem: &Problem,
        evolution_history: Vec<IterationRecord>,
        start_iteration: usize,
    ) -> Result<Solution, SolveError> {
        self.solve_internal(problem, evolution_history, start_iteration.max(1))
            .await
    }

    async fn solve_internal(
        &self,
        problem: &Problem,
        mut history: Vec<IterationRecord>,
        start_iteration: usize,
    ) -> Result<Solution, SolveError> {
        if !history.is_empty()
            && !history
                .iter()
                .any(|r| is_valid_output(&r.output, self.settings.invalid_output_min_words))
        {
            error!("Evolution history exists but contains no valid outputs");
            return Err(SolveError::Validation(
                "All outputs in evolution history are invalid".to_string(),
            ));
        }

        info!(
            "Starting Self-Evolve from iteration {} for: {}",
            start_iteration,
            preview(&problem.question)
        );

        let mut prompt = match history.last().and_then(|r| r.refined_prompt.clone()) {
            Some(refined) => refined,
            None => self.initial_prompt(problem),
        };

        let mut total_tokens = 0usize;
        let mut reasoning_tokens = 0usize;
        for record in &history {
            total_tokens += record.metadata.generator.tokens_used
                + record.metadata.evaluator.tokens_used
                + record
                    .metadata
                    .refiner
                    .as_ref()
                    .map(|r| r.tokens_used)
                    .unwrap_or(0);
            reasoning_tokens += record.metadata.generator.reasoning_tokens
                + record.metadata.evaluator.reasoning_tokens
                + record
                    .metadata
                    .refiner
                    .as_ref()
                    .map(|r| r.reasoning_tokens)
                    .unwrap_or(0);
        }

        let mut should_stop = false;
        let mut answer_converged = false;
        let mut context_truncated = false;
        let mut fallback_record: Option<IterationRecord> = None;

        let mut iteration = start_iteration;
        while iteration <= self.max_iters {
            self.check_cancelled(&format!("at iteration {}", iteration))?;

            info!("Self-Evolve iteration {}/{}", iteration, self.max_iters);
            if let Some(progress) = &self.progress {
                progress(
                    iteration,
                    self.max_iters,
                    &format!("Self-Evolve iteration {}/{}", iteration, self.max_iters),
                );
            }

            let (compacted, truncated) = maybe_compact_prompt(&prompt, &self.settings);
            if truncated {
                warn!("Prompt compacted to fit the context window in iteration {}", iteration);
                context_truncated = true;
                prompt = compacted;
            }

            // Step 1: generate, retrying invalid outputs.  Tokens from
            // attempts that produced invalid output are discarded.
            let mut gen_result: Option<AgentResult> = None;
            let attempts = self.settings.max_retries_per_iteration + 1;
            for attempt in 0..attempts {
                let mut gen_context = AgentContext::from_prompt(prompt.clone());
                if let Some(constraints) = &problem.constraints {
                    gen_context = gen_context.with_extra(context_keys::CONSTRAINTS, constraints);
                }
                if let Some(context) = &problem.context {
                    gen_context = gen_context.with_extra(context_keys::CONTEXT, context);
                }

                match self.generator.run(&gen_context).await {
                    Ok(result)
                        if is_valid_output(
                            &result.output,
                            self.settings.invalid_output_min_words,
                        ) =>
                    {
                        gen_result = Some(result);
                        break;
                    }
                    Ok(result) => {
                        warn!(
                            "Invalid output detected in iteration {}, attempt {}: {}",
                            iteration,
                            attempt + 1,
                            preview(&result.output)
                        );
                    }
                    Err(e) => {
                        warn!(
                            "Generation failed in iteration {}, attempt {}: {}",
                            iteration,
                            attempt + 1,
                            e
                        );
                    }
                }
            }

            let gen_result = match gen_result {
                Some(result) => result,
                None => {
                    error!(
                        "Skipping iteration {} after {} attempts without valid output",
                        iteration, attempts
                    );
                    if self.allow_continuation_fallback {
                        if let Some(best) = history
                            .iter()
                            .rev()
                            .find(|r| {
                                is_valid_output(&r.output, self.settings.invalid_output_min_words)
                            })
                            .cloned()
                        {
                            warn!(
                                "Using iteration {} as continuation fallback",
                                best.iteration
                            );
                            fallback_record = Some(best);
                            break;
                        }
                    }
                    return Err(SolveError::NoValidIteration(
                        "No valid iteration found; marking task as failed.".to_string(),
                    ));
                }
            };

            self.check_cancelled("after generation")?;

            let output = gen_result.output.clone();
            let generator_reasoning = gen_result
                .metadata
                .reasoning_summary
                .clone()
                .unwrap_or_default();
            total_tokens += gen_result.tokens_used;
            reasoning_tokens += gen_result.metadata.reasoning_tokens;
            context_truncated |= gen_result.metadata.context_truncated;

            // Step 2: evaluate.  The professor synthesizes internally, so
            // its final iteration skips evaluation once at least one prior
            // iteration exists.
            let mut eval_record;
            let feedback;
            if self.generator.role() == "professor" && iteration == self.max_iters && iteration > 1
            {
                info!("Skipping final evaluation for professor");
                should_stop = true;
                eval_record = RoleRecord::skipped("skipped");
                feedback = "Final iteration, evaluation skipped.".to_string();
            } else if !is_valid_output(&output, self.settings.invalid_output_min_words) {
                // Defense in depth: an invalid output that slipped through
                // must not reach the evaluator or trigger a stop.
                warn!("Skipping evaluation for invalid output in iteration {}", iteration);
                should_stop = false;
                eval_record = RoleRecord::skipped("skipped_invalid_output");
                feedback = "Evaluation skipped due to invalid generator output".to_string();
            } else {
                let mut eval_context = AgentContext::from_prompt(problem.question.clone())
                    .with_output(output.clone());
                if let Some(constraints) = &problem.constraints {
                    eval_context = eval_context.with_extra(context_keys::CONSTRAINTS, constraints);
                }
                if let Some(context) = &problem.context {
                    eval_context = eval_context.with_extra(context_keys::CONTEXT, context);
                }
                if !generator_reasoning.is_empty() {
                    eval_context = eval_context
                        .with_extra(context_keys::GENERATOR_REASONING, &generator_reasoning);
                }

                match self.evaluator.run(&eval_context).await {
                    Ok(result) => {
                        should_stop = result.metadata.should_stop;
                        total_tokens += result.tokens_used;
                        reasoning_tokens += result.metadata.reasoning_tokens;
                        feedback = result
                            .feedback
                            .clone()
                            .unwrap_or_else(|| result.output.clone());
                        eval_record = RoleRecord::from_result(&result);
                    }
                    Err(e) => {
                        error!("Evaluation failed in iteration {}: {}", iteration, e);
                        should_stop = false;
                        eval_record = RoleRecord::skipped("evaluation_error");
                        eval_record.status = Some(format!("evaluation_error: {}", e));
                        feedback = "Evaluation unavailable for this iteration".to_string();
                    }
                }
                self.check_cancelled("after evaluation")?;
            }

            let evaluator_reasoning = eval_record.reasoning_summary.clone().unwrap_or_default();

            let mut record = IterationRecord {
                iteration,
                prompt: prompt.clone(),
                output: output.clone(),
                feedback: feedback.clone(),
                should_stop,
                metadata: IterationMetadata {
                    generator: RoleRecord::from_result(&gen_result),
                    evaluator: eval_record,
                    refiner: None,
                    consultations: gen_result.metadata.specialist_results.clone(),
                },
                refined_prompt: None,
                timestamp: Utc::now(),
            };

            // Answer-tag convergence shortcut: three consecutive identical
            // extracted answers count as convergence for runners that opt in.
            if self.settings.answer_convergence_shortcut && !should_stop {
                let tag = &self.settings.answer_tag;
                let latest = extract_answer_tag(&record.output, tag);
                if latest.is_some() && history.len() >= 2 {
                    let matches_last_two = history
                        .iter()
                        .rev()
                        .take(2)
                        .all(|r| {
                            extract_answer_tag(&r.output, tag)
                                .map(|v| v.eq_ignore_ascii_case(latest.as_deref().unwrap()))
                                .unwrap_or(false)
                        });
                    if matches_last_two {
                        info!(
                            "Answer-tag value stable for three consecutive iterations; converging"
                        );
                        should_stop = true;
                        answer_converged = true;
                        record.should_stop = true;
                    }
                }
            }

            history.push(record);
            self.persist_partial(&history).await;

            info!("Iteration {} complete. Should stop: {}", iteration, should_stop);
            if should_stop {
                break;
            }

            // Step 3: refine the prompt for the next iteration.
            if iteration < self.max_iters {
                let mut refine_context = AgentContext::from_prompt(prompt.clone())
                    .with_feedback(feedback.clone())
                    .with_extra(context_keys::CURRENT_ANSWER, &output)
                    .with_extra(context_keys::ITERATION, iteration.to_string());
                if let Some(constraints) = &problem.constraints {
                    refine_context =
                        refine_context.with_extra(context_keys::CONSTRAINTS, constraints);
                }
                if let Some(context) = &problem.context {
                    refine_context = refine_context.with_extra(context_keys::CONTEXT, context);
                }
                if !evaluator_reasoning.is_empty() {
                    refine_context = refine_context
                        .with_extra(context_keys::EVALUATOR_REASONING, &evaluator_reasoning);
                }

                match self.refiner.run(&refine_context).await {
                    Ok(result) => {
                        prompt = result.output.clone();
                        total_tokens += result.tokens_used;
                        reasoning_tokens += result.metadata.reasoning_tokens;
                        if let Some(last) = history.last_mut() {
                            last.refined_prompt = Some(prompt.clone());
                            last.metadata.refiner = Some(RoleRecord::from_result(&result));
                        }
                    }
                    Err(e) => {
                        // The rule-based fallback inside the refiner makes
                        // this path rare; keep the current prompt if it
                        // happens anyway.
                        warn!("Refinement failed in iteration {}: {}", iteration, e);
                    }
                }
                self.check_cancelled("after refinement")?;
            }

            iteration += 1;
        }

        self.check_cancelled("before creating the final solution")?;

        if history.is_empty() {
            error!("Evolution history is missing");
            return Err(SolveError::Validation(
                "Evolution history is required to generate a solution".to_string(),
            ));
        }

        let fallback_used = fallback_record.is_some();
        let (final_output, stop_reason, fallback_diagnostic) = match &fallback_record {
            Some(best) => (
                best.output.clone(),
                StopReason::FallbackToBest,
                Some(format!(
                    "Continuation fallback applied: returned iteration {} due to invalid output \
                     in subsequent iterations; returning best available.",
                    best.iteration
                )),
            ),
            None => {
                let last = history.last().expect("history checked non-empty");
                let reason = if should_stop {
                    StopReason::EvaluatorStop
                } else {
                    StopReason::MaxIterations
                };
                (last.output.clone(), reason, None)
            }
        };

        let converged = matches!(
            stop_reason,
            StopReason::EvaluatorStop | StopReason::FallbackToBest
        );

        let (specialist_consultations, specialist_results) = if self.generator.role() == "professor"
        {
            let last_consultations = history
                .iter()
                .rev()
                .find(|r| !r.metadata.consultations.is_empty())
                .map(|r| r.metadata.consultations.clone())
                .unwrap_or_default();
            (Some(last_consultations.len()), last_consultations)
        } else {
            (None, Vec::new())
        };

        let completed_iterations = history.len();
        info!(
            "Self-Evolve complete. Converged: {}, Iterations: {}, Tokens: {}",
            converged, completed_iterations, total_tokens
        );

        Ok(Solution {
            output: final_output,
            iterations: completed_iterations,
            evolution_history: history,
            total_tokens,
            metadata: SolutionMetadata {
                converged,
                stop_reason,
                fallback_used,
                fallback_diagnostic,
                reasoning_tokens,
                specialist_consultations,
                specialist_results,
                answer_converged,
                context_truncated,
            },
        })
    }

    fn check_cancelled(&self, at: &str) -> Result<(), SolveError> {
        if self.cancelled.is_cancelled() {
            info!("Self-Evolve cancelled {}", at);
            return Err(SolveError::Cancelled);
        }
        Ok(())
    }

    fn initial_prompt(&self, problem: &Problem) -> String {
        let mut parts = vec![problem.question.clone()];
        if let Some(context) = &problem.context {
            parts.push(format!("\nContext: {}", context));
        }
        if let Some(constraints) = &problem.constraints {
            parts.push(format!("\nConstraints: {}", constraints));
        }
        parts.join("\n")
    }

    async fn persist_partial(&self, history: &[IterationRecord]) {
        if !self.settings.partial_result_write_enabled {
            return;
        }
        let (job_id, store) = match (&self.job_id, &self.store) {
            (Some(job_id), Some(store)) => (job_id, store),
            _ => return,
        };
        let latest = match history.last() {
            Some(latest) => latest,
            None => return,
        };

        let snapshot = serde_json::json!({
            "iterations": history.len(),
            "latest_iteration": latest,
            "evolution_history": history,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let payload = match serde_json::to_string(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize partial results: {}", e);
                return;
            }
        };

        if let Err(e) = store
            .set_job_fields(
                job_id,
                vec![(fields::PARTIAL_RESULTS.to_string(), payload)],
            )
            .await
        {
            // Partial persistence is best-effort; the run continues.
            warn!("[{}] Failed to persist partial results: {}", job_id, e);
        } else {
            info!(
                "[{}] Saved partial results for iteration {}",
                job_id, latest.iteration
            );
        }
    }
}

fn preview(text: &str) -> String {
    const LIMIT: usize = 100;
    let mut out: String = text.chars().take(LIMIT).collect();
    if text.chars().count() > LIMIT {
        out.push_str("...");
    }
    out
}
