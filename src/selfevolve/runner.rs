//! Public entry points binding a provider and engine(s) for a solve mode.
//!
//! - [`BasicRunner`]: one Self-Evolve loop over Generator/Evaluator/Refiner.
//! - [`EnhancedRunner`]: a Self-Evolve loop whose generator is the
//!   [`ProfessorAgent`]; specialist consultations run their own inner loops.
//!
//! Both expose `solve` and `resume_solve`, and compose a phase-weighted
//! progress function over engine iterations.  For the enhanced runner the
//! phases are professor analysis, specialist consultations, synthesis, and
//! finalization, with equal weight.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use selfevolve::providers::openai::OpenAiCompatProvider;
//! use selfevolve::runner::BasicRunner;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = Arc::new(OpenAiCompatProvider::new("key", "gpt-4.1-mini"));
//! let runner = BasicRunner::new(provider);
//! let solution = runner
//!     .solve("What is the sum of the first 100 primes?", None, None, None)
//!     .await?;
//! println!("{}", solution.output);
//! # Ok(())
//! # }
//! ```

use crate::selfevolve::agent::GeneratorAgent;
use crate::selfevolve::config::Settings;
use crate::selfevolve::engine::{
    CancelHandle, EngineProgress, IterationRecord, Problem, SelfEvolve, Solution, SolveError,
};
use crate::selfevolve::evaluator::EvaluatorAgent;
use crate::selfevolve::professor::{
    ConsultationPhase, ConsultationUpdate, ProfessorAgent,
};
use crate::selfevolve::provider::Provider;
use crate::selfevolve::refiner::RefinerAgent;
use crate::selfevolve::store::JobStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Progress datum delivered to runner callbacks.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Overall completion fraction in `[0, 1]`.
    pub progress: f64,
    /// Human-readable phase description.
    pub phase: String,
    /// Aggregate reasoning tokens observed so far, when known.
    pub reasoning_tokens: Option<usize>,
}

/// Callback invoked at the engine's suspension points.
pub type ProgressCallback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Basic mode: one Self-Evolve loop with generator, evaluator, and refiner
/// sharing the runner's provider.
pub struct BasicRunner {
    provider: Arc<dyn Provider>,
    settings: Settings,
    job_binding: Option<(String, Arc<dyn JobStore>)>,
    cancel: CancelHandle,
}

impl BasicRunner {
    /// Create a basic runner with default settings.
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            settings: Settings::default(),
            job_binding: None,
            cancel: CancelHandle::new(),
        }
    }

    /// Replace the settings (builder pattern).
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Override the iteration cap (builder pattern).
    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.settings.max_iters = max_iters.max(1);
        self
    }

    /// Bind a job id and store for partial-result persistence (builder
    /// pattern).
    pub fn with_job_binding(mut self, job_id: impl Into<String>, store: Arc<dyn JobStore>) -> Self {
        self.job_binding = Some((job_id.into(), store));
        self
    }

    /// Handle that cancels any run started by this runner.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn build_engine(&self, max_iters: usize, progress: Option<EngineProgress>) -> SelfEvolve {
        let generator = Arc::new(GeneratorAgent::new(self.provider.clone()));
        let evaluator = Arc::new(EvaluatorAgent::with_stop_token(
            self.provider.clone(),
            self.settings.stop_token.clone(),
        ));
        let refiner = Arc::new(RefinerAgent::new(self.provider.clone()));

        let mut engine = SelfEvolve::new(generator, evaluator, refiner)
            .with_settings(self.settings.clone())
            .with_max_iters(max_iters)
            .with_cancel_handle(self.cancel.clone());
        if let Some((job_id, store)) = &self.job_binding {
            engine = engine.with_job_binding(job_id.clone(), store.clone());
        }
        if let Some(progress) = progress {
            engine = engine.with_progress(progress);
        }
        engine
    }

    /// Solve a question from scratch.
    pub async fn solve(
        &self,
        question: &str,
        context: Option<String>,
        constraints: Option<String>,
        progress: Option<ProgressCallback>,
    ) -> Result<Solution, SolveError> {
        self.solve_with_metadata(question, context, constraints, HashMap::new(), progress)
            .await
    }

    /// Solve a question, carrying caller metadata into the problem.
    pub async fn solve_with_metadata(
        &self,
        question: &str,
        context: Option<String>,
        constraints: Option<String>,
        metadata: HashMap<String, String>,
        progress: Option<ProgressCallback>,
    ) -> Result<Solution, SolveError> {
        let problem = build_problem(question, context, constraints, metadata);
        let engine_progress = progress.map(iteration_progress);
        let engine = self.build_engine(self.settings.max_iters, engine_progress);
        engine.solve(&problem).await
    }

    /// Continue a previous solve for `additional_iterations` more
    /// iterations.  The engine's cap becomes `history.len() +
    /// additional_iterations`.
    pub async fn resume_solve(
        &self,
        question: &str,
        context: Option<String>,
        constraints: Option<String>,
        evolution_history: Vec<IterationRecord>,
        additional_iterations: usize,
        progress: Option<ProgressCallback>,
    ) -> Result<Solution, SolveError> {
        let problem = build_problem(question, context, constraints, HashMap::new());
        let start_iteration = evolution_history.len() + 1;
        let max_iters = evolution_history.len() + additional_iterations.max(1);
        let engine_progress = progress.map(iteration_progress);
        let engine = self.build_engine(max_iters, engine_progress);
        engine
            .resume_solve(&problem, evolution_history, start_iteration)
            .await
    }
}

/// Enhanced mode: the professor orchestrator drives the outer loop and
/// spawns specialist Self-Evolves per consultation.
pub struct EnhancedRunner {
    provider: Arc<dyn Provider>,
    settings: Settings,
    job_binding: Option<(String, Arc<dyn JobStore>)>,
    cancel: CancelHandle,
}

/// Equal-weight phases composing enhanced-mode progress.
const ENHANCED_PHASES: [&str; 4] = [
    "Professor analysis",
    "Specialist consultations",
    "Synthesis",
    "Finalization",
];

impl EnhancedRunner {
    /// Create an enhanced runner with default settings.
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            settings: Settings::default(),
            job_binding: None,
            cancel: CancelHandle::new(),
        }
    }

    /// Replace the settings (builder pattern).
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Override the outer-loop iteration cap (builder pattern).
    pub fn with_professor_max_iters(mut self, max_iters: usize) -> Self {
        self.settings.professor_max_iters = max_iters.max(1);
        self
    }

    /// Override the inner specialist-loop cap (builder pattern).
    pub fn with_specialist_max_iters(mut self, max_iters: usize) -> Self {
        self.settings.specialist_max_iters = max_iters.max(1);
        self
    }

    /// Bind a job id and store for partial-result persistence (builder
    /// pattern).  Specialist runs derive child ids under the same store.
    pub fn with_job_binding(mut self, job_id: impl Into<String>, store: Arc<dyn JobStore>) -> Self {
        self.job_binding = Some((job_id.into(), store));
        self
    }

    /// Handle that cancels any run started by this runner.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    fn build_engine(&self, max_iters: usize, progress: Option<ProgressCallback>) -> SelfEvolve {
        let phase_index = Arc::new(AtomicUsize::new(0));

        let mut professor = ProfessorAgent::new(self.provider.clone())
            .with_settings(self.settings.clone());
        if let Some((job_id, store)) = &self.job_binding {
            professor = professor.with_job_binding(job_id.clone(), store.clone());
        }
        if let Some(callback) = &progress {
            let callback = callback.clone();
            let phase_index = phase_index.clone();
            professor = professor.with_progress(Arc::new(move |update: &ConsultationUpdate| {
                let index = match update.phase {
                    ConsultationPhase::Analysis => 0,
                    ConsultationPhase::Consultations => 1,
                    ConsultationPhase::Synthesis => 2,
                };
                phase_index.store(index, Ordering::SeqCst);
                callback(&ProgressUpdate {
                    progress: phase_weighted(index, update.fraction),
                    phase: format!("{}: {}", ENHANCED_PHASES[index], update.detail),
                    reasoning_tokens: update.reasoning_tokens,
                });
            }));
        }

        let evaluator = Arc::new(EvaluatorAgent::with_stop_token(
            self.provider.clone(),
            self.settings.stop_token.clone(),
        ));
        let refiner = Arc::new(RefinerAgent::new(self.provider.clone()));

        // The enhanced mode leaves the answer-convergence shortcut to the
        // professor's own synthesis gating.
        let mut settings = self.settings.clone();
        settings.answer_convergence_shortcut = false;

        let mut engine = SelfEvolve::new(Arc::new(professor), evaluator, refiner)
            .with_settings(settings)
            .with_max_iters(max_iters)
            .with_cancel_handle(self.cancel.clone());
        if let Some((job_id, store)) = &self.job_binding {
            engine = engine.with_job_binding(job_id.clone(), store.clone());
        }
        if let Some(callback) = progress {
            let phase_index = phase_index;
            engine = engine.with_progress(Arc::new(move |current, max, phase| {
                // Outer iterations re-enter the analysis phase; the phase
                // index is reset so sub-progress restarts cleanly.
                phase_index.store(0, Ordering::SeqCst);
                let sub = if max > 0 {
                    (current.saturating_sub(1)) as f64 / max as f64
                } else {
                    0.0
                };
                callback(&ProgressUpdate {
                    progress: phase_weighted(0, sub),
                    phase: format!("{}: {}", ENHANCED_PHASES[0], phase),
                    reasoning_tokens: None,
                });
            }));
        }
        engine
    }

    /// Solve a question from scratch in enhanced mode.
    pub async fn solve(
        &self,
        question: &str,
        context: Option<String>,
        constraints: Option<String>,
        progress: Option<ProgressCallback>,
    ) -> Result<Solution, SolveError> {
        self.solve_with_metadata(question, context, constraints, HashMap::new(), progress)
            .await
    }

    /// Solve a question in enhanced mode, carrying caller metadata.
    pub async fn solve_with_metadata(
        &self,
        question: &str,
        context: Option<String>,
        constraints: Option<String>,
        metadata: HashMap<String, String>,
        progress: Option<ProgressCallback>,
    ) -> Result<Solution, SolveError> {
        let problem = build_problem(question, context, constraints, metadata);
        let engine = self.build_engine(self.settings.professor_max_iters, progress.clone());
        let solution = engine.solve(&problem).await?;
        finalize_progress(&progress, solution.metadata.reasoning_tokens);
        Ok(solution)
    }

    /// Continue a previous enhanced solve for `additional_iterations` more
    /// outer iterations.
    pub async fn resume_solve(
        &self,
        question: &str,
        context: Option<String>,
        constraints: Option<String>,
        evolution_history: Vec<IterationRecord>,
        additional_iterations: usize,
        progress: Option<ProgressCallback>,
    ) -> Result<Solution, SolveError> {
        let problem = build_problem(question, context, constraints, HashMap::new());
        let start_iteration = evolution_history.len() + 1;
        let max_iters = evolution_history.len() + additional_iterations.max(1);
        let engine = self.build_engine(max_iters, progress.clone());
        let solution = engine
            .resume_solve(&problem, evolution_history, start_iteration)
            .await?;
        finalize_progress(&progress, solution.metadata.reasoning_tokens);
        Ok(solution)
    }
}

fn build_problem(
    question: &str,
    context: Option<String>,
    constraints: Option<String>,
    metadata: HashMap<String, String>,
) -> Problem {
    let mut problem = Problem::new(question);
    problem.context = context.filter(|c| !c.is_empty());
    problem.constraints = constraints.filter(|c| !c.is_empty());
    problem.metadata = metadata;
    problem
}

/// Map an engine iteration callback onto a flat progress fraction.
fn iteration_progress(callback: ProgressCallback) -> EngineProgress {
    Arc::new(move |current, max, phase| {
        let fraction = if max > 0 {
            (current.saturating_sub(1)) as f64 / max as f64
        } else {
            0.0
        };
        callback(&ProgressUpdate {
            progress: fraction,
            phase: phase.to_string(),
            reasoning_tokens: None,
        });
    })
}

fn phase_weighted(phase_index: usize, sub: f64) -> f64 {
    let phases = ENHANCED_PHASES.len() as f64;
    ((phase_index as f64 + sub.max(0.0).min(1.0)) / phases).min(1.0)
}

fn finalize_progress(progress: &Option<ProgressCallback>, reasoning_tokens: usize) {
    if let Some(callback) = progress {
        callback(&ProgressUpdate {
            progress: 1.0,
            phase: format!("{}: complete", ENHANCED_PHASES[3]),
            reasoning_tokens: if reasoning_tokens > 0 {
                Some(reasoning_tokens)
            } else {
                None
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_weighting_is_equal_across_four_phases() {
        assert!((phase_weighted(0, 0.0) - 0.0).abs() < f64::EPSILON);
        assert!((phase_weighted(1, 0.0) - 0.25).abs() < f64::EPSILON);
        assert!((phase_weighted(2, 0.5) - 0.625).abs() < f64::EPSILON);
        assert!((phase_weighted(3, 1.0) - 1.0).abs() < f64::EPSILON);
        // sub-progress is clamped
        assert!((phase_weighted(1, 2.0) - 0.5).abs() < f64::EPSILON);
    }
}
