use async_trait::async_trait;
use selfevolve::agent::{Agent, AgentContext, AgentError, AgentMetadata, AgentResult};
use selfevolve::config::Settings;
use selfevolve::engine::{
    IterationMetadata, IterationRecord, Problem, RoleRecord, SelfEvolve, SolveError, StopReason,
};
use selfevolve::store::{fields, JobStore, MemoryJobStore};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

const VALID_OUTPUT: &str =
    "The capital of France is Paris, which is located in the north-central part of the country.";

/// Agent that pops pre-scripted results, falling back to a fixed result
/// once the script runs dry.
struct ScriptedAgent {
    role: String,
    script: Mutex<VecDeque<AgentResult>>,
    fallback: AgentResult,
    calls: AtomicUsize,
}

impl ScriptedAgent {
    fn new(role: &str, script: Vec<AgentResult>, fallback: AgentResult) -> Arc<Self> {
        Arc::new(Self {
            role: role.to_string(),
            script: Mutex::new(script.into_iter().collect()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn role(&self) -> &str {
        &self.role
    }

    async fn run(&self, _context: &AgentContext) -> Result<AgentResult, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().await;
        Ok(script.pop_front().unwrap_or_else(|| self.fallback.clone()))
    }
}

fn gen_result(output: &str, tokens: usize) -> AgentResult {
    AgentResult {
        output: output.to_string(),
        feedback: None,
        metadata: AgentMetadata::default(),
        tokens_used: tokens,
    }
}

fn eval_result(feedback: &str, should_stop: bool, tokens: usize) -> AgentResult {
    AgentResult {
        output: feedback.to_string(),
        feedback: Some(feedback.to_string()),
        metadata: AgentMetadata {
            should_stop,
            ..Default::default()
        },
        tokens_used: tokens,
    }
}

fn refine_result(prompt: &str, tokens: usize) -> AgentResult {
    AgentResult {
        output: prompt.to_string(),
        feedback: None,
        metadata: AgentMetadata::default(),
        tokens_used: tokens,
    }
}

fn generator(script: Vec<AgentResult>) -> Arc<ScriptedAgent> {
    ScriptedAgent::new("generator", script, gen_result(VALID_OUTPUT, 10))
}

fn evaluator(script: Vec<AgentResult>) -> Arc<ScriptedAgent> {
    ScriptedAgent::new("evaluator", script, eval_result("Needs more detail.", false, 5))
}

fn refiner() -> Arc<ScriptedAgent> {
    ScriptedAgent::new("refiner", Vec::new(), refine_result("Refined prompt for retry.", 3))
}

fn valid_record(iteration: usize, output: &str) -> IterationRecord {
    IterationRecord {
        iteration,
        prompt: "original question".to_string(),
        output: output.to_string(),
        feedback: "Decent start.".to_string(),
        should_stop: false,
        metadata: IterationMetadata {
            generator: RoleRecord {
                tokens_used: 10,
                ..Default::default()
            },
            evaluator: RoleRecord {
                tokens_used: 5,
                ..Default::default()
            },
            refiner: None,
            consultations: Vec::new(),
        },
        refined_prompt: Some("continue from here".to_string()),
        timestamp: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn normal_convergence_in_one_iteration() {
    let generator = generator(vec![gen_result(VALID_OUTPUT, 20)]);
    let evaluator = evaluator(vec![eval_result("Fully correct.\n<stop>", true, 7)]);
    let engine = SelfEvolve::new(generator.clone(), evaluator, refiner()).with_max_iters(3);

    let solution = engine
        .solve(&Problem::new("What is the capital of France?"))
        .await
        .unwrap();

    assert_eq!(solution.iterations, 1);
    assert_eq!(solution.evolution_history.len(), 1);
    assert!(solution.metadata.converged);
    assert_eq!(solution.metadata.stop_reason, StopReason::EvaluatorStop);
    assert!(!solution.metadata.fallback_used);
    assert_eq!(solution.output, VALID_OUTPUT);
    assert_eq!(solution.total_tokens, 27);
    assert_eq!(generator.call_count(), 1);
}

#[tokio::test]
async fn max_iterations_without_stop() {
    let engine = SelfEvolve::new(generator(vec![]), evaluator(vec![]), refiner()).with_max_iters(3);

    let solution = engine.solve(&Problem::new("An open-ended question")).await.unwrap();

    assert_eq!(solution.iterations, 3);
    assert!(!solution.metadata.converged);
    assert_eq!(solution.metadata.stop_reason, StopReason::MaxIterations);
    // the first two records carry the refined prompt, the last does not
    assert!(solution.evolution_history[0].refined_prompt.is_some());
    assert!(solution.evolution_history[1].refined_prompt.is_some());
    assert!(solution.evolution_history[2].refined_prompt.is_none());
    assert!(solution.evolution_history[1]
        .prompt
        .contains("Refined prompt for retry."));
}

#[tokio::test]
async fn continuation_fallback_returns_best_valid_iteration() {
    // Resume from a history with one valid record; the generator now only
    // produces empty output, so every attempt is invalid.
    let generator = ScriptedAgent::new("generator", Vec::new(), gen_result("", 50));
    let engine = SelfEvolve::new(generator.clone(), evaluator(vec![]), refiner()).with_max_iters(3);

    let history = vec![valid_record(1, VALID_OUTPUT)];
    let solution = engine
        .resume_solve(&Problem::new("What is the capital of France?"), history, 2)
        .await
        .unwrap();

    assert_eq!(solution.output, VALID_OUTPUT);
    assert!(solution.metadata.fallback_used);
    assert!(solution.metadata.converged);
    assert_eq!(solution.metadata.stop_reason, StopReason::FallbackToBest);
    let diagnostic = solution.metadata.fallback_diagnostic.unwrap();
    assert!(diagnostic.contains("iteration 1"));
    // no synthetic record was appended
    assert_eq!(solution.evolution_history.len(), 1);
    assert_eq!(solution.iterations, 1);
    // 4 retries on top of the initial attempt
    assert_eq!(generator.call_count(), 5);
    // invalid attempts contribute no tokens: only the prior history's 15
    assert_eq!(solution.total_tokens, 15);
}

#[tokio::test]
async fn fresh_solve_with_no_valid_output_fails() {
    let generator = ScriptedAgent::new("generator", Vec::new(), gen_result("", 0));
    let engine = SelfEvolve::new(generator.clone(), evaluator(vec![]), refiner());

    let err = engine.solve(&Problem::new("Unanswerable")).await.unwrap_err();
    match err {
        SolveError::NoValidIteration(msg) => {
            assert_eq!(msg, "No valid iteration found; marking task as failed.");
        }
        other => panic!("expected NoValidIterationError, got {:?}", other),
    }
    assert_eq!(generator.call_count(), 5);
}

#[tokio::test]
async fn fallback_disabled_fails_even_with_valid_history() {
    let generator = ScriptedAgent::new("generator", Vec::new(), gen_result("", 0));
    let engine = SelfEvolve::new(generator, evaluator(vec![]), refiner())
        .with_max_iters(3)
        .with_continuation_fallback(false);

    let err = engine
        .resume_solve(&Problem::new("q"), vec![valid_record(1, VALID_OUTPUT)], 2)
        .await
        .unwrap_err();
    assert!(matches!(err, SolveError::NoValidIteration(_)));
}

#[tokio::test]
async fn resume_with_all_invalid_history_is_a_validation_error() {
    let engine = SelfEvolve::new(generator(vec![]), evaluator(vec![]), refiner());

    let mut bad = valid_record(1, "...");
    bad.refined_prompt = None;
    let err = engine
        .resume_solve(&Problem::new("q"), vec![bad], 2)
        .await
        .unwrap_err();
    match err {
        SolveError::Validation(msg) => {
            assert_eq!(msg, "All outputs in evolution history are invalid");
        }
        other => panic!("expected ValidationError, got {:?}", other),
    }
}

#[tokio::test]
async fn resume_with_empty_history_behaves_like_solve() {
    let evaluator = evaluator(vec![eval_result("Good. <stop>", true, 5)]);
    let engine = SelfEvolve::new(generator(vec![]), evaluator, refiner()).with_max_iters(3);

    let solution = engine
        .resume_solve(&Problem::new("q"), Vec::new(), 1)
        .await
        .unwrap();
    assert_eq!(solution.iterations, 1);
    assert_eq!(solution.metadata.stop_reason, StopReason::EvaluatorStop);
}

#[tokio::test]
async fn invalid_retry_tokens_are_discarded() {
    let generator = ScriptedAgent::new(
        "generator",
        vec![gen_result("too short", 500), gen_result(VALID_OUTPUT, 10)],
        gen_result(VALID_OUTPUT, 10),
    );
    let evaluator = evaluator(vec![eval_result("Great.\n<stop>", true, 5)]);
    let engine = SelfEvolve::new(generator, evaluator, refiner()).with_max_iters(3);

    let solution = engine.solve(&Problem::new("q")).await.unwrap();
    // the 500-token invalid attempt is not counted
    assert_eq!(solution.total_tokens, 15);
    assert_eq!(solution.iterations, 1);
}

#[tokio::test]
async fn total_tokens_sum_all_roles_across_iterations() {
    let generator = ScriptedAgent::new(
        "generator",
        vec![gen_result(VALID_OUTPUT, 11), gen_result(VALID_OUTPUT, 13)],
        gen_result(VALID_OUTPUT, 0),
    );
    let evaluator = ScriptedAgent::new(
        "evaluator",
        vec![
            eval_result("Weak.", false, 7),
            eval_result("Good now. <stop>", true, 9),
        ],
        eval_result("Weak.", false, 0),
    );
    let refiner = ScriptedAgent::new(
        "refiner",
        vec![refine_result("try again with rigor", 3)],
        refine_result("try again", 0),
    );
    let engine = SelfEvolve::new(generator, evaluator, refiner).with_max_iters(3);

    let solution = engine.solve(&Problem::new("q")).await.unwrap();
    assert_eq!(solution.iterations, 2);
    assert_eq!(solution.total_tokens, 11 + 7 + 3 + 13 + 9);

    // the history's role records reproduce the same sum
    let from_history: usize = solution
        .evolution_history
        .iter()
        .map(|r| {
            r.metadata.generator.tokens_used
                + r.metadata.evaluator.tokens_used
                + r.metadata.refiner.as_ref().map(|x| x.tokens_used).unwrap_or(0)
        })
        .sum();
    assert_eq!(solution.total_tokens, from_history);
}

#[tokio::test]
async fn single_iteration_cap_boundary() {
    // with a stop verdict
    let engine = SelfEvolve::new(
        generator(vec![]),
        evaluator(vec![eval_result("Done. <stop>", true, 1)]),
        refiner(),
    )
    .with_max_iters(1);
    let stopped = engine.solve(&Problem::new("q")).await.unwrap();
    assert_eq!(stopped.iterations, 1);
    assert_eq!(stopped.metadata.stop_reason, StopReason::EvaluatorStop);

    // without one
    let engine = SelfEvolve::new(generator(vec![]), evaluator(vec![]), refiner()).with_max_iters(1);
    let capped = engine.solve(&Problem::new("q")).await.unwrap();
    assert_eq!(capped.iterations, 1);
    assert_eq!(capped.metadata.stop_reason, StopReason::MaxIterations);
    assert!(!capped.metadata.converged);
}

#[tokio::test]
async fn cancellation_before_first_call_aborts_without_partial_writes() {
    let store = Arc::new(MemoryJobStore::new());
    let generator = generator(vec![]);
    let store_handle: Arc<dyn JobStore> = store.clone();
    let engine = SelfEvolve::new(generator.clone(), evaluator(vec![]), refiner())
        .with_job_binding("job-cancel", store_handle);

    engine.cancel();
    let err = engine.solve(&Problem::new("q")).await.unwrap_err();
    assert!(matches!(err, SolveError::Cancelled));
    assert_eq!(generator.call_count(), 0);

    let job = store.get_job_fields("job-cancel").await.unwrap();
    assert!(!job.contains_key(fields::PARTIAL_RESULTS));
}

#[tokio::test]
async fn partial_results_are_written_per_iteration() {
    let store = Arc::new(MemoryJobStore::new());
    let evaluator = evaluator(vec![eval_result("Done. <stop>", true, 2)]);
    let store_handle: Arc<dyn JobStore> = store.clone();
    let engine = SelfEvolve::new(generator(vec![]), evaluator, refiner())
        .with_max_iters(2)
        .with_job_binding("job-partial", store_handle);

    engine.solve(&Problem::new("q")).await.unwrap();

    let job = store.get_job_fields("job-partial").await.unwrap();
    let snapshot: serde_json::Value =
        serde_json::from_str(job.get(fields::PARTIAL_RESULTS).unwrap()).unwrap();
    assert_eq!(snapshot["iterations"], 1);
    assert_eq!(snapshot["latest_iteration"]["iteration"], 1);
    assert!(snapshot["evolution_history"].is_array());
}

#[tokio::test]
async fn professor_generator_skips_evaluation_on_final_iteration() {
    let generator = ScriptedAgent::new("professor", Vec::new(), gen_result(VALID_OUTPUT, 10));
    let evaluator = evaluator(vec![]);
    let engine = SelfEvolve::new(generator, evaluator.clone(), refiner()).with_max_iters(2);

    let solution = engine.solve(&Problem::new("q")).await.unwrap();

    assert_eq!(solution.iterations, 2);
    assert!(solution.metadata.converged);
    assert_eq!(solution.metadata.stop_reason, StopReason::EvaluatorStop);
    // only the first iteration was evaluated
    assert_eq!(evaluator.call_count(), 1);
    let last = solution.evolution_history.last().unwrap();
    assert_eq!(last.feedback, "Final iteration, evaluation skipped.");
    assert_eq!(last.metadata.evaluator.status.as_deref(), Some("skipped"));
    assert_eq!(solution.metadata.specialist_consultations, Some(0));
}

#[tokio::test]
async fn answer_convergence_shortcut_stops_after_three_identical_answers() {
    let tagged = "Working through the problem carefully, the final value is <answer>42</answer> here.";
    let generator = ScriptedAgent::new("generator", Vec::new(), gen_result(tagged, 4));
    let settings = Settings::default().with_answer_convergence_shortcut(true);
    let engine = SelfEvolve::new(generator, evaluator(vec![]), refiner())
        .with_settings(settings)
        .with_max_iters(5);

    let solution = engine.solve(&Problem::new("q")).await.unwrap();
    assert_eq!(solution.iterations, 3);
    assert!(solution.metadata.answer_converged);
    assert!(solution.metadata.converged);
}

#[tokio::test]
async fn solution_round_trips_through_serde() {
    let evaluator = evaluator(vec![eval_result("Done. <stop>", true, 2)]);
    let engine = SelfEvolve::new(generator(vec![]), evaluator, refiner());
    let solution = engine.solve(&Problem::new("q")).await.unwrap();

    let serialized = serde_json::to_string(&solution).unwrap();
    let restored: selfevolve::engine::Solution = serde_json::from_str(&serialized).unwrap();
    let reserialized = serde_json::to_string(&restored).unwrap();
    assert_eq!(serialized, reserialized);
    assert_eq!(restored.iterations, solution.iterations);
    assert_eq!(restored.output, solution.output);
    assert_eq!(
        restored.evolution_history.len(),
        solution.evolution_history.len()
    );
}
