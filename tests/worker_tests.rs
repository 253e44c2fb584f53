use async_trait::async_trait;
use selfevolve::broker::ChannelBroker;
use selfevolve::engine::Solution;
use selfevolve::provider::{CompletionOptions, Provider, ProviderError};
use selfevolve::store::{fields, lock_key, JobStore, MemoryJobStore};
use selfevolve::worker::{
    request_cancellation, submit_continue_job, submit_solve_job, SolveMode, SolveRequest, Worker,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const QUESTION: &str = "Is 561 a Carmichael number?";
const ANSWER: &str = "Yes, 561 factors as 3 times 11 times 17 and satisfies Korselt's criterion, \
                      making it the smallest Carmichael number.";
const EVAL_STOP: &str = "The factorization and the Korselt check are both correct. <stop>";

struct RuleProvider {
    rules: Vec<(String, String)>,
    default_response: String,
    log: Mutex<Vec<String>>,
}

impl RuleProvider {
    fn new(rules: Vec<(&str, &str)>, default_response: &str) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            default_response: default_response.to_string(),
            log: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Provider for RuleProvider {
    async fn complete(
        &self,
        prompt: &str,
        _system_prompt: &str,
        _temperature: f32,
        _options: &CompletionOptions,
    ) -> Result<String, ProviderError> {
        self.log.lock().await.push(prompt.to_string());
        for (needle, response) in &self.rules {
            if prompt.contains(needle.as_str()) {
                return Ok(response.clone());
            }
        }
        Ok(self.default_response.clone())
    }

    fn model_name(&self) -> &str {
        "rule-model"
    }

    fn provider_name(&self) -> &str {
        "rule"
    }
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn solving_worker(store: Arc<MemoryJobStore>) -> Worker {
    Worker::new(
        store,
        Arc::new(|| -> Arc<dyn Provider> {
            Arc::new(RuleProvider::new(
                vec![
                    ("Evaluate the following answer", EVAL_STOP),
                    (QUESTION, ANSWER),
                ],
                "fallthrough response",
            ))
        }),
    )
}

fn failing_worker(store: Arc<MemoryJobStore>) -> Worker {
    // Every generation comes back empty, so the engine exhausts retries.
    Worker::new(
        store,
        Arc::new(|| -> Arc<dyn Provider> { Arc::new(RuleProvider::new(vec![], "")) }),
    )
}

#[tokio::test]
async fn completed_job_records_result_and_metadata() {
    init_logs();
    let store = Arc::new(MemoryJobStore::new());
    let (broker, mut rx) = ChannelBroker::new();
    let worker = solving_worker(store.clone());

    let request = SolveRequest::new(QUESTION).with_n_iters(2);
    let job_id = submit_solve_job(store.as_ref(), &broker, &request)
        .await
        .unwrap();

    let pending = store.get_job_fields(&job_id).await.unwrap();
    assert_eq!(pending.get(fields::STATUS).map(String::as_str), Some("pending"));
    assert_eq!(pending.get(fields::MODE).map(String::as_str), Some("basic"));
    assert!(pending.contains_key(fields::CREATED_AT));

    let submission = rx.recv().await.unwrap();
    assert_eq!(submission.task_id, job_id);
    worker.process(submission).await.unwrap();

    let job = store.get_job_fields(&job_id).await.unwrap();
    assert_eq!(job.get(fields::STATUS).map(String::as_str), Some("completed"));
    assert!(job.contains_key(fields::STARTED_AT));
    assert!(job.contains_key(fields::COMPLETED_AT));
    assert_eq!(job.get(fields::MODEL_NAME).map(String::as_str), Some("rule-model"));
    assert_eq!(job.get(fields::PROVIDER_NAME).map(String::as_str), Some("rule"));

    let solution: Solution = serde_json::from_str(job.get(fields::RESULT).unwrap()).unwrap();
    assert_eq!(solution.output, ANSWER);
    assert!(solution.metadata.converged);
    // the engine also left a partial snapshot behind
    assert!(job.contains_key(fields::PARTIAL_RESULTS));
}

#[tokio::test]
async fn duplicate_submissions_are_skipped_by_the_lock() {
    let store = Arc::new(MemoryJobStore::new());
    let (broker, mut rx) = ChannelBroker::new();
    let worker = solving_worker(store.clone());

    let job_id = submit_solve_job(store.as_ref(), &broker, &SolveRequest::new(QUESTION))
        .await
        .unwrap();

    // Another worker already holds the single-flight lock.
    assert!(store
        .acquire_lock(&lock_key(&job_id), "other-worker", Duration::from_secs(60))
        .await
        .unwrap());

    let submission = rx.recv().await.unwrap();
    worker.process(submission).await.unwrap();

    // No mutation happened: the job is still pending with no result.
    let job = store.get_job_fields(&job_id).await.unwrap();
    assert_eq!(job.get(fields::STATUS).map(String::as_str), Some("pending"));
    assert!(!job.contains_key(fields::RESULT));
    assert!(!job.contains_key(fields::STARTED_AT));
}

#[tokio::test]
async fn cancellation_of_a_pending_job_is_direct() {
    let store = Arc::new(MemoryJobStore::new());
    let (broker, mut rx) = ChannelBroker::new();
    let worker = solving_worker(store.clone());

    let job_id = submit_solve_job(store.as_ref(), &broker, &SolveRequest::new(QUESTION))
        .await
        .unwrap();
    request_cancellation(store.as_ref(), &job_id).await.unwrap();

    let cancelled = store.get_job_fields(&job_id).await.unwrap();
    assert_eq!(
        cancelled.get(fields::STATUS).map(String::as_str),
        Some("cancelled")
    );
    assert!(cancelled.contains_key(fields::COMPLETED_AT));

    // Processing the stale submission keeps the job cancelled and never
    // starts the engine.
    let submission = rx.recv().await.unwrap();
    worker.process(submission).await.unwrap();

    let job = store.get_job_fields(&job_id).await.unwrap();
    assert_eq!(job.get(fields::STATUS).map(String::as_str), Some("cancelled"));
    assert!(!job.contains_key(fields::RESULT));
    assert!(!job.contains_key(fields::STARTED_AT));
}

#[tokio::test]
async fn engine_failure_marks_the_job_failed() {
    let store = Arc::new(MemoryJobStore::new());
    let (broker, mut rx) = ChannelBroker::new();
    let worker = failing_worker(store.clone());

    let job_id = submit_solve_job(store.as_ref(), &broker, &SolveRequest::new(QUESTION))
        .await
        .unwrap();
    let submission = rx.recv().await.unwrap();
    worker.process(submission).await.unwrap();

    let job = store.get_job_fields(&job_id).await.unwrap();
    assert_eq!(job.get(fields::STATUS).map(String::as_str), Some("failed"));
    assert!(job
        .get(fields::ERROR)
        .unwrap()
        .contains("No valid iteration found"));
    assert!(job.contains_key(fields::COMPLETED_AT));
}

#[tokio::test]
async fn enhanced_mode_jobs_run_the_professor() {
    let store = Arc::new(MemoryJobStore::new());
    let (broker, mut rx) = ChannelBroker::new();

    // No structured function calling: the professor's analysis produces a
    // direct textual answer and the outer evaluator converges on it.
    let direct = "The problem needs no delegation, because Korselt's criterion settles it \
                  immediately for the number in question.";
    let worker = Worker::new(
        store.clone(),
        Arc::new(move || -> Arc<dyn Provider> {
            Arc::new(RuleProvider::new(
                vec![
                    ("Evaluate the following answer", EVAL_STOP),
                    ("Analyze this problem", direct),
                ],
                "fallthrough response",
            ))
        }),
    );

    let request = SolveRequest::new(QUESTION).with_mode(SolveMode::Enhanced);
    let job_id = submit_solve_job(store.as_ref(), &broker, &request)
        .await
        .unwrap();
    assert_eq!(
        store
            .get_job_fields(&job_id)
            .await
            .unwrap()
            .get(fields::MODE)
            .map(String::as_str),
        Some("enhanced")
    );

    let submission = rx.recv().await.unwrap();
    assert_eq!(submission.task_name, "solve_enhanced");
    worker.process(submission).await.unwrap();

    let job = store.get_job_fields(&job_id).await.unwrap();
    assert_eq!(job.get(fields::STATUS).map(String::as_str), Some("completed"));
    let solution: Solution = serde_json::from_str(job.get(fields::RESULT).unwrap()).unwrap();
    assert_eq!(solution.output, direct);
    assert_eq!(solution.metadata.specialist_consultations, Some(0));
}

#[tokio::test]
async fn continuation_jobs_resume_and_record_their_parent() {
    let store = Arc::new(MemoryJobStore::new());
    let (broker, mut rx) = ChannelBroker::new();
    let worker = solving_worker(store.clone());

    // First run to completion.
    let request = SolveRequest::new(QUESTION);
    let parent_id = submit_solve_job(store.as_ref(), &broker, &request)
        .await
        .unwrap();
    worker.process(rx.recv().await.unwrap()).await.unwrap();
    let parent = store.get_job_fields(&parent_id).await.unwrap();
    let parent_solution: Solution =
        serde_json::from_str(parent.get(fields::RESULT).unwrap()).unwrap();

    // Continue it for one more iteration.
    let child_id = submit_continue_job(
        store.as_ref(),
        &broker,
        &parent_id,
        &request,
        parent_solution.evolution_history.clone(),
        1,
    )
    .await
    .unwrap();

    let child_pending = store.get_job_fields(&child_id).await.unwrap();
    assert_eq!(
        child_pending.get(fields::CONTINUED_FROM).map(String::as_str),
        Some(parent_id.as_str())
    );

    let submission = rx.recv().await.unwrap();
    assert_eq!(submission.task_name, "continue_basic");
    worker.process(submission).await.unwrap();

    let child = store.get_job_fields(&child_id).await.unwrap();
    assert_eq!(child.get(fields::STATUS).map(String::as_str), Some("completed"));
    let child_solution: Solution =
        serde_json::from_str(child.get(fields::RESULT).unwrap()).unwrap();
    assert!(child_solution.iterations >= parent_solution.iterations);
}
