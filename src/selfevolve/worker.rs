//! Worker adapter: consumes broker submissions, owns single-flight locks,
//! and maps engine progress and outcomes onto the job store.
//!
//! One worker processes jobs sequentially from its channel; run several
//! workers over clones of the same store for between-job parallelism.
//! Within a job the engine is strictly serial, so the worker's only
//! concurrent companion is a lightweight watcher task that polls the job's
//! `cancel_requested` field and forwards it to the engine's cancel handle.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use selfevolve::broker::ChannelBroker;
//! use selfevolve::provider::Provider;
//! use selfevolve::providers::openai::OpenAiCompatProvider;
//! use selfevolve::store::MemoryJobStore;
//! use selfevolve::worker::{submit_solve_job, SolveRequest, Worker};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryJobStore::new());
//! let (broker, rx) = ChannelBroker::new();
//!
//! let worker = Worker::new(
//!     store.clone(),
//!     Arc::new(|| -> Arc<dyn Provider> {
//!         Arc::new(OpenAiCompatProvider::new("key", "gpt-4.1-mini"))
//!     }),
//! );
//! tokio::spawn(async move { worker.run(rx).await });
//!
//! let request = SolveRequest::new("Is 561 a Carmichael number?");
//! let job_id = submit_solve_job(store.as_ref(), &broker, &request).await?;
//! println!("submitted {}", job_id);
//! # Ok(())
//! # }
//! ```

use crate::selfevolve::broker::{JobBroker, JobSubmission};
use crate::selfevolve::config::Settings;
use crate::selfevolve::engine::{CancelHandle, IterationRecord, Solution, SolveError};
use crate::selfevolve::provider::Provider;
use crate::selfevolve::runner::{BasicRunner, EnhancedRunner, ProgressCallback, ProgressUpdate};
use crate::selfevolve::store::{fields, lock_key, JobStatus, JobStore, StoreError};
use chrono::Utc;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Task routing names understood by [`Worker::process`].
pub mod tasks {
    pub const SOLVE_BASIC: &str = "solve_basic";
    pub const SOLVE_ENHANCED: &str = "solve_enhanced";
    pub const CONTINUE_BASIC: &str = "continue_basic";
    pub const CONTINUE_ENHANCED: &str = "continue_enhanced";
}

/// Solve mode requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolveMode {
    Basic,
    Enhanced,
}

impl Default for SolveMode {
    fn default() -> Self {
        SolveMode::Basic
    }
}

impl SolveMode {
    /// The wire representation stored in the job record's `mode` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            SolveMode::Basic => "basic",
            SolveMode::Enhanced => "enhanced",
        }
    }

    fn solve_task(&self) -> &'static str {
        match self {
            SolveMode::Basic => tasks::SOLVE_BASIC,
            SolveMode::Enhanced => tasks::SOLVE_ENHANCED,
        }
    }

    fn continue_task(&self) -> &'static str {
        match self {
            SolveMode::Basic => tasks::CONTINUE_BASIC,
            SolveMode::Enhanced => tasks::CONTINUE_ENHANCED,
        }
    }
}

/// A client solve request, persisted verbatim in the job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveRequest {
    /// The question to solve.
    pub question: String,
    /// Optional context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Optional constraints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<String>,
    /// Requested mode.
    #[serde(default)]
    pub mode: SolveMode,
    /// Optional iteration-cap override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_iters: Option<usize>,
    /// Free-form request metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl SolveRequest {
    /// Create a basic-mode request from a question.
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            context: None,
            constraints: None,
            mode: SolveMode::Basic,
            n_iters: None,
            metadata: HashMap::new(),
        }
    }

    /// Select the solve mode (builder pattern).
    pub fn with_mode(mut self, mode: SolveMode) -> Self {
        self.mode = mode;
        self
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

    /// Override the iteration cap (builder pattern).
    pub fn with_n_iters(mut self, n_iters: usize) -> Self {
        self.n_iters = Some(n_iters);
        self
    }
}

/// Arguments of the continuation tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinueArgs {
    /// The original request being continued.
    pub request: SolveRequest,
    /// Evolution history accumulated so far.
    pub evolution_history: Vec<IterationRecord>,
    /// Additional iterations to run on top of the history.
    pub additional_iterations: usize,
}

/// Worker failure.
#[derive(Debug)]
pub enum WorkerError {
    /// Task arguments did not deserialize.
    BadRequest(String),
    /// A store operation failed.
    Store(StoreError),
    /// Unknown task name.
    UnknownTask(String),
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            WorkerError::Store(e) => write!(f, "{}", e),
            WorkerError::UnknownTask(name) => write!(f, "Unknown task: {}", name),
        }
    }
}

impl Error for WorkerError {}

impl From<StoreError> for WorkerError {
    fn from(e: StoreError) -> Self {
        WorkerError::Store(e)
    }
}

/// Factory producing one provider per job, so providers are never shared
/// across engines.
pub type ProviderFactory = Arc<dyn Fn() -> Arc<dyn Provider> + Send + Sync>;

/// The worker adapter.
pub struct Worker {
    store: Arc<dyn JobStore>,
    provider_factory: ProviderFactory,
    settings: Settings,
}

impl Worker {
    /// Create a worker over a store and a per-job provider factory.
    pub fn new(store: Arc<dyn JobStore>, provider_factory: ProviderFactory) -> Self {
        Self {
            store,
            provider_factory,
            settings: Settings::default(),
        }
    }

    /// Replace the settings (builder pattern).
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Drain submissions from a channel until it closes.
    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<JobSubmission>) {
        while let Some(job) = rx.recv().await {
            let job_id = job.task_id.clone();
            if let Err(e) = self.process(job).await {
                error!("[{}] worker task failed: {}", job_id, e);
            }
        }
    }

    /// Process one submission end to end.
    ///
    /// Acquires the job's single-flight lock first; when another worker
    /// already holds it, logs the duplicate and returns without touching
    /// the job record.
    pub async fn process(&self, job: JobSubmission) -> Result<(), WorkerError> {
        let job_id = job.task_id.clone();
        let lock = lock_key(&job_id);
        let holder = Uuid::new_v4().to_string();

        let have_lock = match self
            .store
            .acquire_lock(&lock, &holder, self.settings.lock_ttl)
            .await
        {
            Ok(have_lock) => have_lock,
            Err(e) => {
                warn!("[{}] failed to acquire single-flight lock: {}", job_id, e);
                false
            }
        };
        if !have_lock {
            let status = self
                .store
                .get_job_fields(&job_id)
                .await
                .ok()
                .and_then(|f| f.get(fields::STATUS).cloned())
                .unwrap_or_default();
            info!(
                "Duplicate task detected for {}; status={}. Skipping.",
                job_id, status
            );
            return Ok(());
        }

        let outcome = self.execute(&job_id, &job.task_name, job.args).await;
        if let Err(e) = self.store.release_lock(&lock).await {
            warn!("[{}] failed to release lock: {}", job_id, e);
        }
        outcome
    }

    async fn execute(
        &self,
        job_id: &str,
        task_name: &str,
        args: serde_json::Value,
    ) -> Result<(), WorkerError> {
        // A cancellation that arrived while the job sat in the queue moves
        // it straight from pending to cancelled.
        let current = self.store.get_job_fields(job_id).await?;
        let already_cancelled = current
            .get(fields::STATUS)
            .and_then(|s| JobStatus::parse(s))
            == Some(JobStatus::Cancelled)
            || current.get(fields::CANCEL_REQUESTED).map(String::as_str) == Some("1");
        if already_cancelled {
            info!("[{}] cancelled before start", job_id);
            self.store
                .set_job_fields(
                    job_id,
                    vec![
                        (fields::STATUS.to_string(), JobStatus::Cancelled.as_str().to_string()),
                        (fields::COMPLETED_AT.to_string(), now()),
                    ],
                )
                .await?;
            return Ok(());
        }

        let provider = (self.provider_factory)();
        self.store
            .set_job_fields(
                job_id,
                vec![
                    (fields::STATUS.to_string(), JobStatus::Running.as_str().to_string()),
                    (fields::STARTED_AT.to_string(), now()),
                    (fields::MODEL_NAME.to_string(), provider.model_name().to_string()),
                    (
                        fields::PROVIDER_NAME.to_string(),
                        provider.provider_name().to_string(),
                    ),
                ],
            )
            .await?;

        let publishing = Arc::new(AtomicBool::new(true));
        let progress = self.progress_callback(job_id.to_string(), publishing.clone());

        let result = match task_name {
            tasks::SOLVE_BASIC | tasks::SOLVE_ENHANCED => {
                let request: SolveRequest = match serde_json::from_value(args) {
                    Ok(request) => request,
                    Err(e) => {
                        let err = WorkerError::BadRequest(e.to_string());
                        self.record_failure(job_id, &err.to_string()).await?;
                        return Err(err);
                    }
                };
                self.run_solve(job_id, task_name, request, provider, publishing.clone(), progress)
                    .await
            }
            tasks::CONTINUE_BASIC | tasks::CONTINUE_ENHANCED => {
                let continue_args: ContinueArgs = match serde_json::from_value(args) {
                    Ok(continue_args) => continue_args,
                    Err(e) => {
                        let err = WorkerError::BadRequest(e.to_string());
                        self.record_failure(job_id, &err.to_string()).await?;
                        return Err(err);
                    }
                };
                self.run_continue(
                    job_id,
                    task_name,
                    continue_args,
                    provider,
                    publishing.clone(),
                    progress,
                )
                .await
            }
            other => {
                let err = WorkerError::UnknownTask(other.to_string());
                self.record_failure(job_id, &err.to_string()).await?;
                return Err(err);
            }
        };

        publishing.store(false, Ordering::SeqCst);
        match result {
            Ok(solution) => self.record_success(job_id, &solution).await,
            Err(SolveError::Cancelled) => {
                info!("[{}] job cancelled", job_id);
                self.store
                    .set_job_fields(
                        job_id,
                        vec![
                            (
                                fields::STATUS.to_string(),
                                JobStatus::Cancelled.as_str().to_string(),
                            ),
                            (fields::COMPLETED_AT.to_string(), now()),
                        ],
                    )
                    .await?;
                Ok(())
            }
            Err(e) => {
                error!("[{}] solve failed: {}", job_id, e);
                self.record_failure(job_id, &e.to_string()).await
            }
        }
    }

    async fn run_solve(
        &self,
        job_id: &str,
        task_name: &str,
        request: SolveRequest,
        provider: Arc<dyn Provider>,
        publishing: Arc<AtomicBool>,
        progress: ProgressCallback,
    ) -> Result<Solution, SolveError> {
        let mut settings = self.settings.clone();
        if let Some(n_iters) = request.n_iters {
            match task_name {
                tasks::SOLVE_ENHANCED => settings.professor_max_iters = n_iters.max(1),
                _ => settings.max_iters = n_iters.max(1),
            }
        }

        let mut metadata = request.metadata.clone();
        metadata.insert("job_id".to_string(), job_id.to_string());

        if task_name == tasks::SOLVE_ENHANCED {
            let runner = EnhancedRunner::new(provider)
                .with_settings(settings)
                .with_job_binding(job_id.to_string(), self.store.clone());
            let watcher = self.spawn_cancel_watcher(
                job_id.to_string(),
                runner.cancel_handle(),
                publishing,
            );
            let result = runner
                .solve_with_metadata(
                    &request.question,
                    request.context.clone(),
                    request.constraints.clone(),
                    metadata,
                    Some(progress),
                )
                .await;
            watcher.abort();
            result
        } else {
            let runner = BasicRunner::new(provider)
                .with_settings(settings)
                .with_job_binding(job_id.to_string(), self.store.clone());
            let watcher = self.spawn_cancel_watcher(
                job_id.to_string(),
                runner.cancel_handle(),
                publishing,
            );
            let result = runner
                .solve_with_metadata(
                    &request.question,
                    request.context.clone(),
                    request.constraints.clone(),
                    metadata,
                    Some(progress),
                )
                .await;
            watcher.abort();
            result
        }
    }

    async fn run_continue(
        &self,
        job_id: &str,
        task_name: &str,
        continue_args: ContinueArgs,
        provider: Arc<dyn Provider>,
        publishing: Arc<AtomicBool>,
        progress: ProgressCallback,
    ) -> Result<Solution, SolveError> {
        let ContinueArgs {
            request,
            evolution_history,
            additional_iterations,
        } = continue_args;

        if task_name == tasks::CONTINUE_ENHANCED {
            let runner = EnhancedRunner::new(provider)
                .with_settings(self.settings.clone())
                .with_job_binding(job_id.to_string(), self.store.clone());
            let watcher = self.spawn_cancel_watcher(
                job_id.to_string(),
                runner.cancel_handle(),
                publishing,
            );
            let result = runner
                .resume_solve(
                    &request.question,
                    request.context.clone(),
                    request.constraints.clone(),
                    evolution_history,
                    additional_iterations,
                    Some(progress),
                )
                .await;
            watcher.abort();
            result
        } else {
            let runner = BasicRunner::new(provider)
                .with_settings(self.settings.clone())
                .with_job_binding(job_id.to_string(), self.store.clone());
            let watcher = self.spawn_cancel_watcher(
                job_id.to_string(),
                runner.cancel_handle(),
                publishing,
            );
            let result = runner
                .resume_solve(
                    &request.question,
                    request.context.clone(),
                    request.constraints.clone(),
                    evolution_history,
                    additional_iterations,
                    Some(progress),
                )
                .await;
            watcher.abort();
            result
        }
    }

    /// Watch the job's `cancel_requested` field and forward it to the
    /// engine's cancel handle.  Also stops progress publication so a
    /// cancelled job goes quiet immediately.
    fn spawn_cancel_watcher(
        &self,
        job_id: String,
        handle: CancelHandle,
        publishing: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(250)).await;
                match store.get_job_fields(&job_id).await {
                    Ok(fields_map) => {
                        let requested = fields_map
                            .get(fields::CANCEL_REQUESTED)
                            .map(String::as_str)
                            == Some("1");
                        if requested {
                            info!("[{}] cancellation signal observed", job_id);
                            publishing.store(false, Ordering::SeqCst);
                            handle.cancel();
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("[{}] cancel watcher store read failed: {}", job_id, e);
                        break;
                    }
                }
            }
        })
    }

    fn progress_callback(&self, job_id: String, publishing: Arc<AtomicBool>) -> ProgressCallback {
        let store = self.store.clone();
        Arc::new(move |update: &ProgressUpdate| {
            if !publishing.load(Ordering::SeqCst) {
                return;
            }
            let store = store.clone();
            let job_id = job_id.clone();
            let mut job_fields = vec![
                (fields::PROGRESS.to_string(), format!("{:.4}", update.progress)),
                (fields::CURRENT_PHASE.to_string(), update.phase.clone()),
            ];
            if let Some(reasoning) = update.reasoning_tokens {
                job_fields.push((fields::REASONING_TOKENS.to_string(), reasoning.to_string()));
            }
            info!(
                "[{}] Progress update: {:.1}% - {}",
                job_id,
                update.progress * 100.0,
                update.phase
            );
            tokio::spawn(async move {
                if let Err(e) = store.set_job_fields(&job_id, job_fields).await {
                    warn!("[{}] progress write failed: {}", job_id, e);
                }
            });
        })
    }

    async fn record_success(&self, job_id: &str, solution: &Solution) -> Result<(), WorkerError> {
        let payload = serde_json::to_string(solution)
            .map_err(|e| WorkerError::BadRequest(format!("unserializable solution: {}", e)))?;
        self.store
            .set_job_fields(
                job_id,
                vec![
                    (
                        fields::STATUS.to_string(),
                        JobStatus::Completed.as_str().to_string(),
                    ),
                    (fields::COMPLETED_AT.to_string(), now()),
                    (fields::RESULT.to_string(), payload),
                    (fields::PROGRESS.to_string(), "1.0000".to_string()),
                    (
                        fields::REASONING_TOKENS.to_string(),
                        solution.metadata.reasoning_tokens.to_string(),
                    ),
                ],
            )
            .await?;
        info!("[{}] job completed", job_id);
        Ok(())
    }

    async fn record_failure(&self, job_id: &str, error_text: &str) -> Result<(), WorkerError> {
        self.store
            .set_job_fields(
                job_id,
                vec![
                    (
                        fields::STATUS.to_string(),
                        JobStatus::Failed.as_str().to_string(),
                    ),
                    (fields::COMPLETED_AT.to_string(), now()),
                    (fields::ERROR.to_string(), error_text.to_string()),
                ],
            )
            .await?;
        Ok(())
    }
}

/// Mint a job id, persist the pending record, and enqueue the solve task.
pub async fn submit_solve_job(
    store: &dyn JobStore,
    broker: &dyn JobBroker,
    request: &SolveRequest,
) -> Result<String, WorkerError> {
    let job_id = Uuid::new_v4().to_string();
    let payload = serde_json::to_value(request)
        .map_err(|e| WorkerError::BadRequest(e.to_string()))?;
    let serialized = payload.to_string();

    store
        .set_job_fields(
            &job_id,
            vec![
                (fields::JOB_ID.to_string(), job_id.clone()),
                (
                    fields::STATUS.to_string(),
                    JobStatus::Pending.as_str().to_string(),
                ),
                (fields::CREATED_AT.to_string(), now()),
                (fields::REQUEST.to_string(), serialized),
                (fields::MODE.to_string(), request.mode.as_str().to_string()),
                (fields::PROGRESS.to_string(), "0.0000".to_string()),
            ],
        )
        .await?;

    broker
        .submit(JobSubmission {
            task_name: request.mode.solve_task().to_string(),
            task_id: job_id.clone(),
            args: payload,
        })
        .await
        .map_err(|e| WorkerError::BadRequest(e.to_string()))?;

    Ok(job_id)
}

/// Mint a continuation job for `parent_job_id`, persist the pending record
/// (including `continued_from`), and enqueue the continue task.
pub async fn submit_continue_job(
    store: &dyn JobStore,
    broker: &dyn JobBroker,
    parent_job_id: &str,
    request: &SolveRequest,
    evolution_history: Vec<IterationRecord>,
    additional_iterations: usize,
) -> Result<String, WorkerError> {
    let job_id = Uuid::new_v4().to_string();
    let continue_args = ContinueArgs {
        request: request.clone(),
        evolution_history,
        additional_iterations,
    };
    let payload = serde_json::to_value(&continue_args)
        .map_err(|e| WorkerError::BadRequest(e.to_string()))?;

    store
        .set_job_fields(
            &job_id,
            vec![
                (fields::JOB_ID.to_string(), job_id.clone()),
                (
                    fields::STATUS.to_string(),
                    JobStatus::Pending.as_str().to_string(),
                ),
                (fields::CREATED_AT.to_string(), now()),
                (
                    fields::REQUEST.to_string(),
                    serde_json::to_value(request)
                        .map_err(|e| WorkerError::BadRequest(e.to_string()))?
                        .to_string(),
                ),
                (fields::MODE.to_string(), request.mode.as_str().to_string()),
                (fields::CONTINUED_FROM.to_string(), parent_job_id.to_string()),
                (fields::PROGRESS.to_string(), "0.0000".to_string()),
            ],
        )
        .await?;

    broker
        .submit(JobSubmission {
            task_name: request.mode.continue_task().to_string(),
            task_id: job_id.clone(),
            args: payload,
        })
        .await
        .map_err(|e| WorkerError::BadRequest(e.to_string()))?;

    Ok(job_id)
}

/// Request cancellation of a job.
///
/// A still-pending job moves straight to `cancelled`; a running job gets
/// its `cancel_requested` flag set, which the owning worker forwards to the
/// engine at its next checkpoint.
pub async fn request_cancellation(store: &dyn JobStore, job_id: &str) -> Result<(), WorkerError> {
    let current = store.get_job_fields(job_id).await?;
    let status = current
        .get(fields::STATUS)
        .and_then(|s| JobStatus::parse(s));

    if status == Some(JobStatus::Pending) {
        store
            .set_job_fields(
                job_id,
                vec![
                    (
                        fields::STATUS.to_string(),
                        JobStatus::Cancelled.as_str().to_string(),
                    ),
                    (fields::COMPLETED_AT.to_string(), now()),
                    (fields::CANCEL_REQUESTED.to_string(), "1".to_string()),
                ],
            )
            .await?;
    } else {
        store
            .set_job_fields(
                job_id,
                vec![(fields::CANCEL_REQUESTED.to_string(), "1".to_string())],
            )
            .await?;
    }
    Ok(())
}

fn now() -> String {
    Utc::now().to_rfc3339()
}
