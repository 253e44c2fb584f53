//! Abstract job store: a hash-map-per-job with TTL and single-flight locks.
//!
//! The engine and worker only see the [`JobStore`] trait; any backend with
//! hash writes, existence checks, TTLs, and `SetNX`-style lock acquisition
//! satisfies it.  [`MemoryJobStore`] is the in-process implementation used
//! by tests and embedded deployments.
//!
//! Field names written into a job hash are contractual; see [`fields`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Lifecycle status of a job.
///
/// Transitions form the DAG `pending → running → (completed | failed |
/// cancelled)`; `cancelled` may also be reached directly from `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// The wire representation stored in the job hash.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Parse a wire representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Contractual field names of the persisted job record.
pub mod fields {
    pub const JOB_ID: &str = "job_id";
    pub const STATUS: &str = "status";
    pub const CREATED_AT: &str = "created_at";
    pub const STARTED_AT: &str = "started_at";
    pub const COMPLETED_AT: &str = "completed_at";
    pub const PROGRESS: &str = "progress";
    pub const CURRENT_PHASE: &str = "current_phase";
    pub const MODEL_NAME: &str = "model_name";
    pub const PROVIDER_NAME: &str = "provider_name";
    pub const REQUEST: &str = "request";
    pub const MODE: &str = "mode";
    pub const RESULT: &str = "result";
    pub const ERROR: &str = "error";
    pub const PARTIAL_RESULTS: &str = "partial_results";
    pub const CONTINUED_FROM: &str = "continued_from";
    pub const REASONING_TOKENS: &str = "reasoning_tokens";
    pub const CANCEL_REQUESTED: &str = "cancel_requested";
}

/// Key of the single-flight lock guarding `job_id`.
pub fn lock_key(job_id: &str) -> String {
    format!("lock:job:{}", job_id)
}

/// Store operation failure.
#[derive(Debug, Clone)]
pub struct StoreError(pub String);

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Store error: {}", self.0)
    }
}

impl Error for StoreError {}

/// Abstract hash-map-with-TTL job store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Idempotent merge of `fields` into the job hash.
    async fn set_job_fields(
        &self,
        job_id: &str,
        fields: Vec<(String, String)>,
    ) -> Result<(), StoreError>;

    /// The job hash, empty if absent.
    async fn get_job_fields(&self, job_id: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Set the job hash's expiry.
    async fn set_ttl(&self, job_id: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Whether the job hash exists.
    async fn exists(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Delete the job hash.
    async fn delete(&self, job_id: &str) -> Result<(), StoreError>;

    /// `SetNX`-style lock acquisition: returns `true` iff the lock was free
    /// (or expired) and is now held by `holder` for `ttl`.
    async fn acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Release a lock.  Releasing an unheld lock is a no-op.
    async fn release_lock(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<String, HashMap<String, String>>,
    expiries: HashMap<String, Instant>,
    locks: HashMap<String, (String, Instant)>,
}

impl MemoryState {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.jobs.remove(&key);
            self.expiries.remove(&key);
        }
    }
}

/// In-process [`JobStore`] backed by hash maps with TTL bookkeeping.
///
/// # Example
///
/// ```rust
/// use selfevolve::store::{fields, JobStore, MemoryJobStore};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MemoryJobStore::new();
/// store
///     .set_job_fields("job-1", vec![(fields::STATUS.to_string(), "pending".to_string())])
///     .await?;
/// assert!(store.exists("job-1").await?);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn set_job_fields(
        &self,
        job_id: &str,
        fields: Vec<(String, String)>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        let entry = state.jobs.entry(job_id.to_string()).or_default();
        for (key, value) in fields {
            entry.insert(key, value);
        }
        Ok(())
    }

    async fn get_job_fields(&self, job_id: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        Ok(state.jobs.get(job_id).cloned().unwrap_or_default())
    }

    async fn set_ttl(&self, job_id: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(job_id) {
            state
                .expiries
                .insert(job_id.to_string(), Instant::now() + ttl);
        }
        Ok(())
    }

    async fn exists(&self, job_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.purge_expired();
        Ok(state.jobs.contains_key(job_id))
    }

    async fn delete(&self, job_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.jobs.remove(job_id);
        state.expiries.remove(job_id);
        Ok(())
    }

    async fn acquire_lock(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if let Some((_, deadline)) = state.locks.get(key) {
            if *deadline > now {
                return Ok(false);
            }
        }
        state
            .locks
            .insert(key.to_string(), (holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_lock(&self, key: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.locks.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fields_merge_idempotently() {
        let store = MemoryJobStore::new();
        store
            .set_job_fields(
                "j",
                vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())],
            )
            .await
            .unwrap();
        store
            .set_job_fields("j", vec![("b".to_string(), "3".to_string())])
            .await
            .unwrap();
        let fields = store.get_job_fields("j").await.unwrap();
        assert_eq!(fields.get("a").map(String::as_str), Some("1"));
        assert_eq!(fields.get("b").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn absent_jobs_read_as_empty() {
        let store = MemoryJobStore::new();
        assert!(store.get_job_fields("missing").await.unwrap().is_empty());
        assert!(!store.exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn locks_are_single_flight_until_released() {
        let store = MemoryJobStore::new();
        let key = lock_key("j");
        assert!(store
            .acquire_lock(&key, "w1", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!store
            .acquire_lock(&key, "w2", Duration::from_secs(60))
            .await
            .unwrap());
        store.release_lock(&key).await.unwrap();
        assert!(store
            .acquire_lock(&key, "w2", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expired_locks_can_be_reacquired() {
        let store = MemoryJobStore::new();
        let key = lock_key("j");
        assert!(store
            .acquire_lock(&key, "w1", Duration::from_millis(5))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store
            .acquire_lock(&key, "w2", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn ttl_expires_job_hashes() {
        let store = MemoryJobStore::new();
        store
            .set_job_fields("j", vec![("a".to_string(), "1".to_string())])
            .await
            .unwrap();
        store.set_ttl("j", Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!store.exists("j").await.unwrap());
    }
}
