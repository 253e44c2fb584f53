//! Abstract job broker: task submissions keyed by job id.
//!
//! The front-end submits `{task_name, args, task_id}` triples; the task id
//! always equals the job id so external revocation maps onto the engine's
//! cancellation path.  [`ChannelBroker`] is the in-process implementation:
//! its receiving half feeds [`Worker::run`](crate::selfevolve::worker::Worker::run).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use tokio::sync::mpsc;

/// A unit of work handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    /// Task routing name, e.g. `"solve_basic"`.
    pub task_name: String,
    /// Job id; doubles as the broker task id.
    pub task_id: String,
    /// Task arguments, serialized.
    pub args: serde_json::Value,
}

/// Broker operation failure.
#[derive(Debug, Clone)]
pub struct BrokerError(pub String);

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Broker error: {}", self.0)
    }
}

impl Error for BrokerError {}

/// Abstract task queue.
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Enqueue a submission for some worker to pick up.
    async fn submit(&self, job: JobSubmission) -> Result<(), BrokerError>;
}

/// In-process broker over an unbounded channel.
pub struct ChannelBroker {
    tx: mpsc::UnboundedSender<JobSubmission>,
}

impl ChannelBroker {
    /// Create a broker plus the receiving half a worker loop consumes.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobSubmission>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobBroker for ChannelBroker {
    async fn submit(&self, job: JobSubmission) -> Result<(), BrokerError> {
        self.tx
            .send(job)
            .map_err(|e| BrokerError(format!("queue closed: {}", e)))
    }
}
