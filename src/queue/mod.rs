mod durable;

pub use durable::DurableQueue;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::model::{BookSeat, Job, JobId, JobOutcome, JobRecord, JobState};

/// Work queue between admission and arbitration.
///
/// Enqueue order is FIFO and delivery is at-least-once: a job that was
/// handed out but never settled is delivered again after a restart, so
/// handlers must tolerate seeing the same job twice.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, name: &str, payload: BookSeat) -> Result<JobId, EngineError>;

    /// Wait for the next waiting job and mark it active. `None` once the
    /// queue is closed.
    async fn dequeue(&self) -> Option<Job>;

    /// Settle an active job with a result.
    async fn complete(&self, id: JobId, outcome: JobOutcome) -> Result<(), EngineError>;

    /// Report a failed attempt. Returns `Waiting` if the job was put back for
    /// another attempt, `Failed` if it is now terminal.
    async fn fail(&self, id: JobId, reason: String, retryable: bool)
    -> Result<JobState, EngineError>;

    fn get(&self, id: JobId) -> Option<JobRecord>;

    /// Deliveries allowed per job before a retryable failure becomes final.
    fn max_attempts(&self) -> u32;

    /// Stop handing out jobs and refuse new ones.
    fn close(&self);
}
