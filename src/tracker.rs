use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use crate::error::EngineError;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::queue::JobQueue;

/// Answers "what happened to my booking?" by job id. Reads only the job's
/// queue state and result, never the booking store.
#[derive(Clone)]
pub struct StatusTracker {
    queue: Arc<dyn JobQueue>,
    hub: Arc<NotifyHub>,
}

/// Map a job record to its client-facing status.
pub fn report(record: &JobRecord) -> StatusReport {
    match (record.state, &record.outcome) {
        (JobState::Waiting | JobState::Active, _) => StatusReport::Pending,
        (JobState::Completed, Some(JobOutcome::Booked(booking))) => StatusReport::Success {
            booking: booking.clone(),
        },
        (JobState::Completed, Some(JobOutcome::Rejected { reason })) => StatusReport::Failed {
            reason: reason.clone(),
        },
        (JobState::Completed, None) => StatusReport::Failed {
            reason: "job completed without a result".into(),
        },
        (JobState::Failed, _) => StatusReport::Failed {
            reason: record
                .failed_reason
                .clone()
                .unwrap_or_else(|| "unknown failure".into()),
        },
    }
}

impl StatusTracker {
    pub fn new(queue: Arc<dyn JobQueue>, hub: Arc<NotifyHub>) -> Self {
        Self { queue, hub }
    }

    pub fn status(&self, job_id: JobId) -> Result<StatusReport, EngineError> {
        self.queue
            .get(job_id)
            .map(|record| report(&record))
            .ok_or(EngineError::JobNotFound(job_id))
    }

    /// Like [`StatusTracker::status`], but waits up to `timeout` for the job to
    /// settle. Returns `Pending` if it has not settled by then.
    pub async fn wait(&self, job_id: JobId, timeout: Duration) -> Result<StatusReport, EngineError> {
        // Subscribe before the first read so a settle in between is not missed.
        let mut rx = self.hub.subscribe(job_id);
        let current = self.status(job_id);
        if !matches!(current, Ok(StatusReport::Pending)) {
            drop(rx);
            self.hub.release(job_id);
            return current;
        }

        let settled = tokio::time::timeout(timeout, async {
            loop {
                match rx.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => return,
                    Err(RecvError::Closed) => {
                        // Channel replaced or dropped; fall back to polling the record.
                        if self.status(job_id).map(|r| r.is_settled()).unwrap_or(true) {
                            return;
                        }
                        rx = self.hub.subscribe(job_id);
                    }
                }
            }
        })
        .await;
        if settled.is_err() {
            drop(rx);
            self.hub.release(job_id);
        }
        self.status(job_id)
    }
}
