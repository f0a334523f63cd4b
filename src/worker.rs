use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::directory::ResourceDirectory;
use crate::error::EngineError;
use crate::model::*;
use crate::observability;
use crate::queue::JobQueue;
use crate::store::{fits, BookingStore};

/// Reason reported when a redelivered job finds its booking failed with no
/// recorded reason.
pub const ALREADY_FAILED: &str = "booking already failed";

/// The only component allowed to commit seats.
pub struct Arbiter {
    store: Arc<BookingStore>,
    directory: Arc<dyn ResourceDirectory>,
}

impl Arbiter {
    pub fn new(store: Arc<BookingStore>, directory: Arc<dyn ResourceDirectory>) -> Self {
        Self { store, directory }
    }

    /// Decide one booking. The seat count is read and the status written
    /// inside a single transaction on the resource partition.
    ///
    /// A full resource is an `Ok(Rejected)`, not an error. Errors are
    /// reserved for a missing resource or booking and for storage failures.
    pub async fn arbitrate(&self, job: &BookSeat) -> Result<JobOutcome, EngineError> {
        let resource = self
            .directory
            .lookup(job.resource_id)
            .await?
            .ok_or(EngineError::ResourceNotFound(job.resource_id))?;

        let mut tx = self.store.begin(resource.id).await;
        let booking = tx
            .booking(job.booking_id)
            .ok_or(EngineError::BookingNotFound(job.booking_id))?;

        // Redelivery after a crash between the booking commit and the job
        // settle: report what was already decided.
        match booking.status {
            BookingStatus::Booked => return Ok(JobOutcome::Booked(booking)),
            BookingStatus::Failed => {
                let reason = tx
                    .failure_reason(booking.id)
                    .unwrap_or_else(|| ALREADY_FAILED.into());
                return Ok(JobOutcome::Rejected { reason });
            }
            BookingStatus::Pending => {}
        }

        let committed = tx.committed_seats();
        if !fits(resource.total_seats, committed, booking.seat_count) {
            tx.fail(booking.id, INSUFFICIENT_CAPACITY)?;
            tx.commit().await?;
            debug!(
                "booking {} rejected: {} requested, {} of {} committed on resource {}",
                booking.id, booking.seat_count, committed, resource.total_seats, resource.id
            );
            return Ok(JobOutcome::Rejected {
                reason: INSUFFICIENT_CAPACITY.into(),
            });
        }

        tx.set_status(booking.id, BookingStatus::Booked)?;
        let booked = tx
            .commit()
            .await?
            .pop()
            .ok_or(EngineError::BookingNotFound(booking.id))?;
        debug!(
            "booking {} committed: {} seats, {} of {} now taken on resource {}",
            booked.id,
            booked.seat_count,
            committed + u64::from(booked.seat_count),
            resource.total_seats,
            resource.id
        );
        Ok(JobOutcome::Booked(booked))
    }
}

/// Run one dequeued job to a settled or requeued state.
pub async fn process(arbiter: &Arbiter, queue: &dyn JobQueue, job: Job) {
    let started = Instant::now();
    let result = arbiter.arbitrate(&job.payload).await;
    metrics::histogram!(observability::ARBITRATION_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(outcome) => {
            metrics::counter!(
                observability::ARBITRATIONS_TOTAL,
                "outcome" => observability::outcome_label(&outcome)
            )
            .increment(1);
            if let Err(e) = queue.complete(job.id, outcome).await {
                error!("job {}: decision committed but job not settled: {e}", job.id);
            }
        }
        Err(e) => {
            let retry = e.is_retryable() && job.attempts < queue.max_attempts();
            if retry {
                metrics::counter!(observability::ARBITRATIONS_TOTAL, "outcome" => "retried")
                    .increment(1);
                warn!("job {} attempt {} failed, retrying: {e}", job.id, job.attempts);
            } else {
                metrics::counter!(observability::ARBITRATIONS_TOTAL, "outcome" => "failed")
                    .increment(1);
                warn!("job {} failed: {e}", job.id);
                // Compensate outside the aborted transaction before the job
                // turns terminal, so no settled job points at a PENDING booking.
                if let Err(comp) = arbiter
                    .store
                    .mark_failed(job.payload.booking_id, &e.reason())
                    .await
                {
                    error!(
                        "job {}: booking {} could not be failed: {comp}",
                        job.id, job.payload.booking_id
                    );
                }
            }
            if let Err(qe) = queue.fail(job.id, e.reason(), retry).await {
                error!("job {}: failure not recorded: {qe}", job.id);
            }
        }
    }
}

async fn run_worker(
    index: usize,
    arbiter: Arc<Arbiter>,
    queue: Arc<dyn JobQueue>,
    cancel: CancellationToken,
) {
    debug!("worker {index} started");
    metrics::gauge!(observability::WORKERS_ACTIVE).increment(1.0);
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = queue.dequeue() => match job {
                Some(job) => job,
                None => break,
            },
        };
        // Once dequeued, a job runs to completion even if shutdown starts.
        process(&arbiter, queue.as_ref(), job).await;
    }
    metrics::gauge!(observability::WORKERS_ACTIVE).decrement(1.0);
    debug!("worker {index} stopped");
}

/// A set of long-lived arbitration workers with an explicit lifecycle.
pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(workers: usize, arbiter: Arc<Arbiter>, queue: Arc<dyn JobQueue>) -> Self {
        let workers = workers.clamp(1, crate::limits::MAX_WORKERS);
        let cancel = CancellationToken::new();
        let handles = (0..workers)
            .map(|index| {
                tokio::spawn(run_worker(
                    index,
                    arbiter.clone(),
                    queue.clone(),
                    cancel.child_token(),
                ))
            })
            .collect();
        info!("started {workers} arbitration worker(s)");
        Self { cancel, handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop taking new jobs and wait for in-flight ones to settle.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("worker task ended abnormally: {e}");
            }
        }
        info!("arbitration workers stopped");
    }
}
