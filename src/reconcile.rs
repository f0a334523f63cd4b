use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::model::*;
use crate::observability;
use crate::queue::DurableQueue;
use crate::service::BookingService;
use crate::store::BookingStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// PENDING bookings whose job had already settled.
    pub settled_job: usize,
    /// PENDING bookings no job refers to, older than the grace period.
    pub orphaned: usize,
}

impl ReconcileReport {
    pub fn total(&self) -> usize {
        self.settled_job + self.orphaned
    }
}

/// One consistency sweep over PENDING bookings.
///
/// A settled job must never leave its booking PENDING; if one does, that is
/// a bug elsewhere, so it is logged as an error before being repaired. A
/// PENDING booking without any job is what a crash between booking insert
/// and enqueue leaves behind; it gets `grace_ms` to be picked up first.
pub async fn reconcile_once(
    store: &BookingStore,
    queue: &DurableQueue,
    grace_ms: Ms,
    now: Ms,
) -> ReconcileReport {
    let pending = store.with_status(BookingStatus::Pending);
    if pending.is_empty() {
        return ReconcileReport::default();
    }
    let job_states: HashMap<BookingId, (JobId, JobState)> = queue
        .records()
        .into_iter()
        .map(|r| (r.payload.booking_id, (r.id, r.state)))
        .collect();

    let mut report = ReconcileReport::default();
    for booking in pending {
        let (kind, reason) = match job_states.get(&booking.id) {
            Some((job_id, state)) if state.is_terminal() => {
                error!(
                    "job {job_id} is {state:?} but booking {} is still PENDING",
                    booking.id
                );
                ("settled_job", "job settled without a decision")
            }
            Some(_) => continue,
            None if now - booking.created_at > grace_ms => {
                warn!("booking {} has no job after {grace_ms}ms", booking.id);
                ("orphaned", "no job was enqueued")
            }
            None => continue,
        };
        match store.mark_failed(booking.id, reason).await {
            Ok(Some(_)) => {
                metrics::counter!(observability::RECONCILE_REPAIRS_TOTAL, "kind" => kind)
                    .increment(1);
                if kind == "settled_job" {
                    report.settled_job += 1;
                } else {
                    report.orphaned += 1;
                }
            }
            Ok(None) => debug!("booking {} settled during reconcile", booking.id),
            Err(e) => error!("booking {} could not be repaired: {e}", booking.id),
        }
    }
    report
}

/// Background task that periodically runs [`reconcile_once`].
pub async fn run_reconciler(
    service: Arc<BookingService>,
    every: Duration,
    grace_ms: Ms,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let report = service.reconcile(grace_ms).await;
        if report.total() > 0 {
            info!(
                "reconciled {} booking(s): {} settled-job, {} orphaned",
                report.total(),
                report.settled_job,
                report.orphaned
            );
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(
    service: Arc<BookingService>,
    threshold: u64,
    retention_ms: Ms,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let appends = service.journal().appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match service.compact(retention_ms).await {
            Ok(written) => info!("compacted WAL: {appends} appends folded into {written} events"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::notify::NotifyHub;
    use crate::queue::JobQueue;
    use crate::wal::Wal;

    fn setup(name: &str) -> (BookingStore, DurableQueue) {
        let dir = std::env::temp_dir().join("seatwise_test_reconcile");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        let journal = Journal::start(Wal::open(&path).unwrap());
        (
            BookingStore::new(journal.clone()),
            DurableQueue::new(journal, Arc::new(NotifyHub::new()), 1),
        )
    }

    async fn admit(store: &BookingStore, queue: &DurableQueue) -> (Booking, JobId) {
        let booking = store.create_pending(1, 1, 1).await.unwrap();
        let job = queue
            .enqueue(
                BOOK_SEAT_JOB,
                BookSeat {
                    user_id: 1,
                    resource_id: 1,
                    seat_count: 1,
                    booking_id: booking.id,
                },
            )
            .await
            .unwrap();
        (booking, job)
    }

    #[tokio::test]
    async fn settled_job_with_pending_booking_is_repaired() {
        let (store, queue) = setup("settled.wal");
        let (booking, job) = admit(&store, &queue).await;
        queue.dequeue().await.unwrap();
        // Settle the job without touching the booking.
        queue.fail(job, "lost".into(), false).await.unwrap();

        let report = reconcile_once(&store, &queue, 60_000, now_ms()).await;
        assert_eq!(report, ReconcileReport { settled_job: 1, orphaned: 0 });
        assert_eq!(store.get(booking.id).unwrap().status, BookingStatus::Failed);

        let again = reconcile_once(&store, &queue, 60_000, now_ms()).await;
        assert_eq!(again.total(), 0);
    }

    #[tokio::test]
    async fn in_flight_jobs_are_left_alone() {
        let (store, queue) = setup("in_flight.wal");
        let (waiting, _) = admit(&store, &queue).await;
        let (active, _) = admit(&store, &queue).await;
        queue.dequeue().await.unwrap();

        let report = reconcile_once(&store, &queue, 0, now_ms() + 1_000_000).await;
        assert_eq!(report.total(), 0);
        assert_eq!(store.get(waiting.id).unwrap().status, BookingStatus::Pending);
        assert_eq!(store.get(active.id).unwrap().status, BookingStatus::Pending);
    }

    #[tokio::test]
    async fn orphan_booking_fails_after_grace() {
        let (store, queue) = setup("orphan.wal");
        let orphan = store.create_pending(1, 1, 1).await.unwrap();

        let early = reconcile_once(&store, &queue, 60_000, orphan.created_at + 10).await;
        assert_eq!(early.total(), 0);

        let late = reconcile_once(&store, &queue, 60_000, orphan.created_at + 60_001).await;
        assert_eq!(late, ReconcileReport { settled_job: 0, orphaned: 1 });
        assert_eq!(store.get(orphan.id).unwrap().status, BookingStatus::Failed);
        assert_eq!(
            store.failure_reason(orphan.id).as_deref(),
            Some("no job was enqueued")
        );
    }
}
