use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::EngineError;
use crate::limits::MAX_SEATS_PER_BOOKING;
use crate::model::*;
use crate::observability;
use crate::queue::JobQueue;
use crate::store::BookingStore;

/// Admission: turns a validated request into a PENDING booking plus a
/// `bookSeat` job, and hands back the job id without waiting for the
/// decision.
///
/// Admission never looks at capacity or at the resource catalog. The worker
/// decides both under the resource lock; a second, unlocked check here could
/// only disagree with it.
#[derive(Clone)]
pub struct Producer {
    store: Arc<BookingStore>,
    queue: Arc<dyn JobQueue>,
}

impl Producer {
    pub fn new(store: Arc<BookingStore>, queue: Arc<dyn JobQueue>) -> Self {
        Self { store, queue }
    }

    pub async fn submit(&self, request: BookingRequest) -> Result<JobId, EngineError> {
        if request.seat_count == 0 {
            return Err(EngineError::InvalidRequest("seat count must be positive"));
        }
        if request.seat_count > MAX_SEATS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("seat count too large"));
        }

        let booking = self
            .store
            .create_pending(request.user_id, request.resource_id, request.seat_count)
            .await?;
        let payload = BookSeat {
            user_id: booking.user_id,
            resource_id: booking.resource_id,
            seat_count: booking.seat_count,
            booking_id: booking.id,
        };

        match self.queue.enqueue(BOOK_SEAT_JOB, payload).await {
            Ok(job_id) => {
                metrics::counter!(observability::ADMISSIONS_TOTAL).increment(1);
                info!(
                    "admitted booking {} ({} seats on resource {}) as job {job_id}",
                    booking.id, booking.seat_count, booking.resource_id
                );
                Ok(job_id)
            }
            Err(e) => {
                warn!("enqueue failed for booking {}: {e}", booking.id);
                if let Err(comp) = self.store.mark_failed(booking.id, &e.reason()).await {
                    error!("booking {} left PENDING without a job: {comp}", booking.id);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::notify::NotifyHub;
    use crate::queue::DurableQueue;
    use crate::wal::Wal;
    use tokio_test::{assert_err, assert_ok};

    fn setup(name: &str) -> (Producer, Arc<BookingStore>, Arc<DurableQueue>) {
        let dir = std::env::temp_dir().join("seatwise_test_producer");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);

        let journal = Journal::start(Wal::open(&path).unwrap());
        let store = Arc::new(BookingStore::new(journal.clone()));
        let queue = Arc::new(DurableQueue::new(journal, Arc::new(NotifyHub::new()), 1));
        (Producer::new(store.clone(), queue.clone()), store, queue)
    }

    fn request(seat_count: u32) -> BookingRequest {
        BookingRequest {
            user_id: 5,
            resource_id: 9,
            seat_count,
        }
    }

    #[tokio::test]
    async fn submit_creates_pending_booking_and_waiting_job() {
        let (producer, store, queue) = setup("submit.wal");
        let job_id = assert_ok!(producer.submit(request(3)).await);

        let record = queue.get(job_id).unwrap();
        assert_eq!(record.state, JobState::Waiting);
        assert_eq!(record.name, BOOK_SEAT_JOB);
        assert_eq!(record.payload.seat_count, 3);
        assert_eq!(record.payload.user_id, 5);

        let booking = store.get(record.payload.booking_id).unwrap();
        assert_eq!(booking.status, BookingStatus::Pending);
        assert_eq!(booking.resource_id, 9);
    }

    #[tokio::test]
    async fn repeated_submits_are_not_deduplicated() {
        let (producer, store, queue) = setup("repeat.wal");
        let a = producer.submit(request(1)).await.unwrap();
        let b = producer.submit(request(1)).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn unknown_resource_is_still_admitted() {
        let (producer, store, _) = setup("unknown_resource.wal");
        assert_ok!(producer.submit(request(1)).await);
        assert_eq!(store.with_status(BookingStatus::Pending).len(), 1);
    }

    #[tokio::test]
    async fn out_of_range_seat_counts_write_nothing() {
        let (producer, store, queue) = setup("limits.wal");
        assert_eq!(
            producer.submit(request(0)).await.unwrap_err(),
            EngineError::InvalidRequest("seat count must be positive")
        );
        assert_err!(producer.submit(request(MAX_SEATS_PER_BOOKING + 1)).await);
        assert!(store.is_empty());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn failed_enqueue_fails_the_booking() {
        let (producer, store, queue) = setup("closed_queue.wal");
        queue.close();
        assert_eq!(
            producer.submit(request(2)).await.unwrap_err(),
            EngineError::QueueClosed
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.with_status(BookingStatus::Failed).len(), 1);
    }
}
