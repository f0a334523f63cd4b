use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use ulid::Ulid;

use super::JobQueue;
use crate::error::EngineError;
use crate::journal::Journal;
use crate::limits::MAX_WAITING_JOBS;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;

/// In-process FIFO queue made durable by the shared journal.
///
/// Every enqueue, retry and settle is journaled before it takes effect. The
/// active state is not: after a restart every unsettled job is waiting again,
/// which is what gives at-least-once delivery.
pub struct DurableQueue {
    jobs: DashMap<JobId, JobRecord>,
    waiting: Mutex<VecDeque<JobId>>,
    ready: Notify,
    closed: AtomicBool,
    max_attempts: u32,
    journal: Journal,
    hub: Arc<NotifyHub>,
}

impl DurableQueue {
    pub fn new(journal: Journal, hub: Arc<NotifyHub>, max_attempts: u32) -> Self {
        Self {
            jobs: DashMap::new(),
            waiting: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            max_attempts: max_attempts.max(1),
            journal,
            hub,
        }
    }

    pub async fn waiting_len(&self) -> usize {
        self.waiting.lock().await.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// All job records, oldest first.
    pub fn records(&self) -> Vec<JobRecord> {
        let mut out: Vec<JobRecord> = self.jobs.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|r| (r.enqueued_at, r.id));
        out
    }

    async fn push_waiting(&self, id: JobId) {
        let mut waiting = self.waiting.lock().await;
        waiting.push_back(id);
        metrics::gauge!(observability::QUEUE_WAITING).set(waiting.len() as f64);
        drop(waiting);
        self.ready.notify_one();
    }

    async fn pop_waiting(&self) -> Option<Job> {
        let mut waiting = self.waiting.lock().await;
        while let Some(id) = waiting.pop_front() {
            let Some(mut record) = self.jobs.get_mut(&id) else {
                continue;
            };
            if record.state != JobState::Waiting {
                continue;
            }
            record.state = JobState::Active;
            record.attempts += 1;
            metrics::gauge!(observability::QUEUE_WAITING).set(waiting.len() as f64);
            return Some(record.job());
        }
        None
    }

    fn active_attempts(&self, id: JobId) -> Result<u32, EngineError> {
        let record = self.jobs.get(&id).ok_or(EngineError::JobNotFound(id))?;
        if record.state != JobState::Active {
            return Err(EngineError::InvalidRequest("job is not active"));
        }
        Ok(record.attempts)
    }

    // ── Replay & compaction ──────────────────────────────────

    /// Apply a replayed WAL event. Booking events are ignored.
    pub fn replay(&self, event: &Event) {
        match event {
            Event::JobEnqueued { id, name, payload, at } => {
                self.jobs.insert(
                    *id,
                    JobRecord {
                        id: *id,
                        name: name.clone(),
                        payload: *payload,
                        state: JobState::Waiting,
                        attempts: 0,
                        outcome: None,
                        failed_reason: None,
                        enqueued_at: *at,
                        finished_at: None,
                    },
                );
            }
            Event::JobRetried { id, attempts, reason } => {
                if let Some(mut record) = self.jobs.get_mut(id) {
                    record.state = JobState::Waiting;
                    record.attempts = *attempts;
                    record.failed_reason = Some(reason.clone());
                }
            }
            Event::JobCompleted { id, attempts, outcome, at } => {
                if let Some(mut record) = self.jobs.get_mut(id) {
                    record.state = JobState::Completed;
                    record.attempts = *attempts;
                    record.outcome = Some(outcome.clone());
                    record.finished_at = Some(*at);
                }
            }
            Event::JobFailed { id, attempts, reason, at } => {
                if let Some(mut record) = self.jobs.get_mut(id) {
                    record.state = JobState::Failed;
                    record.attempts = *attempts;
                    record.failed_reason = Some(reason.clone());
                    record.finished_at = Some(*at);
                }
            }
            Event::BookingCreated { .. } | Event::BookingStatusChanged { .. } => {}
        }
    }

    /// Rebuild the waiting list from replayed records, oldest first. Returns
    /// the number of jobs that will be delivered again.
    pub async fn restore_waiting(&self) -> usize {
        let ids: Vec<JobId> = self
            .records()
            .into_iter()
            .filter(|r| !r.state.is_terminal())
            .map(|r| r.id)
            .collect();
        let count = ids.len();
        for id in ids {
            if let Some(mut record) = self.jobs.get_mut(&id) {
                record.state = JobState::Waiting;
            }
            self.push_waiting(id).await;
        }
        count
    }

    /// Forget settled jobs that finished before `cutoff`. Their ids become
    /// unknown to status queries. The caller must hold the compaction gate.
    pub fn prune_settled_before(&self, cutoff: Ms) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, r| {
            !(r.state.is_terminal() && r.finished_at.is_some_and(|at| at < cutoff))
        });
        before - self.jobs.len()
    }

    /// Minimal events that recreate the current job state. The caller must
    /// hold the compaction gate.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for r in self.records() {
            events.push(Event::JobEnqueued {
                id: r.id,
                name: r.name.clone(),
                payload: r.payload,
                at: r.enqueued_at,
            });
            let finished = r.finished_at.unwrap_or(r.enqueued_at);
            match (r.state, r.outcome) {
                (JobState::Completed, Some(outcome)) => events.push(Event::JobCompleted {
                    id: r.id,
                    attempts: r.attempts,
                    outcome,
                    at: finished,
                }),
                (JobState::Failed, _) => events.push(Event::JobFailed {
                    id: r.id,
                    attempts: r.attempts,
                    reason: r.failed_reason.unwrap_or_default(),
                    at: finished,
                }),
                _ if r.attempts > 0 => events.push(Event::JobRetried {
                    id: r.id,
                    attempts: r.attempts,
                    reason: r.failed_reason.unwrap_or_default(),
                }),
                _ => {}
            }
        }
        events
    }
}

#[async_trait]
impl JobQueue for DurableQueue {
    async fn enqueue(&self, name: &str, payload: BookSeat) -> Result<JobId, EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::QueueClosed);
        }
        if self.waiting_len().await >= MAX_WAITING_JOBS {
            return Err(EngineError::LimitExceeded("too many waiting jobs"));
        }
        let id = Ulid::new();
        let at = now_ms();
        let record = JobRecord {
            id,
            name: name.to_string(),
            payload,
            state: JobState::Waiting,
            attempts: 0,
            outcome: None,
            failed_reason: None,
            enqueued_at: at,
            finished_at: None,
        };
        let event = Event::JobEnqueued {
            id,
            name: record.name.clone(),
            payload,
            at,
        };
        self.journal
            .commit(vec![event], || {
                self.jobs.insert(id, record);
            })
            .await?;
        self.push_waiting(id).await;
        Ok(id)
    }

    async fn dequeue(&self) -> Option<Job> {
        loop {
            // Register interest before checking, so a notify between the
            // check and the await is not lost.
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(job) = self.pop_waiting().await {
                return Some(job);
            }
            notified.await;
        }
    }

    async fn complete(&self, id: JobId, outcome: JobOutcome) -> Result<(), EngineError> {
        let attempts = self.active_attempts(id)?;
        let at = now_ms();
        let event = Event::JobCompleted {
            id,
            attempts,
            outcome: outcome.clone(),
            at,
        };
        self.journal
            .commit(vec![event], || {
                if let Some(mut record) = self.jobs.get_mut(&id) {
                    record.state = JobState::Completed;
                    record.outcome = Some(outcome);
                    record.finished_at = Some(at);
                }
            })
            .await?;
        self.hub.settled(id, JobState::Completed);
        Ok(())
    }

    async fn fail(
        &self,
        id: JobId,
        reason: String,
        retryable: bool,
    ) -> Result<JobState, EngineError> {
        let attempts = self.active_attempts(id)?;
        if retryable && attempts < self.max_attempts {
            let event = Event::JobRetried {
                id,
                attempts,
                reason: reason.clone(),
            };
            self.journal
                .commit(vec![event], || {
                    if let Some(mut record) = self.jobs.get_mut(&id) {
                        record.state = JobState::Waiting;
                        record.failed_reason = Some(reason);
                    }
                })
                .await?;
            self.push_waiting(id).await;
            return Ok(JobState::Waiting);
        }

        let at = now_ms();
        let event = Event::JobFailed {
            id,
            attempts,
            reason: reason.clone(),
            at,
        };
        self.journal
            .commit(vec![event], || {
                if let Some(mut record) = self.jobs.get_mut(&id) {
                    record.state = JobState::Failed;
                    record.failed_reason = Some(reason);
                    record.finished_at = Some(at);
                }
            })
            .await?;
        self.hub.settled(id, JobState::Failed);
        Ok(JobState::Failed)
    }

    fn get(&self, id: JobId) -> Option<JobRecord> {
        self.jobs.get(&id).map(|e| e.value().clone())
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::Wal;
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("seatwise_test_queue");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn open_queue(path: &PathBuf, max_attempts: u32) -> DurableQueue {
        let journal = Journal::start(Wal::open(path).unwrap());
        DurableQueue::new(journal, Arc::new(NotifyHub::new()), max_attempts)
    }

    fn payload(booking_id: BookingId) -> BookSeat {
        BookSeat {
            user_id: 1,
            resource_id: 1,
            seat_count: 1,
            booking_id,
        }
    }

    fn rejected() -> JobOutcome {
        JobOutcome::Rejected {
            reason: INSUFFICIENT_CAPACITY.into(),
        }
    }

    #[tokio::test]
    async fn delivers_in_enqueue_order() {
        let queue = open_queue(&test_wal_path("fifo.wal"), 1);
        let a = queue.enqueue(BOOK_SEAT_JOB, payload(1)).await.unwrap();
        let b = queue.enqueue(BOOK_SEAT_JOB, payload(2)).await.unwrap();

        let first = queue.dequeue().await.unwrap();
        let second = queue.dequeue().await.unwrap();
        assert_eq!((first.id, second.id), (a, b));
        assert_eq!(first.name, BOOK_SEAT_JOB);
        assert_eq!(first.attempts, 1);
        assert_eq!(queue.get(a).unwrap().state, JobState::Active);
    }

    #[tokio::test]
    async fn dequeue_waits_for_enqueue() {
        let queue = Arc::new(open_queue(&test_wal_path("wait.wal"), 1));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = queue.enqueue(BOOK_SEAT_JOB, payload(1)).await.unwrap();

        let job = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(job.id, id);
    }

    #[tokio::test]
    async fn close_wakes_consumers_and_refuses_work() {
        let queue = Arc::new(open_queue(&test_wal_path("close.wal"), 1));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let got = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
        assert_eq!(
            queue.enqueue(BOOK_SEAT_JOB, payload(1)).await.unwrap_err(),
            EngineError::QueueClosed
        );
    }

    #[tokio::test]
    async fn complete_records_outcome_once() {
        let queue = open_queue(&test_wal_path("complete.wal"), 1);
        let id = queue.enqueue(BOOK_SEAT_JOB, payload(1)).await.unwrap();
        queue.dequeue().await.unwrap();

        queue.complete(id, rejected()).await.unwrap();
        let record = queue.get(id).unwrap();
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.outcome, Some(rejected()));
        assert!(record.finished_at.is_some());

        assert_eq!(
            queue.complete(id, rejected()).await.unwrap_err(),
            EngineError::InvalidRequest("job is not active")
        );
        let unknown = Ulid::new();
        assert_eq!(
            queue.complete(unknown, rejected()).await.unwrap_err(),
            EngineError::JobNotFound(unknown)
        );
    }

    #[tokio::test]
    async fn retryable_failures_requeue_until_attempts_run_out() {
        let queue = open_queue(&test_wal_path("retry.wal"), 2);
        let id = queue.enqueue(BOOK_SEAT_JOB, payload(1)).await.unwrap();

        queue.dequeue().await.unwrap();
        let state = queue.fail(id, "WAL error: disk".into(), true).await.unwrap();
        assert_eq!(state, JobState::Waiting);

        let again = queue.dequeue().await.unwrap();
        assert_eq!(again.attempts, 2);
        let state = queue.fail(id, "WAL error: disk".into(), true).await.unwrap();
        assert_eq!(state, JobState::Failed);
        assert_eq!(queue.get(id).unwrap().failed_reason.as_deref(), Some("WAL error: disk"));
    }

    #[tokio::test]
    async fn permanent_failure_is_terminal_at_once() {
        let queue = open_queue(&test_wal_path("permanent.wal"), 5);
        let id = queue.enqueue(BOOK_SEAT_JOB, payload(1)).await.unwrap();
        queue.dequeue().await.unwrap();
        let state = queue.fail(id, "resource not found".into(), false).await.unwrap();
        assert_eq!(state, JobState::Failed);
        assert_eq!(queue.waiting_len().await, 0);
    }

    #[tokio::test]
    async fn settle_is_announced() {
        let hub = Arc::new(NotifyHub::new());
        let path = test_wal_path("announce.wal");
        let queue = DurableQueue::new(Journal::start(Wal::open(&path).unwrap()), hub.clone(), 1);
        let id = queue.enqueue(BOOK_SEAT_JOB, payload(1)).await.unwrap();
        let mut rx = hub.subscribe(id);
        queue.dequeue().await.unwrap();
        queue.fail(id, "boom".into(), false).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), JobState::Failed);
    }

    #[tokio::test]
    async fn unsettled_jobs_are_redelivered_after_replay() {
        let path = test_wal_path("redeliver.wal");
        let (done, active, waiting) = {
            let queue = open_queue(&path, 1);
            let done = queue.enqueue(BOOK_SEAT_JOB, payload(1)).await.unwrap();
            let active = queue.enqueue(BOOK_SEAT_JOB, payload(2)).await.unwrap();
            let waiting = queue.enqueue(BOOK_SEAT_JOB, payload(3)).await.unwrap();
            queue.dequeue().await.unwrap();
            queue.complete(done, rejected()).await.unwrap();
            queue.dequeue().await.unwrap();
            (done, active, waiting)
        };

        let queue = open_queue(&path, 1);
        for event in Wal::replay(&path).unwrap() {
            queue.replay(&event);
        }
        assert_eq!(queue.restore_waiting().await, 2);
        assert_eq!(queue.get(done).unwrap().outcome, Some(rejected()));
        assert_eq!(queue.dequeue().await.unwrap().id, active);
        assert_eq!(queue.dequeue().await.unwrap().id, waiting);
    }

    #[tokio::test]
    async fn snapshot_and_prune() {
        let path = test_wal_path("snapshot.wal");
        let queue = open_queue(&path, 1);
        let done = queue.enqueue(BOOK_SEAT_JOB, payload(1)).await.unwrap();
        let open = queue.enqueue(BOOK_SEAT_JOB, payload(2)).await.unwrap();
        queue.dequeue().await.unwrap();
        queue.complete(done, rejected()).await.unwrap();

        let copy = open_queue(&test_wal_path("snapshot_copy.wal"), 1);
        for event in queue.snapshot_events() {
            copy.replay(&event);
        }
        assert_eq!(copy.get(done).unwrap().state, JobState::Completed);
        assert_eq!(copy.get(open).unwrap().state, JobState::Waiting);

        assert_eq!(queue.prune_settled_before(now_ms() + 1), 1);
        assert!(queue.get(done).is_none());
        assert!(queue.get(open).is_some());
    }
}
