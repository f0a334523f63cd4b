use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::directory::ResourceDirectory;
use crate::error::EngineError;
use crate::journal::Journal;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::producer::Producer;
use crate::queue::{DurableQueue, JobQueue};
use crate::reconcile::{self, ReconcileReport};
use crate::store::BookingStore;
use crate::tracker::StatusTracker;
use crate::wal::Wal;
use crate::worker::{Arbiter, WorkerPool};

/// One booking engine: store, queue and journal over a single WAL, plus the
/// workers and background tasks that run against them.
pub struct BookingService {
    journal: Journal,
    store: Arc<BookingStore>,
    queue: Arc<DurableQueue>,
    producer: Producer,
    tracker: StatusTracker,
    arbiter: Arc<Arbiter>,
    workers: Mutex<Option<WorkerPool>>,
    background: CancellationToken,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BookingService {
    /// Open (or create) the WAL at `wal_path` and rebuild state from it. Jobs
    /// that had not settled are queued for delivery again.
    pub async fn open(
        wal_path: impl Into<PathBuf>,
        directory: Arc<dyn ResourceDirectory>,
        max_attempts: u32,
    ) -> std::io::Result<Self> {
        let wal_path = wal_path.into();
        let events = Wal::recover(&wal_path)?;
        let journal = Journal::start(Wal::open(&wal_path)?);

        let hub = Arc::new(NotifyHub::new());
        let store = Arc::new(BookingStore::new(journal.clone()));
        let queue = Arc::new(DurableQueue::new(journal.clone(), hub.clone(), max_attempts));
        for event in &events {
            store.replay(event);
            queue.replay(event);
        }
        let redeliver = queue.restore_waiting().await;
        info!(
            "replayed {} events from {}: {} bookings, {} jobs, {redeliver} to deliver",
            events.len(),
            wal_path.display(),
            store.len(),
            queue.len()
        );

        let dyn_queue: Arc<dyn JobQueue> = queue.clone();
        Ok(Self {
            producer: Producer::new(store.clone(), dyn_queue.clone()),
            tracker: StatusTracker::new(dyn_queue, hub),
            arbiter: Arc::new(Arbiter::new(store.clone(), directory)),
            journal,
            store,
            queue,
            workers: Mutex::new(None),
            background: CancellationToken::new(),
            background_tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    pub fn store(&self) -> &Arc<BookingStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub async fn submit(&self, request: BookingRequest) -> Result<JobId, EngineError> {
        self.producer.submit(request).await
    }

    pub fn status(&self, job_id: JobId) -> Result<StatusReport, EngineError> {
        self.tracker.status(job_id)
    }

    /// Start `n` arbitration workers. A no-op if workers are already running.
    pub async fn start_workers(&self, n: usize) {
        let mut workers = self.workers.lock().await;
        if workers.is_none() {
            let queue: Arc<dyn JobQueue> = self.queue.clone();
            *workers = Some(WorkerPool::start(n, self.arbiter.clone(), queue));
        }
    }

    /// Stop the workers, letting in-flight jobs settle first.
    pub async fn stop_workers(&self) {
        let pool = self.workers.lock().await.take();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }
    }

    /// Spawn the reconciler and the WAL compactor.
    pub async fn start_background(self: &Arc<Self>, config: &Config) {
        let mut tasks = self.background_tasks.lock().await;
        tasks.push(tokio::spawn(reconcile::run_reconciler(
            self.clone(),
            config.reconcile_interval(),
            config.orphan_grace_ms,
            self.background.child_token(),
        )));
        tasks.push(tokio::spawn(reconcile::run_compactor(
            self.clone(),
            config.compact_threshold,
            config.job_retention_ms,
            self.background.child_token(),
        )));
    }

    /// Workers plus background tasks, as configured.
    pub async fn start(self: &Arc<Self>, config: &Config) {
        self.start_workers(config.workers).await;
        self.start_background(config).await;
    }

    /// Refuse new work, drain the workers and stop background tasks.
    pub async fn shutdown(&self) {
        self.queue.close();
        self.stop_workers().await;
        self.background.cancel();
        let tasks: Vec<JoinHandle<()>> = self.background_tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("booking service stopped");
    }

    pub async fn reconcile(&self, grace_ms: Ms) -> ReconcileReport {
        reconcile::reconcile_once(&self.store, &self.queue, grace_ms, now_ms()).await
    }

    /// Rewrite the WAL as a snapshot of current state, dropping settled jobs
    /// that finished more than `retention_ms` ago. Returns the number of
    /// events written.
    pub async fn compact(&self, retention_ms: Ms) -> Result<usize, EngineError> {
        let cutoff = now_ms() - retention_ms;
        self.journal
            .compact_with(|| {
                let pruned = self.queue.prune_settled_before(cutoff);
                if pruned > 0 {
                    info!("dropped {pruned} settled job(s) from the WAL");
                }
                let mut events = self.store.snapshot_events();
                events.extend(self.queue.snapshot_events());
                events
            })
            .await
    }
}
