use std::io;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::error::EngineError;
use crate::limits::JOURNAL_CHANNEL_DEPTH;
use crate::model::Event;
use crate::observability;
use crate::wal::Wal;

enum JournalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Rewrite {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One fsync for the whole batch, then answer every sender.
async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<JournalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (events, response) = match cmd {
            JournalCommand::Append { events, response } => (events, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };
        let mut batch: Vec<PendingAppend> = vec![(events, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                JournalCommand::Append { events, response } => batch.push((events, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        flush_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
    tracing::debug!("journal writer for {} stopped", wal.path().display());
}

fn flush_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    let event_count: usize = batch.iter().map(|(events, _)| events.len()).sum();
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(event_count as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    'append: for (events, _) in &batch {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                result = Err(e);
                break 'append;
            }
        }
    }
    // Flush even after an append error so a partial frame is not carried
    // into the next batch; every caller in this batch is told it failed.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: JournalCommand) {
    match cmd {
        JournalCommand::Rewrite { events, response } => {
            let _ = response.send(wal.rewrite(&events));
        }
        JournalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        JournalCommand::Append { .. } => unreachable!("appends are batched by writer_loop"),
    }
}

/// Handle to the durable event log shared by the booking store and the job
/// queue.
///
/// Every state change goes through [`Journal::commit`]: the events are made
/// durable first and only then applied in memory, all while holding the
/// compaction gate shared. [`Journal::compact_with`] takes the gate
/// exclusively, so a snapshot always reflects every acknowledged commit.
#[derive(Clone)]
pub struct Journal {
    tx: mpsc::Sender<JournalCommand>,
    gate: Arc<RwLock<()>>,
}

impl Journal {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn start(wal: Wal) -> Self {
        let (tx, rx) = mpsc::channel(JOURNAL_CHANNEL_DEPTH);
        tokio::spawn(writer_loop(wal, rx));
        Self {
            tx,
            gate: Arc::new(RwLock::new(())),
        }
    }

    async fn append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(JournalCommand::Append { events, response })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Persist `events`, then run `apply`. `apply` never runs if the append
    /// fails, which is what makes a failed commit a rollback.
    pub async fn commit<T>(
        &self,
        events: Vec<Event>,
        apply: impl FnOnce() -> T,
    ) -> Result<T, EngineError> {
        let _shared = self.gate.read().await;
        self.append(events).await?;
        Ok(apply())
    }

    /// Replace the log with the events returned by `snapshot`. Returns the
    /// number of events written.
    pub async fn compact_with(
        &self,
        snapshot: impl FnOnce() -> Vec<Event>,
    ) -> Result<usize, EngineError> {
        let _exclusive = self.gate.write().await;
        let events = snapshot();
        let count = events.len();
        let (response, rx) = oneshot::channel();
        self.tx
            .send(JournalCommand::Rewrite { events, response })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        Ok(count)
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (response, rx) = oneshot::channel();
        if self
            .tx
            .send(JournalCommand::AppendsSinceCompact { response })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
