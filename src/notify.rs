use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{JobId, JobState};

const CHANNEL_CAPACITY: usize = 4;

/// Broadcast hub announcing when a job reaches a terminal queue state.
/// Channels are created on subscribe and dropped once the job settles.
pub struct NotifyHub {
    channels: DashMap<JobId, broadcast::Sender<JobState>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to the settle notification of one job.
    pub fn subscribe(&self, job_id: JobId) -> broadcast::Receiver<JobState> {
        self.channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Announce a terminal state. No-op if nobody is listening.
    pub fn settled(&self, job_id: JobId, state: JobState) {
        if let Some((_, sender)) = self.channels.remove(&job_id) {
            let _ = sender.send(state);
        }
    }

    /// Drop the channel of a job nobody is waiting on any more.
    pub fn release(&self, job_id: JobId) {
        self.channels
            .remove_if(&job_id, |_, sender| sender.receiver_count() == 0);
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
