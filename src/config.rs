use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

/// Process configuration, read from `SEATWISE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub workers: usize,
    pub max_attempts: u32,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    /// How long settled jobs stay queryable after they finish.
    pub job_retention_ms: Ms,
    pub reconcile_interval_ms: u64,
    /// Age a job-less PENDING booking must reach before it is failed.
    pub orphan_grace_ms: Ms,
    pub metrics_port: Option<u16>,
    /// Seed list of trains, `id:seats[,id:seats]`.
    pub trains: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            workers: 4,
            max_attempts: 1,
            compact_threshold: 1000,
            job_retention_ms: 7 * DAY_MS,
            reconcile_interval_ms: 5000,
            orphan_grace_ms: 30_000,
            metrics_port: None,
            trains: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Missing or unparsable values fall
    /// back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("SEATWISE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            workers: parsed(&lookup, "SEATWISE_WORKERS").unwrap_or(defaults.workers),
            max_attempts: parsed::<u32>(&lookup, "SEATWISE_MAX_ATTEMPTS")
                .unwrap_or(defaults.max_attempts)
                .max(1),
            compact_threshold: parsed(&lookup, "SEATWISE_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            job_retention_ms: parsed(&lookup, "SEATWISE_JOB_RETENTION_MS")
                .unwrap_or(defaults.job_retention_ms),
            reconcile_interval_ms: parsed(&lookup, "SEATWISE_RECONCILE_INTERVAL_MS")
                .unwrap_or(defaults.reconcile_interval_ms),
            orphan_grace_ms: parsed(&lookup, "SEATWISE_ORPHAN_GRACE_MS")
                .unwrap_or(defaults.orphan_grace_ms),
            metrics_port: parsed(&lookup, "SEATWISE_METRICS_PORT"),
            trains: lookup("SEATWISE_TRAINS").filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(1))
    }
}
