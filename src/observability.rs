use std::net::SocketAddr;

use crate::model::JobOutcome;

// ── Admission & arbitration ─────────────────────────────────────

/// Counter: booking requests admitted (one booking + one job each).
pub const ADMISSIONS_TOTAL: &str = "seatwise_admissions_total";

/// Counter: arbitration decisions. Labels: outcome (booked, rejected, failed, retried).
pub const ARBITRATIONS_TOTAL: &str = "seatwise_arbitrations_total";

/// Histogram: time from dequeue to decision, in seconds.
pub const ARBITRATION_DURATION_SECONDS: &str = "seatwise_arbitration_duration_seconds";

// ── Queue & consistency ─────────────────────────────────────────

/// Gauge: jobs waiting to be dequeued.
pub const QUEUE_WAITING: &str = "seatwise_queue_waiting";

/// Gauge: worker tasks currently running.
pub const WORKERS_ACTIVE: &str = "seatwise_workers_active";

/// Counter: bookings the reconciler had to drive out of PENDING. Labels: kind.
pub const RECONCILE_REPAIRS_TOTAL: &str = "seatwise_reconcile_repairs_total";

// ── Journal ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "seatwise_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "seatwise_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for an arbitration outcome.
pub fn outcome_label(outcome: &JobOutcome) -> &'static str {
    match outcome {
        JobOutcome::Booked(_) => "booked",
        JobOutcome::Rejected { .. } => "rejected",
    }
}
