/// Largest seat count a single booking may request.
pub const MAX_SEATS_PER_BOOKING: u32 = 10_000;

/// Upper bound on jobs sitting in the waiting list before admission pushes back.
pub const MAX_WAITING_JOBS: usize = 1_000_000;

/// Bounded channel depth between committers and the WAL writer task.
pub const JOURNAL_CHANNEL_DEPTH: usize = 4096;

/// Upper bound on worker tasks in one pool.
pub const MAX_WORKERS: usize = 256;

/// Commands from one intake stream that may run ahead of their replies.
pub const MAX_PENDING_REPLIES: usize = 1024;
