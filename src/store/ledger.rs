use crate::model::{BookingStatus, ResourceId};

// ── Capacity Ledger ───────────────────────────────────────────────
//
// Committed seats are never stored; they are summed from the bookings of a
// partition every time a decision needs them.

/// Σ seat_count over the BOOKED entries of `bookings`.
pub fn committed_seats(bookings: impl IntoIterator<Item = (u32, BookingStatus)>) -> u64 {
    bookings
        .into_iter()
        .filter(|(_, status)| *status == BookingStatus::Booked)
        .map(|(seats, _)| u64::from(seats))
        .sum()
}

/// `total - committed`, negative if the ledger is already over capacity.
pub fn available_seats(total_seats: u32, committed: u64) -> i64 {
    i64::from(total_seats) - committed as i64
}

/// Whether `requested` more seats still fit.
pub fn fits(total_seats: u32, committed: u64, requested: u32) -> bool {
    available_seats(total_seats, committed) >= i64::from(requested)
}

/// Point-in-time view of one resource's ledger. Informational only; seat
/// decisions are made inside a transaction, never from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacitySnapshot {
    pub resource_id: ResourceId,
    pub total_seats: u32,
    pub committed: u64,
    pub pending: u64,
}

impl CapacitySnapshot {
    pub fn available(&self) -> i64 {
        available_seats(self.total_seats, self.committed)
    }
}
