mod ledger;

pub use ledger::{available_seats, committed_seats, fits, CapacitySnapshot};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::EngineError;
use crate::journal::Journal;
use crate::model::*;

/// Per-resource partition. Holding its lock is what makes a transaction
/// atomic with respect to every other writer for the same resource.
#[derive(Debug)]
pub struct Partition {
    pub resource_id: ResourceId,
    /// Bookings on this resource, in creation order.
    pub booking_ids: Vec<BookingId>,
}

pub type SharedPartition = Arc<Mutex<Partition>>;

/// Bookings and their lifecycle state.
///
/// Records live in one map keyed by booking id; each resource additionally
/// owns a partition listing its bookings. Status changes only happen through
/// a [`Transaction`], which holds the partition lock from first read to
/// commit, so two arbitrations for the same resource can never both act on a
/// stale seat count.
pub struct BookingStore {
    bookings: DashMap<BookingId, Booking>,
    failure_reasons: DashMap<BookingId, String>,
    partitions: DashMap<ResourceId, SharedPartition>,
    next_id: AtomicU64,
    journal: Journal,
}

impl BookingStore {
    pub fn new(journal: Journal) -> Self {
        Self {
            bookings: DashMap::new(),
            failure_reasons: DashMap::new(),
            partitions: DashMap::new(),
            next_id: AtomicU64::new(1),
            journal,
        }
    }

    fn partition(&self, resource_id: ResourceId) -> SharedPartition {
        self.partitions
            .entry(resource_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Partition {
                    resource_id,
                    booking_ids: Vec::new(),
                }))
            })
            .clone()
    }

    // ── Writes ───────────────────────────────────────────────

    /// Insert a new PENDING booking.
    pub async fn create_pending(
        &self,
        user_id: UserId,
        resource_id: ResourceId,
        seat_count: u32,
    ) -> Result<Booking, EngineError> {
        let partition = self.partition(resource_id);
        let mut guard = partition.lock().await;

        let now = now_ms();
        let booking = Booking {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            user_id,
            resource_id,
            seat_count,
            status: BookingStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.journal
            .commit(vec![event], || {
                guard.booking_ids.push(booking.id);
                self.bookings.insert(booking.id, booking.clone());
            })
            .await?;
        Ok(booking)
    }

    /// Open the atomic unit of work for `resource_id`. Waits for any other
    /// transaction on the same resource to finish.
    pub async fn begin(&self, resource_id: ResourceId) -> Transaction<'_> {
        let guard = self.partition(resource_id).lock_owned().await;
        Transaction {
            store: self,
            partition: guard,
            staged: Vec::new(),
        }
    }

    /// Compensating update: drive a booking to FAILED with `reason` if it is
    /// still PENDING. Returns the updated record, or `None` if it had already
    /// settled.
    pub async fn mark_failed(
        &self,
        id: BookingId,
        reason: &str,
    ) -> Result<Option<Booking>, EngineError> {
        let resource_id = self
            .bookings
            .get(&id)
            .map(|b| b.resource_id)
            .ok_or(EngineError::BookingNotFound(id))?;
        let mut tx = self.begin(resource_id).await;
        let current = tx.booking(id).ok_or(EngineError::BookingNotFound(id))?;
        if current.status.is_terminal() {
            return Ok(None);
        }
        tx.fail(id, reason)?;
        Ok(tx.commit().await?.pop())
    }

    // ── Reads ────────────────────────────────────────────────

    pub fn get(&self, id: BookingId) -> Option<Booking> {
        self.bookings.get(&id).map(|e| e.value().clone())
    }

    /// Why a FAILED booking failed, if it was recorded.
    pub fn failure_reason(&self, id: BookingId) -> Option<String> {
        self.failure_reasons.get(&id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    /// Every booking on a resource, in creation order.
    pub async fn bookings_for(&self, resource_id: ResourceId) -> Vec<Booking> {
        let Some(partition) = self.partitions.get(&resource_id).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let guard = partition.lock().await;
        guard.booking_ids.iter().filter_map(|id| self.get(*id)).collect()
    }

    pub fn with_status(&self, status: BookingStatus) -> Vec<Booking> {
        let mut out: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|e| e.value().status == status)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|b| b.id);
        out
    }

    pub async fn capacity(&self, resource: &Resource) -> CapacitySnapshot {
        let bookings = self.bookings_for(resource.id).await;
        let pending = bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Pending)
            .map(|b| u64::from(b.seat_count))
            .sum();
        CapacitySnapshot {
            resource_id: resource.id,
            total_seats: resource.total_seats,
            committed: committed_seats(bookings.iter().map(|b| (b.seat_count, b.status))),
            pending,
        }
    }

    // ── Replay & compaction ──────────────────────────────────

    /// Apply a replayed WAL event. Job events are ignored.
    pub fn replay(&self, event: &Event) {
        match event {
            Event::BookingCreated { booking } => {
                let partition = self.partition(booking.resource_id);
                // Replay runs before any worker starts; the lock is uncontended.
                if let Ok(mut guard) = partition.try_lock() {
                    if !guard.booking_ids.contains(&booking.id) {
                        guard.booking_ids.push(booking.id);
                    }
                }
                self.bookings.insert(booking.id, booking.clone());
                self.next_id.fetch_max(booking.id + 1, Ordering::SeqCst);
            }
            Event::BookingStatusChanged {
                id,
                status,
                reason,
                at,
                ..
            } => {
                if let Some(mut b) = self.bookings.get_mut(id) {
                    b.status = *status;
                    b.updated_at = *at;
                }
                if let Some(reason) = reason {
                    self.failure_reasons.insert(*id, reason.clone());
                }
            }
            _ => {}
        }
    }

    /// Minimal events that recreate the current booking state. The caller
    /// must hold the journal's compaction gate.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut bookings: Vec<Booking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        bookings.sort_by_key(|b| b.id);
        let mut events = Vec::with_capacity(bookings.len());
        for booking in bookings {
            let (id, resource_id, at) = (booking.id, booking.resource_id, booking.updated_at);
            events.push(Event::BookingCreated { booking });
            if let Some(reason) = self.failure_reason(id) {
                events.push(Event::BookingStatusChanged {
                    id,
                    resource_id,
                    status: BookingStatus::Failed,
                    reason: Some(reason),
                    at,
                });
            }
        }
        events
    }
}

/// Atomic unit of work over one resource partition.
///
/// Reads see committed state plus this transaction's own staged writes.
/// `commit` journals and applies the staged writes as one unit; dropping the
/// transaction without committing discards them.
pub struct Transaction<'a> {
    store: &'a BookingStore,
    partition: OwnedMutexGuard<Partition>,
    staged: Vec<Staged>,
}

struct Staged {
    id: BookingId,
    status: BookingStatus,
    reason: Option<String>,
}

impl Transaction<'_> {
    pub fn resource_id(&self) -> ResourceId {
        self.partition.resource_id
    }

    fn staged_write(&self, id: BookingId) -> Option<&Staged> {
        self.staged.iter().rev().find(|w| w.id == id)
    }

    fn staged_status(&self, id: BookingId) -> Option<BookingStatus> {
        self.staged_write(id).map(|w| w.status)
    }

    /// A booking of this partition, with staged changes applied.
    pub fn booking(&self, id: BookingId) -> Option<Booking> {
        if !self.partition.booking_ids.contains(&id) {
            return None;
        }
        let mut booking = self.store.get(id)?;
        if let Some(status) = self.staged_status(id) {
            booking.status = status;
        }
        Some(booking)
    }

    /// Seats held by BOOKED bookings on this resource.
    pub fn committed_seats(&self) -> u64 {
        committed_seats(self.partition.booking_ids.iter().filter_map(|id| {
            let booking = self.store.bookings.get(id)?;
            let status = self.staged_status(*id).unwrap_or(booking.status);
            Some((booking.seat_count, status))
        }))
    }

    /// Why a booking of this partition failed, with staged changes applied.
    pub fn failure_reason(&self, id: BookingId) -> Option<String> {
        match self.staged_write(id) {
            Some(w) => w.reason.clone(),
            None => self.store.failure_reason(id),
        }
    }

    pub fn set_status(&mut self, id: BookingId, status: BookingStatus) -> Result<(), EngineError> {
        self.stage(id, status, None)
    }

    /// Stage PENDING -> FAILED and record why.
    pub fn fail(&mut self, id: BookingId, reason: &str) -> Result<(), EngineError> {
        self.stage(id, BookingStatus::Failed, Some(reason.to_string()))
    }

    fn stage(
        &mut self,
        id: BookingId,
        status: BookingStatus,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let current = self.booking(id).ok_or(EngineError::BookingNotFound(id))?;
        if !current.status.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                id,
                from: current.status,
                to: status,
            });
        }
        self.staged.push(Staged { id, status, reason });
        Ok(())
    }

    /// Journal and apply the staged writes. Returns the updated bookings.
    pub async fn commit(mut self) -> Result<Vec<Booking>, EngineError> {
        let staged = std::mem::take(&mut self.staged);
        if staged.is_empty() {
            return Ok(Vec::new());
        }
        let at = now_ms();
        let resource_id = self.resource_id();
        let events = staged
            .iter()
            .map(|w| Event::BookingStatusChanged {
                id: w.id,
                resource_id,
                status: w.status,
                reason: w.reason.clone(),
                at,
            })
            .collect();
        let store = self.store;
        store
            .journal
            .commit(events, || {
                staged
                    .into_iter()
                    .filter_map(|w| {
                        if let Some(reason) = w.reason {
                            store.failure_reasons.insert(w.id, reason);
                        }
                        let mut booking = store.bookings.get_mut(&w.id)?;
                        booking.status = w.status;
                        booking.updated_at = at;
                        Some(booking.clone())
                    })
                    .collect()
            })
            .await
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.staged.is_empty() {
            tracing::debug!(
                "rolled back {} staged write(s) on resource {}",
                self.staged.len(),
                self.partition.resource_id
            );
        }
    }
}
