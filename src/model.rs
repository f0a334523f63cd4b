use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub type ResourceId = u64;
pub type UserId = u64;
pub type BookingId = u64;
pub type JobId = Ulid;

/// Logical name of the only job type the engine enqueues.
pub const BOOK_SEAT_JOB: &str = "bookSeat";

/// Reason attached to a rejected booking when the resource is full.
pub const INSUFFICIENT_CAPACITY: &str = "insufficient capacity";

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// A capacity-bounded resource (a train). Owned by the resource directory;
/// the engine only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub id: ResourceId,
    pub total_seats: u32,
    pub name: Option<String>,
}

impl Resource {
    pub fn new(id: ResourceId, total_seats: u32) -> Self {
        Self {
            id,
            total_seats,
            name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Booked,
    Failed,
}

impl BookingStatus {
    /// `Pending` is the only state with outgoing edges.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Pending, BookingStatus::Booked)
                | (BookingStatus::Pending, BookingStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, BookingStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Booked => "BOOKED",
            BookingStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single seat-reservation attempt and its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: BookingId,
    pub user_id: UserId,
    pub resource_id: ResourceId,
    pub seat_count: u32,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// A validated admission request, as handed over by the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    pub user_id: UserId,
    #[serde(alias = "trainId")]
    pub resource_id: ResourceId,
    pub seat_count: u32,
}

/// Payload of a `bookSeat` job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSeat {
    pub user_id: UserId,
    pub resource_id: ResourceId,
    pub seat_count: u32,
    pub booking_id: BookingId,
}

/// Queue-intrinsic job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Result payload of a completed job. A rejection is a business outcome,
/// not a job failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Booked(Booking),
    Rejected { reason: String },
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Booked(_))
    }

    /// `{success: true, booking}` / `{success: false, reason}`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            JobOutcome::Booked(booking) => serde_json::json!({
                "success": true,
                "booking": booking,
            }),
            JobOutcome::Rejected { reason } => serde_json::json!({
                "success": false,
                "reason": reason,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub payload: BookSeat,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub payload: BookSeat,
    pub state: JobState,
    /// Number of times the job has been handed to a worker.
    pub attempts: u32,
    pub outcome: Option<JobOutcome>,
    pub failed_reason: Option<String>,
    pub enqueued_at: Ms,
    pub finished_at: Option<Ms>,
}

impl JobRecord {
    pub fn job(&self) -> Job {
        Job {
            id: self.id,
            name: self.name.clone(),
            payload: self.payload,
            attempts: self.attempts,
        }
    }
}

/// Client-facing status of a booking job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StatusReport {
    Pending,
    Success { booking: Booking },
    Failed { reason: String },
}

impl StatusReport {
    pub fn is_settled(&self) -> bool {
        !matches!(self, StatusReport::Pending)
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: BookingId,
        resource_id: ResourceId,
        status: BookingStatus,
        /// Why a booking failed, when the writer knew.
        reason: Option<String>,
        at: Ms,
    },
    JobEnqueued {
        id: JobId,
        name: String,
        payload: BookSeat,
        at: Ms,
    },
    JobRetried {
        id: JobId,
        attempts: u32,
        reason: String,
    },
    JobCompleted {
        id: JobId,
        attempts: u32,
        outcome: JobOutcome,
        at: Ms,
    },
    JobFailed {
        id: JobId,
        attempts: u32,
        reason: String,
        at: Ms,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(status: BookingStatus) -> Booking {
        Booking {
            id: 7,
            user_id: 1,
            resource_id: 2,
            seat_count: 3,
            status,
            created_at: 100,
            updated_at: 200,
        }
    }

    #[test]
    fn status_transitions_are_one_way() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Booked));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Pending));
        for terminal in [Booked, Failed] {
            for next in [Pending, Booked, Failed] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
            assert!(terminal.is_terminal());
        }
        assert!(!Pending.is_terminal());
    }

    #[test]
    fn booking_json_shape() {
        let v = serde_json::to_value(booking(BookingStatus::Booked)).unwrap();
        assert_eq!(v["id"], 7);
        assert_eq!(v["userId"], 1);
        assert_eq!(v["resourceId"], 2);
        assert_eq!(v["seatCount"], 3);
        assert_eq!(v["status"], "BOOKED");
    }

    #[test]
    fn outcome_json_contract() {
        let ok = JobOutcome::Booked(booking(BookingStatus::Booked)).to_json();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["booking"]["status"], "BOOKED");

        let rejected = JobOutcome::Rejected {
            reason: INSUFFICIENT_CAPACITY.into(),
        }
        .to_json();
        assert_eq!(rejected["success"], false);
        assert_eq!(rejected["reason"], "insufficient capacity");
    }

    #[test]
    fn status_report_json_contract() {
        let pending = serde_json::to_value(StatusReport::Pending).unwrap();
        assert_eq!(pending, serde_json::json!({"status": "pending"}));

        let success = serde_json::to_value(StatusReport::Success {
            booking: booking(BookingStatus::Booked),
        })
        .unwrap();
        assert_eq!(success["status"], "success");
        assert_eq!(success["booking"]["seatCount"], 3);

        let failed = serde_json::to_value(StatusReport::Failed {
            reason: "resource not found".into(),
        })
        .unwrap();
        assert_eq!(
            failed,
            serde_json::json!({"status": "failed", "reason": "resource not found"})
        );
    }

    #[test]
    fn request_accepts_train_id_alias() {
        let req: BookingRequest =
            serde_json::from_str(r#"{"userId":4,"trainId":9,"seatCount":2}"#).unwrap();
        assert_eq!(req.resource_id, 9);
        assert_eq!(req.seat_count, 2);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::JobCompleted {
            id: Ulid::new(),
            attempts: 1,
            outcome: JobOutcome::Booked(booking(BookingStatus::Booked)),
            at: 5,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
