use crate::model::{BookingId, BookingStatus, JobId, ResourceId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    JobNotFound(JobId),
    BookingNotFound(BookingId),
    ResourceNotFound(ResourceId),
    InvalidTransition {
        id: BookingId,
        from: BookingStatus,
        to: BookingStatus,
    },
    InvalidRequest(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
    QueueClosed,
}

impl EngineError {
    /// Storage-class failures may succeed on a later attempt. Everything else
    /// is a permanent property of the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::WalError(_) | EngineError::QueueClosed)
    }

    /// Reason recorded on a failed job.
    pub fn reason(&self) -> String {
        match self {
            EngineError::ResourceNotFound(_) => "resource not found".to_string(),
            other => other.to_string(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::JobNotFound(id) => write!(f, "job not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::ResourceNotFound(id) => write!(f, "resource not found: {id}"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "booking {id}: illegal transition {from} -> {to}")
            }
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::QueueClosed => write!(f, "job queue closed"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_resource_reason_is_stable() {
        assert_eq!(EngineError::ResourceNotFound(42).reason(), "resource not found");
        assert_eq!(
            EngineError::WalError("disk full".into()).reason(),
            "WAL error: disk full"
        );
    }

    #[test]
    fn only_storage_errors_retry() {
        assert!(EngineError::WalError("x".into()).is_retryable());
        assert!(EngineError::QueueClosed.is_retryable());
        assert!(!EngineError::ResourceNotFound(1).is_retryable());
        assert!(!EngineError::BookingNotFound(1).is_retryable());
        assert!(!EngineError::InvalidRequest("seat count must be positive").is_retryable());
    }
}
