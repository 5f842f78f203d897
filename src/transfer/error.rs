//! Transfer Error Types
//!
//! Synchronous failures returned by the coordinator and the record store.
//! Asynchronous I/O failures never surface here; the worker records them as
//! FAILED and publishes them to observers.

use thiserror::Error;

use super::types::TransferId;

/// Transfer error types
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    // === Validation Errors ===
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // === Record Errors ===
    #[error("Transfer not found: {0}")]
    TransferNotFound(TransferId),

    #[error("Transfer {0} was modified concurrently, re-read and retry")]
    ConcurrentModification(TransferId),

    #[error("Transfer {0} is still active and cannot be deleted yet")]
    BusyCannotDelete(TransferId),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    // === I/O Errors ===
    #[error("Remote operation failed: {0}")]
    RemoteOperationFailed(String),

    #[error("Local I/O error: {0}")]
    IoError(String),

    // === System Errors ===
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl TransferError {
    /// Stable error code for logs and CLI output
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidInput(_) => "INVALID_INPUT",
            TransferError::TransferNotFound(_) => "RECORD_NOT_FOUND",
            TransferError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            TransferError::BusyCannotDelete(_) => "BUSY_CANNOT_DELETE",
            TransferError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            TransferError::RemoteOperationFailed(_) => "REMOTE_OPERATION_FAILED",
            TransferError::IoError(_) => "IO_ERROR",
            TransferError::DatabaseError(_) => "DATABASE_ERROR",
            TransferError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }

    /// True when the caller may retry the same call after re-reading state
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::ConcurrentModification(_) | TransferError::BusyCannotDelete(_)
        )
    }
}

impl From<sqlx::Error> for TransferError {
    fn from(e: sqlx::Error) -> Self {
        TransferError::DatabaseError(e.to_string())
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::IoError(e.to_string())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        TransferError::DatabaseError(format!("metadata encoding: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(TransferError::TransferNotFound(7).code(), "RECORD_NOT_FOUND");
        assert_eq!(
            TransferError::BusyCannotDelete(7).code(),
            "BUSY_CANNOT_DELETE"
        );
        assert_eq!(
            TransferError::InvalidInput("dir".into()).code(),
            "INVALID_INPUT"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(TransferError::ConcurrentModification(1).is_retryable());
        assert!(TransferError::BusyCannotDelete(1).is_retryable());
        assert!(!TransferError::TransferNotFound(1).is_retryable());
        assert!(!TransferError::RemoteOperationFailed("boom".into()).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = TransferError::TransferNotFound(42);
        assert_eq!(err.to_string(), "Transfer not found: 42");
    }

    #[test]
    fn test_from_io_error() {
        let err: TransferError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, TransferError::IoError(_)));
    }
}
