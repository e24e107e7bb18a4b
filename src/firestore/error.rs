use std::error::Error;
use std::fmt::{Display, Formatter};

/// Canonical status codes surfaced by the synchronization engine.
///
/// These mirror the gRPC canonical codes the Firestore backend reports; the
/// engine classifies them into permanent and transient failures when deciding
/// whether to retry a stream, a write or a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FirestoreErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl FirestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirestoreErrorCode::Cancelled => "firestore/cancelled",
            FirestoreErrorCode::Unknown => "firestore/unknown",
            FirestoreErrorCode::InvalidArgument => "firestore/invalid-argument",
            FirestoreErrorCode::DeadlineExceeded => "firestore/deadline-exceeded",
            FirestoreErrorCode::NotFound => "firestore/not-found",
            FirestoreErrorCode::AlreadyExists => "firestore/already-exists",
            FirestoreErrorCode::PermissionDenied => "firestore/permission-denied",
            FirestoreErrorCode::ResourceExhausted => "firestore/resource-exhausted",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::Aborted => "firestore/aborted",
            FirestoreErrorCode::OutOfRange => "firestore/out-of-range",
            FirestoreErrorCode::Unimplemented => "firestore/unimplemented",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::DataLoss => "firestore/data-loss",
            FirestoreErrorCode::Unauthenticated => "firestore/unauthenticated",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreError {
    pub code: FirestoreErrorCode,
    message: String,
}

impl FirestoreError {
    pub fn new(code: FirestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` if this is the sentinel raised when the primary lease
    /// was lost in the middle of an operation.
    pub fn is_primary_lease_lost(&self) -> bool {
        self.code == FirestoreErrorCode::FailedPrecondition
            && self.message == PRIMARY_LEASE_LOST_ERROR_MSG
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

pub const PRIMARY_LEASE_LOST_ERROR_MSG: &str =
    "The current tab is not in the required state to perform this operation. \
     It might be necessary to refresh the browser tab.";

pub fn cancelled(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Cancelled, message)
}

pub fn invalid_argument(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn already_exists(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::AlreadyExists, message)
}

pub fn permission_denied(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::PermissionDenied, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Aborted, message)
}

pub fn unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unavailable, message)
}

pub fn data_loss(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DataLoss, message)
}

pub fn primary_lease_lost() -> FirestoreError {
    failed_precondition(PRIMARY_LEASE_LOST_ERROR_MSG)
}

/// Whether an error code should be considered permanent, i.e. retrying the
/// same request will not help.
pub fn is_permanent_error(code: FirestoreErrorCode) -> bool {
    match code {
        FirestoreErrorCode::Cancelled
        | FirestoreErrorCode::Unknown
        | FirestoreErrorCode::DeadlineExceeded
        | FirestoreErrorCode::ResourceExhausted
        | FirestoreErrorCode::Internal
        | FirestoreErrorCode::Unavailable
        | FirestoreErrorCode::Unauthenticated => false,
        FirestoreErrorCode::InvalidArgument
        | FirestoreErrorCode::NotFound
        | FirestoreErrorCode::AlreadyExists
        | FirestoreErrorCode::PermissionDenied
        | FirestoreErrorCode::FailedPrecondition
        | FirestoreErrorCode::Aborted
        | FirestoreErrorCode::OutOfRange
        | FirestoreErrorCode::Unimplemented
        | FirestoreErrorCode::DataLoss => true,
    }
}

/// Write-stream variant of [`is_permanent_error`]: `Aborted` writes are
/// retried because the backend uses it for contention.
pub fn is_permanent_write_error(code: FirestoreErrorCode) -> bool {
    is_permanent_error(code) && code != FirestoreErrorCode::Aborted
}

/// Codes on which a transaction's update function is re-run.
pub fn is_retryable_transaction_error(code: FirestoreErrorCode) -> bool {
    matches!(
        code,
        FirestoreErrorCode::Aborted
            | FirestoreErrorCode::FailedPrecondition
            | FirestoreErrorCode::AlreadyExists
    )
}

/// Swallows the primary-lease-lost sentinel, propagating every other error.
pub fn ignore_if_primary_lease_loss(result: FirestoreResult<()>) -> FirestoreResult<()> {
    match result {
        Err(err) if err.is_primary_lease_lost() => {
            log::debug!("unexpectedly lost primary lease");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_permanent_errors() {
        assert!(is_permanent_error(FirestoreErrorCode::PermissionDenied));
        assert!(!is_permanent_error(FirestoreErrorCode::Unavailable));
        assert!(is_permanent_error(FirestoreErrorCode::Aborted));
        assert!(!is_permanent_write_error(FirestoreErrorCode::Aborted));
    }

    #[test]
    fn retryable_transaction_codes() {
        assert!(is_retryable_transaction_error(FirestoreErrorCode::Aborted));
        assert!(is_retryable_transaction_error(
            FirestoreErrorCode::FailedPrecondition
        ));
        assert!(is_retryable_transaction_error(
            FirestoreErrorCode::AlreadyExists
        ));
        assert!(!is_retryable_transaction_error(
            FirestoreErrorCode::Unavailable
        ));
        assert!(!is_retryable_transaction_error(
            FirestoreErrorCode::PermissionDenied
        ));
    }

    #[test]
    fn primary_lease_loss_is_suppressed() {
        assert!(ignore_if_primary_lease_loss(Err(primary_lease_lost())).is_ok());
        let err = ignore_if_primary_lease_loss(Err(unavailable("offline"))).unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);
    }
}
