//! Domain error types.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::violation::{ConsistencyViolation, summarize};

/// Transient infrastructure failures that are safe to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientFailure {
    /// The database aborted the transaction to preserve serializability.
    SerializationFailure,
    /// The database detected a deadlock and chose this transaction as victim.
    DeadlockDetected,
    /// The connection dropped or the pool was closed.
    ConnectionLost,
    /// Acquiring a connection or running a statement timed out.
    Timeout,
}

impl fmt::Display for TransientFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SerializationFailure => "serialization failure",
            Self::DeadlockDetected => "deadlock detected",
            Self::ConnectionLost => "connection lost",
            Self::Timeout => "timeout",
        })
    }
}

/// Top-level domain error type.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An aggregate was not found.
    #[error("aggregate not found: {0}")]
    AggregateNotFound(Uuid),

    /// Optimistic concurrency conflict.
    #[error(
        "concurrency conflict on {entity_type} {aggregate_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        /// Entity type (or `event_stream`) that had the conflict.
        entity_type: String,
        /// The aggregate that had the conflict.
        aggregate_id: Uuid,
        /// The expected version.
        expected: i64,
        /// The actual version found (0 when the row is gone).
        actual: i64,
    },

    /// A command failed validation before any handler ran.
    #[error("validation error: {0}")]
    Validation(String),

    /// Entity data or raised events failed their schema rules.
    #[error("invalid data: {}", summarize(.0))]
    InvalidData(Vec<ConsistencyViolation>),

    /// A reference points at a row that does not exist.
    #[error("referential integrity violated: {}", summarize(.0))]
    ReferentialIntegrity(Vec<ConsistencyViolation>),

    /// No handler is registered for the command.
    #[error("no command handler registered for {0}")]
    HandlerNotFound(String),

    /// A second handler was registered for an already-bound command kind.
    #[error("a command handler is already registered for {0}")]
    DuplicateHandler(String),

    /// More than one fallback handler claimed the command.
    #[error("{candidates} command handlers claim {command_type}")]
    AmbiguousHandler {
        /// The command type that was dispatched.
        command_type: String,
        /// How many handlers claimed it.
        candidates: usize,
    },

    /// A transient infrastructure failure.
    #[error("transient failure: {0}")]
    Transient(TransientFailure),

    /// No consistency snapshot exists with this id.
    #[error("consistency snapshot not found: {0}")]
    SnapshotNotFound(Uuid),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline passed.
    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl DomainError {
    /// Whether retrying the same request may succeed.
    ///
    /// Version conflicts and transient infrastructure failures are
    /// retryable; integrity, validation and programmer errors are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. } | Self::Transient(_))
    }

    /// Whether this is an optimistic-locking conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// The violations carried by integrity and data errors.
    #[must_use]
    pub fn violations(&self) -> &[ConsistencyViolation] {
        match self {
            Self::InvalidData(violations) | Self::ReferentialIntegrity(violations) => violations,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::violation::{Severity, ViolationType};

    #[test]
    fn test_conflicts_and_transient_failures_are_retryable() {
        let conflict = DomainError::ConcurrencyConflict {
            entity_type: "task".into(),
            aggregate_id: Uuid::new_v4(),
            expected: 1,
            actual: 2,
        };

        assert!(conflict.is_retryable());
        assert!(conflict.is_conflict());
        assert!(DomainError::Transient(TransientFailure::DeadlockDetected).is_retryable());
        assert!(DomainError::Transient(TransientFailure::ConnectionLost).is_retryable());
    }

    #[test]
    fn test_logical_errors_are_not_retryable() {
        let violation = ConsistencyViolation::new(
            ViolationType::ReferentialIntegrity,
            "task",
            Uuid::nil(),
            "missing project",
            Severity::High,
        );

        assert!(!DomainError::ReferentialIntegrity(vec![violation]).is_retryable());
        assert!(!DomainError::Validation("bad".into()).is_retryable());
        assert!(!DomainError::HandlerNotFound("x".into()).is_retryable());
        assert!(!DomainError::Cancelled.is_retryable());
        assert!(!DomainError::Infrastructure("boom".into()).is_retryable());
    }

    #[test]
    fn test_integrity_error_message_includes_first_violation() {
        let violation = ConsistencyViolation::new(
            ViolationType::ReferentialIntegrity,
            "task",
            Uuid::nil(),
            "missing project",
            Severity::High,
        );
        let err = DomainError::ReferentialIntegrity(vec![violation]);

        assert!(err.to_string().contains("missing project"));
        assert_eq!(err.violations().len(), 1);
    }
}
