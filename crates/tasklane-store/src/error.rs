//! Translation of `sqlx` errors into the domain taxonomy.

use tasklane_core::error::{DomainError, TransientFailure};
use tasklane_core::violation::{ConsistencyViolation, Severity, ViolationType};
use uuid::Uuid;

use crate::sql::SqlBuildError;

/// Classifies a SQLSTATE code. `None` means the code carries no retry or
/// integrity meaning.
fn classify_sqlstate(code: &str, message: &str) -> Option<DomainError> {
    match code {
        "40001" => Some(DomainError::Transient(
            TransientFailure::SerializationFailure,
        )),
        "40P01" => Some(DomainError::Transient(TransientFailure::DeadlockDetected)),
        "23503" => Some(DomainError::ReferentialIntegrity(vec![
            ConsistencyViolation::new(
                ViolationType::ReferentialIntegrity,
                "database",
                Uuid::nil(),
                format!("FOREIGN_KEY: {message}"),
                Severity::High,
            ),
        ])),
        "23505" | "23514" | "22P02" => Some(DomainError::Validation(message.to_owned())),
        _ => None,
    }
}

/// Maps a `sqlx` error onto [`DomainError`].
#[must_use]
pub fn map_sqlx_error(error: sqlx::Error) -> DomainError {
    match &error {
        sqlx::Error::Database(db) => {
            let message = db.message().to_owned();
            db.code()
                .and_then(|code| classify_sqlstate(&code, &message))
                .unwrap_or_else(|| DomainError::Infrastructure(error.to_string()))
        }
        sqlx::Error::PoolTimedOut => DomainError::Transient(TransientFailure::Timeout),
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            DomainError::Transient(TransientFailure::ConnectionLost)
        }
        _ => DomainError::Infrastructure(error.to_string()),
    }
}

impl From<SqlBuildError> for DomainError {
    fn from(error: SqlBuildError) -> Self {
        DomainError::Validation(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_sqlstates() {
        assert!(matches!(
            classify_sqlstate("40001", "could not serialize access"),
            Some(DomainError::Transient(TransientFailure::SerializationFailure))
        ));
        assert!(matches!(
            classify_sqlstate("40P01", "deadlock detected"),
            Some(DomainError::Transient(TransientFailure::DeadlockDetected))
        ));
    }

    #[test]
    fn test_integrity_and_validation_sqlstates_are_not_retryable() {
        let foreign_key = classify_sqlstate("23503", "violates foreign key").unwrap();
        let unique = classify_sqlstate("23505", "duplicate key").unwrap();

        assert!(!foreign_key.is_retryable());
        assert_eq!(foreign_key.violations().len(), 1);
        assert!(matches!(unique, DomainError::Validation(m) if m == "duplicate key"));
        assert!(classify_sqlstate("42P01", "relation does not exist").is_none());
    }

    #[test]
    fn test_pool_errors_are_transient() {
        assert!(map_sqlx_error(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(map_sqlx_error(sqlx::Error::PoolClosed).is_retryable());
        assert!(matches!(
            map_sqlx_error(sqlx::Error::RowNotFound),
            DomainError::Infrastructure(_)
        ));
    }

    #[test]
    fn test_build_errors_become_validation() {
        let error: DomainError = SqlBuildError::InvalidIdentifier("a b".into()).into();

        assert!(matches!(error, DomainError::Validation(_)));
    }
}
