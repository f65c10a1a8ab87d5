//! Tasklane auditor error types.

use tasklane_core::error::DomainError;
use thiserror::Error;

/// Startup and runtime errors of the auditor.
#[derive(Debug, Error)]
pub enum AppError {
    /// A required environment variable is missing or invalid, or the
    /// entity schema cannot be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database connection or pool error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Reading the schema or writing a report failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The consistency engine failed.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// A report could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Whether the run ended because it was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Domain(DomainError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_display_unchanged() {
        let error = AppError::from(DomainError::Validation("bad schema".into()));

        assert_eq!(error.to_string(), DomainError::Validation("bad schema".into()).to_string());
    }

    #[test]
    fn test_only_cancellation_is_cancelled() {
        assert!(AppError::from(DomainError::Cancelled).is_cancelled());
        assert!(!AppError::from(DomainError::DeadlineExceeded).is_cancelled());
        assert!(!AppError::Config("DATABASE_URL".into()).is_cancelled());
    }
}
