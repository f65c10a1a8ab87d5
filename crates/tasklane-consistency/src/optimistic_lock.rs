//! Optimistic lock manager.
//!
//! A write carries the version token its author last read. The stored
//! token is compared and incremented in one statement; a mismatch is a
//! retryable [`DomainError::ConcurrencyConflict`] carrying both values, so
//! of two writers that read the same version exactly one wins.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tasklane_core::clock::Clock;
use tasklane_core::context::OperationContext;
use tasklane_core::error::DomainError;
use tasklane_core::rng::JitterSource;
use tasklane_core::sleep::Sleeper;
use tasklane_core::storage::{StorageTransaction, VersionCas};
use tasklane_core::version::{VersionToken, invalid_token_violation};
use tracing::warn;
use uuid::Uuid;

use crate::metrics::ConsistencyMetrics;
use crate::retry::{RetryEnv, RetrySchedule, run_with_retry};

/// Retries operations that lose a version race.
pub struct OptimisticLockManager {
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    jitter: Arc<dyn JitterSource>,
    metrics: Arc<ConsistencyMetrics>,
}

impl OptimisticLockManager {
    /// Creates a manager.
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        jitter: Arc<dyn JitterSource>,
        metrics: Arc<ConsistencyMetrics>,
    ) -> Self {
        Self {
            clock,
            sleeper,
            jitter,
            metrics,
        }
    }

    /// Invokes `operation` until it stops failing with a version conflict or
    /// `max_attempts` have been made. Any other error ends the loop
    /// immediately.
    ///
    /// `operation` must re-read the versions it writes against; retrying
    /// with the stale token would conflict again.
    ///
    /// # Errors
    ///
    /// Returns the final `ConcurrencyConflict` once attempts are exhausted,
    /// the first non-conflict error, or `Cancelled`/`DeadlineExceeded`.
    pub async fn with_retry<T, F, Fut>(
        &self,
        cx: &OperationContext,
        max_attempts: u32,
        base_delay: Duration,
        mut operation: F,
    ) -> Result<T, DomainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DomainError>>,
    {
        let env = RetryEnv {
            clock: self.clock.as_ref(),
            sleeper: self.sleeper.as_ref(),
            jitter: self.jitter.as_ref(),
        };
        let (value, _) = run_with_retry(
            cx,
            &RetrySchedule::new(max_attempts, base_delay),
            env,
            DomainError::is_conflict,
            |attempt, error, delay| {
                self.metrics.record_retry(true);
                warn!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "version conflict, retrying"
                );
            },
            |_| operation(),
        )
        .await?;
        Ok(value)
    }
}

/// Checks a version the caller read against the stored one.
///
/// # Errors
///
/// Returns `InvalidData` when the stored token is missing or not positive,
/// and `ConcurrencyConflict` when the tokens differ.
pub fn verify_version(
    entity_type: &str,
    entity_id: Uuid,
    expected: VersionToken,
    stored: Option<i64>,
) -> Result<(), DomainError> {
    match stored {
        Some(actual) if actual >= 1 => {
            if actual == expected.get() {
                Ok(())
            } else {
                Err(DomainError::ConcurrencyConflict {
                    entity_type: entity_type.to_owned(),
                    aggregate_id: entity_id,
                    expected: expected.get(),
                    actual,
                })
            }
        }
        other => Err(DomainError::InvalidData(vec![invalid_token_violation(
            entity_type,
            entity_id,
            other,
        )])),
    }
}

/// Increments the stored token of one row if it still equals `expected`.
///
/// # Errors
///
/// Returns `AggregateNotFound` for a missing row, `InvalidData` for a
/// corrupt stored token, `ConcurrencyConflict` on mismatch, or the storage
/// error.
pub async fn compare_and_increment(
    tx: &mut dyn StorageTransaction,
    entity_type: &str,
    table: &str,
    version_column: &str,
    entity_id: Uuid,
    expected: VersionToken,
) -> Result<VersionToken, DomainError> {
    match tx
        .compare_and_increment(table, version_column, entity_id, expected.get())
        .await?
    {
        VersionCas::Incremented(next) => VersionToken::new(next),
        VersionCas::Mismatch { actual: Some(actual) } => {
            verify_version(entity_type, entity_id, expected, Some(actual))?;
            // Equal tokens never report a mismatch.
            Err(DomainError::Infrastructure(format!(
                "storage reported a version mismatch for {entity_type} {entity_id} at v{actual}"
            )))
        }
        VersionCas::Mismatch { actual: None } => {
            if tx.fetch_record(table, entity_id).await?.is_none() {
                return Err(DomainError::AggregateNotFound(entity_id));
            }
            verify_version(entity_type, entity_id, expected, None).map(|()| expected)
        }
    }
}
