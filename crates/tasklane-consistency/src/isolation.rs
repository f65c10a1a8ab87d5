//! Transaction isolation probes.
//!
//! These are heuristics. Their findings are `TRANSACTION_ISOLATION`
//! violations carried as warnings; they never abort an operation.

use serde_json::json;
use tasklane_core::error::DomainError;
use tasklane_core::storage::{IsolationLevel, StorageTransaction};
use tasklane_core::violation::{ConsistencyViolation, Severity, ViolationType};
use tracing::warn;
use uuid::Uuid;

use crate::policy::ConsistencyPolicy;

const TRANSACTION_ENTITY: &str = "transaction";

fn isolation_warning(message: String, severity: Severity) -> ConsistencyViolation {
    ConsistencyViolation::new(
        ViolationType::TransactionIsolation,
        TRANSACTION_ENTITY,
        Uuid::nil(),
        message,
        severity,
    )
}

/// Flags policy combinations that undermine their own guarantees.
#[must_use]
pub fn isolation_sanity_warnings(policy: &ConsistencyPolicy) -> Vec<ConsistencyViolation> {
    let mut warnings = Vec::new();
    if policy.isolation_level == IsolationLevel::ReadUncommitted
        && policy.enforce_optimistic_locking
    {
        warnings.push(
            isolation_warning(
                "READ UNCOMMITTED lets version checks observe uncommitted writes".to_owned(),
                Severity::Medium,
            )
            .with_field("isolation_level")
            .with_actual(json!(policy.isolation_level)),
        );
    }
    if policy.isolation_level == IsolationLevel::Serializable && policy.max_attempts() == 1 {
        warnings.push(
            isolation_warning(
                "SERIALIZABLE without retries surfaces every serialization failure".to_owned(),
                Severity::Low,
            )
            .with_field("retry_attempts")
            .with_actual(json!(policy.retry_attempts)),
        );
    }
    warnings
}

/// Reports lock contention above the policy threshold.
///
/// # Errors
///
/// Returns the storage error.
pub async fn deadlock_probe(
    tx: &mut dyn StorageTransaction,
    policy: &ConsistencyPolicy,
) -> Result<Option<ConsistencyViolation>, DomainError> {
    let blocked_waiters = tx.blocked_waiters().await?;
    if blocked_waiters <= policy.deadlock_probe_threshold {
        return Ok(None);
    }
    warn!(
        blocked_waiters,
        threshold = policy.deadlock_probe_threshold,
        "deadlock risk"
    );
    Ok(Some(
        isolation_warning(
            format!(
                "{} lock requests are waiting (threshold {})",
                blocked_waiters, policy.deadlock_probe_threshold
            ),
            Severity::Medium,
        )
        .with_field("blocked_waiters")
        .with_expected(json!(policy.deadlock_probe_threshold))
        .with_actual(json!(blocked_waiters)),
    ))
}

/// Reports every other transaction open longer than the policy threshold.
///
/// # Errors
///
/// Returns the storage error.
pub async fn long_transaction_audit(
    tx: &mut dyn StorageTransaction,
    policy: &ConsistencyPolicy,
) -> Result<Vec<ConsistencyViolation>, DomainError> {
    let diagnostics = tx
        .lock_diagnostics(policy.long_transaction_threshold)
        .await?;
    Ok(diagnostics
        .long_running
        .into_iter()
        .map(|held| {
            isolation_warning(
                format!(
                    "transaction {} has been {} for {} ms",
                    held.holder, held.state, held.age_ms
                ),
                Severity::Low,
            )
            .with_field("age_ms")
            .with_actual(json!(held.age_ms))
        })
        .collect())
}
