//! Consistency policy configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tasklane_core::error::DomainError;
use tasklane_core::storage::IsolationLevel;

/// How the delay between retries grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Every retry waits the base delay.
    Fixed,
    /// The delay doubles after every failed attempt, capped at `max_delay`.
    Exponential {
        /// Upper bound for a single delay.
        max_delay: Duration,
    },
}

/// Which checks are enforced and how write paths retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyPolicy {
    /// Isolation level for every transaction the engine opens.
    pub isolation_level: IsolationLevel,
    /// Total attempts per operation; `0` is treated as `1`.
    pub retry_attempts: u32,
    /// Base delay between attempts.
    pub retry_delay: Duration,
    /// Re-run an operation after a version conflict. Turn off when the
    /// expected versions come from the caller and cannot change between
    /// attempts; transient failures are still retried.
    pub retry_conflicts: bool,
    /// Delay growth.
    pub backoff: BackoffStrategy,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    pub jitter: bool,
    /// Check version tokens before writes and audit them.
    pub enforce_optimistic_locking: bool,
    /// Validate references before commit and audit orphans.
    pub enforce_referential_integrity: bool,
    /// Validate field rules and raised events before commit.
    pub enforce_data_validation: bool,
    /// Repair violations flagged `auto_fixable` during full checks.
    pub auto_fix_violations: bool,
    /// Blocked lock waiters above which a deadlock-risk warning is raised.
    pub deadlock_probe_threshold: i64,
    /// Age after which another open transaction is reported.
    pub long_transaction_threshold: Duration,
}

impl Default for ConsistencyPolicy {
    fn default() -> Self {
        Self {
            isolation_level: IsolationLevel::ReadCommitted,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
            retry_conflicts: true,
            backoff: BackoffStrategy::Exponential {
                max_delay: Duration::from_secs(2),
            },
            jitter: false,
            enforce_optimistic_locking: true,
            enforce_referential_integrity: true,
            enforce_data_validation: true,
            auto_fix_violations: false,
            deadlock_probe_threshold: 5,
            long_transaction_threshold: Duration::from_secs(30),
        }
    }
}

impl ConsistencyPolicy {
    /// Sets the isolation level.
    #[must_use]
    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Sets the total attempt budget.
    #[must_use]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Sets the base retry delay.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Enables or disables retries after version conflicts.
    #[must_use]
    pub fn with_conflict_retries(mut self, retry: bool) -> Self {
        self.retry_conflicts = retry;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Toggles version enforcement.
    #[must_use]
    pub fn with_optimistic_locking(mut self, enforce: bool) -> Self {
        self.enforce_optimistic_locking = enforce;
        self
    }

    /// Toggles referential-integrity enforcement.
    #[must_use]
    pub fn with_referential_integrity(mut self, enforce: bool) -> Self {
        self.enforce_referential_integrity = enforce;
        self
    }

    /// Toggles data validation.
    #[must_use]
    pub fn with_data_validation(mut self, enforce: bool) -> Self {
        self.enforce_data_validation = enforce;
        self
    }

    /// Permits automatic repair during full checks.
    #[must_use]
    pub fn with_auto_fix(mut self, auto_fix: bool) -> Self {
        self.auto_fix_violations = auto_fix;
        self
    }

    /// Sets the long-running transaction threshold.
    #[must_use]
    pub fn with_long_transaction_threshold(mut self, threshold: Duration) -> Self {
        self.long_transaction_threshold = threshold;
        self
    }

    /// Sets the blocked-waiter count that triggers a deadlock warning.
    #[must_use]
    pub fn with_deadlock_probe_threshold(mut self, waiters: i64) -> Self {
        self.deadlock_probe_threshold = waiters;
        self
    }

    /// Attempts actually made per operation.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.retry_attempts.max(1)
    }

    /// Builds a policy from `CONSISTENCY_*` keys, falling back to defaults
    /// for absent keys.
    ///
    /// Production passes `|k| std::env::var(k).ok()`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` naming the key of the first value
    /// that cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, DomainError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut policy = Self::default();

        if let Some(raw) = lookup("CONSISTENCY_ISOLATION_LEVEL") {
            policy.isolation_level = raw.parse()?;
        }
        if let Some(attempts) = parse_key::<u32>(&lookup, "CONSISTENCY_RETRY_ATTEMPTS")? {
            policy.retry_attempts = attempts;
        }
        if let Some(ms) = parse_key::<u64>(&lookup, "CONSISTENCY_RETRY_DELAY_MS")? {
            policy.retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_key::<u64>(&lookup, "CONSISTENCY_MAX_RETRY_DELAY_MS")? {
            policy.backoff = BackoffStrategy::Exponential {
                max_delay: Duration::from_millis(ms),
            };
        }
        if let Some(flag) = parse_flag(&lookup, "CONSISTENCY_ENFORCE_OPTIMISTIC_LOCKING")? {
            policy.enforce_optimistic_locking = flag;
        }
        if let Some(flag) = parse_flag(&lookup, "CONSISTENCY_ENFORCE_REFERENTIAL_INTEGRITY")? {
            policy.enforce_referential_integrity = flag;
        }
        if let Some(flag) = parse_flag(&lookup, "CONSISTENCY_ENFORCE_DATA_VALIDATION")? {
            policy.enforce_data_validation = flag;
        }
        if let Some(flag) = parse_flag(&lookup, "CONSISTENCY_AUTO_FIX")? {
            policy.auto_fix_violations = flag;
        }
        if let Some(secs) = parse_key::<u64>(&lookup, "CONSISTENCY_LONG_TRANSACTION_SECS")? {
            policy.long_transaction_threshold = Duration::from_secs(secs);
        }

        Ok(policy)
    }
}

fn parse_key<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, DomainError> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| DomainError::Validation(format!("{key}: cannot parse {raw:?}")))
        })
        .transpose()
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<bool>, DomainError> {
    lookup(key)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(DomainError::Validation(format!(
                "{key}: expected a boolean, got {raw:?}"
            ))),
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_safe() {
        let policy = ConsistencyPolicy::default();

        assert_eq!(policy.isolation_level, IsolationLevel::ReadCommitted);
        assert_eq!(policy.retry_attempts, 3);
        assert!(policy.enforce_optimistic_locking);
        assert!(policy.enforce_referential_integrity);
        assert!(policy.enforce_data_validation);
        assert!(!policy.auto_fix_violations);
    }

    #[test]
    fn test_from_lookup_overrides_only_present_keys() {
        // Arrange
        let lookup = lookup_from(&[
            ("CONSISTENCY_ISOLATION_LEVEL", "serializable"),
            ("CONSISTENCY_RETRY_ATTEMPTS", "5"),
            ("CONSISTENCY_RETRY_DELAY_MS", "20"),
            ("CONSISTENCY_AUTO_FIX", "true"),
        ]);

        // Act
        let policy = ConsistencyPolicy::from_lookup(lookup).unwrap();

        // Assert
        assert_eq!(policy.isolation_level, IsolationLevel::Serializable);
        assert_eq!(policy.retry_attempts, 5);
        assert_eq!(policy.retry_delay, Duration::from_millis(20));
        assert!(policy.auto_fix_violations);
        assert!(policy.enforce_referential_integrity);
        assert_eq!(
            policy.long_transaction_threshold,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_from_lookup_rejects_unparseable_values() {
        let lookup = lookup_from(&[("CONSISTENCY_RETRY_ATTEMPTS", "many")]);

        let result = ConsistencyPolicy::from_lookup(lookup);

        match result {
            Err(DomainError::Validation(msg)) => {
                assert!(msg.contains("CONSISTENCY_RETRY_ATTEMPTS"));
            }
            other => panic!("expected Validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let policy = ConsistencyPolicy::default().with_retry_attempts(0);

        assert_eq!(policy.max_attempts(), 1);
    }
}
