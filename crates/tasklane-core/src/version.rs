//! Version tokens for optimistic concurrency.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::violation::{ConsistencyViolation, Severity, ViolationType};

/// Monotonically increasing version attached to every persisted aggregate.
///
/// A write succeeds only if the writer's token equals the stored one; the
/// stored token then increments by exactly one. Tokens are always `>= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct VersionToken(i64);

impl VersionToken {
    /// Version of a freshly created aggregate.
    pub const INITIAL: Self = Self(1);

    /// Wraps a raw stored version.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidData` if `raw` is zero or negative.
    pub fn new(raw: i64) -> Result<Self, DomainError> {
        if raw < 1 {
            return Err(DomainError::InvalidData(vec![invalid_token_violation(
                "aggregate",
                Uuid::nil(),
                Some(raw),
            )]));
        }
        Ok(Self(raw))
    }

    /// Returns the raw value.
    #[must_use]
    pub fn get(self) -> i64 {
        self.0
    }

    /// Returns the token a successful write produces.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl TryFrom<i64> for VersionToken {
    type Error = String;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        if raw < 1 {
            return Err(format!("version token must be >= 1, got {raw}"));
        }
        Ok(Self(raw))
    }
}

impl From<VersionToken> for i64 {
    fn from(token: VersionToken) -> Self {
        token.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Builds the violation reported for a stored token that is null, zero or
/// negative.
#[must_use]
pub fn invalid_token_violation(
    entity_type: &str,
    entity_id: Uuid,
    stored: Option<i64>,
) -> ConsistencyViolation {
    let actual = stored.map_or(serde_json::Value::Null, serde_json::Value::from);
    ConsistencyViolation::new(
        ViolationType::OptimisticLock,
        entity_type,
        entity_id,
        format!(
            "stored version token {} is not a positive integer",
            stored.map_or_else(|| "NULL".to_owned(), |v| v.to_string())
        ),
        Severity::Critical,
    )
    .with_field("version")
    .with_expected(serde_json::json!(">= 1"))
    .with_actual(actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_zero_and_negative() {
        assert!(VersionToken::new(0).is_err());
        assert!(VersionToken::new(-3).is_err());
        match VersionToken::new(0) {
            Err(DomainError::InvalidData(v)) => {
                assert_eq!(v[0].violation_type, ViolationType::OptimisticLock);
                assert_eq!(v[0].severity, Severity::Critical);
            }
            other => panic!("expected InvalidData, got {other:?}"),
        }
    }

    #[test]
    fn test_next_increments_by_one() {
        let v = VersionToken::new(4).unwrap();
        assert_eq!(v.next().get(), 5);
        assert_eq!(VersionToken::INITIAL.get(), 1);
    }

    #[test]
    fn test_deserialize_rejects_non_positive() {
        assert!(serde_json::from_str::<VersionToken>("0").is_err());
        assert_eq!(
            serde_json::from_str::<VersionToken>("7").unwrap(),
            VersionToken::new(7).unwrap()
        );
    }
}
