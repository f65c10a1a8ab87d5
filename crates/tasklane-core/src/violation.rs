//! Consistency violations produced by audits and in-flight checks.
//!
//! Violations are audit output: they are recomputed on demand and never
//! persisted as domain state.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category of a consistency violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationType {
    /// A stored version token is missing, zero or negative.
    OptimisticLock,
    /// A reference points at a row that does not exist, or is malformed.
    ReferentialIntegrity,
    /// A field fails its schema or range rule.
    DataValidation,
    /// Heuristic signal that transactions are interfering with each other.
    TransactionIsolation,
}

impl ViolationType {
    /// All violation types, in audit order.
    pub const ALL: [Self; 4] = [
        Self::OptimisticLock,
        Self::ReferentialIntegrity,
        Self::DataValidation,
        Self::TransactionIsolation,
    ];

    /// Stable name used in logs and reports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OptimisticLock => "OPTIMISTIC_LOCK",
            Self::ReferentialIntegrity => "REFERENTIAL_INTEGRITY",
            Self::DataValidation => "DATA_VALIDATION",
            Self::TransactionIsolation => "TRANSACTION_ISOLATION",
        }
    }
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a consistency violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Informational; nothing is wrong yet.
    Low,
    /// Data is questionable but usable.
    Medium,
    /// Data is wrong and should be repaired.
    High,
    /// Data is corrupt and blocks writers.
    Critical,
}

/// A single consistency finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyViolation {
    /// Category of the finding.
    #[serde(rename = "type")]
    pub violation_type: ViolationType,
    /// Entity type the finding is about.
    pub entity_type: String,
    /// Identifier of the offending entity (nil for non-entity findings).
    pub entity_id: Uuid,
    /// Field involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Value the rule expected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_value: Option<serde_json::Value>,
    /// Value actually found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_value: Option<serde_json::Value>,
    /// Human-readable explanation.
    pub message: String,
    /// How bad it is.
    pub severity: Severity,
    /// Whether an automatic repair exists for this finding.
    pub auto_fixable: bool,
}

impl ConsistencyViolation {
    /// Creates a violation with no field detail.
    #[must_use]
    pub fn new(
        violation_type: ViolationType,
        entity_type: impl Into<String>,
        entity_id: Uuid,
        message: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            violation_type,
            entity_type: entity_type.into(),
            entity_id,
            field: None,
            expected_value: None,
            actual_value: None,
            message: message.into(),
            severity,
            auto_fixable: false,
        }
    }

    /// Attaches the offending field.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Attaches the expected value.
    #[must_use]
    pub fn with_expected(mut self, value: serde_json::Value) -> Self {
        self.expected_value = Some(value);
        self
    }

    /// Attaches the actual value.
    #[must_use]
    pub fn with_actual(mut self, value: serde_json::Value) -> Self {
        self.actual_value = Some(value);
        self
    }

    /// Marks the violation as automatically repairable.
    #[must_use]
    pub fn fixable(mut self, auto_fixable: bool) -> Self {
        self.auto_fixable = auto_fixable;
        self
    }
}

impl fmt::Display for ConsistencyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}: {}",
            self.violation_type, self.entity_type, self.entity_id, self.message
        )
    }
}

/// Renders a short summary of a violation list for error messages.
#[must_use]
pub fn summarize(violations: &[ConsistencyViolation]) -> String {
    match violations {
        [] => "no violations".to_owned(),
        [only] => only.to_string(),
        [first, rest @ ..] => format!("{first} (and {} more)", rest.len()),
    }
}
