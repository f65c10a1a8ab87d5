//! Referential integrity manager.
//!
//! Integrity is checked eagerly, for the rows a transaction touched, and
//! lazily, by a full scan of every registered relationship.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tasklane_core::error::DomainError;
use tasklane_core::storage::{OrphanRow, StorageTransaction};
use tasklane_core::violation::{ConsistencyViolation, Severity, ViolationType};
use tracing::debug;
use uuid::Uuid;

use crate::registry::{EntityDefinition, EntityRegistry, OrphanPolicy, ReferenceRule};

/// Classification of a dangling reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrphanKind {
    /// A well-formed id whose parent row is gone.
    ForeignKey,
    /// A value that is not an id at all, or a missing required reference.
    Structural,
}

impl OrphanKind {
    /// Classifies a raw reference value.
    #[must_use]
    pub fn of(reference: &Value) -> Self {
        if parse_reference(reference).is_some() {
            Self::ForeignKey
        } else {
            Self::Structural
        }
    }

    /// Label used in violation messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ForeignKey => "FOREIGN_KEY",
            Self::Structural => "STRUCTURAL",
        }
    }
}

/// Mutation being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityOperation {
    /// Row inserted.
    Create,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

/// Outcome of a single-entity check.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationResult {
    /// Whether the entity passed.
    pub valid: bool,
    /// What failed.
    pub violations: Vec<ConsistencyViolation>,
}

impl ValidationResult {
    fn from_violations(violations: Vec<ConsistencyViolation>) -> Self {
        Self {
            valid: violations.is_empty(),
            violations,
        }
    }
}

/// Outcome of a full scan.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    /// One violation per orphaned row.
    pub violations: Vec<ConsistencyViolation>,
    /// Observations that are not violations.
    pub warnings: Vec<String>,
    /// Relationships scanned, as `child.column -> parent`.
    pub checked_constraints: Vec<String>,
}

fn parse_reference(value: &Value) -> Option<Uuid> {
    value.as_str().and_then(|s| Uuid::parse_str(s).ok())
}

fn orphan_violation(
    child: &EntityDefinition,
    rule: &ReferenceRule,
    orphan: &OrphanRow,
) -> ConsistencyViolation {
    let kind = OrphanKind::of(&orphan.reference);
    let (severity, fixable, detail) = match kind {
        OrphanKind::ForeignKey => (
            Severity::High,
            rule.on_orphan != OrphanPolicy::Reject,
            format!("references a missing {} row", rule.target),
        ),
        OrphanKind::Structural => (
            Severity::Critical,
            false,
            format!("holds a malformed {} reference", rule.target),
        ),
    };
    ConsistencyViolation::new(
        ViolationType::ReferentialIntegrity,
        &child.entity_type,
        orphan.child_id,
        format!(
            "{}: {}.{} {detail}",
            kind.as_str(),
            child.entity_type,
            rule.column
        ),
        severity,
    )
    .with_field(&rule.column)
    .with_expected(json!(rule.target))
    .with_actual(orphan.reference.clone())
    .fixable(fixable)
}

/// Scans, validates and repairs references declared in the registry.
#[derive(Debug, Clone)]
pub struct ReferentialIntegrityManager {
    registry: Arc<EntityRegistry>,
}

impl ReferentialIntegrityManager {
    /// Creates a manager over `registry`.
    #[must_use]
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }

    /// Scans every registered relationship for orphans.
    ///
    /// # Errors
    ///
    /// Returns the storage error; orphans are reported, not raised.
    pub async fn perform_full_integrity_check(
        &self,
        tx: &mut dyn StorageTransaction,
    ) -> Result<IntegrityReport, DomainError> {
        let mut report = IntegrityReport::default();

        for child in self.registry.entities() {
            for rule in &child.references {
                let parent = self.registry.require(&rule.target)?;
                report.checked_constraints.push(format!(
                    "{}.{} -> {}",
                    child.entity_type, rule.column, parent.entity_type
                ));

                let orphans = tx
                    .find_orphans(&child.table, &rule.column, &parent.table)
                    .await?;
                debug!(
                    child = %child.entity_type,
                    column = %rule.column,
                    orphans = orphans.len(),
                    "scanned relationship"
                );
                if orphans.is_empty() {
                    continue;
                }
                if rule.on_orphan == OrphanPolicy::Reject {
                    report.warnings.push(format!(
                        "{} orphaned {}.{} rows need manual repair (policy reject)",
                        orphans.len(),
                        child.entity_type,
                        rule.column
                    ));
                }
                report.violations.extend(
                    orphans
                        .iter()
                        .map(|orphan| orphan_violation(child, rule, orphan)),
                );
            }
        }

        Ok(report)
    }

    /// Checks one entity inside an open transaction.
    ///
    /// Create and update require every non-null reference to be well-formed
    /// and resolve, and every required reference to be present. Delete
    /// requires that no registered child still points at the entity,
    /// whatever the relationship's orphan policy.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an unknown entity type, or the storage error.
    pub async fn validate_entity(
        &self,
        tx: &mut dyn StorageTransaction,
        entity_type: &str,
        entity_id: Uuid,
        operation: EntityOperation,
    ) -> Result<ValidationResult, DomainError> {
        let definition = self.registry.require(entity_type)?;
        let violations = match operation {
            EntityOperation::Create | EntityOperation::Update => {
                self.check_outgoing(tx, definition, entity_id).await?
            }
            EntityOperation::Delete => self.check_incoming(tx, definition, entity_id).await?,
        };
        Ok(ValidationResult::from_violations(violations))
    }

    async fn check_outgoing(
        &self,
        tx: &mut dyn StorageTransaction,
        definition: &EntityDefinition,
        entity_id: Uuid,
    ) -> Result<Vec<ConsistencyViolation>, DomainError> {
        let Some(record) = tx.fetch_record(&definition.table, entity_id).await? else {
            return Ok(vec![
                ConsistencyViolation::new(
                    ViolationType::ReferentialIntegrity,
                    &definition.entity_type,
                    entity_id,
                    format!("{} {entity_id} does not exist", definition.entity_type),
                    Severity::Critical,
                ),
            ]);
        };

        let mut violations = Vec::new();
        for rule in &definition.references {
            let reference = record.get(&rule.column).cloned().unwrap_or(Value::Null);
            if reference.is_null() {
                if !rule.nullable {
                    violations.push(
                        ConsistencyViolation::new(
                            ViolationType::ReferentialIntegrity,
                            &definition.entity_type,
                            entity_id,
                            format!(
                                "STRUCTURAL: {}.{} is required",
                                definition.entity_type, rule.column
                            ),
                            Severity::Critical,
                        )
                        .with_field(&rule.column)
                        .with_expected(json!(rule.target)),
                    );
                }
                continue;
            }

            let parent = self.registry.require(&rule.target)?;
            let resolves = match parse_reference(&reference) {
                Some(parent_id) => tx.fetch_record(&parent.table, parent_id).await?.is_some(),
                None => false,
            };
            if !resolves {
                let orphan = OrphanRow {
                    child_id: entity_id,
                    reference,
                };
                violations.push(orphan_violation(definition, rule, &orphan).fixable(false));
            }
        }
        Ok(violations)
    }

    async fn check_incoming(
        &self,
        tx: &mut dyn StorageTransaction,
        definition: &EntityDefinition,
        entity_id: Uuid,
    ) -> Result<Vec<ConsistencyViolation>, DomainError> {
        let target = Value::String(entity_id.to_string());
        let mut violations = Vec::new();
        for (child, rule) in self.registry.children_of(&definition.entity_type) {
            let dependents = tx
                .find_orphans(&child.table, &rule.column, &definition.table)
                .await?
                .into_iter()
                .filter(|orphan| orphan.reference == target)
                .count();
            if dependents > 0 {
                violations.push(
                    ConsistencyViolation::new(
                        ViolationType::ReferentialIntegrity,
                        &definition.entity_type,
                        entity_id,
                        format!(
                            "FOREIGN_KEY: {dependents} {} rows still reference this {} through {}",
                            child.entity_type, definition.entity_type, rule.column
                        ),
                        Severity::High,
                    )
                    .with_field(&rule.column)
                    .with_actual(json!(dependents)),
                );
            }
        }
        Ok(violations)
    }

    /// Applies the relationship's orphan policy to a violation from
    /// [`perform_full_integrity_check`](Self::perform_full_integrity_check).
    /// Returns whether the violation was repaired.
    ///
    /// Versioned children have their token incremented by a repair so that
    /// concurrent writers holding the old token conflict.
    ///
    /// # Errors
    ///
    /// Returns the storage error.
    pub async fn fix_violation(
        &self,
        tx: &mut dyn StorageTransaction,
        violation: &ConsistencyViolation,
    ) -> Result<bool, DomainError> {
        if violation.violation_type != ViolationType::ReferentialIntegrity {
            return Ok(false);
        }
        let Some(child) = self.registry.get(&violation.entity_type) else {
            return Ok(false);
        };
        let Some(rule) = violation
            .field
            .as_deref()
            .and_then(|column| child.reference_on(column))
        else {
            return Ok(false);
        };
        let reference = violation.actual_value.as_ref().unwrap_or(&Value::Null);
        if OrphanKind::of(reference) == OrphanKind::Structural {
            return Ok(false);
        }

        match rule.on_orphan {
            OrphanPolicy::Reject => Ok(false),
            OrphanPolicy::CascadeDelete => tx.delete_record(&child.table, violation.entity_id).await,
            OrphanPolicy::SetNull => {
                let Some(record) = tx.fetch_record(&child.table, violation.entity_id).await? else {
                    return Ok(false);
                };
                let mut fields = Map::new();
                fields.insert(rule.column.clone(), Value::Null);
                if let Some(column) = &child.version_column {
                    if let Some(version) = record.get_i64(column).filter(|v| *v >= 1) {
                        fields.insert(column.clone(), Value::from(version + 1));
                    }
                }
                tx.update_fields(&child.table, violation.entity_id, &fields)
                    .await
            }
        }
    }
}
