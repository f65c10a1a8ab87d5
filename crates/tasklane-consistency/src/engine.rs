//! The consistency engine.
//!
//! Composes the transaction manager, optimistic locking, referential
//! integrity and data validation into guarded write paths, and runs
//! whole-database audits and checksummed snapshots on demand.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tasklane_core::clock::{Clock, SystemClock};
use tasklane_core::context::OperationContext;
use tasklane_core::error::DomainError;
use tasklane_core::event_log::StoredEvent;
use tasklane_core::rng::{JitterSource, ThreadJitter};
use tasklane_core::sleep::Sleeper;
use tasklane_core::storage::{Database, IsolationLevel, StorageTransaction};
use tasklane_core::violation::{ConsistencyViolation, Severity, ViolationType};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::integrity::{EntityOperation, ReferentialIntegrityManager};
use crate::isolation::{deadlock_probe, isolation_sanity_warnings, long_transaction_audit};
use crate::metrics::{ConsistencyMetrics, MetricsSnapshot};
use crate::optimistic_lock::OptimisticLockManager;
use crate::policy::ConsistencyPolicy;
use crate::registry::EntityRegistry;
use crate::retry::{RetryEnv, RetrySchedule, TokioSleeper, run_with_retry};
use crate::snapshot::{
    ConsistencySnapshot, InMemorySnapshotStore, SnapshotStore, SnapshotValidation, diff_snapshots,
    table_checksum,
};
use crate::transaction::{
    CommitGuard, OperationKind, OperationRecord, TransactionContext, TransactionManager,
    TransactionOptions, UnitFuture,
};
use crate::validation::{validate_events, validate_record};

/// Result of [`ConsistencyEngine::execute_with_consistency`].
#[derive(Debug, Clone)]
pub struct ConsistentResult<T> {
    /// What the operation returned.
    pub value: T,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Events appended at commit.
    pub events: Vec<StoredEvent>,
    /// Row mutations of the committed attempt.
    pub operations: Vec<OperationRecord>,
    /// Non-fatal findings from pre- and post-operation checks.
    pub warnings: Vec<ConsistencyViolation>,
}

/// Repairs made by an auto-fix pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FixOutcome {
    pub fixed: usize,
    pub failed: usize,
}

/// Result of a full consistency audit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyCheckResult {
    pub check_id: Uuid,
    pub checked_at: DateTime<Utc>,
    /// `true` when no violations were found.
    pub is_consistent: bool,
    pub violations: Vec<ConsistencyViolation>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
    /// Violations per type name.
    pub violation_counts: BTreeMap<String, usize>,
    pub execution_time_ms: u64,
    /// Present when auto-fix ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_outcome: Option<FixOutcome>,
}

#[derive(Debug, Default)]
struct AuditFindings {
    violations: Vec<ConsistencyViolation>,
    warnings: Vec<String>,
}

/// Checks run around every guarded unit of work.
struct EngineGuard<'a> {
    integrity: &'a ReferentialIntegrityManager,
    registry: &'a EntityRegistry,
    policy: &'a ConsistencyPolicy,
}

/// The last mutation per entity, in order of first touch.
fn final_operations(operations: &[OperationRecord]) -> Vec<OperationRecord> {
    let mut last: Vec<OperationRecord> = Vec::new();
    for op in operations {
        match last
            .iter_mut()
            .find(|seen| seen.entity_type == op.entity_type && seen.entity_id == op.entity_id)
        {
            Some(slot) => *slot = op.clone(),
            None => last.push(op.clone()),
        }
    }
    last
}

#[async_trait]
impl CommitGuard for EngineGuard<'_> {
    async fn after_begin(&self, ctx: &mut TransactionContext) -> Result<(), DomainError> {
        for warning in isolation_sanity_warnings(self.policy) {
            ctx.warn(warning);
        }
        if let Some(warning) = deadlock_probe(ctx.storage(), self.policy).await? {
            ctx.warn(warning);
        }
        Ok(())
    }

    async fn before_commit(&self, ctx: &mut TransactionContext) -> Result<(), DomainError> {
        let touched = final_operations(ctx.operations());

        let mut violations = validate_events(ctx.raised_events());
        if self.policy.enforce_data_validation {
            for op in touched.iter().filter(|op| op.kind != OperationKind::Delete) {
                let definition = self.registry.require(&op.entity_type)?;
                if definition.rules.is_empty() {
                    continue;
                }
                if let Some(record) = ctx
                    .storage()
                    .fetch_record(&definition.table, op.entity_id)
                    .await?
                {
                    violations.extend(validate_record(definition, &record));
                }
            }
        }
        if !violations.is_empty() {
            return Err(DomainError::InvalidData(violations));
        }

        if self.policy.enforce_referential_integrity {
            let mut violations = Vec::new();
            for op in &touched {
                let operation = match op.kind {
                    OperationKind::Create => EntityOperation::Create,
                    OperationKind::Update => EntityOperation::Update,
                    OperationKind::Delete => EntityOperation::Delete,
                };
                let result = self
                    .integrity
                    .validate_entity(ctx.storage(), &op.entity_type, op.entity_id, operation)
                    .await?;
                violations.extend(result.violations);
            }
            if !violations.is_empty() {
                return Err(DomainError::ReferentialIntegrity(violations));
            }
        }

        Ok(())
    }
}

fn recommendations(counts: &BTreeMap<String, usize>, critical: usize) -> Vec<String> {
    let mut out = Vec::new();
    for violation_type in ViolationType::ALL {
        let Some(&count) = counts.get(violation_type.as_str()) else {
            continue;
        };
        out.push(match violation_type {
            ViolationType::OptimisticLock => format!(
                "Reset {count} corrupt version tokens and find the writer that bypasses version checks"
            ),
            ViolationType::ReferentialIntegrity => format!(
                "Repair {count} broken references and review the orphan policy of each relationship"
            ),
            ViolationType::DataValidation => {
                format!("Correct {count} rows that fail field rules at their source")
            }
            ViolationType::TransactionIsolation => format!(
                "Investigate {count} long-running transactions; they hold locks other writers wait on"
            ),
        });
    }
    if critical > 0 {
        out.push(format!(
            "Address {critical} CRITICAL violations before further writes"
        ));
    }
    out
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Orchestrates consistent writes, audits and snapshots.
pub struct ConsistencyEngine {
    database: Arc<dyn Database>,
    registry: Arc<EntityRegistry>,
    transactions: TransactionManager,
    locks: OptimisticLockManager,
    integrity: ReferentialIntegrityManager,
    snapshots: Arc<dyn SnapshotStore>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    jitter: Arc<dyn JitterSource>,
    metrics: Arc<ConsistencyMetrics>,
    policy: ConsistencyPolicy,
}

/// Builds a [`ConsistencyEngine`].
pub struct ConsistencyEngineBuilder {
    database: Arc<dyn Database>,
    registry: Arc<EntityRegistry>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    jitter: Arc<dyn JitterSource>,
    snapshots: Arc<dyn SnapshotStore>,
    policy: ConsistencyPolicy,
}

impl ConsistencyEngineBuilder {
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    #[must_use]
    pub fn jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    #[must_use]
    pub fn snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = snapshots;
        self
    }

    /// Policy for engine-initiated work: snapshots and auto-fix passes.
    #[must_use]
    pub fn policy(mut self, policy: ConsistencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn build(self) -> ConsistencyEngine {
        let metrics = Arc::new(ConsistencyMetrics::default());
        ConsistencyEngine {
            transactions: TransactionManager::new(
                Arc::clone(&self.database),
                Arc::clone(&self.registry),
                Arc::clone(&self.clock),
                Arc::clone(&self.sleeper),
                Arc::clone(&self.jitter),
                Arc::clone(&metrics),
            ),
            locks: OptimisticLockManager::new(
                Arc::clone(&self.clock),
                Arc::clone(&self.sleeper),
                Arc::clone(&self.jitter),
                Arc::clone(&metrics),
            ),
            integrity: ReferentialIntegrityManager::new(Arc::clone(&self.registry)),
            database: self.database,
            registry: self.registry,
            snapshots: self.snapshots,
            clock: self.clock,
            sleeper: self.sleeper,
            jitter: self.jitter,
            metrics,
            policy: self.policy,
        }
    }
}

impl ConsistencyEngine {
    /// Starts a builder with production defaults: system clock, timer
    /// sleeps, thread-local jitter and an in-memory snapshot store.
    #[must_use]
    pub fn builder(
        database: Arc<dyn Database>,
        registry: Arc<EntityRegistry>,
    ) -> ConsistencyEngineBuilder {
        ConsistencyEngineBuilder {
            database,
            registry,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            jitter: Arc::new(ThreadJitter),
            snapshots: Arc::new(InMemorySnapshotStore::new()),
            policy: ConsistencyPolicy::default(),
        }
    }

    /// The entity registry.
    #[must_use]
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// The transaction manager, for units of work that need no checks.
    #[must_use]
    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Conflict-only retries for callers that manage their own writes.
    #[must_use]
    pub fn optimistic_locks(&self) -> &OptimisticLockManager {
        &self.locks
    }

    /// The referential integrity manager.
    #[must_use]
    pub fn integrity(&self) -> &ReferentialIntegrityManager {
        &self.integrity
    }

    /// Current counter values.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn retry_env(&self) -> RetryEnv<'_> {
        RetryEnv {
            clock: self.clock.as_ref(),
            sleeper: self.sleeper.as_ref(),
            jitter: self.jitter.as_ref(),
        }
    }

    /// Runs `operation` in a transaction at the policy's isolation level.
    ///
    /// Before the operation, isolation sanity and deadlock-risk probes add
    /// warnings. After it, raised events and touched rows are validated and,
    /// when referential integrity is enforced, every touched entity is
    /// checked; any violation rolls the transaction back. Version conflicts
    /// and transient failures re-run the whole operation up to the policy's
    /// attempt budget.
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` or `ReferentialIntegrity` with the violations
    /// (never retried), the last retryable error once attempts are
    /// exhausted, or `Cancelled`/`DeadlineExceeded`.
    pub async fn execute_with_consistency<T, F>(
        &self,
        cx: &OperationContext,
        policy: &ConsistencyPolicy,
        operation: F,
    ) -> Result<ConsistentResult<T>, DomainError>
    where
        T: Send,
        F: for<'a> Fn(&'a mut TransactionContext) -> UnitFuture<'a, T> + Send + Sync,
    {
        let guard = EngineGuard {
            integrity: &self.integrity,
            registry: &self.registry,
            policy,
        };
        let outcome = self
            .transactions
            .execute_guarded(cx, TransactionOptions::from_policy(policy), &guard, operation)
            .await?;
        Ok(ConsistentResult {
            value: outcome.value,
            attempts: outcome.attempts,
            events: outcome.events,
            operations: outcome.operations,
            warnings: outcome.warnings,
        })
    }

    /// Audits the whole database: version tokens, references, field rules
    /// and long-running transactions, in that order.
    ///
    /// Findings are reported in the result; they are never raised as
    /// errors. With `auto_fix_violations` set, fixable violations are
    /// repaired in a separate transaction and the outcome is added as a
    /// warning.
    ///
    /// # Errors
    ///
    /// Returns infrastructure failures, `Cancelled` or `DeadlineExceeded`.
    pub async fn perform_full_consistency_check(
        &self,
        cx: &OperationContext,
        policy: &ConsistencyPolicy,
    ) -> Result<ConsistencyCheckResult, DomainError> {
        let started = Instant::now();
        let check_id = Uuid::now_v7();
        let checked_at = self.clock.now();

        let (findings, _) = run_with_retry(
            cx,
            &RetrySchedule::from_policy(policy),
            self.retry_env(),
            DomainError::is_retryable,
            |attempt, error, _| warn!(attempt, error = %error, "consistency audit failed, retrying"),
            |_| self.audit_once(cx, policy),
        )
        .await?;
        let AuditFindings {
            violations,
            mut warnings,
        } = findings;

        let mut violation_counts: BTreeMap<String, usize> = BTreeMap::new();
        for violation in &violations {
            *violation_counts
                .entry(violation.violation_type.as_str().to_owned())
                .or_default() += 1;
        }
        let critical = violations
            .iter()
            .filter(|v| v.severity == Severity::Critical)
            .count();
        self.metrics.record_violations(violations.len());

        let fix_outcome = if policy.auto_fix_violations {
            let fixable: Vec<&ConsistencyViolation> =
                violations.iter().filter(|v| v.auto_fixable).collect();
            let outcome = self.fix_violations(cx, policy, &fixable).await?;
            warnings.push(format!(
                "auto-fix repaired {} of {} fixable violations ({} failed)",
                outcome.fixed,
                fixable.len(),
                outcome.failed
            ));
            Some(outcome)
        } else {
            None
        };

        let result = ConsistencyCheckResult {
            check_id,
            checked_at,
            is_consistent: violations.is_empty(),
            recommendations: recommendations(&violation_counts, critical),
            violations,
            warnings,
            violation_counts,
            execution_time_ms: elapsed_ms(started),
            fix_outcome,
        };

        info!(
            check_id = %result.check_id,
            violations = result.violations.len(),
            critical,
            is_consistent = result.is_consistent,
            execution_time_ms = result.execution_time_ms,
            "consistency check completed"
        );
        Ok(result)
    }

    async fn audit_once(
        &self,
        cx: &OperationContext,
        policy: &ConsistencyPolicy,
    ) -> Result<AuditFindings, DomainError> {
        let mut tx = self.database.begin(policy.isolation_level).await?;
        let result = cx
            .race(self.clock.as_ref(), self.audit(tx.as_mut(), policy))
            .await;
        if let Err(e) = tx.rollback().await {
            debug!(error = %e, "audit rollback failed");
        }
        result
    }

    async fn audit(
        &self,
        tx: &mut dyn StorageTransaction,
        policy: &ConsistencyPolicy,
    ) -> Result<AuditFindings, DomainError> {
        let mut findings = AuditFindings::default();

        for definition in self.registry.entities() {
            let Some(column) = &definition.version_column else {
                continue;
            };
            for (id, stored) in tx.invalid_versions(&definition.table, column).await? {
                findings.violations.push(
                    ConsistencyViolation::new(
                        ViolationType::OptimisticLock,
                        &definition.entity_type,
                        id,
                        format!(
                            "{} {id} has an invalid version token",
                            definition.entity_type
                        ),
                        Severity::High,
                    )
                    .with_field(column)
                    .with_expected(json!(">= 1"))
                    .with_actual(stored.map_or(Value::Null, Value::from))
                    .fixable(true),
                );
            }
        }

        let integrity = self.integrity.perform_full_integrity_check(tx).await?;
        debug!(
            constraints = integrity.checked_constraints.len(),
            "referential integrity scanned"
        );
        findings.violations.extend(integrity.violations);
        findings.warnings.extend(integrity.warnings);

        for definition in self.registry.entities() {
            if definition.rules.is_empty() {
                continue;
            }
            for record in tx.list_records(&definition.table).await? {
                findings
                    .violations
                    .extend(validate_record(definition, &record));
            }
        }

        findings
            .violations
            .extend(long_transaction_audit(tx, policy).await?);

        Ok(findings)
    }

    /// Repairs the given violations in one transaction.
    ///
    /// Version tokens are reset to 1; references follow their relationship's
    /// orphan policy. A failed commit counts every repair as failed.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` or `DeadlineExceeded`; repair failures are counted,
    /// not raised.
    pub async fn fix_violations(
        &self,
        cx: &OperationContext,
        policy: &ConsistencyPolicy,
        violations: &[&ConsistencyViolation],
    ) -> Result<FixOutcome, DomainError> {
        if violations.is_empty() {
            return Ok(FixOutcome::default());
        }
        let mut tx = match self.database.begin(policy.isolation_level).await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(error = %e, "auto-fix could not open a transaction");
                self.metrics.record_fixes(0, violations.len());
                return Ok(FixOutcome {
                    fixed: 0,
                    failed: violations.len(),
                });
            }
        };

        let repairs = cx
            .race(self.clock.as_ref(), async {
                let mut outcome = FixOutcome::default();
                for violation in violations {
                    match self.fix_violation(tx.as_mut(), violation).await {
                        Ok(true) => outcome.fixed += 1,
                        Ok(false) => outcome.failed += 1,
                        Err(e) => {
                            warn!(
                                entity_type = %violation.entity_type,
                                entity_id = %violation.entity_id,
                                error = %e,
                                "auto-fix failed"
                            );
                            outcome.failed += 1;
                        }
                    }
                }
                Ok(outcome)
            })
            .await;

        let mut outcome = match repairs {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(rollback_error) = tx.rollback().await {
                    debug!(error = %rollback_error, "auto-fix rollback failed");
                }
                return Err(e);
            }
        };
        if let Err(e) = tx.commit().await {
            warn!(error = %e, "auto-fix commit failed");
            outcome = FixOutcome {
                fixed: 0,
                failed: violations.len(),
            };
        }
        self.metrics.record_fixes(outcome.fixed, outcome.failed);
        info!(fixed = outcome.fixed, failed = outcome.failed, "auto-fix applied");
        Ok(outcome)
    }

    async fn fix_violation(
        &self,
        tx: &mut dyn StorageTransaction,
        violation: &ConsistencyViolation,
    ) -> Result<bool, DomainError> {
        match violation.violation_type {
            ViolationType::OptimisticLock => {
                let definition = self.registry.require(&violation.entity_type)?;
                let Some(column) = &definition.version_column else {
                    return Ok(false);
                };
                let mut fields = Map::new();
                fields.insert(column.clone(), Value::from(1));
                tx.update_fields(&definition.table, violation.entity_id, &fields)
                    .await
            }
            ViolationType::ReferentialIntegrity => {
                self.integrity.fix_violation(tx, violation).await
            }
            ViolationType::DataValidation | ViolationType::TransactionIsolation => Ok(false),
        }
    }

    /// Takes a snapshot of every tracked table inside one repeatable-read
    /// transaction and retains it.
    ///
    /// # Errors
    ///
    /// Returns infrastructure failures, `Cancelled` or `DeadlineExceeded`.
    pub async fn create_consistency_snapshot(
        &self,
        cx: &OperationContext,
    ) -> Result<ConsistencySnapshot, DomainError> {
        let snapshot = self.take_snapshot(cx).await?;
        self.snapshots.save(snapshot.clone()).await?;
        info!(
            snapshot_id = %snapshot.snapshot_id,
            entity_types = snapshot.entity_counts.len(),
            "consistency snapshot created"
        );
        Ok(snapshot)
    }

    /// Compares the database against a retained snapshot.
    ///
    /// # Errors
    ///
    /// Returns `SnapshotNotFound` for an unknown id, or the failures of
    /// [`create_consistency_snapshot`](Self::create_consistency_snapshot).
    pub async fn validate_against_snapshot(
        &self,
        cx: &OperationContext,
        snapshot_id: Uuid,
    ) -> Result<SnapshotValidation, DomainError> {
        let baseline = self
            .snapshots
            .get(snapshot_id)
            .await?
            .ok_or(DomainError::SnapshotNotFound(snapshot_id))?;
        let current = self.take_snapshot(cx).await?;
        let drift = diff_snapshots(&baseline, &current);
        if !drift.is_empty() {
            warn!(
                baseline_id = %snapshot_id,
                drifted = drift.len(),
                "database drifted from snapshot"
            );
        }
        Ok(SnapshotValidation {
            baseline_id: snapshot_id,
            is_unchanged: drift.is_empty(),
            current,
            drift,
        })
    }

    /// Validates against `baseline_id`, then retains the fresh snapshot as
    /// the next baseline and drops the old one. One snapshot is taken, so
    /// no write can land between the comparison and the new baseline.
    ///
    /// # Errors
    ///
    /// As [`validate_against_snapshot`](Self::validate_against_snapshot).
    pub async fn advance_snapshot(
        &self,
        cx: &OperationContext,
        baseline_id: Uuid,
    ) -> Result<SnapshotValidation, DomainError> {
        let validation = self.validate_against_snapshot(cx, baseline_id).await?;
        self.snapshots.save(validation.current.clone()).await?;
        self.snapshots.remove(baseline_id).await?;
        debug!(
            baseline_id = %baseline_id,
            snapshot_id = %validation.current.snapshot_id,
            "snapshot baseline advanced"
        );
        Ok(validation)
    }

    /// Drops a retained snapshot. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns the snapshot store's failure.
    pub async fn discard_snapshot(&self, snapshot_id: Uuid) -> Result<bool, DomainError> {
        self.snapshots.remove(snapshot_id).await
    }

    async fn take_snapshot(&self, cx: &OperationContext) -> Result<ConsistencySnapshot, DomainError> {
        let (snapshot, _) = run_with_retry(
            cx,
            &RetrySchedule::from_policy(&self.policy),
            self.retry_env(),
            DomainError::is_retryable,
            |attempt, error, _| warn!(attempt, error = %error, "snapshot failed, retrying"),
            |_| self.snapshot_once(cx),
        )
        .await?;
        Ok(snapshot)
    }

    async fn snapshot_once(&self, cx: &OperationContext) -> Result<ConsistencySnapshot, DomainError> {
        let mut tx = self.database.begin(IsolationLevel::RepeatableRead).await?;
        let result = cx
            .race(self.clock.as_ref(), async {
                let mut snapshot = ConsistencySnapshot {
                    snapshot_id: Uuid::now_v7(),
                    timestamp: self.clock.now(),
                    entity_counts: BTreeMap::new(),
                    checksums: BTreeMap::new(),
                };
                for definition in self.registry.entities() {
                    let rows = tx.list_records(&definition.table).await?;
                    snapshot
                        .entity_counts
                        .insert(definition.entity_type.clone(), rows.len() as u64);
                    snapshot
                        .checksums
                        .insert(definition.entity_type.clone(), table_checksum(&rows)?);
                }
                Ok(snapshot)
            })
            .await;
        if let Err(e) = tx.rollback().await {
            debug!(error = %e, "snapshot rollback failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tasklane_core::event_log::{EventLog, PendingEvent};
    use tasklane_core::storage::Record;
    use tasklane_core::version::VersionToken;
    use tasklane_test_support::{FailingDatabase, InMemoryDatabase, NoJitter, RecordingSleeper};

    use super::*;
    use crate::registry::{EntityDefinition, FieldRule, OrphanPolicy, ReferenceRule};

    struct Harness {
        db: Arc<InMemoryDatabase>,
        sleeper: Arc<RecordingSleeper>,
        engine: ConsistencyEngine,
    }

    fn registry() -> Arc<EntityRegistry> {
        Arc::new(
            EntityRegistry::builder()
                .entity(
                    EntityDefinition::new("projects", "projects")
                        .versioned("version")
                        .rule(FieldRule::required("name")),
                )
                .entity(
                    EntityDefinition::new("tasks", "tasks")
                        .versioned("version")
                        .reference(
                            ReferenceRule::new("project_id", "projects")
                                .nullable()
                                .on_orphan(OrphanPolicy::SetNull),
                        )
                        .rule(FieldRule::required("title"))
                        .rule(FieldRule::range("priority", Some(0.0), Some(4.0))),
                )
                .build()
                .unwrap(),
        )
    }

    fn harness() -> Harness {
        let db = Arc::new(InMemoryDatabase::new());
        let sleeper = Arc::new(RecordingSleeper::new());
        let engine = ConsistencyEngine::builder(db.clone(), registry())
            .sleeper(sleeper.clone())
            .jitter(Arc::new(NoJitter))
            .build();
        Harness { db, sleeper, engine }
    }

    fn policy() -> ConsistencyPolicy {
        ConsistencyPolicy::default().with_retry_delay(Duration::from_millis(10))
    }

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }

    fn seed(db: &InMemoryDatabase, table: &str, id: Uuid, value: Value) {
        db.seed(table, Record::new(id, fields(value)));
    }

    fn seeded() -> (Harness, Uuid, Uuid) {
        let h = harness();
        let project = Uuid::new_v4();
        let task = Uuid::new_v4();
        seed(&h.db, "projects", project, json!({ "name": "Launch", "version": 1 }));
        seed(
            &h.db,
            "tasks",
            task,
            json!({ "title": "Write copy", "priority": 1, "project_id": project.to_string(), "version": 1 }),
        );
        (h, project, task)
    }

    fn event(event_type: &str) -> PendingEvent {
        PendingEvent {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload: json!({}),
            correlation_id: None,
            causation_id: None,
            user_id: None,
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_clean_database_is_consistent() {
        // Arrange
        let (h, _, _) = seeded();

        // Act
        let result = h
            .engine
            .perform_full_consistency_check(&OperationContext::background(), &policy())
            .await
            .unwrap();

        // Assert
        assert!(result.is_consistent);
        assert!(result.violations.is_empty());
        assert!(result.recommendations.is_empty());
        assert!(result.fix_outcome.is_none());
    }

    #[tokio::test]
    async fn test_one_orphan_yields_exactly_one_referential_violation() {
        // Arrange
        let (h, project, task) = seeded();
        h.db.remove("projects", project);

        // Act
        let result = h
            .engine
            .perform_full_consistency_check(&OperationContext::background(), &policy())
            .await
            .unwrap();

        // Assert
        assert!(!result.is_consistent);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(
            result.violations[0].violation_type,
            ViolationType::ReferentialIntegrity
        );
        assert_eq!(result.violations[0].entity_id, task);
        assert_eq!(result.violation_counts.get("REFERENTIAL_INTEGRITY"), Some(&1));
        assert_eq!(result.recommendations.len(), 1);
        assert_eq!(h.engine.metrics().violations_found, 1);
    }

    #[tokio::test]
    async fn test_audit_accumulates_every_violation_type() {
        // Arrange
        let (h, project, task) = seeded();
        h.db.set_field("projects", project, "version", json!(0));
        h.db.set_field("tasks", task, "priority", json!(9));
        let stray = Uuid::new_v4();
        seed(
            &h.db,
            "tasks",
            stray,
            json!({ "title": "Stray", "project_id": "p-1", "version": 1 }),
        );

        // Act
        let result = h
            .engine
            .perform_full_consistency_check(&OperationContext::background(), &policy())
            .await
            .unwrap();

        // Assert
        assert_eq!(result.violation_counts.get("OPTIMISTIC_LOCK"), Some(&1));
        assert_eq!(result.violation_counts.get("REFERENTIAL_INTEGRITY"), Some(&1));
        assert_eq!(result.violation_counts.get("DATA_VALIDATION"), Some(&1));
        assert!(result
            .recommendations
            .iter()
            .any(|r| r.contains("CRITICAL")));
    }

    #[tokio::test]
    async fn test_auto_fix_repairs_fixable_violations_and_reports_it() {
        // Arrange
        let (h, project, task) = seeded();
        let other = Uuid::new_v4();
        seed(&h.db, "projects", other, json!({ "name": "Other", "version": -3 }));
        h.db.remove("projects", project);
        let policy = policy().with_auto_fix(true);

        // Act
        let result = h
            .engine
            .perform_full_consistency_check(&OperationContext::background(), &policy)
            .await
            .unwrap();

        // Assert
        assert_eq!(result.fix_outcome, Some(FixOutcome { fixed: 2, failed: 0 }));
        assert!(result.warnings.iter().any(|w| w.starts_with("auto-fix")));
        assert_eq!(h.db.record("projects", other).unwrap().get_i64("version"), Some(1));
        assert_eq!(
            h.db.record("tasks", task).unwrap().get("project_id"),
            Some(&Value::Null)
        );
        let again = h
            .engine
            .perform_full_consistency_check(&OperationContext::background(), &policy)
            .await
            .unwrap();
        assert!(again.is_consistent);
        assert_eq!(h.engine.metrics().auto_fixes_applied, 2);
    }

    #[tokio::test]
    async fn test_audit_surfaces_infrastructure_failures() {
        let engine = ConsistencyEngine::builder(Arc::new(FailingDatabase), registry())
            .sleeper(Arc::new(RecordingSleeper::new()))
            .build();

        let result = engine
            .perform_full_consistency_check(&OperationContext::background(), &policy())
            .await;

        match result {
            Err(DomainError::Infrastructure(_)) => {}
            other => panic!("expected Infrastructure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_snapshots_without_writes_are_identical() {
        let (h, _, _) = seeded();
        let cx = OperationContext::background();

        let first = h.engine.create_consistency_snapshot(&cx).await.unwrap();
        let second = h.engine.create_consistency_snapshot(&cx).await.unwrap();

        assert_ne!(first.snapshot_id, second.snapshot_id);
        assert_eq!(first.entity_counts, second.entity_counts);
        assert_eq!(first.checksums, second.checksums);
    }

    #[tokio::test]
    async fn test_one_insert_drifts_only_its_entity_type() {
        // Arrange
        let (h, _, _) = seeded();
        let cx = OperationContext::background();
        let baseline = h.engine.create_consistency_snapshot(&cx).await.unwrap();
        seed(&h.db, "tasks", Uuid::new_v4(), json!({ "title": "New", "version": 1 }));

        // Act
        let validation = h
            .engine
            .validate_against_snapshot(&cx, baseline.snapshot_id)
            .await
            .unwrap();

        // Assert
        assert!(!validation.is_unchanged);
        assert_eq!(validation.drift.len(), 1);
        assert_eq!(validation.drift[0].entity_type, "tasks");
        assert_eq!(validation.drift[0].baseline_count, Some(1));
        assert_eq!(validation.drift[0].current_count, Some(2));
        assert_eq!(
            validation.current.checksums.get("projects"),
            baseline.checksums.get("projects")
        );
    }

    #[tokio::test]
    async fn test_advancing_replaces_the_baseline() {
        // Arrange
        let (h, _, _) = seeded();
        let cx = OperationContext::background();
        let baseline = h.engine.create_consistency_snapshot(&cx).await.unwrap();
        seed(&h.db, "tasks", Uuid::new_v4(), json!({ "title": "New", "version": 1 }));

        // Act
        let first = h
            .engine
            .advance_snapshot(&cx, baseline.snapshot_id)
            .await
            .unwrap();
        let second = h
            .engine
            .advance_snapshot(&cx, first.current.snapshot_id)
            .await
            .unwrap();

        // Assert
        assert_eq!(first.drift.len(), 1);
        assert!(second.is_unchanged);
        match h
            .engine
            .validate_against_snapshot(&cx, baseline.snapshot_id)
            .await
        {
            Err(DomainError::SnapshotNotFound(id)) => assert_eq!(id, baseline.snapshot_id),
            other => panic!("expected SnapshotNotFound, got {other:?}"),
        }
        assert!(h.engine.discard_snapshot(second.current.snapshot_id).await.unwrap());
        assert!(!h.engine.discard_snapshot(first.current.snapshot_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_snapshot_is_not_found() {
        let h = harness();
        let missing = Uuid::new_v4();

        let result = h
            .engine
            .validate_against_snapshot(&OperationContext::background(), missing)
            .await;

        match result {
            Err(DomainError::SnapshotNotFound(id)) => assert_eq!(id, missing),
            other => panic!("expected SnapshotNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_operation_commits_rows_and_events() {
        // Arrange
        let h = harness();
        let project = Uuid::new_v4();

        // Act
        let result = h
            .engine
            .execute_with_consistency(&OperationContext::background(), &policy(), move |ctx| {
                Box::pin(async move {
                    ctx.create("projects", project, fields(json!({ "name": "Launch" })))
                        .await?;
                    ctx.raise_event(project, event("tasks.project_created"));
                    Ok(project)
                })
            })
            .await
            .unwrap();

        // Assert
        assert_eq!(result.value, project);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.operations[0].kind, OperationKind::Create);
        assert!(h.db.record("projects", project).is_some());
        assert_eq!(
            h.db.event_log().get_events(project, None).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_until_the_nth_attempt_succeeds() {
        // Arrange
        let (h, _, task) = seeded();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        // Act
        let result = h
            .engine
            .execute_with_consistency(&OperationContext::background(), &policy(), move |ctx| {
                let counter = Arc::clone(&counter);
                Box::pin(async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(DomainError::ConcurrencyConflict {
                            entity_type: "tasks".into(),
                            aggregate_id: task,
                            expected: 1,
                            actual: 2,
                        });
                    }
                    ctx.update("tasks", task, VersionToken::INITIAL, fields(json!({ "priority": 2 })))
                        .await
                })
            })
            .await
            .unwrap();

        // Assert
        assert_eq!(result.attempts, 3);
        assert_eq!(result.value.map(VersionToken::get), Some(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(
            h.sleeper.delays(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
        assert_eq!(h.engine.metrics().conflicts, 2);
    }

    #[tokio::test]
    async fn test_conflict_surfaces_after_exactly_the_attempt_budget() {
        let (h, _, task) = seeded();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result = h
            .engine
            .execute_with_consistency(&OperationContext::background(), &policy(), move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    Err::<(), _>(DomainError::ConcurrencyConflict {
                        entity_type: "tasks".into(),
                        aggregate_id: task,
                        expected: 1,
                        actual: 2,
                    })
                })
            })
            .await;

        assert!(matches!(result, Err(DomainError::ConcurrencyConflict { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dangling_reference_aborts_without_retry() {
        // Arrange
        let h = harness();
        let task = Uuid::new_v4();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        // Act
        let result = h
            .engine
            .execute_with_consistency(&OperationContext::background(), &policy(), move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    let row = fields(json!({
                        "title": "Orphan",
                        "project_id": Uuid::new_v4().to_string(),
                    }));
                    ctx.create("tasks", task, row).await?;
                    Ok(())
                })
            })
            .await;

        // Assert
        match result {
            Err(DomainError::ReferentialIntegrity(violations)) => {
                assert_eq!(violations.len(), 1);
                assert_eq!(violations[0].entity_id, task);
            }
            other => panic!("expected ReferentialIntegrity, got {other:?}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(h.db.record("tasks", task).is_none());
    }

    #[tokio::test]
    async fn test_integrity_enforcement_can_be_disabled() {
        let h = harness();
        let task = Uuid::new_v4();

        let result = h
            .engine
            .execute_with_consistency(
                &OperationContext::background(),
                &policy().with_referential_integrity(false),
                move |ctx| {
                    Box::pin(async move {
                        let row = fields(json!({
                            "title": "Orphan",
                            "project_id": Uuid::new_v4().to_string(),
                        }));
                        ctx.create("tasks", task, row).await?;
                        Ok(())
                    })
                },
            )
            .await;

        assert!(result.is_ok());
        assert!(h.db.record("tasks", task).is_some());
    }

    #[tokio::test]
    async fn test_deleting_a_referenced_parent_is_rejected() {
        let (h, project, _) = seeded();

        let result = h
            .engine
            .execute_with_consistency(&OperationContext::background(), &policy(), move |ctx| {
                Box::pin(async move { ctx.delete("projects", project, VersionToken::INITIAL).await })
            })
            .await;

        assert!(matches!(result, Err(DomainError::ReferentialIntegrity(_))));
        assert!(h.db.record("projects", project).is_some());
    }

    #[tokio::test]
    async fn test_invalid_rows_and_events_are_rejected_before_commit() {
        // Arrange
        let h = harness();
        let project = Uuid::new_v4();

        // Act
        let result = h
            .engine
            .execute_with_consistency(&OperationContext::background(), &policy(), move |ctx| {
                Box::pin(async move {
                    ctx.create("projects", project, fields(json!({ "name": "" })))
                        .await?;
                    ctx.raise_event(project, event(""));
                    Ok(())
                })
            })
            .await;

        // Assert
        match result {
            Err(DomainError::InvalidData(violations)) => {
                assert_eq!(violations.len(), 2);
                assert!(violations
                    .iter()
                    .all(|v| v.violation_type == ViolationType::DataValidation));
            }
            other => panic!("expected InvalidData, got {other:?}"),
        }
        assert_eq!(h.db.count("projects"), 0);
        assert!(h.db.event_log().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_events_are_rejected_with_data_validation_off() {
        let h = harness();
        let project = Uuid::new_v4();

        let result = h
            .engine
            .execute_with_consistency(
                &OperationContext::background(),
                &policy().with_data_validation(false),
                move |ctx| {
                    Box::pin(async move {
                        ctx.create("projects", project, fields(json!({ "name": "" })))
                            .await?;
                        ctx.raise_event(project, event(""));
                        Ok(())
                    })
                },
            )
            .await;

        match result {
            Err(DomainError::InvalidData(violations)) => {
                assert_eq!(violations.len(), 1);
                assert_eq!(violations[0].field.as_deref(), Some("event_type"));
            }
            other => panic!("expected InvalidData, got {other:?}"),
        }
        assert_eq!(h.db.count("projects"), 0);
        assert!(h.db.event_log().is_empty());
    }

    #[tokio::test]
    async fn test_pre_operation_probes_add_warnings() {
        let h = harness();
        h.db.set_blocked_waiters(10);
        let policy = policy().with_isolation_level(IsolationLevel::ReadUncommitted);

        let result = h
            .engine
            .execute_with_consistency(&OperationContext::background(), &policy, |_ctx| {
                Box::pin(async { Ok(()) })
            })
            .await
            .unwrap();

        assert_eq!(result.warnings.len(), 2);
        assert!(result
            .warnings
            .iter()
            .all(|w| w.violation_type == ViolationType::TransactionIsolation));
    }
}
