//! Transaction manager.
//!
//! Opens a storage transaction at the requested isolation level, runs a
//! unit of work against a [`TransactionContext`], appends the events the
//! unit raised and commits. Any error rolls back. Retryable errors re-run
//! the whole attempt from a fresh transaction.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tasklane_core::clock::Clock;
use tasklane_core::context::OperationContext;
use tasklane_core::error::DomainError;
use tasklane_core::event::DomainEvent;
use tasklane_core::event_log::{ExpectedVersion, PendingEvent, StoredEvent};
use tasklane_core::rng::JitterSource;
use tasklane_core::sleep::Sleeper;
use tasklane_core::storage::{Database, IsolationLevel, Record, StorageTransaction};
use tasklane_core::version::VersionToken;
use tasklane_core::violation::ConsistencyViolation;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics::ConsistencyMetrics;
use crate::optimistic_lock::compare_and_increment;
use crate::policy::ConsistencyPolicy;
use crate::registry::EntityRegistry;
use crate::retry::{RetryEnv, RetrySchedule, run_with_retry};

/// Boxed future returned by a unit of work.
pub type UnitFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DomainError>> + Send + 'a>>;

/// What a unit of work did to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    /// Row inserted.
    Create,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

/// One row mutation performed inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    /// Kind of mutation.
    pub kind: OperationKind,
    /// Entity type of the row.
    pub entity_type: String,
    /// Row id.
    pub entity_id: Uuid,
    /// Version token after the mutation, for versioned entities.
    pub version: Option<i64>,
}

/// An event raised during a unit of work, appended at commit.
#[derive(Debug, Clone, PartialEq)]
pub struct RaisedEvent {
    /// Stream the event belongs to.
    pub stream_id: Uuid,
    /// The event.
    pub event: PendingEvent,
}

/// The handle a unit of work uses to read and write.
pub struct TransactionContext {
    tx: Box<dyn StorageTransaction>,
    registry: Arc<EntityRegistry>,
    clock: Arc<dyn Clock>,
    enforce_versions: bool,
    attempt: u32,
    operations: Vec<OperationRecord>,
    events: Vec<RaisedEvent>,
    warnings: Vec<ConsistencyViolation>,
}

impl TransactionContext {
    fn new(
        tx: Box<dyn StorageTransaction>,
        registry: Arc<EntityRegistry>,
        clock: Arc<dyn Clock>,
        enforce_versions: bool,
        attempt: u32,
    ) -> Self {
        Self {
            tx,
            registry,
            clock,
            enforce_versions,
            attempt,
            operations: Vec::new(),
            events: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Inserts a row of a registered entity type. Versioned entities start
    /// at version 1 unless `fields` sets the version column.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for unknown entity types or the storage error.
    pub async fn create(
        &mut self,
        entity_type: &str,
        id: Uuid,
        mut fields: Map<String, Value>,
    ) -> Result<Record, DomainError> {
        let definition = self.registry.require(entity_type)?;
        let table = definition.table.clone();
        let mut version = None;
        if let Some(column) = &definition.version_column {
            let token = fields
                .entry(column.clone())
                .or_insert_with(|| Value::from(VersionToken::INITIAL.get()));
            version = token.as_i64();
        }
        let record = Record::new(id, fields);
        self.tx.insert_record(&table, &record).await?;
        self.record_operation(OperationKind::Create, entity_type, id, version);
        Ok(record)
    }

    /// Reads a row of a registered entity type.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for unknown entity types or the storage error.
    pub async fn fetch(&mut self, entity_type: &str, id: Uuid) -> Result<Option<Record>, DomainError> {
        let table = self.registry.require(entity_type)?.table.clone();
        self.tx.fetch_record(&table, id).await
    }

    /// Reads a row that must exist.
    ///
    /// # Errors
    ///
    /// Returns `AggregateNotFound` when the row is missing.
    pub async fn get(&mut self, entity_type: &str, id: Uuid) -> Result<Record, DomainError> {
        self.fetch(entity_type, id)
            .await?
            .ok_or(DomainError::AggregateNotFound(id))
    }

    /// Overwrites fields of a row the caller read at `expected`.
    ///
    /// For versioned entities the stored token is compared and incremented
    /// first; the returned token is the new one. When version enforcement
    /// is off the token is incremented from whatever is stored.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrencyConflict` on a stale token, `AggregateNotFound`
    /// for a missing row, or the storage error.
    pub async fn update(
        &mut self,
        entity_type: &str,
        id: Uuid,
        expected: VersionToken,
        mut fields: Map<String, Value>,
    ) -> Result<Option<VersionToken>, DomainError> {
        let definition = self.registry.require(entity_type)?;
        let table = definition.table.clone();
        let version_column = definition.version_column.clone();

        let version = match &version_column {
            Some(column) => {
                fields.remove(column);
                let guard = self.guard_token(entity_type, &table, column, id, expected).await?;
                Some(compare_and_increment(self.tx.as_mut(), entity_type, &table, column, id, guard).await?)
            }
            None => None,
        };

        fields.remove("id");
        if !fields.is_empty() && !self.tx.update_fields(&table, id, &fields).await? {
            return Err(DomainError::AggregateNotFound(id));
        }
        self.record_operation(
            OperationKind::Update,
            entity_type,
            id,
            version.map(VersionToken::get),
        );
        Ok(version)
    }

    /// Deletes a row the caller read at `expected`.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrencyConflict` on a stale token, `AggregateNotFound`
    /// for a missing row, or the storage error.
    pub async fn delete(
        &mut self,
        entity_type: &str,
        id: Uuid,
        expected: VersionToken,
    ) -> Result<(), DomainError> {
        let definition = self.registry.require(entity_type)?;
        let table = definition.table.clone();
        if let Some(column) = definition.version_column.clone() {
            let guard = self.guard_token(entity_type, &table, &column, id, expected).await?;
            compare_and_increment(self.tx.as_mut(), entity_type, &table, &column, id, guard).await?;
        }
        if !self.tx.delete_record(&table, id).await? {
            return Err(DomainError::AggregateNotFound(id));
        }
        self.record_operation(OperationKind::Delete, entity_type, id, None);
        Ok(())
    }

    /// The token to compare against: the caller's when enforcement is on,
    /// otherwise the stored one.
    async fn guard_token(
        &mut self,
        entity_type: &str,
        table: &str,
        column: &str,
        id: Uuid,
        expected: VersionToken,
    ) -> Result<VersionToken, DomainError> {
        if self.enforce_versions {
            return Ok(expected);
        }
        let record = self
            .tx
            .fetch_record(table, id)
            .await?
            .ok_or(DomainError::AggregateNotFound(id))?;
        match record.get_i64(column) {
            Some(stored) if stored >= 1 => VersionToken::new(stored),
            stored => Err(DomainError::InvalidData(vec![
                tasklane_core::version::invalid_token_violation(entity_type, id, stored),
            ])),
        }
    }

    fn record_operation(
        &mut self,
        kind: OperationKind,
        entity_type: &str,
        entity_id: Uuid,
        version: Option<i64>,
    ) {
        self.operations.push(OperationRecord {
            kind,
            entity_type: entity_type.to_owned(),
            entity_id,
            version,
        });
    }

    /// Queues an event for append at commit.
    pub fn raise_event(&mut self, stream_id: Uuid, event: PendingEvent) {
        self.events.push(RaisedEvent { stream_id, event });
    }

    /// Queues a typed domain event on its own stream.
    pub fn raise(&mut self, event: &dyn DomainEvent) {
        self.raise_event(event.metadata().stream_id, event.to_pending());
    }

    /// Records a non-fatal finding returned with the result.
    pub fn warn(&mut self, violation: ConsistencyViolation) {
        warn!(
            violation_type = %violation.violation_type,
            entity_type = %violation.entity_type,
            message = %violation.message,
            "consistency warning"
        );
        self.warnings.push(violation);
    }

    /// Raw access to the underlying transaction.
    pub fn storage(&mut self) -> &mut dyn StorageTransaction {
        self.tx.as_mut()
    }

    /// The entity registry.
    #[must_use]
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Mutations performed so far.
    #[must_use]
    pub fn operations(&self) -> &[OperationRecord] {
        &self.operations
    }

    /// Events raised so far, in raise order.
    #[must_use]
    pub fn raised_events(&self) -> &[RaisedEvent] {
        &self.events
    }

    /// Warnings recorded so far.
    #[must_use]
    pub fn warnings(&self) -> &[ConsistencyViolation] {
        &self.warnings
    }

    /// 1-based attempt number.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The isolation level of the open transaction.
    #[must_use]
    pub fn isolation_level(&self) -> IsolationLevel {
        self.tx.isolation_level()
    }

    /// Current time from the engine clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Appends raised events, one batch per stream in order of first raise.
    async fn flush_events(&mut self) -> Result<Vec<StoredEvent>, DomainError> {
        let mut batches: Vec<(Uuid, Vec<PendingEvent>)> = Vec::new();
        for raised in std::mem::take(&mut self.events) {
            match batches.iter_mut().find(|(stream, _)| *stream == raised.stream_id) {
                Some((_, batch)) => batch.push(raised.event),
                None => batches.push((raised.stream_id, vec![raised.event])),
            }
        }

        let mut stored = Vec::new();
        for (stream_id, batch) in batches {
            stored.extend(
                self.tx
                    .append_events(stream_id, ExpectedVersion::Any, &batch)
                    .await?,
            );
        }
        Ok(stored)
    }
}

/// Checks run inside the transaction around the unit of work.
#[async_trait]
pub trait CommitGuard: Send + Sync {
    /// Runs right after the transaction opens.
    async fn after_begin(&self, _ctx: &mut TransactionContext) -> Result<(), DomainError> {
        Ok(())
    }

    /// Runs after the unit of work and before events are appended. An
    /// error rolls the transaction back.
    async fn before_commit(&self, _ctx: &mut TransactionContext) -> Result<(), DomainError> {
        Ok(())
    }
}

/// A guard that checks nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGuard;

impl CommitGuard for NoGuard {}

/// Per-call transaction settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Isolation level.
    pub isolation_level: IsolationLevel,
    /// Attempts and backoff.
    pub schedule: RetrySchedule,
    /// Compare caller tokens on update and delete.
    pub enforce_versions: bool,
    /// Retry version conflicts as well as transient failures.
    pub retry_conflicts: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self::from_policy(&ConsistencyPolicy::default())
    }
}

impl TransactionOptions {
    /// Options derived from a policy.
    #[must_use]
    pub fn from_policy(policy: &ConsistencyPolicy) -> Self {
        Self {
            isolation_level: policy.isolation_level,
            schedule: RetrySchedule::from_policy(policy),
            enforce_versions: policy.enforce_optimistic_locking,
            retry_conflicts: policy.retry_conflicts,
        }
    }
}

/// Result of a committed transaction.
#[derive(Debug, Clone)]
pub struct TransactionOutcome<T> {
    /// What the unit of work returned.
    pub value: T,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Mutations of the successful attempt.
    pub operations: Vec<OperationRecord>,
    /// Events appended by the successful attempt.
    pub events: Vec<StoredEvent>,
    /// Warnings of the successful attempt.
    pub warnings: Vec<ConsistencyViolation>,
}

/// Runs units of work in retried transactions.
pub struct TransactionManager {
    database: Arc<dyn Database>,
    registry: Arc<EntityRegistry>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    jitter: Arc<dyn JitterSource>,
    metrics: Arc<ConsistencyMetrics>,
}

impl TransactionManager {
    /// Creates a manager.
    #[must_use]
    pub fn new(
        database: Arc<dyn Database>,
        registry: Arc<EntityRegistry>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        jitter: Arc<dyn JitterSource>,
        metrics: Arc<ConsistencyMetrics>,
    ) -> Self {
        Self {
            database,
            registry,
            clock,
            sleeper,
            jitter,
            metrics,
        }
    }

    /// Runs `unit` in a transaction with no extra checks.
    ///
    /// # Errors
    ///
    /// See [`TransactionManager::execute_guarded`].
    pub async fn execute_transaction<T, F>(
        &self,
        cx: &OperationContext,
        options: TransactionOptions,
        unit: F,
    ) -> Result<TransactionOutcome<T>, DomainError>
    where
        T: Send,
        F: for<'a> Fn(&'a mut TransactionContext) -> UnitFuture<'a, T> + Send + Sync,
    {
        self.execute_guarded(cx, options, &NoGuard, unit).await
    }

    /// Runs `unit` in a transaction, with `guard` checks before and after
    /// it, retrying retryable failures from a fresh transaction.
    ///
    /// # Errors
    ///
    /// Returns the last retryable error once attempts are exhausted, the
    /// first non-retryable error, or `Cancelled`/`DeadlineExceeded`.
    pub async fn execute_guarded<T, F>(
        &self,
        cx: &OperationContext,
        options: TransactionOptions,
        guard: &dyn CommitGuard,
        unit: F,
    ) -> Result<TransactionOutcome<T>, DomainError>
    where
        T: Send,
        F: for<'a> Fn(&'a mut TransactionContext) -> UnitFuture<'a, T> + Send + Sync,
    {
        let env = RetryEnv {
            clock: self.clock.as_ref(),
            sleeper: self.sleeper.as_ref(),
            jitter: self.jitter.as_ref(),
        };
        let unit = &unit;
        let options = &options;
        let (mut outcome, attempts) = run_with_retry(
            cx,
            &options.schedule,
            env,
            |error| error.is_retryable() && (options.retry_conflicts || !error.is_conflict()),
            |attempt, error, delay| {
                self.metrics.record_retry(error.is_conflict());
                warn!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "transaction attempt failed, retrying"
                );
            },
            move |attempt| self.run_attempt(cx, options, guard, unit, attempt),
        )
        .await?;
        outcome.attempts = attempts;
        Ok(outcome)
    }

    async fn run_attempt<T, F>(
        &self,
        cx: &OperationContext,
        options: &TransactionOptions,
        guard: &dyn CommitGuard,
        unit: &F,
        attempt: u32,
    ) -> Result<TransactionOutcome<T>, DomainError>
    where
        T: Send,
        F: for<'a> Fn(&'a mut TransactionContext) -> UnitFuture<'a, T> + Send + Sync,
    {
        let started = Instant::now();
        let tx = self.database.begin(options.isolation_level).await?;
        let mut ctx = TransactionContext::new(
            tx,
            Arc::clone(&self.registry),
            Arc::clone(&self.clock),
            options.enforce_versions,
            attempt,
        );

        let result = cx
            .race(self.clock.as_ref(), run_unit(&mut ctx, guard, unit))
            .await;

        let (value, events) = match result {
            Ok(done) => done,
            Err(e) => {
                if let Err(rollback_error) = ctx.tx.rollback().await {
                    warn!(error = %rollback_error, "rollback failed");
                }
                self.metrics.record_rollback();
                debug!(attempt, error = %e, "transaction rolled back");
                return Err(e);
            }
        };

        if let Err(e) = ctx.tx.commit().await {
            self.metrics.record_rollback();
            return Err(e);
        }
        self.metrics.record_commit();
        debug!(
            attempt,
            operations = ctx.operations.len(),
            events = events.len(),
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "transaction committed"
        );

        Ok(TransactionOutcome {
            value,
            attempts: attempt,
            operations: ctx.operations,
            events,
            warnings: ctx.warnings,
        })
    }
}

async fn run_unit<T, F>(
    ctx: &mut TransactionContext,
    guard: &dyn CommitGuard,
    unit: &F,
) -> Result<(T, Vec<StoredEvent>), DomainError>
where
    F: for<'a> Fn(&'a mut TransactionContext) -> UnitFuture<'a, T>,
{
    guard.after_begin(ctx).await?;
    let value = unit(&mut *ctx).await?;
    guard.before_commit(ctx).await?;
    let events = ctx.flush_events().await?;
    Ok((value, events))
}
