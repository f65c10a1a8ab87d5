//! Test databases: in-memory and failing `Database` implementations.
//!
//! `InMemoryDatabase` validates optimistically: every transaction works on a
//! private overlay and commit re-checks, under one lock, that the versions it
//! compared against and the rows it inserted have not been touched by a
//! transaction that committed in between.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tasklane_core::clock::{Clock, SystemClock};
use tasklane_core::error::{DomainError, TransientFailure};
use tasklane_core::event_log::{ExpectedVersion, PendingEvent, StoredEvent};
use tasklane_core::storage::{
    Database, IsolationLevel, LockDiagnostics, LongRunningTransaction, OrphanRow, Record,
    StorageTransaction, VersionCas,
};
use uuid::Uuid;

use crate::event_log::InMemoryEventLog;

type Row = Map<String, Value>;

#[derive(Debug, Default)]
struct DbState {
    tables: BTreeMap<String, BTreeMap<Uuid, Row>>,
    open: BTreeMap<u64, DateTime<Utc>>,
    next_tx: u64,
    blocked_waiters: i64,
    diagnostics_scans: u32,
    commit_failures: VecDeque<TransientFailure>,
}

impl DbState {
    fn row(&self, table: &str, id: Uuid) -> Option<&Row> {
        self.tables.get(table).and_then(|rows| rows.get(&id))
    }
}

/// A transactional database kept entirely in memory.
pub struct InMemoryDatabase {
    state: Arc<Mutex<DbState>>,
    events: Arc<InMemoryEventLog>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for InMemoryDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryDatabase")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDatabase {
    /// Creates an empty database using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty database whose transaction ages are measured by
    /// `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(DbState::default())),
            events: Arc::new(InMemoryEventLog::new()),
            clock,
        }
    }

    /// The event log that committed transactions append to.
    #[must_use]
    pub fn event_log(&self) -> Arc<InMemoryEventLog> {
        Arc::clone(&self.events)
    }

    /// Writes a row directly, bypassing transactions. Used to seed data and
    /// to inject corruption.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn seed(&self, table: &str, record: Record) {
        let mut state = self.state.lock().unwrap();
        state
            .tables
            .entry(table.to_owned())
            .or_default()
            .insert(record.id, record.fields);
    }

    /// Overwrites a single column directly.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned or the row does not exist.
    pub fn set_field(&self, table: &str, id: Uuid, column: &str, value: Value) {
        let mut state = self.state.lock().unwrap();
        let row = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&id))
            .expect("set_field on a row that does not exist");
        row.insert(column.to_owned(), value);
    }

    /// Deletes a row directly.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn remove(&self, table: &str, id: Uuid) {
        let mut state = self.state.lock().unwrap();
        if let Some(rows) = state.tables.get_mut(table) {
            rows.remove(&id);
        }
    }

    /// Reads a committed row.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn record(&self, table: &str, id: Uuid) -> Option<Record> {
        let state = self.state.lock().unwrap();
        state.row(table, id).map(|fields| Record {
            id,
            fields: fields.clone(),
        })
    }

    /// Number of committed rows in a table.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn count(&self, table: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Number of transactions currently open.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn open_transactions(&self) -> usize {
        self.state.lock().unwrap().open.len()
    }

    /// Sets the number of lock waiters reported by `lock_diagnostics`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn set_blocked_waiters(&self, waiters: i64) {
        self.state.lock().unwrap().blocked_waiters = waiters;
    }

    /// Number of full `lock_diagnostics` scans served so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn diagnostics_scans(&self) -> u32 {
        self.state.lock().unwrap().diagnostics_scans
    }

    /// Makes the next `times` commits fail with `failure`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn fail_next_commits(&self, times: usize, failure: TransientFailure) {
        let mut state = self.state.lock().unwrap();
        state
            .commit_failures
            .extend(std::iter::repeat_n(failure, times));
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn StorageTransaction>, DomainError> {
        let id = {
            let mut state = self.state.lock().unwrap();
            state.next_tx += 1;
            let id = state.next_tx;
            state.open.insert(id, self.clock.now());
            id
        };
        Ok(Box::new(InMemoryTransaction {
            id,
            isolation,
            state: Arc::clone(&self.state),
            events: Arc::clone(&self.events),
            clock: Arc::clone(&self.clock),
            writes: BTreeMap::new(),
            version_reads: Vec::new(),
            inserted: Vec::new(),
            pending_events: Vec::new(),
            finished: false,
        }))
    }
}

struct VersionRead {
    table: String,
    id: Uuid,
    column: String,
    expected: i64,
}

struct PendingBatch {
    stream_id: Uuid,
    committed_base: Option<i64>,
    events: Vec<PendingEvent>,
}

struct InMemoryTransaction {
    id: u64,
    isolation: IsolationLevel,
    state: Arc<Mutex<DbState>>,
    events: Arc<InMemoryEventLog>,
    clock: Arc<dyn Clock>,
    writes: BTreeMap<(String, Uuid), Option<Row>>,
    version_reads: Vec<VersionRead>,
    inserted: Vec<(String, Uuid)>,
    pending_events: Vec<PendingBatch>,
    finished: bool,
}

impl InMemoryTransaction {
    fn ensure_open(&self) -> Result<(), DomainError> {
        if self.finished {
            return Err(DomainError::Infrastructure(
                "transaction already finished".into(),
            ));
        }
        Ok(())
    }

    fn current(&self, table: &str, id: Uuid) -> Option<Row> {
        if let Some(write) = self.writes.get(&(table.to_owned(), id)) {
            return write.clone();
        }
        self.state.lock().unwrap().row(table, id).cloned()
    }

    fn rows(&self, table: &str) -> BTreeMap<Uuid, Row> {
        let mut rows = self
            .state
            .lock()
            .unwrap()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default();
        for ((write_table, id), write) in &self.writes {
            if write_table != table {
                continue;
            }
            match write {
                Some(row) => {
                    rows.insert(*id, row.clone());
                }
                None => {
                    rows.remove(id);
                }
            }
        }
        rows
    }

    fn pending_count(&self, stream_id: Uuid) -> i64 {
        #[allow(clippy::cast_possible_wrap)]
        let count = self
            .pending_events
            .iter()
            .filter(|b| b.stream_id == stream_id)
            .map(|b| b.events.len())
            .sum::<usize>() as i64;
        count
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Ok(mut state) = self.state.lock() {
            state.open.remove(&self.id);
        }
    }

    fn validate(&self, state: &DbState) -> Result<(), DomainError> {
        for read in &self.version_reads {
            let actual = state
                .row(&read.table, read.id)
                .and_then(|row| row.get(&read.column))
                .and_then(Value::as_i64);
            if actual != Some(read.expected) {
                return Err(DomainError::ConcurrencyConflict {
                    entity_type: read.table.clone(),
                    aggregate_id: read.id,
                    expected: read.expected,
                    actual: actual.unwrap_or(0),
                });
            }
        }
        for (table, id) in &self.inserted {
            if state.row(table, *id).is_some() {
                return Err(DomainError::ConcurrencyConflict {
                    entity_type: table.clone(),
                    aggregate_id: *id,
                    expected: 0,
                    actual: state
                        .row(table, *id)
                        .and_then(|row| row.get("version"))
                        .and_then(Value::as_i64)
                        .unwrap_or(1),
                });
            }
        }
        let mut seen = HashSet::new();
        for batch in &self.pending_events {
            if !seen.insert(batch.stream_id) {
                continue;
            }
            if let Some(base) = batch.committed_base {
                let actual = self.events.stream_version(batch.stream_id);
                if actual != base {
                    return Err(DomainError::ConcurrencyConflict {
                        entity_type: "event_stream".into(),
                        aggregate_id: batch.stream_id,
                        expected: base,
                        actual,
                    });
                }
            }
        }
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.finish();
        }
    }
}

#[async_trait]
impl StorageTransaction for InMemoryTransaction {
    fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    async fn fetch_record(&mut self, table: &str, id: Uuid) -> Result<Option<Record>, DomainError> {
        self.ensure_open()?;
        Ok(self.current(table, id).map(|fields| Record { id, fields }))
    }

    async fn list_records(&mut self, table: &str) -> Result<Vec<Record>, DomainError> {
        self.ensure_open()?;
        Ok(self
            .rows(table)
            .into_iter()
            .map(|(id, fields)| Record { id, fields })
            .collect())
    }

    async fn insert_record(&mut self, table: &str, record: &Record) -> Result<(), DomainError> {
        self.ensure_open()?;
        if self.current(table, record.id).is_some() {
            return Err(DomainError::Validation(format!(
                "duplicate key {} in {table}",
                record.id
            )));
        }
        let mut fields = record.fields.clone();
        fields.insert("id".into(), Value::String(record.id.to_string()));
        self.writes
            .insert((table.to_owned(), record.id), Some(fields));
        self.inserted.push((table.to_owned(), record.id));
        Ok(())
    }

    async fn update_fields(
        &mut self,
        table: &str,
        id: Uuid,
        fields: &Map<String, Value>,
    ) -> Result<bool, DomainError> {
        self.ensure_open()?;
        let Some(mut row) = self.current(table, id) else {
            return Ok(false);
        };
        for (column, value) in fields {
            if column != "id" {
                row.insert(column.clone(), value.clone());
            }
        }
        self.writes.insert((table.to_owned(), id), Some(row));
        Ok(true)
    }

    async fn delete_record(&mut self, table: &str, id: Uuid) -> Result<bool, DomainError> {
        self.ensure_open()?;
        if self.current(table, id).is_none() {
            return Ok(false);
        }
        self.writes.insert((table.to_owned(), id), None);
        Ok(true)
    }

    async fn compare_and_increment(
        &mut self,
        table: &str,
        version_column: &str,
        id: Uuid,
        expected: i64,
    ) -> Result<VersionCas, DomainError> {
        self.ensure_open()?;
        let from_overlay = self.writes.contains_key(&(table.to_owned(), id));
        let Some(mut row) = self.current(table, id) else {
            return Ok(VersionCas::Mismatch { actual: None });
        };
        let actual = row.get(version_column).and_then(Value::as_i64);
        if actual != Some(expected) {
            return Ok(VersionCas::Mismatch { actual });
        }
        let next = expected + 1;
        row.insert(version_column.to_owned(), Value::from(next));
        self.writes.insert((table.to_owned(), id), Some(row));
        if !from_overlay {
            self.version_reads.push(VersionRead {
                table: table.to_owned(),
                id,
                column: version_column.to_owned(),
                expected,
            });
        }
        Ok(VersionCas::Incremented(next))
    }

    async fn invalid_versions(
        &mut self,
        table: &str,
        version_column: &str,
    ) -> Result<Vec<(Uuid, Option<i64>)>, DomainError> {
        self.ensure_open()?;
        Ok(self
            .rows(table)
            .into_iter()
            .filter_map(|(id, row)| {
                let version = row.get(version_column).and_then(Value::as_i64);
                match version {
                    Some(v) if v > 0 => None,
                    other => Some((id, other)),
                }
            })
            .collect())
    }

    async fn find_orphans(
        &mut self,
        child_table: &str,
        column: &str,
        parent_table: &str,
    ) -> Result<Vec<OrphanRow>, DomainError> {
        self.ensure_open()?;
        let parents = self.rows(parent_table);
        Ok(self
            .rows(child_table)
            .into_iter()
            .filter_map(|(child_id, row)| {
                let reference = row.get(column).cloned().unwrap_or(Value::Null);
                if reference.is_null() {
                    return None;
                }
                let resolves = reference
                    .as_str()
                    .and_then(|s| Uuid::parse_str(s).ok())
                    .is_some_and(|parent| parents.contains_key(&parent));
                (!resolves).then_some(OrphanRow {
                    child_id,
                    reference,
                })
            })
            .collect())
    }

    async fn append_events(
        &mut self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: &[PendingEvent],
    ) -> Result<Vec<StoredEvent>, DomainError> {
        self.ensure_open()?;
        let pending_before = self.pending_count(stream_id);
        let current = self.events.stream_version(stream_id) + pending_before;
        if !expected.matches(current) {
            return Err(DomainError::ConcurrencyConflict {
                entity_type: "event_stream".into(),
                aggregate_id: stream_id,
                expected: match expected {
                    ExpectedVersion::Exact(v) => v,
                    ExpectedVersion::Any => current,
                },
                actual: current,
            });
        }
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let committed_base = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v - pending_before),
        };
        #[allow(clippy::cast_possible_wrap)]
        let global_base = (self.events.len() as i64)
            + self
                .pending_events
                .iter()
                .map(|b| b.events.len() as i64)
                .sum::<i64>();

        let provisional = events
            .iter()
            .cloned()
            .zip(1_i64..)
            .map(|(pending, offset)| {
                StoredEvent::from_pending(stream_id, current + offset, global_base + offset, pending)
            })
            .collect();
        self.pending_events.push(PendingBatch {
            stream_id,
            committed_base,
            events: events.to_vec(),
        });
        Ok(provisional)
    }

    async fn blocked_waiters(&mut self) -> Result<i64, DomainError> {
        self.ensure_open()?;
        Ok(self.state.lock().unwrap().blocked_waiters)
    }

    async fn lock_diagnostics(
        &mut self,
        threshold: Duration,
    ) -> Result<LockDiagnostics, DomainError> {
        self.ensure_open()?;
        let now = self.clock.now();
        let mut state = self.state.lock().unwrap();
        state.diagnostics_scans += 1;
        let long_running = state
            .open
            .iter()
            .filter(|(id, _)| **id != self.id)
            .filter_map(|(id, started)| {
                let age = (now - *started).to_std().ok()?;
                (age > threshold).then(|| LongRunningTransaction {
                    holder: format!("tx-{id}"),
                    age_ms: i64::try_from(age.as_millis()).unwrap_or(i64::MAX),
                    state: "idle in transaction".into(),
                })
            })
            .collect();
        Ok(LockDiagnostics {
            blocked_waiters: state.blocked_waiters,
            long_running,
        })
    }

    async fn commit(&mut self) -> Result<(), DomainError> {
        self.ensure_open()?;
        let result = {
            let mut state = self.state.lock().unwrap();
            if let Some(failure) = state.commit_failures.pop_front() {
                Err(DomainError::Transient(failure))
            } else {
                self.validate(&state).map(|()| {
                    for ((table, id), write) in std::mem::take(&mut self.writes) {
                        let rows = state.tables.entry(table).or_default();
                        match write {
                            Some(row) => {
                                rows.insert(id, row);
                            }
                            None => {
                                rows.remove(&id);
                            }
                        }
                    }
                    for batch in std::mem::take(&mut self.pending_events) {
                        // Expectations were validated above under the same lock.
                        let _ = self.events.append_now(
                            batch.stream_id,
                            ExpectedVersion::Any,
                            batch.events,
                        );
                    }
                })
            }
        };
        self.finish();
        result
    }

    async fn rollback(&mut self) -> Result<(), DomainError> {
        self.ensure_open()?;
        self.writes.clear();
        self.pending_events.clear();
        self.finish();
        Ok(())
    }
}

/// A database that refuses every connection. Useful for testing
/// infrastructure-failure paths.
#[derive(Debug)]
pub struct FailingDatabase;

#[async_trait]
impl Database for FailingDatabase {
    async fn begin(
        &self,
        _isolation: IsolationLevel,
    ) -> Result<Box<dyn StorageTransaction>, DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }
}
