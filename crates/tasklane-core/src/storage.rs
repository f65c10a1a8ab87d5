//! Transactional storage abstraction.
//!
//! The consistency engine reasons about rows generically: every tracked
//! table is addressed by name and every row is a [`Record`]. Implementations
//! bind all values as parameters; table and column names come only from the
//! entity registry.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::event_log::{ExpectedVersion, PendingEvent, StoredEvent};

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// Dirty reads allowed.
    ReadUncommitted,
    /// Each statement sees committed data.
    ReadCommitted,
    /// The transaction sees one snapshot.
    RepeatableRead,
    /// Transactions behave as if run one at a time.
    Serializable,
}

impl IsolationLevel {
    /// SQL keyword form, e.g. `REPEATABLE READ`.
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for IsolationLevel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();
        match normalized.as_str() {
            "READ_UNCOMMITTED" => Ok(Self::ReadUncommitted),
            "READ_COMMITTED" => Ok(Self::ReadCommitted),
            "REPEATABLE_READ" => Ok(Self::RepeatableRead),
            "SERIALIZABLE" => Ok(Self::Serializable),
            _ => Err(DomainError::Validation(format!(
                "unknown isolation level: {s}"
            ))),
        }
    }
}

/// A generic row: its id plus every column as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Primary key.
    pub id: Uuid,
    /// Column values keyed by column name (includes `id`).
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Record {
    /// Creates a record, mirroring the id into `fields`.
    #[must_use]
    pub fn new(id: Uuid, mut fields: serde_json::Map<String, serde_json::Value>) -> Self {
        fields.insert("id".to_owned(), serde_json::Value::String(id.to_string()));
        Self { id, fields }
    }

    /// Returns a column value.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&serde_json::Value> {
        self.fields.get(column)
    }

    /// Returns an integer column value.
    #[must_use]
    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.fields.get(column).and_then(serde_json::Value::as_i64)
    }
}

/// Result of a compare-and-increment on a version column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCas {
    /// Versions matched; the row now carries this version.
    Incremented(i64),
    /// Versions differed. `actual` is `None` when the row does not exist or
    /// its version is NULL.
    Mismatch {
        /// The stored version, if any.
        actual: Option<i64>,
    },
}

/// A child row whose reference does not resolve.
#[derive(Debug, Clone, PartialEq)]
pub struct OrphanRow {
    /// The child row id.
    pub child_id: Uuid,
    /// The raw reference value found in the child row.
    pub reference: serde_json::Value,
}

/// A transaction that has been open longer than a threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongRunningTransaction {
    /// Backend-specific identifier (pid, transaction number).
    pub holder: String,
    /// How long it has been open.
    pub age_ms: i64,
    /// Backend-reported state (`idle in transaction`, `active`, ...).
    pub state: String,
}

/// Lock contention observed from inside a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDiagnostics {
    /// Lock requests currently waiting.
    pub blocked_waiters: i64,
    /// Other transactions open longer than the probe threshold.
    pub long_running: Vec<LongRunningTransaction>,
}

/// An open database transaction.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait StorageTransaction: Send {
    /// The isolation level this transaction was opened with.
    fn isolation_level(&self) -> IsolationLevel;

    /// Loads one row.
    async fn fetch_record(&mut self, table: &str, id: Uuid) -> Result<Option<Record>, DomainError>;

    /// Loads every row of a table ordered by id.
    async fn list_records(&mut self, table: &str) -> Result<Vec<Record>, DomainError>;

    /// Inserts a row.
    async fn insert_record(&mut self, table: &str, record: &Record) -> Result<(), DomainError>;

    /// Overwrites the given columns; returns `false` if the row is missing.
    async fn update_fields(
        &mut self,
        table: &str,
        id: Uuid,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<bool, DomainError>;

    /// Deletes a row; returns `false` if it was already gone.
    async fn delete_record(&mut self, table: &str, id: Uuid) -> Result<bool, DomainError>;

    /// Atomically increments `version_column` if it equals `expected`.
    async fn compare_and_increment(
        &mut self,
        table: &str,
        version_column: &str,
        id: Uuid,
        expected: i64,
    ) -> Result<VersionCas, DomainError>;

    /// Rows whose version column is NULL, zero or negative.
    async fn invalid_versions(
        &mut self,
        table: &str,
        version_column: &str,
    ) -> Result<Vec<(Uuid, Option<i64>)>, DomainError>;

    /// Child rows whose non-null `column` does not resolve to a parent row.
    async fn find_orphans(
        &mut self,
        child_table: &str,
        column: &str,
        parent_table: &str,
    ) -> Result<Vec<OrphanRow>, DomainError>;

    /// Appends events to a stream as part of this transaction.
    async fn append_events(
        &mut self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: &[PendingEvent],
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Number of lock requests currently waiting to be granted.
    async fn blocked_waiters(&mut self) -> Result<i64, DomainError>;

    /// Lock waiters and other transactions older than `threshold`.
    async fn lock_diagnostics(&mut self, threshold: Duration)
    -> Result<LockDiagnostics, DomainError>;

    /// Commits the transaction.
    async fn commit(&mut self) -> Result<(), DomainError>;

    /// Rolls the transaction back.
    async fn rollback(&mut self) -> Result<(), DomainError>;
}

/// Source of transactions; the only shared mutable resource of the engine.
#[async_trait]
pub trait Database: Send + Sync {
    /// Opens a transaction at the requested isolation level.
    async fn begin(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Box<dyn StorageTransaction>, DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_parses_common_spellings() {
        assert_eq!(
            "READ_COMMITTED".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(
            "repeatable-read".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            "Serializable".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::Serializable
        );
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn test_isolation_level_renders_sql() {
        assert_eq!(IsolationLevel::ReadUncommitted.as_sql(), "READ UNCOMMITTED");
        assert_eq!(IsolationLevel::Serializable.to_string(), "SERIALIZABLE");
    }

    #[test]
    fn test_record_new_mirrors_id_into_fields() {
        let id = Uuid::new_v4();
        let record = Record::new(id, serde_json::Map::new());

        assert_eq!(record.get("id"), Some(&serde_json::json!(id.to_string())));
    }
}
