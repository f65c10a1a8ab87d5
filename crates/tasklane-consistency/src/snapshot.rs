//! Checksummed consistency snapshots and drift detection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tasklane_core::error::DomainError;
use tasklane_core::storage::Record;
use uuid::Uuid;

/// Row counts and content checksums of every tracked table at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencySnapshot {
    /// Snapshot identifier.
    pub snapshot_id: Uuid,
    /// When the snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// Rows per entity type.
    pub entity_counts: BTreeMap<String, u64>,
    /// Lowercase hex SHA-256 per entity type.
    pub checksums: BTreeMap<String, String>,
}

/// Differences for one entity type between a baseline and a fresh snapshot.
/// A side is `None` when the entity type is absent from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDrift {
    pub entity_type: String,
    pub baseline_count: Option<u64>,
    pub current_count: Option<u64>,
    pub baseline_checksum: Option<String>,
    pub current_checksum: Option<String>,
}

/// Result of comparing the database against a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotValidation {
    /// The snapshot compared against.
    pub baseline_id: Uuid,
    /// The snapshot taken for the comparison.
    pub current: ConsistencySnapshot,
    /// Entity types whose count or checksum changed.
    pub drift: Vec<SnapshotDrift>,
    /// Whether `drift` is empty.
    pub is_unchanged: bool,
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, sort_keys(v))).collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), v))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

fn row_digest(record: &Record) -> Result<[u8; 32], DomainError> {
    let canonical = sort_keys(&Value::Object(record.fields.clone()));
    let bytes = serde_json::to_vec(&canonical)
        .map_err(|e| DomainError::Infrastructure(format!("row serialization failed: {e}")))?;
    Ok(Sha256::digest(bytes).into())
}

/// Checksum of a table's rows.
///
/// Each row is hashed from its JSON with sorted keys; the row hashes are
/// then hashed in id order. The result does not depend on the order `rows`
/// arrive in.
///
/// # Errors
///
/// Returns `Infrastructure` if a row cannot be serialised.
pub fn table_checksum(rows: &[Record]) -> Result<String, DomainError> {
    let mut ordered: Vec<&Record> = rows.iter().collect();
    ordered.sort_by_key(|record| record.id);

    let mut hasher = Sha256::new();
    for record in ordered {
        hasher.update(row_digest(record)?);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compares two snapshots entity type by entity type.
#[must_use]
pub fn diff_snapshots(
    baseline: &ConsistencySnapshot,
    current: &ConsistencySnapshot,
) -> Vec<SnapshotDrift> {
    let entity_types: BTreeSet<&String> = baseline
        .entity_counts
        .keys()
        .chain(baseline.checksums.keys())
        .chain(current.entity_counts.keys())
        .chain(current.checksums.keys())
        .collect();

    entity_types
        .into_iter()
        .filter_map(|entity_type| {
            let drift = SnapshotDrift {
                entity_type: entity_type.clone(),
                baseline_count: baseline.entity_counts.get(entity_type).copied(),
                current_count: current.entity_counts.get(entity_type).copied(),
                baseline_checksum: baseline.checksums.get(entity_type).cloned(),
                current_checksum: current.checksums.get(entity_type).cloned(),
            };
            let changed = drift.baseline_count != drift.current_count
                || drift.baseline_checksum != drift.current_checksum;
            changed.then_some(drift)
        })
        .collect()
}

/// Retains snapshots for later comparison.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Stores a snapshot under its id.
    async fn save(&self, snapshot: ConsistencySnapshot) -> Result<(), DomainError>;

    /// Returns a stored snapshot.
    async fn get(&self, snapshot_id: Uuid) -> Result<Option<ConsistencySnapshot>, DomainError>;

    /// Drops a snapshot. Returns whether it was stored.
    async fn remove(&self, snapshot_id: Uuid) -> Result<bool, DomainError>;
}

/// Process-local snapshot store.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Mutex<HashMap<Uuid, ConsistencySnapshot>>,
}

impl InMemorySnapshotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.lock().map_or(0, |s| s.len())
    }

    /// Whether no snapshot is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn save(&self, snapshot: ConsistencySnapshot) -> Result<(), DomainError> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|e| DomainError::Infrastructure(format!("snapshot store poisoned: {e}")))?;
        snapshots.insert(snapshot.snapshot_id, snapshot);
        Ok(())
    }

    async fn get(&self, snapshot_id: Uuid) -> Result<Option<ConsistencySnapshot>, DomainError> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|e| DomainError::Infrastructure(format!("snapshot store poisoned: {e}")))?;
        Ok(snapshots.get(&snapshot_id).cloned())
    }

    async fn remove(&self, snapshot_id: Uuid) -> Result<bool, DomainError> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|e| DomainError::Infrastructure(format!("snapshot store poisoned: {e}")))?;
        Ok(snapshots.remove(&snapshot_id).is_some())
    }
}
