//! Append-only event log abstraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// An event raised by a unit of work, not yet assigned a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Event type name for deserialization routing.
    pub event_type: String,
    /// Serialized event payload.
    pub payload: serde_json::Value,
    /// Correlation ID for tracing.
    pub correlation_id: Option<Uuid>,
    /// Causation ID linking to the causing command.
    pub causation_id: Option<Uuid>,
    /// The user whose command produced the event.
    pub user_id: Option<Uuid>,
    /// Timestamp of event creation.
    pub occurred_at: DateTime<Utc>,
}

/// Stored representation of a domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Stream (aggregate) this event belongs to.
    pub stream_id: Uuid,
    /// Event type name for deserialization routing.
    pub event_type: String,
    /// Serialized event payload.
    pub payload: serde_json::Value,
    /// 1-based position within the stream.
    pub sequence_number: i64,
    /// Position in the global, cross-stream ordering.
    pub global_position: i64,
    /// Correlation ID for tracing.
    pub correlation_id: Option<Uuid>,
    /// Causation ID linking to the causing command.
    pub causation_id: Option<Uuid>,
    /// The user whose command produced the event.
    pub user_id: Option<Uuid>,
    /// Timestamp of event creation.
    pub occurred_at: DateTime<Utc>,
}

impl StoredEvent {
    /// Builds a stored event from a pending one and its assigned positions.
    #[must_use]
    pub fn from_pending(
        stream_id: Uuid,
        sequence_number: i64,
        global_position: i64,
        pending: PendingEvent,
    ) -> Self {
        Self {
            event_id: pending.event_id,
            stream_id,
            event_type: pending.event_type,
            payload: pending.payload,
            sequence_number,
            global_position,
            correlation_id: pending.correlation_id,
            causation_id: pending.causation_id,
            user_id: pending.user_id,
            occurred_at: pending.occurred_at,
        }
    }
}

/// Optimistic expectation about a stream's version at append time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// Append regardless of the current version.
    Any,
    /// Append only if the stream is at exactly this version (0 = no stream).
    Exact(i64),
}

impl ExpectedVersion {
    /// Checks `current` against the expectation.
    #[must_use]
    pub fn matches(self, current: i64) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == current,
        }
    }
}

/// Derived view of a stream; never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStreamInfo {
    /// The stream identifier.
    pub stream_id: Uuid,
    /// Current version (equals the event count).
    pub version: i64,
    /// Number of events in the stream.
    pub event_count: i64,
    /// Timestamp of the first event.
    pub first_event_at: DateTime<Utc>,
    /// Timestamp of the last event.
    pub last_event_at: DateTime<Utc>,
}

/// Compacted state of a stream at a given version.
///
/// Snapshots are an optimization; replaying the full stream must always
/// produce the same state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSnapshot<T = serde_json::Value> {
    /// The stream this snapshot compacts.
    pub stream_id: Uuid,
    /// Stream version the state reflects.
    pub version: i64,
    /// The compacted state.
    pub state: T,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

impl EventSnapshot {
    /// Serializes a typed state into a storable snapshot.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the state cannot be serialized.
    pub fn encode<T: Serialize>(
        stream_id: Uuid,
        version: i64,
        state: &T,
        taken_at: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let state = serde_json::to_value(state)
            .map_err(|e| DomainError::Infrastructure(format!("snapshot serialization failed: {e}")))?;
        Ok(Self {
            stream_id,
            version,
            state,
            taken_at,
        })
    }

    /// Deserializes the stored state.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the state does not match `T`.
    pub fn decode<T: DeserializeOwned>(self) -> Result<EventSnapshot<T>, DomainError> {
        let state = serde_json::from_value(self.state).map_err(|e| {
            DomainError::Infrastructure(format!("snapshot deserialization failed: {e}"))
        })?;
        Ok(EventSnapshot {
            stream_id: self.stream_id,
            version: self.version,
            state,
            taken_at: self.taken_at,
        })
    }
}

/// Append-only store of ordered domain events per stream.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends events to a stream, assigning consecutive sequence numbers.
    ///
    /// Existing events are never reordered or rewritten. An empty batch is a
    /// no-op.
    async fn append(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<PendingEvent>,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Returns the stream's events with `sequence_number > from_version`.
    /// Unknown streams yield an empty vec.
    async fn get_events(
        &self,
        stream_id: Uuid,
        from_version: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Returns events across all streams with `global_position > from_position`.
    async fn get_all_events(
        &self,
        from_position: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError>;

    /// Returns `None` for a stream that has no events.
    async fn get_stream_info(&self, stream_id: Uuid)
    -> Result<Option<EventStreamInfo>, DomainError>;

    /// Stores a snapshot, replacing an older one for the same stream.
    async fn save_snapshot(&self, snapshot: EventSnapshot) -> Result<(), DomainError>;

    /// Returns the retained snapshot for a stream, if any.
    async fn get_snapshot(&self, stream_id: Uuid) -> Result<Option<EventSnapshot>, DomainError>;
}
