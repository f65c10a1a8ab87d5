//! Test event logs: in-memory and failing `EventLog` implementations.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tasklane_core::error::DomainError;
use tasklane_core::event_log::{
    EventLog, EventSnapshot, EventStreamInfo, ExpectedVersion, PendingEvent, StoredEvent,
};
use uuid::Uuid;

#[derive(Debug, Default)]
struct LogState {
    streams: HashMap<Uuid, Vec<StoredEvent>>,
    all: Vec<StoredEvent>,
    snapshots: HashMap<Uuid, EventSnapshot>,
}

impl LogState {
    fn version(&self, stream_id: Uuid) -> i64 {
        self.streams
            .get(&stream_id)
            .and_then(|events| events.last())
            .map_or(0, |e| e.sequence_number)
    }

    fn append(
        &mut self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<PendingEvent>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let current = self.version(stream_id);
        if !expected.matches(current) {
            return Err(stream_conflict(stream_id, expected, current));
        }
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut next_position = self.all.last().map_or(0, |e| e.global_position);
        let mut sequence = current;
        let stored: Vec<StoredEvent> = events
            .into_iter()
            .map(|pending| {
                sequence += 1;
                next_position += 1;
                StoredEvent::from_pending(stream_id, sequence, next_position, pending)
            })
            .collect();

        self.streams
            .entry(stream_id)
            .or_default()
            .extend(stored.iter().cloned());
        self.all.extend(stored.iter().cloned());
        Ok(stored)
    }
}

fn stream_conflict(stream_id: Uuid, expected: ExpectedVersion, actual: i64) -> DomainError {
    DomainError::ConcurrencyConflict {
        entity_type: "event_stream".to_owned(),
        aggregate_id: stream_id,
        expected: match expected {
            ExpectedVersion::Exact(v) => v,
            ExpectedVersion::Any => actual,
        },
        actual,
    }
}

/// An event log kept entirely in memory.
///
/// Reference implementation of the `EventLog` contract for tests and local
/// development; it offers no durability.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    state: Mutex<LogState>,
}

impl InMemoryEventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version of a stream (0 when it does not exist).
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn stream_version(&self, stream_id: Uuid) -> i64 {
        self.state.lock().unwrap().version(stream_id)
    }

    /// Total number of events across all streams.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().all.len()
    }

    /// Whether the log holds no events.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn append_now(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<PendingEvent>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        self.state.lock().unwrap().append(stream_id, expected, events)
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(
        &self,
        stream_id: Uuid,
        expected: ExpectedVersion,
        events: Vec<PendingEvent>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        self.append_now(stream_id, expected, events)
    }

    async fn get_events(
        &self,
        stream_id: Uuid,
        from_version: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let from = from_version.unwrap_or(0);
        let state = self.state.lock().unwrap();
        Ok(state
            .streams
            .get(&stream_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.sequence_number > from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_all_events(
        &self,
        from_position: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        let from = from_position.unwrap_or(0);
        let state = self.state.lock().unwrap();
        Ok(state
            .all
            .iter()
            .filter(|e| e.global_position > from)
            .cloned()
            .collect())
    }

    async fn get_stream_info(
        &self,
        stream_id: Uuid,
    ) -> Result<Option<EventStreamInfo>, DomainError> {
        let state = self.state.lock().unwrap();
        let Some(events) = state.streams.get(&stream_id) else {
            return Ok(None);
        };
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            return Ok(None);
        };
        #[allow(clippy::cast_possible_wrap)]
        let event_count = events.len() as i64;
        Ok(Some(EventStreamInfo {
            stream_id,
            version: last.sequence_number,
            event_count,
            first_event_at: first.occurred_at,
            last_event_at: last.occurred_at,
        }))
    }

    async fn save_snapshot(&self, snapshot: EventSnapshot) -> Result<(), DomainError> {
        let mut state = self.state.lock().unwrap();
        let version = state.version(snapshot.stream_id);
        if snapshot.version > version {
            return Err(DomainError::Validation(format!(
                "snapshot version {} is ahead of stream {} at version {version}",
                snapshot.version, snapshot.stream_id
            )));
        }
        let keep_existing = state
            .snapshots
            .get(&snapshot.stream_id)
            .is_some_and(|existing| existing.version > snapshot.version);
        if !keep_existing {
            state.snapshots.insert(snapshot.stream_id, snapshot);
        }
        Ok(())
    }

    async fn get_snapshot(&self, stream_id: Uuid) -> Result<Option<EventSnapshot>, DomainError> {
        Ok(self.state.lock().unwrap().snapshots.get(&stream_id).cloned())
    }
}

/// An event log that always returns an infrastructure error. Useful for
/// testing error-handling paths.
#[derive(Debug)]
pub struct FailingEventLog;

#[async_trait]
impl EventLog for FailingEventLog {
    async fn append(
        &self,
        _stream_id: Uuid,
        _expected: ExpectedVersion,
        _events: Vec<PendingEvent>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }

    async fn get_events(
        &self,
        _stream_id: Uuid,
        _from_version: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }

    async fn get_all_events(
        &self,
        _from_position: Option<i64>,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }

    async fn get_stream_info(
        &self,
        _stream_id: Uuid,
    ) -> Result<Option<EventStreamInfo>, DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }

    async fn save_snapshot(&self, _snapshot: EventSnapshot) -> Result<(), DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }

    async fn get_snapshot(&self, _stream_id: Uuid) -> Result<Option<EventSnapshot>, DomainError> {
        Err(DomainError::Infrastructure("connection refused".into()))
    }
}
