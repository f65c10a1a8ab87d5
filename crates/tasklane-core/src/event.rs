//! Domain event abstractions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event_log::PendingEvent;

/// Metadata attached to every domain event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event identifier.
    pub event_id: Uuid,
    /// Aggregate/stream this event belongs to.
    pub stream_id: Uuid,
    /// Correlation ID for tracing a command through its effects.
    pub correlation_id: Option<Uuid>,
    /// Causation ID linking this event to the command that caused it.
    pub causation_id: Option<Uuid>,
    /// The user whose command produced the event.
    pub user_id: Option<Uuid>,
    /// Timestamp of event creation.
    pub occurred_at: DateTime<Utc>,
}

/// Trait that all domain events implement.
pub trait DomainEvent: Send + Sync + std::fmt::Debug {
    /// Returns the event type name (used for serialization routing).
    fn event_type(&self) -> &'static str;

    /// Serializes the event payload to JSON.
    fn to_payload(&self) -> serde_json::Value;

    /// Returns the metadata for this event.
    fn metadata(&self) -> &EventMetadata;

    /// Converts the event into the form appended to the event log.
    fn to_pending(&self) -> PendingEvent {
        let meta = self.metadata();
        PendingEvent {
            event_id: meta.event_id,
            event_type: self.event_type().to_owned(),
            payload: self.to_payload(),
            correlation_id: meta.correlation_id,
            causation_id: meta.causation_id,
            user_id: meta.user_id,
            occurred_at: meta.occurred_at,
        }
    }
}
