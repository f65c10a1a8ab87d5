//! Aggregate replay abstraction.

use uuid::Uuid;

use crate::error::DomainError;
use crate::event_log::StoredEvent;

/// Trait for state that is rebuilt by replaying an event stream.
pub trait AggregateRoot: Send + Sync {
    /// Returns the aggregate identifier.
    fn aggregate_id(&self) -> Uuid;

    /// Returns the current version (number of events applied).
    fn version(&self) -> i64;

    /// Apply a stored event to mutate internal state.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the payload cannot be decoded.
    fn apply(&mut self, event: &StoredEvent) -> Result<(), DomainError>;

    /// Applies events in order.
    ///
    /// # Errors
    ///
    /// Propagates the first failure from [`AggregateRoot::apply`].
    fn replay(&mut self, events: &[StoredEvent]) -> Result<(), DomainError> {
        for event in events {
            self.apply(event)?;
        }
        Ok(())
    }
}
