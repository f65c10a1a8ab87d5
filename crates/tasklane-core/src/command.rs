//! Command abstractions.

use std::fmt::Debug;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::DomainError;

/// Identity and tracing data carried by every command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMetadata {
    /// Globally unique command identifier.
    pub command_id: Uuid,
    /// When the command was created.
    pub timestamp: DateTime<Utc>,
    /// The user on whose behalf the command runs.
    pub user_id: Option<Uuid>,
    /// Correlation ID to trace this command through the system.
    pub correlation_id: Option<Uuid>,
}

impl CommandMetadata {
    /// Creates metadata with a fresh command id stamped by `clock`.
    #[must_use]
    pub fn new(clock: &dyn Clock) -> Self {
        Self {
            command_id: Uuid::now_v7(),
            timestamp: clock.now(),
            user_id: None,
            correlation_id: None,
        }
    }

    /// Sets the acting user.
    #[must_use]
    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// The correlation id, falling back to the command id.
    #[must_use]
    pub fn correlation_or_command_id(&self) -> Uuid {
        self.correlation_id.unwrap_or(self.command_id)
    }
}

/// Tag identifying a command variant; the routing key of the command bus.
pub trait CommandKind: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Stable name used for routing errors and logs.
    fn name(self) -> &'static str;
}

/// Trait that all commands implement.
pub trait Command: Send + Sync + Debug {
    /// The closed set of kinds this command type can take.
    type Kind: CommandKind;

    /// The kind of this command.
    fn kind(&self) -> Self::Kind;

    /// Identity and tracing metadata.
    fn metadata(&self) -> &CommandMetadata;

    /// The type name for this command (for logging/routing).
    fn command_type(&self) -> &'static str {
        self.kind().name()
    }

    /// Input validation run before any handler executes.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Validation` when the command is malformed.
    fn validate(&self) -> Result<(), DomainError> {
        Ok(())
    }
}
