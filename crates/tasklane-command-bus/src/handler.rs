//! Command handler trait.

use async_trait::async_trait;
use tasklane_core::command::Command;
use tasklane_core::context::OperationContext;
use tasklane_core::error::DomainError;

/// Executes commands of type `C`, producing `R`.
///
/// A handler either binds itself to one command kind through
/// [`command_kind`](Self::command_kind), or leaves it `None` and claims a
/// family of kinds through [`can_handle`](Self::can_handle).
#[async_trait]
pub trait CommandHandler<C: Command, R>: Send + Sync {
    /// Name used in logs and duplicate checks.
    fn name(&self) -> &'static str;

    /// The single kind this handler is bound to.
    fn command_kind(&self) -> Option<C::Kind> {
        None
    }

    /// Whether this handler accepts `command`.
    fn can_handle(&self, command: &C) -> bool {
        self.command_kind() == Some(command.kind())
    }

    /// Executes the command. `cx` carries the caller's deadline and
    /// cancellation into whatever work the handler starts.
    async fn handle(&self, cx: &OperationContext, command: C) -> Result<R, DomainError>;
}
