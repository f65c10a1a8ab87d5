//! Tasklane command bus.
//!
//! Routes each command to exactly one registered handler. Handlers bound to
//! a command kind are looked up directly; the rest are consulted through
//! [`CommandHandler::can_handle`]. The bus validates, logs and times
//! commands but never retries them.

pub mod bus;
pub mod handler;

pub use bus::CommandBus;
pub use handler::CommandHandler;
