//! Shared test doubles and utilities for the Tasklane consistency engine.

mod clock;
mod database;
mod event_log;
mod rng;
mod sleeper;

pub use clock::{FixedClock, SteppingClock};
pub use database::{FailingDatabase, InMemoryDatabase};
pub use event_log::{FailingEventLog, InMemoryEventLog};
pub use rng::{FixedJitter, NoJitter};
pub use sleeper::{PendingSleeper, RecordingSleeper};
