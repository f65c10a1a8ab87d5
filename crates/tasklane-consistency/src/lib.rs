//! Tasklane consistency engine.
//!
//! Guarded, retried transactions over a [`Database`](tasklane_core::storage::Database),
//! with optimistic locking, referential integrity, data validation, isolation
//! probes and checksummed snapshots. [`ConsistencyEngine`] ties them together.

pub mod engine;
pub mod integrity;
pub mod isolation;
pub mod metrics;
pub mod optimistic_lock;
pub mod policy;
pub mod registry;
pub mod retry;
pub mod snapshot;
pub mod transaction;
pub mod validation;

pub use engine::{ConsistencyCheckResult, ConsistencyEngine, ConsistentResult, FixOutcome};
pub use policy::{BackoffStrategy, ConsistencyPolicy};
pub use registry::{EntityDefinition, EntityRegistry, FieldRule, OrphanPolicy, ReferenceRule};
pub use tasklane_core::context::{CancelHandle, OperationContext};
pub use transaction::{TransactionContext, UnitFuture};
