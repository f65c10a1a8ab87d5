//! Sleep abstraction for retry backoff.

use std::time::Duration;

use async_trait::async_trait;

/// Suspends the current task between retry attempts.
///
/// Production code uses a timer-backed implementation; tests inject one that
/// records the requested delays and returns immediately.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Waits for `duration`.
    async fn sleep(&self, duration: Duration);
}
