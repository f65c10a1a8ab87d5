//! Test sleepers: `Sleeper` implementations that never block.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tasklane_core::sleep::Sleeper;

/// A sleeper that records every requested delay and returns immediately.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the delays requested so far, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

/// A sleeper that never wakes up; used to prove cancellation interrupts
/// backoff.
#[derive(Debug, Clone, Copy)]
pub struct PendingSleeper;

#[async_trait]
impl Sleeper for PendingSleeper {
    async fn sleep(&self, _duration: Duration) {
        std::future::pending::<()>().await;
    }
}
