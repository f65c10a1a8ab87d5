//! Caller deadlines and cancellation.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crate::clock::Clock;
use crate::error::DomainError;
use tokio::sync::watch;

/// Deadline and cancellation signal supplied by the caller of an engine
/// operation.
///
/// The default context never expires and cannot be cancelled.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    deadline: Option<DateTime<Utc>>,
    cancellation: Option<watch::Receiver<bool>>,
}

/// Cancels every clone of the [`OperationContext`] it was created with.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signals cancellation. Idempotent.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

impl OperationContext {
    /// A context with no deadline and no cancellation.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that can be cancelled through the returned handle.
    #[must_use]
    pub fn cancellable() -> (Self, CancelHandle) {
        let (sender, receiver) = watch::channel(false);
        (
            Self {
                deadline: None,
                cancellation: Some(receiver),
            },
            CancelHandle { sender },
        )
    }

    /// Sets the absolute deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The absolute deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// Whether cancellation has been signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Whether the deadline has passed according to `clock`.
    #[must_use]
    pub fn deadline_passed(&self, clock: &dyn Clock) -> bool {
        self.deadline.is_some_and(|deadline| clock.now() >= deadline)
    }

    /// Time left until the deadline; `None` without a deadline.
    #[must_use]
    pub fn remaining(&self, clock: &dyn Clock) -> Option<Duration> {
        self.deadline
            .map(|deadline| (deadline - clock.now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Resolves once cancellation is signalled; never resolves otherwise.
    pub async fn cancelled(&self) {
        let Some(receiver) = &self.cancellation else {
            return std::future::pending().await;
        };
        let mut receiver = receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                // Handle dropped without cancelling.
                return std::future::pending().await;
            }
        }
    }

    /// Runs `work`, abandoning it on cancellation or when the deadline
    /// passes. Dropping the abandoned future is what rolls back any
    /// transaction it holds.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Cancelled`, `DomainError::DeadlineExceeded` or
    /// whatever `work` returns.
    pub async fn race<T, F>(&self, clock: &dyn Clock, work: F) -> Result<T, DomainError>
    where
        F: Future<Output = Result<T, DomainError>>,
    {
        let remaining = self.remaining(clock);
        let expiry = async move {
            match remaining {
                Some(left) => tokio::time::sleep(left).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            () = self.cancelled() => Err(DomainError::Cancelled),
            () = expiry => Err(DomainError::DeadlineExceeded),
            result = work => result,
        }
    }
}
