//! Bounded retry loop with backoff.
//!
//! Both the transaction manager and the optimistic lock manager retry
//! through [`run_with_retry`]: one explicit loop with an attempt counter, a
//! deadline check before every additional attempt and a backoff sleep that
//! yields to cancellation.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tasklane_core::clock::Clock;
use tasklane_core::context::OperationContext;
use tasklane_core::error::DomainError;
use tasklane_core::rng::JitterSource;
use tasklane_core::sleep::Sleeper;
use tracing::debug;

use crate::policy::{BackoffStrategy, ConsistencyPolicy};

/// Upper bound on a single delay when no explicit cap is configured.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(2);

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    /// Total attempts including the first; never below 1.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Delay growth.
    pub backoff: BackoffStrategy,
    /// Whether delays are scaled by a jitter factor.
    pub jitter: bool,
}

impl RetrySchedule {
    /// Exponential backoff capped at [`DEFAULT_MAX_DELAY`], no jitter.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff: BackoffStrategy::Exponential {
                max_delay: DEFAULT_MAX_DELAY,
            },
            jitter: false,
        }
    }

    /// A single attempt, never retried.
    #[must_use]
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// The schedule a policy asks for.
    #[must_use]
    pub fn from_policy(policy: &ConsistencyPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts(),
            base_delay: policy.retry_delay,
            backoff: policy.backoff,
            jitter: policy.jitter,
        }
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Enables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay to wait after failed attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32, jitter: &dyn JitterSource) -> Duration {
        let delay = match self.backoff {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential { max_delay } => {
                let shift = attempt.saturating_sub(1).min(31);
                self.base_delay
                    .saturating_mul(1_u32 << shift)
                    .min(max_delay)
            }
        };
        if self.jitter {
            delay.mul_f64(jitter.jitter_factor().clamp(0.0, 1.0))
        } else {
            delay
        }
    }
}

/// Time, sleep and jitter sources used by the retry loop.
#[derive(Clone, Copy)]
pub struct RetryEnv<'a> {
    /// Deadline checks.
    pub clock: &'a dyn Clock,
    /// Backoff sleeps.
    pub sleeper: &'a dyn Sleeper,
    /// Jitter factors.
    pub jitter: &'a dyn JitterSource,
}

/// Runs `attempt_fn` until it succeeds, fails with an error `should_retry`
/// rejects, or the schedule is exhausted. Returns the value and the number
/// of attempts made.
///
/// Before the first attempt an expired deadline yields
/// `DeadlineExceeded`; before a retry it surfaces the last retryable error
/// instead. Cancellation yields `Cancelled` at any point, including during a
/// backoff sleep.
///
/// # Errors
///
/// Returns the last error from `attempt_fn`, `DomainError::Cancelled` or
/// `DomainError::DeadlineExceeded`.
pub async fn run_with_retry<T, F, Fut, P, R>(
    cx: &OperationContext,
    schedule: &RetrySchedule,
    env: RetryEnv<'_>,
    should_retry: P,
    mut on_retry: R,
    mut attempt_fn: F,
) -> Result<(T, u32), DomainError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, DomainError>>,
    P: Fn(&DomainError) -> bool,
    R: FnMut(u32, &DomainError, Duration),
{
    let max_attempts = schedule.max_attempts.max(1);

    if cx.is_cancelled() {
        return Err(DomainError::Cancelled);
    }
    if cx.deadline_passed(env.clock) {
        return Err(DomainError::DeadlineExceeded);
    }

    let mut attempt = 1;
    loop {
        let error = match attempt_fn(attempt).await {
            Ok(value) => return Ok((value, attempt)),
            Err(e) if should_retry(&e) && attempt < max_attempts => e,
            Err(e) => return Err(e),
        };

        let delay = schedule.delay_after(attempt, env.jitter);
        on_retry(attempt, &error, delay);

        tokio::select! {
            biased;
            () = cx.cancelled() => return Err(DomainError::Cancelled),
            () = env.sleeper.sleep(delay) => {}
        }

        if cx.is_cancelled() {
            return Err(DomainError::Cancelled);
        }
        if cx.deadline_passed(env.clock) {
            debug!(attempt, "deadline passed before retry");
            return Err(error);
        }
        attempt += 1;
    }
}

/// Timer-backed sleeper.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
