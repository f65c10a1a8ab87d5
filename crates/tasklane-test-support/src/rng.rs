//! Test jitter: deterministic `JitterSource` implementations for tests.

use tasklane_core::rng::JitterSource;

/// Jitter that never shortens a delay.
#[derive(Debug, Clone, Copy)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn jitter_factor(&self) -> f64 {
        1.0
    }
}

/// Jitter that always returns the same factor.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn jitter_factor(&self) -> f64 {
        self.0
    }
}
