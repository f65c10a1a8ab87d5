//! Randomness abstraction for retry jitter.
//!
//! In production this wraps the thread-local RNG. Tests inject a source that
//! always returns the same factor so backoff delays are predictable.

use rand::Rng;

/// Source of jitter factors used to spread out retry delays.
pub trait JitterSource: Send + Sync {
    /// Returns a factor in `[0.5, 1.0]` applied to a computed backoff delay.
    fn jitter_factor(&self) -> f64;
}

/// Jitter drawn from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadJitter;

impl JitterSource for ThreadJitter {
    fn jitter_factor(&self) -> f64 {
        rand::rng().random_range(0.5..=1.0)
    }
}
