//! Tasklane Core: shared abstractions for the consistency engine.
//!
//! This crate defines the fundamental traits and types that the command bus,
//! the consistency engine and the storage backends depend on. It contains no
//! infrastructure code.

pub mod aggregate;
pub mod clock;
pub mod command;
pub mod context;
pub mod error;
pub mod event;
pub mod event_log;
pub mod rng;
pub mod sleep;
pub mod storage;
pub mod version;
pub mod violation;
