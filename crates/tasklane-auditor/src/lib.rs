//! Tasklane auditor: scheduled consistency audits and snapshot drift
//! detection.

pub mod config;
pub mod error;
pub mod runner;
