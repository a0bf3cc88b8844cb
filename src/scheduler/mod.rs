//! Task queue scheduler.
//!
//! Owns the per-task pagination loop: one task at a time, first-OPEN-by-index.

mod runner;

pub use runner::{advance, spawn_session_driver, AdvanceOutcome};

pub(crate) use runner::log_session;
