//! Session lifecycle manager.

mod manager;

pub use manager::*;
