//! Snapshot Agent Library
//!
//! Periodic, hardlinked snapshots of project directories. The byte transfer
//! is delegated to rsync; this crate decides when to snapshot, what to
//! exclude, how snapshots are committed, and which ones to keep.

pub mod config;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod retention;
pub mod scheduler;
pub mod snapshot;
pub mod sync;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, Mount};
pub use utils::errors::{AgentError, Result};
