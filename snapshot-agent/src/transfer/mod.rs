//! Transfer progress reporting.

pub mod progress;
