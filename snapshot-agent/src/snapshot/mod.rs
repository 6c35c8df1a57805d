//! Snapshot naming and on-disk layout under a destination root.

pub mod id;
pub mod store;

pub use id::SnapshotId;
pub use store::{Snapshot, SnapshotState, SnapshotStore};
