//! Snapshot retention.
//!
//! Selection is pure and happens over the full list of committed ids before
//! anything is deleted. The newest snapshot is never selected.

use crate::snapshot::{SnapshotId, SnapshotStore};
use crate::{AgentError, Result};
use chrono::NaiveDateTime;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep the newest `keep` snapshots.
    Tail { keep: usize },
    /// Keep the newest snapshot of each age bucket `[2^(k-1), 2^k)`,
    /// ages measured in whole `unit`s.
    Thin { unit: Duration },
}

impl RetentionPolicy {
    pub fn tail(keep: usize) -> Result<Self> {
        if keep == 0 {
            return Err(AgentError::Config(
                "tail retention must keep at least one snapshot".to_string(),
            ));
        }
        Ok(RetentionPolicy::Tail { keep })
    }

    pub fn thin(unit: Duration) -> Result<Self> {
        if unit.as_secs() == 0 {
            return Err(AgentError::Config(
                "thin retention unit must be at least one second".to_string(),
            ));
        }
        Ok(RetentionPolicy::Thin { unit })
    }
}

impl fmt::Display for RetentionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionPolicy::Tail { keep } => write!(f, "tail({})", keep),
            RetentionPolicy::Thin { unit } => write!(f, "thin({}s)", unit.as_secs()),
        }
    }
}

/// Age bucket of an age in whole units: 0 for age 0, otherwise `k` such that
/// `2^(k-1) <= age < 2^k`.
fn bucket(age: u64) -> u32 {
    u64::BITS - age.leading_zeros()
}

fn age_in_units(id: &SnapshotId, now: NaiveDateTime, unit: Duration) -> u64 {
    let secs = (now - id.timestamp()).num_seconds().max(0) as u64;
    secs / unit.as_secs().max(1)
}

/// Ids to delete from `ids` (oldest first), returned oldest first.
pub fn select_to_delete(
    ids: &[SnapshotId],
    policy: &RetentionPolicy,
    now: NaiveDateTime,
) -> Vec<SnapshotId> {
    let Some(newest) = ids.iter().max() else {
        return Vec::new();
    };

    match policy {
        RetentionPolicy::Tail { keep } => {
            let keep = (*keep).max(1);
            let mut sorted: Vec<&SnapshotId> = ids.iter().collect();
            sorted.sort();
            let cut = sorted.len().saturating_sub(keep);
            sorted[..cut].iter().map(|id| (*id).clone()).collect()
        }
        RetentionPolicy::Thin { unit } => {
            let mut sorted: Vec<&SnapshotId> = ids.iter().collect();
            sorted.sort();

            let mut occupied = HashSet::new();
            occupied.insert(bucket(age_in_units(newest, now, *unit)));

            let mut doomed: Vec<SnapshotId> = sorted
                .iter()
                .rev()
                .filter(|id| **id != newest)
                .filter(|id| !occupied.insert(bucket(age_in_units(id, now, *unit))))
                .map(|id| (*id).clone())
                .collect();
            doomed.reverse();
            doomed
        }
    }
}

/// Apply `policy` to the committed snapshots in `store`.
///
/// Deletion failures do not stop the remaining deletions; they are collected
/// into one [`AgentError::Retention`].
pub fn prune(
    store: &SnapshotStore,
    policy: &RetentionPolicy,
    now: NaiveDateTime,
) -> Result<Vec<SnapshotId>> {
    let ids: Vec<SnapshotId> = store.committed()?.into_iter().map(|s| s.id).collect();
    let doomed = select_to_delete(&ids, policy, now);

    let mut deleted = Vec::new();
    let mut failed = Vec::new();
    for id in doomed {
        match store.delete(&id) {
            Ok(()) => {
                info!("Removed old snapshot {} ({})", id, policy);
                deleted.push(id);
            }
            Err(e) => {
                warn!("Failed to remove snapshot {}: {}", id, e);
                failed.push(id.to_string());
            }
        }
    }

    if failed.is_empty() {
        Ok(deleted)
    } else {
        Err(AgentError::Retention { failed })
    }
}
