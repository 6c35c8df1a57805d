//! Snapshot identifiers.
//!
//! An id is a local timestamp `YYYYMMDD-HHMMSS`, optionally followed by a
//! two-digit collision counter (`-01`, `-02`, ...). The encoding is fixed
//! width, so lexicographic order equals chronological order.

use chrono::NaiveDateTime;
use std::fmt;

pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Suffix this agent appends to snapshots that are still being written.
pub const IN_PROGRESS_SUFFIX: &str = "-partial";

/// Older in-progress marker, still recognised and discarded.
pub const LEGACY_IN_PROGRESS_SUFFIX: &str = "-inprogress";

/// Highest collision counter; keeps the counter two digits wide.
pub const MAX_COUNTER: u32 = 99;

const TIMESTAMP_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(String);

impl SnapshotId {
    pub fn from_time(time: NaiveDateTime) -> Self {
        Self(time.format(TIMESTAMP_FORMAT).to_string())
    }

    /// Same timestamp, disambiguated by `counter` (1..=[`MAX_COUNTER`]).
    pub fn with_counter(&self, counter: u32) -> Self {
        debug_assert!((1..=MAX_COUNTER).contains(&counter));
        let base = &self.0[..TIMESTAMP_LEN];
        Self(format!("{}-{:02}", base, counter))
    }

    /// Parse a committed snapshot directory name. Returns `None` for names
    /// that are not snapshot ids, including in-progress names.
    pub fn parse(name: &str) -> Option<Self> {
        let stamp = name.get(..TIMESTAMP_LEN)?;
        NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;

        let rest = &name[TIMESTAMP_LEN..];
        if !rest.is_empty() {
            let counter = rest.strip_prefix('-')?;
            if counter.len() != 2 || !counter.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
        }
        Some(Self(name.to_string()))
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        // Construction guarantees a valid prefix.
        NaiveDateTime::parse_from_str(&self.0[..TIMESTAMP_LEN], TIMESTAMP_FORMAT)
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn in_progress_name(&self) -> String {
        format!("{}{}", self.0, IN_PROGRESS_SUFFIX)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a directory name marks an unfinished snapshot.
pub fn is_in_progress_name(name: &str) -> bool {
    name.ends_with(IN_PROGRESS_SUFFIX) || name.ends_with(LEGACY_IN_PROGRESS_SUFFIX)
}

/// Id of an in-progress directory name, if it carries one.
pub fn parse_in_progress(name: &str) -> Option<SnapshotId> {
    name.strip_suffix(IN_PROGRESS_SUFFIX)
        .or_else(|| name.strip_suffix(LEGACY_IN_PROGRESS_SUFFIX))
        .and_then(SnapshotId::parse)
}
