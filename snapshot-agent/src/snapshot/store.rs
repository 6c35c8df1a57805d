//! Snapshot directories under one destination root.
//!
//! The filesystem is the only index: every query re-reads the root.

use super::id::{self, SnapshotId};
use crate::{AgentError, Result};
use chrono::NaiveDateTime;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    InProgress,
    Committed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub state: SnapshotState,
    pub path: PathBuf,
}

/// A directory entry under the root, already decoded.
struct RootEntry {
    name: String,
    path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open the store, creating the destination root if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::new(root);
        fs::create_dir_all(&store.root)?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_entries(&self) -> Result<Vec<RootEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => entries.push(RootEntry {
                    name,
                    path: entry.path(),
                }),
                Err(raw) => {
                    warn!(
                        "{}",
                        AgentError::Encoding(format!(
                            "skipping non UTF-8 entry {:?} in {}",
                            raw,
                            self.root.display()
                        ))
                    );
                }
            }
        }
        Ok(entries)
    }

    /// All committed snapshots, oldest first.
    pub fn committed(&self) -> Result<Vec<Snapshot>> {
        let mut snapshots: Vec<Snapshot> = self
            .dir_entries()?
            .into_iter()
            .filter(|e| !id::is_in_progress_name(&e.name))
            .filter_map(|e| match SnapshotId::parse(&e.name) {
                Some(id) => Some(Snapshot {
                    id,
                    state: SnapshotState::Committed,
                    path: e.path,
                }),
                None => {
                    debug!("Ignoring non-snapshot directory {}", e.path.display());
                    None
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(snapshots)
    }

    /// Snapshots still marked in-progress.
    pub fn in_progress(&self) -> Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = self
            .dir_entries()?
            .into_iter()
            .filter(|e| id::is_in_progress_name(&e.name))
            .map(|e| e.path)
            .collect();
        paths.sort();
        Ok(paths)
    }

    pub fn latest_committed(&self) -> Result<Option<Snapshot>> {
        Ok(self.committed()?.pop())
    }

    /// Remove every in-progress directory. Their content was never verified,
    /// so they are dropped rather than resumed.
    pub fn discard_stale_in_progress(&self) -> Result<Vec<PathBuf>> {
        let stale = self.in_progress()?;
        for path in &stale {
            fs::remove_dir_all(path)?;
            info!("Removed unfinished snapshot: {}", path.display());
        }
        Ok(stale)
    }

    /// Pick an id for a snapshot started at `now` that collides with nothing
    /// already under the root.
    pub fn allocate_id(&self, now: NaiveDateTime) -> Result<SnapshotId> {
        let base = SnapshotId::from_time(now);
        let taken = |id: &SnapshotId| {
            self.root.join(id.as_str()).exists() || self.root.join(id.in_progress_name()).exists()
        };
        if !taken(&base) {
            return Ok(base);
        }
        (1..=id::MAX_COUNTER)
            .map(|counter| base.with_counter(counter))
            .find(|candidate| !taken(candidate))
            .ok_or_else(|| {
                AgentError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "more than {} snapshots started at {} in {}",
                        id::MAX_COUNTER,
                        base,
                        self.root.display()
                    ),
                ))
            })
    }

    /// Create the in-progress directory for `id`.
    pub fn begin(&self, id: &SnapshotId) -> Result<PathBuf> {
        let path = self.root.join(id.in_progress_name());
        fs::create_dir(&path)?;
        debug!("Started snapshot directory {}", path.display());
        Ok(path)
    }

    /// Publish an in-progress directory under its final name with a single
    /// rename.
    pub fn commit(&self, in_progress: &Path, id: &SnapshotId) -> Result<Snapshot> {
        let path = self.root.join(id.as_str());
        if path.exists() {
            return Err(AgentError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("snapshot {} already exists", path.display()),
            )));
        }
        fs::rename(in_progress, &path)?;
        Ok(Snapshot {
            id: id.clone(),
            state: SnapshotState::Committed,
            path,
        })
    }

    /// Delete a committed snapshot.
    pub fn delete(&self, id: &SnapshotId) -> Result<()> {
        fs::remove_dir_all(self.root.join(id.as_str()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn at(s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(12, 0, s)
            .unwrap()
    }

    #[test]
    fn test_latest_skips_in_progress_and_foreign() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir(root.join("20240102-115959"))?;
        fs::create_dir(root.join("20240102-120000"))?;
        fs::create_dir(root.join("20240102-120005-partial"))?;
        fs::create_dir(root.join("zz-notes"))?;
        fs::write(root.join("20240102-130000"), b"not a dir")?;

        let store = SnapshotStore::new(root);
        let latest = store.latest_committed()?.unwrap();
        assert_eq!(latest.id.as_str(), "20240102-120000");
        assert_eq!(latest.state, SnapshotState::Committed);
        assert_eq!(store.committed()?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_empty_root_has_no_latest() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = SnapshotStore::open(temp_dir.path().join("backups"))?;
        assert!(store.latest_committed()?.is_none());
        Ok(())
    }

    #[test]
    fn test_discard_stale_in_progress() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        fs::create_dir_all(root.join("20240102-120000-partial/sub"))?;
        fs::create_dir(root.join("20240102-110000-inprogress"))?;
        fs::create_dir(root.join("20240102-100000"))?;

        let store = SnapshotStore::new(root);
        let removed = store.discard_stale_in_progress()?;
        assert_eq!(removed.len(), 2);
        assert!(store.in_progress()?.is_empty());
        assert!(root.join("20240102-100000").exists());
        Ok(())
    }

    #[test]
    fn test_begin_and_commit() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = SnapshotStore::new(temp_dir.path());
        let id = store.allocate_id(at(0))?;

        let partial = store.begin(&id)?;
        fs::write(partial.join("file.txt"), b"data")?;
        assert!(store.latest_committed()?.is_none());

        let snapshot = store.commit(&partial, &id)?;
        assert!(!partial.exists());
        assert_eq!(fs::read(snapshot.path.join("file.txt"))?, b"data");
        assert_eq!(store.latest_committed()?.map(|s| s.id), Some(id));
        Ok(())
    }

    #[test]
    fn test_allocate_id_avoids_collisions() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = SnapshotStore::new(temp_dir.path());

        let first = store.allocate_id(at(0))?;
        let partial = store.begin(&first)?;
        store.commit(&partial, &first)?;

        let second = store.allocate_id(at(0))?;
        assert_eq!(second.as_str(), "20240102-120000-01");
        store.begin(&second)?;

        let third = store.allocate_id(at(0))?;
        assert_eq!(third.as_str(), "20240102-120000-02");
        Ok(())
    }

    #[test]
    fn test_allocate_id_stops_at_counter_limit() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = SnapshotStore::new(temp_dir.path());
        let base = SnapshotId::from_time(at(0));
        fs::create_dir(temp_dir.path().join(base.as_str()))?;
        for counter in 1..id::MAX_COUNTER {
            fs::create_dir(temp_dir.path().join(base.with_counter(counter).as_str()))?;
        }

        let last = store.allocate_id(at(0))?;
        assert_eq!(last.as_str(), "20240102-120000-99");
        store.begin(&last)?;

        assert!(store.allocate_id(at(0)).is_err());
        Ok(())
    }

    #[test]
    fn test_commit_refuses_to_overwrite() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = SnapshotStore::new(temp_dir.path());
        let id = SnapshotId::from_time(at(0));
        fs::create_dir(temp_dir.path().join(id.as_str()))?;
        let partial = store.begin(&id)?;
        assert!(store.commit(&partial, &id).is_err());
        assert!(partial.exists());
        Ok(())
    }
}
