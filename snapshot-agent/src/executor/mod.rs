//! Backup pass executor - one snapshot attempt for one mount.
//!
//! A pass ties the components together:
//! - discard in-progress leftovers under the destination root
//! - compile ignore rules
//! - dry-run against the latest snapshot and stop if nothing changed
//! - sync into a new in-progress directory, hardlinking against the latest
//! - commit by rename, then apply retention

use crate::config::Mount;
use crate::fs::ignore;
use crate::retention;
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::sync::{ChangeDetector, SyncExecutor, SyncTool};
use crate::Result;
use chrono::{Local, NaiveDateTime};
use std::sync::Arc;
use tracing::{info, warn};

/// How a pass ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Created(Snapshot),
    /// Nothing changed since `latest`; no snapshot was written.
    Unchanged { latest: Snapshot },
}

/// Runs backup passes. Holds no per-mount state, so one executor can serve
/// any number of mounts.
pub struct BackupExecutor {
    detector: ChangeDetector,
    sync: SyncExecutor,
}

impl BackupExecutor {
    pub fn new(tool: Arc<dyn SyncTool>) -> Self {
        Self {
            detector: ChangeDetector::new(Arc::clone(&tool)),
            sync: SyncExecutor::new(tool),
        }
    }

    /// Render the sync tool's progress while transferring.
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.sync = self.sync.with_progress(show_progress);
        self
    }

    /// Run one backup pass for `mount`.
    ///
    /// Directory walks, deletions and renames run on the blocking pool; only
    /// the sync tool is awaited on the runtime.
    pub async fn run_once(&self, mount: &Mount) -> Result<BackupOutcome> {
        let (store, previous, rules) = {
            let mount = mount.clone();
            blocking(move || {
                mount.validate()?;
                let store = SnapshotStore::open(&mount.destination)?;
                store.discard_stale_in_progress()?;
                let previous = store.latest_committed()?;
                let rules = ignore::compile(&mount.source, &mount.excludes)?;
                Ok((store, previous, rules))
            })
            .await?
        };

        if let Some(latest) = previous.as_ref() {
            if !self.detector.has_changes(mount, &rules, latest).await? {
                info!(
                    mount = %mount.source.display(),
                    "No changes detected since last backup; skipping new snapshot."
                );
                return Ok(BackupOutcome::Unchanged {
                    latest: latest.clone(),
                });
            }
        }

        let (id, in_progress) = {
            let store = store.clone();
            blocking(move || {
                let id = store.allocate_id(now())?;
                let path = store.begin(&id)?;
                Ok((id, path))
            })
            .await?
        };
        info!(
            mount = %mount.source.display(),
            "Running rsync to create snapshot: {}",
            in_progress.display()
        );

        self.sync
            .run(mount, &rules, &in_progress, previous.as_ref())
            .await?;

        let snapshot = {
            let store = store.clone();
            blocking(move || store.commit(&in_progress, &id)).await?
        };
        info!(mount = %mount.source.display(), "Snapshot created: {}", snapshot.path.display());

        if let Some(policy) = mount.retention.clone() {
            if let Err(e) = blocking(move || retention::prune(&store, &policy, now())).await {
                warn!(mount = %mount.source.display(), "Retention failed: {}", e);
            }
        }

        Ok(BackupOutcome::Created(snapshot))
    }
}

/// Run synchronous filesystem work on the blocking pool so it cannot stall
/// other mounts' loops.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}
