//! Interval-driven backup loops.
//!
//! Each mount gets its own task running passes back to back with a fixed
//! sleep in between. Cancellation is only observed at the sleep and between
//! passes, so a sync that has started always finishes and commits.

use crate::config::Mount;
use crate::executor::{blocking, BackupExecutor, BackupOutcome};
use crate::snapshot::SnapshotStore;
use crate::{AgentError, Result};
use futures_util::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running { first_pass: bool },
    Sleeping,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub interval: Duration,
    /// Wait one interval before the first pass.
    pub skip_first: bool,
    /// Stop after this many passes.
    pub max_runs: Option<usize>,
}

impl LoopOptions {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            skip_first: false,
            max_runs: None,
        }
    }

    pub fn for_mount(mount: &Mount) -> Self {
        Self::new(mount.interval())
    }

    pub fn skip_first(mut self, skip_first: bool) -> Self {
        self.skip_first = skip_first;
        self
    }

    pub fn max_runs(mut self, max_runs: Option<usize>) -> Self {
        self.max_runs = max_runs;
        self
    }
}

/// What a loop did before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopReport {
    pub mount: PathBuf,
    pub passes: usize,
    pub created: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// Human-readable wait, e.g. `5 minute(s)` or `30 second(s)`.
pub fn describe_wait(interval: Duration) -> String {
    let secs = interval.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        format!("{} minute(s)", secs / 60)
    } else if secs > 0 {
        format!("{} second(s)", secs)
    } else {
        format!("{} ms", interval.as_millis())
    }
}

/// Sleep for `duration`; returns `false` if cancelled first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

/// The backup loop of one mount.
pub struct MountLoop {
    mount: Mount,
    options: LoopOptions,
    executor: Arc<BackupExecutor>,
    state: watch::Sender<LoopState>,
}

impl MountLoop {
    pub fn new(mount: Mount, options: LoopOptions, executor: Arc<BackupExecutor>) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            mount,
            options,
            executor,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: LoopState) {
        self.state.send_replace(state);
    }

    /// Run until cancelled or `max_runs` is reached.
    ///
    /// Only a configuration problem found before the first pass (missing
    /// source, malformed ignore file) is returned as an error; failed passes
    /// are logged and counted.
    pub async fn run(&self, cancel: CancellationToken) -> Result<LoopReport> {
        let mount = &self.mount;
        let source = mount.source.display().to_string();

        if self.options.interval.is_zero() {
            return Err(AgentError::Config(format!(
                "{}: interval must be greater than zero",
                source
            )));
        }
        {
            let mount = mount.clone();
            blocking(move || mount.preflight()).await?;
        }

        let mut report = LoopReport {
            mount: mount.source.clone(),
            ..Default::default()
        };

        let destination = mount.destination.clone();
        let cleanup = blocking(move || {
            SnapshotStore::open(&destination)?.discard_stale_in_progress()
        })
        .await;
        if let Err(e) = cleanup {
            warn!(mount = %source, "Could not clean destination at startup: {}", e);
        }

        if self.options.skip_first {
            self.set_state(LoopState::Sleeping);
            if !sleep_or_cancel(self.options.interval, &cancel).await {
                self.set_state(LoopState::Cancelled);
                return Ok(report);
            }
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.set_state(LoopState::Running {
                first_pass: report.passes == 0,
            });
            match self.executor.run_once(mount).await {
                Ok(BackupOutcome::Created(_)) => report.created += 1,
                Ok(BackupOutcome::Unchanged { .. }) => report.unchanged += 1,
                Err(e) => {
                    error!(mount = %source, "Backup failed: {}", e);
                    report.failed += 1;
                }
            }
            report.passes += 1;

            if self.options.max_runs.is_some_and(|max| report.passes >= max) {
                break;
            }

            info!(mount = %source, "Done, waiting {}", describe_wait(self.options.interval));
            self.set_state(LoopState::Sleeping);
            if !sleep_or_cancel(self.options.interval, &cancel).await {
                break;
            }
        }

        self.set_state(LoopState::Cancelled);
        info!(
            mount = %source,
            "Backup loop stopped after {} pass(es): {} created, {} unchanged, {} failed",
            report.passes, report.created, report.unchanged, report.failed
        );
        Ok(report)
    }
}

/// A spawned mount loop.
pub struct MountTask {
    pub mount: PathBuf,
    cancel: CancellationToken,
    state: watch::Receiver<LoopState>,
    handle: JoinHandle<Result<LoopReport>>,
}

impl MountTask {
    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Runs one independent loop per mount inside this process.
pub struct BackupScheduler {
    executor: Arc<BackupExecutor>,
    shutdown: CancellationToken,
    tasks: Vec<MountTask>,
}

impl BackupScheduler {
    pub fn new(executor: Arc<BackupExecutor>) -> Self {
        Self::with_shutdown(executor, CancellationToken::new())
    }

    /// Loops stop when `shutdown` is cancelled.
    pub fn with_shutdown(executor: Arc<BackupExecutor>, shutdown: CancellationToken) -> Self {
        Self {
            executor,
            shutdown,
            tasks: Vec::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the loop for `mount`. A mount may only be scheduled once.
    pub fn spawn(&mut self, mount: Mount, options: LoopOptions) -> Result<&MountTask> {
        if self.tasks.iter().any(|t| t.mount == mount.source) {
            return Err(AgentError::Config(format!(
                "mount {} is already scheduled",
                mount.source.display()
            )));
        }

        let source = mount.source.clone();
        let cancel = self.shutdown.child_token();
        let mount_loop = MountLoop::new(mount, options, Arc::clone(&self.executor));
        let state = mount_loop.subscribe();

        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move { mount_loop.run(loop_cancel).await });

        info!(mount = %source.display(), "Backup loop started");
        self.tasks.push(MountTask {
            mount: source,
            cancel,
            state,
            handle,
        });
        Ok(&self.tasks[self.tasks.len() - 1])
    }

    pub fn tasks(&self) -> &[MountTask] {
        &self.tasks
    }

    /// Current state of every loop.
    pub fn states(&self) -> Vec<(PathBuf, LoopState)> {
        self.tasks
            .iter()
            .map(|t| (t.mount.clone(), t.state()))
            .collect()
    }

    /// Stop one mount's loop; returns `false` if it is not scheduled.
    pub fn cancel(&self, source: &Path) -> bool {
        match self.tasks.iter().find(|t| t.mount == source) {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every loop to finish its current step and exit.
    pub async fn join_all(self) -> Vec<(PathBuf, Result<LoopReport>)> {
        let (mounts, handles): (Vec<PathBuf>, Vec<_>) = self
            .tasks
            .into_iter()
            .map(|t| (t.mount, t.handle))
            .unzip();

        let results = join_all(handles).await;
        mounts
            .into_iter()
            .zip(results)
            .map(|(mount, joined)| {
                let result = joined.unwrap_or_else(|e| {
                    Err(AgentError::Task(format!(
                        "backup loop for {} panicked or was aborted: {}",
                        mount.display(),
                        e
                    )))
                });
                (mount, result)
            })
            .collect()
    }
}
