//! Snapshot Agent - Main entry point
//!
//! Takes periodic rsync snapshots of project directories.

use anyhow::{anyhow, bail, Result};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use snapshot_agent::config::{normalize_path, RetentionConfig, DEFAULT_INTERVAL_MINUTES};
use snapshot_agent::daemon::shutdown::ShutdownCoordinator;
use snapshot_agent::executor::BackupExecutor;
use snapshot_agent::retention::RetentionPolicy;
use snapshot_agent::scheduler::{BackupScheduler, LoopOptions};
use snapshot_agent::sync::{RsyncTool, SyncTool};
use snapshot_agent::{utils, AgentError, Config, Mount};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", env = "SNAPSHOT_AGENT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take a single snapshot of a directory
    Once {
        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        retention: RetentionArgs,

        /// Show a progress bar while syncing
        #[arg(long)]
        progress: bool,
    },

    /// Snapshot a directory every interval until interrupted
    Repeated {
        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        retention: RetentionArgs,

        /// Minutes between snapshots
        #[arg(long, default_value_t = DEFAULT_INTERVAL_MINUTES)]
        interval: u64,

        /// Wait one interval before the first snapshot
        #[arg(long)]
        skip_first: bool,
    },

    /// Repeated snapshots for one mount from the config file
    RepeatedMount {
        /// Source directory of the mount (optional when only one is configured)
        #[arg(long, value_name = "DIR")]
        mount: Option<PathBuf>,

        /// Wait one interval before the first snapshot
        #[arg(long)]
        skip_first: bool,
    },

    /// Repeated snapshots for every mount from the config file
    RepeatedAll {
        /// Wait one interval before the first snapshot
        #[arg(long)]
        skip_first: bool,
    },
}

#[derive(ClapArgs, Debug)]
struct TargetArgs {
    /// Directory to back up
    #[arg(long, value_name = "DIR")]
    source_dir: PathBuf,

    /// Directory that holds the snapshots
    #[arg(long, value_name = "DIR")]
    dest_dir: PathBuf,

    /// Extra exclude pattern; may be given several times
    #[arg(long = "exclude", value_name = "PATTERN")]
    excludes: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PolicyKind {
    Tail,
    Thin,
}

#[derive(ClapArgs, Debug)]
struct RetentionArgs {
    /// Retention policy applied after each new snapshot
    #[arg(long, value_enum)]
    retention: Option<PolicyKind>,

    /// Snapshots to keep with `--retention tail`
    #[arg(long, requires = "retention", required_if_eq("retention", "tail"))]
    keep: Option<usize>,

    /// Age unit for `--retention thin` (default: the interval)
    #[arg(long, value_name = "MINUTES", requires = "retention")]
    thin_unit_minutes: Option<u64>,
}

impl RetentionArgs {
    fn policy(&self, interval_minutes: u64) -> snapshot_agent::Result<Option<RetentionPolicy>> {
        let config = match self.retention {
            None => return Ok(None),
            Some(PolicyKind::Tail) => RetentionConfig::Tail {
                keep: self.keep.unwrap_or(0),
            },
            Some(PolicyKind::Thin) => RetentionConfig::Thin {
                unit_minutes: self.thin_unit_minutes,
            },
        };
        config.to_policy(interval_minutes).map(Some)
    }
}

impl TargetArgs {
    fn into_mount(self, interval_minutes: u64, retention: &RetentionArgs) -> snapshot_agent::Result<Mount> {
        Ok(Mount::new(
            normalize_path(&self.source_dir),
            normalize_path(&self.dest_dir),
            interval_minutes,
        )
        .with_excludes(self.excludes)
        .with_retention(retention.policy(interval_minutes)?))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            let code = e
                .downcast_ref::<AgentError>()
                .map(AgentError::exit_code)
                .unwrap_or(1);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(args: Args) -> Result<()> {
    // Load configuration
    let config = args.config.as_deref().map(Config::from_file);

    // Initialize logging
    let log_level = args
        .log_level
        .clone()
        .or_else(|| {
            config
                .as_ref()
                .and_then(|c| c.as_ref().ok())
                .map(|c| c.log.level.clone())
        })
        .unwrap_or_else(|| "info".to_string());
    utils::logger::init(&log_level)?;

    let config = config.transpose()?.unwrap_or_default();
    let tool: Arc<dyn SyncTool> = Arc::new(RsyncTool::new(config.sync.binary.clone()));

    match args.command {
        Command::Once {
            target,
            retention,
            progress,
        } => {
            let mount = target.into_mount(DEFAULT_INTERVAL_MINUTES, &retention)?;
            tracing::info!(
                "Running one-off backup from {} to {}...",
                mount.source.display(),
                mount.destination.display()
            );
            let executor = BackupExecutor::new(tool).with_progress(progress);
            ShutdownCoordinator::new()
                .run_to_completion(executor.run_once(&mount))
                .await?;
            Ok(())
        }
        Command::Repeated {
            target,
            retention,
            interval,
            skip_first,
        } => {
            if interval == 0 {
                bail!("Interval must be greater than zero minutes");
            }
            let mount = target.into_mount(interval, &retention)?;
            tracing::info!(
                "Starting repeated backup from {} to {} every {} minute(s)...",
                mount.source.display(),
                mount.destination.display(),
                interval
            );
            run_loops(tool, vec![mount], skip_first).await
        }
        Command::RepeatedMount { mount, skip_first } => {
            let selected = match mount {
                Some(path) => config.find_mount(&path)?.ok_or_else(|| {
                    anyhow!(
                        "Mount with source {} is not defined in the configuration.",
                        path.display()
                    )
                })?,
                None => match config.mounts()?.as_slice() {
                    [] => bail!("No mounts configured for backups."),
                    [only] => only.clone(),
                    _ => bail!("Several mounts are configured; choose one with --mount."),
                },
            };
            tracing::info!(
                "Starting repeated backup for mount {} -> {} every {} minute(s)...",
                selected.source.display(),
                selected.destination.display(),
                selected.interval_minutes
            );
            run_loops(tool, vec![selected], skip_first).await
        }
        Command::RepeatedAll { skip_first } => {
            let mounts = config.mounts()?;
            if mounts.is_empty() {
                bail!("No mounts configured for backups.");
            }
            run_loops(tool, mounts, skip_first).await
        }
    }
}

/// Run one loop per mount until Ctrl+C or SIGTERM.
async fn run_loops(tool: Arc<dyn SyncTool>, mounts: Vec<Mount>, skip_first: bool) -> Result<()> {
    // Configuration problems are fatal before any snapshot work begins
    for mount in &mounts {
        mount.preflight()?;
    }

    let shutdown_coordinator = ShutdownCoordinator::new();
    let executor = Arc::new(BackupExecutor::new(tool));
    let mut scheduler = BackupScheduler::with_shutdown(executor, shutdown_coordinator.token());

    let count = mounts.len();
    for mount in mounts {
        let options = LoopOptions::for_mount(&mount).skip_first(skip_first);
        scheduler.spawn(mount, options)?;
    }
    tracing::info!(
        "Started {} repeated backup job(s). Press Ctrl+C to stop when you're done.",
        count
    );

    let signal_handle = tokio::spawn(async move {
        shutdown_coordinator.wait_for_signal().await;
    });

    let results = scheduler.join_all().await;
    signal_handle.abort();

    let mut first_error = None;
    for (mount, result) in results {
        match result {
            Ok(report) => tracing::info!(
                "{}: {} snapshot(s) created, {} unchanged, {} failed",
                mount.display(),
                report.created,
                report.unchanged,
                report.failed
            ),
            Err(e) => {
                tracing::error!("{}: {}", mount.display(), e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
