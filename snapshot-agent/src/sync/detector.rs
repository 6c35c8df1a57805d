//! Dry-run change detection against the latest snapshot.

use super::{SyncInvocation, SyncTool};
use crate::config::Mount;
use crate::fs::ignore::IgnoreRule;
use crate::snapshot::Snapshot;
use crate::utils::errors::SyncOperation;
use crate::{AgentError, Result};
use std::sync::Arc;
use tracing::debug;

/// Summary lines the tool prints on every run, changed or not.
pub const NOISE_PREFIXES: [&str; 4] = [
    "sending incremental file list",
    "sent ",
    "total size ",
    "delta-transmission ",
];

pub struct ChangeDetector {
    tool: Arc<dyn SyncTool>,
}

impl ChangeDetector {
    pub fn new(tool: Arc<dyn SyncTool>) -> Self {
        Self { tool }
    }

    /// Compare the mount source with `previous` without touching either.
    pub async fn has_changes(
        &self,
        mount: &Mount,
        rules: &[IgnoreRule],
        previous: &Snapshot,
    ) -> Result<bool> {
        let invocation = SyncInvocation::new(&mount.source, &previous.path)
            .with_flags(["--dry-run", "--itemize-changes"])
            .with_filters(rules);

        let output = self.tool.dry_run(&invocation).await?;
        if !output.success() {
            return Err(AgentError::SyncTool {
                mount: mount.source.clone(),
                operation: SyncOperation::DryRun,
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        let changed = first_change(&output.stdout);
        if let Some(line) = changed {
            debug!(mount = %mount.source.display(), "First change: {}", line);
        }
        Ok(changed.is_some())
    }
}

/// First output line that is neither blank nor a known summary line.
pub fn first_change(lines: &[String]) -> Option<&str> {
    lines
        .iter()
        .map(|line| line.trim())
        .find(|line| !line.is_empty() && !NOISE_PREFIXES.iter().any(|p| line.starts_with(p)))
}
