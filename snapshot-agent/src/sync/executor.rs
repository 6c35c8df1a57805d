//! The real snapshot transfer.

use super::{SyncInvocation, SyncTool};
use crate::config::Mount;
use crate::fs::ignore::IgnoreRule;
use crate::snapshot::Snapshot;
use crate::utils::errors::SyncOperation;
use crate::{AgentError, Result};
use std::path::Path;
use std::sync::Arc;

const PROGRESS_FLAGS: [&str; 2] = ["--progress", "--info=progress2"];

pub struct SyncExecutor {
    tool: Arc<dyn SyncTool>,
    show_progress: bool,
}

impl SyncExecutor {
    pub fn new(tool: Arc<dyn SyncTool>) -> Self {
        Self {
            tool,
            show_progress: false,
        }
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Mirror the mount source into `destination`, hardlinking files that are
    /// unchanged since `link_base`.
    ///
    /// On failure `destination` is left as-is for inspection. Committing a
    /// successful run is up to the caller.
    pub async fn run(
        &self,
        mount: &Mount,
        rules: &[IgnoreRule],
        destination: &Path,
        link_base: Option<&Snapshot>,
    ) -> Result<()> {
        let mut invocation = SyncInvocation::new(&mount.source, destination)
            .with_filters(rules)
            .with_link_dest(link_base.map(|s| s.path.clone()));
        if self.show_progress {
            invocation = invocation.with_flags(PROGRESS_FLAGS);
        }

        let output = self.tool.sync(&invocation, self.show_progress).await?;
        if output.success() {
            Ok(())
        } else {
            Err(AgentError::SyncTool {
                mount: mount.source.clone(),
                operation: SyncOperation::Sync,
                exit_code: output.exit_code,
                stderr: output.stderr,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{SnapshotId, SnapshotState};
    use crate::sync::fake::FakeSyncTool;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_run_passes_link_base_and_filters() -> Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        std::fs::write(src.path().join("a.txt"), b"a")?;

        let tool = Arc::new(FakeSyncTool::new());
        let executor = SyncExecutor::new(tool.clone());
        let mount = Mount::new(src.path(), dst.path(), 5);
        let base = Snapshot {
            id: SnapshotId::parse("20240101-000000").unwrap(),
            state: SnapshotState::Committed,
            path: PathBuf::from("/backups/20240101-000000"),
        };
        let rules = vec![IgnoreRule::include("keep"), IgnoreRule::exclude("*")];

        let target = dst.path().join("20240102-000000-partial");
        executor.run(&mount, &rules, &target, Some(&base)).await?;

        let calls = tool.sync_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].link_dest, Some(base.path.clone()));
        assert_eq!(calls[0].filters, rules);
        assert!(calls[0].extra_flags.is_empty());
        assert!(target.join("a.txt").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_progress_flags_are_added() -> Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        let tool = Arc::new(FakeSyncTool::new());
        let executor = SyncExecutor::new(tool.clone()).with_progress(true);
        let mount = Mount::new(src.path(), dst.path(), 5);

        executor.run(&mount, &[], &dst.path().join("snap"), None).await?;
        assert_eq!(
            tool.sync_calls()[0].extra_flags,
            vec!["--progress".to_string(), "--info=progress2".to_string()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_keeps_destination() -> Result<()> {
        let src = TempDir::new()?;
        let dst = TempDir::new()?;
        let tool = Arc::new(FakeSyncTool::new());
        tool.fail_source(src.path());
        let executor = SyncExecutor::new(tool);
        let mount = Mount::new(src.path(), dst.path(), 5);

        let target = dst.path().join("20240102-000000-partial");
        std::fs::create_dir(&target)?;
        let err = executor.run(&mount, &[], &target, None).await.unwrap_err();

        assert_eq!(err.exit_code(), 23);
        assert!(target.exists());
        Ok(())
    }
}
