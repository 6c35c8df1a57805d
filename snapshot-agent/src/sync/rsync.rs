//! `rsync` subprocess adapter.

use super::{SyncInvocation, SyncTool, ToolOutput};
use crate::transfer::progress::{LineSplitter, ProgressDisplay};
use crate::{AgentError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

pub const DEFAULT_BINARY: &str = "rsync";

/// Runs the system `rsync` binary.
#[derive(Debug, Clone)]
pub struct RsyncTool {
    binary: String,
}

impl RsyncTool {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn command(&self, invocation: &SyncInvocation) -> Command {
        let args = invocation.args();
        debug!(
            "{} {}",
            self.binary,
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut cmd = std::process::Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group: a terminal Ctrl+C reaches the agent, which lets
        // the running transfer finish instead of killing it halfway.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut cmd = Command::from(cmd);
        // If the agent drops the run (runtime shutdown, panic), take the
        // transfer down with it instead of leaving it orphaned.
        cmd.kill_on_drop(true);
        cmd
    }

    fn launch_error(&self, source: std::io::Error) -> AgentError {
        AgentError::Launch {
            binary: self.binary.clone(),
            source,
        }
    }

    async fn run_captured(&self, invocation: &SyncInvocation) -> Result<ToolOutput> {
        let output = self
            .command(invocation)
            .output()
            .await
            .map_err(|e| self.launch_error(e))?;

        let mut splitter = LineSplitter::new();
        let mut stdout = splitter.push(&output.stdout);
        stdout.extend(splitter.finish());

        Ok(ToolOutput {
            exit_code: output.status.code(),
            stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_with_progress(&self, invocation: &SyncInvocation) -> Result<ToolOutput> {
        let mut child = self
            .command(invocation)
            .spawn()
            .map_err(|e| self.launch_error(e))?;

        let mut child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();

        // Drain stderr concurrently so a chatty tool cannot block on a full pipe.
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stderr) = child_stderr {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            buf
        });

        let mut display = ProgressDisplay::new();
        let mut splitter = LineSplitter::new();
        let mut stdout = Vec::new();

        if let Some(out) = child_stdout.as_mut() {
            let mut chunk = [0u8; 8192];
            loop {
                let n = out.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                for line in splitter.push(&chunk[..n]) {
                    display.observe(&line);
                    stdout.push(line);
                }
            }
        }
        stdout.extend(splitter.finish());
        display.finish();

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(ToolOutput {
            exit_code: status.code(),
            stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

impl Default for RsyncTool {
    fn default() -> Self {
        Self::new(DEFAULT_BINARY)
    }
}

#[async_trait]
impl SyncTool for RsyncTool {
    async fn dry_run(&self, invocation: &SyncInvocation) -> Result<ToolOutput> {
        self.run_captured(invocation).await
    }

    async fn sync(&self, invocation: &SyncInvocation, show_progress: bool) -> Result<ToolOutput> {
        if show_progress {
            self.run_with_progress(invocation).await
        } else {
            self.run_captured(invocation).await
        }
    }
}

/// Whether `binary` can be executed at all.
pub async fn is_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let tool = RsyncTool::new("/nonexistent/rsync-binary");
        let err = tool
            .dry_run(&SyncInvocation::new("/tmp", "/tmp/out"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_exit_code_and_stderr_are_captured() {
        // `false` ignores its arguments and exits 1.
        if !std::path::Path::new("/bin/false").exists() {
            return;
        }
        let tool = RsyncTool::new("/bin/false");
        let output = tool
            .sync(&SyncInvocation::new("/tmp", "/tmp/out"), false)
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(1));
        assert!(!output.success());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_run_kills_the_child() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let temp = tempfile::TempDir::new()?;
        let pid_file = temp.path().join("pid");
        let script = temp.path().join("slow-sync");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho $$ > {}\nexec sleep 30\n", pid_file.display()),
        )?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;

        let tool = RsyncTool::new(script.to_string_lossy());
        let invocation = SyncInvocation::new(temp.path(), temp.path().join("out"));
        let run = tokio::time::timeout(Duration::from_millis(500), tool.sync(&invocation, false));
        assert!(run.await.is_err(), "the slow sync should still be running");

        let pid = std::fs::read_to_string(&pid_file)?.trim().to_string();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).unwrap_or_default();
        let running = status
            .lines()
            .any(|l| l.starts_with("State:") && !l.contains("zombie"));
        assert!(!running, "child {} survived the dropped run", pid);
        Ok(())
    }

    #[tokio::test]
    async fn test_availability_probe() {
        assert!(!is_available("/nonexistent/rsync-binary").await);
    }
}
