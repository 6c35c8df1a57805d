//! Custom error types for the snapshot agent.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Which sync tool invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOperation {
    DryRun,
    Sync,
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOperation::DryRun => f.write_str("dry-run change check"),
            SyncOperation::Sync => f.write_str("snapshot sync"),
        }
    }
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{}: {operation} failed (exit code {}): {}", .mount.display(), fmt_code(.exit_code), fmt_stderr(.stderr))]
    SyncTool {
        mount: PathBuf,
        operation: SyncOperation,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to launch sync tool `{binary}`: {source}")]
    Launch {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Retention error: failed to delete {} snapshot(s): {}", .failed.len(), .failed.join(", "))]
    Retention { failed: Vec<String> },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Task error: {0}")]
    Task(String),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn fmt_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
}

fn fmt_stderr(stderr: &str) -> &str {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        "no diagnostic output"
    } else {
        trimmed
    }
}

impl AgentError {
    /// Process exit code for this error, propagating the sync tool's own code.
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::SyncTool {
                exit_code: Some(code),
                ..
            } if *code != 0 => *code,
            _ => 1,
        }
    }

    /// Errors that must stop the process before any snapshot work begins.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Config(_) | AgentError::Toml(_))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
