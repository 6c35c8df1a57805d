//! Configuration management for the snapshot agent.
//!
//! Loads mount definitions from a TOML file. Every mount is validated before
//! any backup work starts.

use crate::fs::ignore;
use crate::retention::RetentionPolicy;
use crate::sync::rsync::DEFAULT_BINARY;
use crate::{AgentError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_INTERVAL_MINUTES: u64 = 5;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub mounts: Vec<MountConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Sync tool executable
    #[serde(default = "default_binary")]
    pub binary: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MountConfig {
    /// Directory to protect
    pub source: PathBuf,

    /// Snapshot destination root (default: `<parent>/backups-<name>`)
    #[serde(default)]
    pub backup: Option<PathBuf>,

    /// Minutes between backups
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Extra exclude patterns
    #[serde(default)]
    pub excludes: Vec<String>,

    #[serde(default)]
    pub retention: Option<RetentionConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum RetentionConfig {
    Tail {
        keep: usize,
    },
    Thin {
        #[serde(default)]
        unit_minutes: Option<u64>,
    },
}

impl RetentionConfig {
    /// Resolve into a policy; thin ages default to the mount interval.
    pub fn to_policy(&self, interval_minutes: u64) -> Result<RetentionPolicy> {
        match self {
            RetentionConfig::Tail { keep } => RetentionPolicy::tail(*keep),
            RetentionConfig::Thin { unit_minutes } => {
                let minutes = unit_minutes.unwrap_or(interval_minutes);
                RetentionPolicy::thin(Duration::from_secs(minutes * 60))
            }
        }
    }
}

/// A source directory paired with its snapshot root. Identity is `source`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub interval_minutes: u64,
    pub excludes: Vec<String>,
    pub retention: Option<RetentionPolicy>,
}

impl Mount {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        interval_minutes: u64,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            interval_minutes,
            excludes: Vec::new(),
            retention: None,
        }
    }

    pub fn with_excludes(mut self, excludes: Vec<String>) -> Self {
        self.excludes = excludes;
        self
    }

    pub fn with_retention(mut self, retention: Option<RetentionPolicy>) -> Self {
        self.retention = retention;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }

    /// Check the source is a readable directory.
    pub fn validate(&self) -> Result<()> {
        if !self.source.is_dir() {
            return Err(AgentError::Config(format!(
                "Source directory does not exist: {}",
                self.source.display()
            )));
        }
        std::fs::read_dir(&self.source).map_err(|e| {
            AgentError::Config(format!(
                "Source directory is not readable: {}: {}",
                self.source.display(),
                e
            ))
        })?;
        Ok(())
    }

    /// Everything that must hold before the first pass: a readable source
    /// and well-formed ignore files.
    pub fn preflight(&self) -> Result<()> {
        self.validate()?;
        ignore::compile(&self.source, &self.excludes)?;
        Ok(())
    }
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_binary() -> String {
    DEFAULT_BINARY.to_string()
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_MINUTES
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Resolved mounts, in file order.
    pub fn mounts(&self) -> Result<Vec<Mount>> {
        self.mounts
            .iter()
            .enumerate()
            .map(|(index, entry)| entry.resolve(index))
            .collect()
    }

    /// The configured mount whose source is `source`.
    pub fn find_mount(&self, source: &Path) -> Result<Option<Mount>> {
        let wanted = normalize_path(source);
        Ok(self.mounts()?.into_iter().find(|m| m.source == wanted))
    }
}

impl MountConfig {
    fn resolve(&self, index: usize) -> Result<Mount> {
        if self.interval == 0 {
            return Err(AgentError::Config(format!(
                "mounts[{}].interval must be greater than zero",
                index
            )));
        }
        let source = normalize_path(&self.source);
        let destination = match &self.backup {
            Some(backup) => normalize_path(backup),
            None => default_backup_dir(&source),
        };
        let retention = self
            .retention
            .as_ref()
            .map(|r| r.to_policy(self.interval))
            .transpose()
            .map_err(|e| AgentError::Config(format!("mounts[{}].retention: {}", index, e)))?;

        Ok(Mount::new(source, destination, self.interval)
            .with_excludes(self.excludes.clone())
            .with_retention(retention))
    }
}

/// `<parent>/backups-<name>` next to the source.
pub fn default_backup_dir(source: &Path) -> PathBuf {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    let parent = source.parent().unwrap_or(source);
    parent.join(format!("backups-{}", name))
}

/// Expand `~` and make `path` absolute, resolving symlinks when it exists.
pub fn normalize_path(path: &Path) -> PathBuf {
    let expanded = match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    };

    if let Ok(canonical) = std::fs::canonicalize(&expanded) {
        return canonical;
    }
    if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(&expanded))
            .unwrap_or(expanded)
    }
}
