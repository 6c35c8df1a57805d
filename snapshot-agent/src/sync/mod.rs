//! External file synchronization tool.
//!
//! The agent never copies file data itself. It describes each run as a
//! [`SyncInvocation`] and hands it to a [`SyncTool`], normally the `rsync`
//! subprocess adapter in [`rsync`].

pub mod detector;
pub mod executor;
pub mod rsync;

#[cfg(test)]
pub(crate) mod fake;

use crate::fs::ignore::IgnoreRule;
use crate::Result;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;

pub use detector::ChangeDetector;
pub use executor::SyncExecutor;
pub use rsync::RsyncTool;

/// Archive mode, compression, verbose listing, and mirror deletion.
const BASE_FLAGS: [&str; 2] = ["-avz", "--delete"];

/// One run of the sync tool: mirror `source` into `destination`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncInvocation {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Previous snapshot to hardlink unchanged files from.
    pub link_dest: Option<PathBuf>,
    pub filters: Vec<IgnoreRule>,
    pub extra_flags: Vec<String>,
}

impl SyncInvocation {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            link_dest: None,
            filters: Vec::new(),
            extra_flags: Vec::new(),
        }
    }

    pub fn with_filters(mut self, filters: &[IgnoreRule]) -> Self {
        self.filters = filters.to_vec();
        self
    }

    pub fn with_link_dest(mut self, link_dest: Option<PathBuf>) -> Self {
        self.link_dest = link_dest;
        self
    }

    pub fn with_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_flags.extend(flags.into_iter().map(Into::into));
        self
    }

    /// Command-line arguments, in the order the tool must see them. Filters
    /// keep their compiled order since the tool applies the first match.
    /// Paths are passed through byte for byte.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = BASE_FLAGS.iter().map(OsString::from).collect();
        args.extend(self.extra_flags.iter().map(OsString::from));
        args.extend(
            self.filters
                .iter()
                .map(|rule| OsString::from(rule.to_filter_arg())),
        );

        if let Some(link_dest) = &self.link_dest {
            let mut arg = OsString::from("--link-dest=");
            arg.push(link_dest);
            args.push(arg);
        }

        // Trailing slash: copy the contents of source, not the directory.
        let mut source = self.source.clone().into_os_string();
        if !source.as_encoded_bytes().ends_with(b"/") {
            source.push("/");
        }
        args.push(source);
        args.push(self.destination.clone().into_os_string());
        args
    }
}

/// What the tool reported for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[async_trait]
pub trait SyncTool: Send + Sync {
    /// Itemized dry run; nothing on disk changes.
    async fn dry_run(&self, invocation: &SyncInvocation) -> Result<ToolOutput>;

    /// Real transfer. With `show_progress` the tool's progress output is
    /// rendered while it runs.
    async fn sync(&self, invocation: &SyncInvocation, show_progress: bool) -> Result<ToolOutput>;
}
