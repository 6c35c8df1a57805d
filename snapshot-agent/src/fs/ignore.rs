//! `.backupignore` discovery and compilation into sync filter rules.
//!
//! Every directory under a mount source may carry a `.backupignore` file.
//! Its patterns are scoped to that directory, `!pattern` re-includes a path,
//! and a trailing `/` covers the directory and everything beneath it.
//!
//! The sync tool evaluates filters first-match-wins, while ignore files are
//! written last-match-wins (a later `!keep` overrides an earlier `dir/`). The
//! compiler therefore emits the file-based rules in reverse precedence order:
//! deeper files before shallower ones, later lines before earlier ones.
//! Command-line excludes follow the whole file-based section.

use crate::{AgentError, Result};
use std::fmt;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Name of the per-directory ignore file.
pub const IGNORE_FILE_NAME: &str = ".backupignore";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Include,
    Exclude,
}

impl FilterAction {
    fn sign(self) -> char {
        match self {
            FilterAction::Include => '+',
            FilterAction::Exclude => '-',
        }
    }
}

/// One compiled filter rule, in sync tool pattern syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreRule {
    pub action: FilterAction,
    pub pattern: String,
}

impl IgnoreRule {
    pub fn include(pattern: impl Into<String>) -> Self {
        Self {
            action: FilterAction::Include,
            pattern: pattern.into(),
        }
    }

    pub fn exclude(pattern: impl Into<String>) -> Self {
        Self {
            action: FilterAction::Exclude,
            pattern: pattern.into(),
        }
    }

    /// Render as a single `--filter=` argument.
    pub fn to_filter_arg(&self) -> String {
        format!("--filter={}", self)
    }
}

impl fmt::Display for IgnoreRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action.sign(), self.pattern)
    }
}

/// Compile every ignore file under `source` plus `cli_patterns` into an
/// ordered rule list ready to hand to the sync tool.
pub fn compile(source: &Path, cli_patterns: &[String]) -> Result<Vec<IgnoreRule>> {
    let mut per_file: Vec<(usize, Vec<IgnoreRule>)> = Vec::new();

    for entry in WalkDir::new(source).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(AgentError::Config(format!(
                    "cannot read source directory {}: {}",
                    source.display(),
                    e
                )));
            }
            Err(e) => {
                warn!("Skipping unreadable entry while collecting ignore files: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_file() || entry.file_name() != IGNORE_FILE_NAME {
            continue;
        }

        let dir = entry.path().parent().unwrap_or(source);
        let relative = dir.strip_prefix(source).unwrap_or(Path::new(""));
        let Some(prefix) = relative.to_str() else {
            warn!(
                "{}",
                AgentError::Encoding(format!(
                    "skipping ignore file in non UTF-8 directory {}",
                    relative.display()
                ))
            );
            continue;
        };

        let bytes = std::fs::read(entry.path())?;
        let content = String::from_utf8(bytes).map_err(|_| {
            AgentError::Config(format!(
                "malformed ignore file {}: not valid UTF-8",
                entry.path().display()
            ))
        })?;

        let rules = parse_ignore_file(&content, &prefix.replace('\\', "/"));
        debug!("Loaded {} rule(s) from {}", rules.len(), entry.path().display());
        per_file.push((entry.depth(), rules));
    }

    // Stable: files at the same depth keep discovery order before reversal.
    per_file.sort_by_key(|(depth, _)| *depth);
    let mut rules: Vec<IgnoreRule> = per_file.into_iter().flat_map(|(_, r)| r).collect();
    rules.reverse();

    rules.extend(
        cli_patterns
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| IgnoreRule::exclude(p.clone())),
    );

    Ok(rules)
}

/// Parse the content of one ignore file located at `prefix` (relative to the
/// mount root, empty for the root itself). Rules come back in file order.
pub fn parse_ignore_file(content: &str, prefix: &str) -> Vec<IgnoreRule> {
    content
        .lines()
        .filter_map(|raw| {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }

            let (action, body) = match line.strip_prefix('!') {
                Some(rest) => (FilterAction::Include, rest),
                None => (FilterAction::Exclude, line),
            };

            let pattern = normalize_pattern(body, prefix);
            if pattern.is_empty() {
                return None;
            }
            Some(IgnoreRule { action, pattern })
        })
        .collect()
}

/// Scope `pattern` to `prefix` and expand a trailing `/` to `/**`.
pub fn normalize_pattern(pattern: &str, prefix: &str) -> String {
    let pattern = pattern.trim_start();
    let pattern = pattern.strip_prefix('/').unwrap_or(pattern);

    let mut full = if prefix.is_empty() {
        pattern.to_string()
    } else if pattern.is_empty() {
        prefix.to_string()
    } else {
        format!("{}/{}", prefix, pattern)
    };

    if full.ends_with('/') {
        full.push_str("**");
    }

    full.replace('\\', "/")
}
