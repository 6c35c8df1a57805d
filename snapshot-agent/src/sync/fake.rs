//! In-process stand-in for the sync tool, used by tests.
//!
//! Copies trees with `std::fs`, hardlinks files unchanged since the link
//! base, and reports differences in the tool's itemized format. Filters are
//! applied like rsync does: first matching rule wins, and an excluded
//! directory is not descended into.

use super::{SyncInvocation, SyncTool, ToolOutput};
use crate::fs::ignore::{FilterAction, IgnoreRule};
use crate::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use walkdir::WalkDir;

#[derive(Default)]
pub struct FakeSyncTool {
    scripted_dry_runs: Mutex<VecDeque<ToolOutput>>,
    failing_sources: Mutex<HashSet<PathBuf>>,
    dirty_sources: Mutex<HashSet<PathBuf>>,
    sync_delay: Mutex<Option<Duration>>,
    dry_run_calls: Mutex<Vec<SyncInvocation>>,
    sync_calls: Mutex<Vec<SyncInvocation>>,
}

impl FakeSyncTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `output` from the next dry run instead of diffing.
    pub fn script_dry_run(&self, output: ToolOutput) {
        self.scripted_dry_runs.lock().unwrap().push_back(output);
    }

    /// Real syncs of `source` exit 23 after writing part of the tree.
    pub fn fail_source(&self, source: &Path) {
        self.failing_sources.lock().unwrap().insert(source.to_path_buf());
    }

    /// Dry runs of `source` always report a change.
    pub fn dirty_source(&self, source: &Path) {
        self.dirty_sources.lock().unwrap().insert(source.to_path_buf());
    }

    pub fn set_sync_delay(&self, delay: Duration) {
        *self.sync_delay.lock().unwrap() = Some(delay);
    }

    pub fn dry_run_calls(&self) -> Vec<SyncInvocation> {
        self.dry_run_calls.lock().unwrap().clone()
    }

    pub fn sync_calls(&self) -> Vec<SyncInvocation> {
        self.sync_calls.lock().unwrap().clone()
    }
}

/// Glob match with rsync wildcards: `*` and `?` stop at `/`, `**` does not.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) if rest.first() == Some(&b'*') => {
            let rest = &rest[1..];
            (0..=text.len()).any(|i| glob_match(rest, &text[i..]))
        }
        Some((b'*', rest)) => (0..=text.len())
            .take_while(|&i| i == 0 || text[i - 1] != b'/')
            .any(|i| glob_match(rest, &text[i..])),
        Some((b'?', rest)) => {
            matches!(text.split_first(), Some((c, tail)) if *c != b'/' && glob_match(rest, tail))
        }
        Some((p, rest)) => {
            matches!(text.split_first(), Some((c, tail)) if c == p && glob_match(rest, tail))
        }
    }
}

/// Whether `pattern` matches the transfer-relative path `rel`.
fn rule_matches(pattern: &str, rel: &str) -> bool {
    let (anchored, pattern) = match pattern.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, pattern),
    };
    if !pattern.contains('/') && !pattern.contains("**") {
        let name = rel.rsplit('/').next().unwrap_or(rel);
        return glob_match(pattern.as_bytes(), name.as_bytes());
    }
    if anchored {
        return glob_match(pattern.as_bytes(), rel.as_bytes());
    }
    std::iter::once(0)
        .chain(rel.match_indices('/').map(|(i, _)| i + 1))
        .any(|start| glob_match(pattern.as_bytes(), rel[start..].as_bytes()))
}

/// Whether the file at `rel` survives `rules`, checking every ancestor
/// directory first.
pub fn passes_filters(rel: &str, rules: &[IgnoreRule]) -> bool {
    let parts: Vec<&str> = rel.split('/').collect();
    (1..=parts.len()).all(|depth| {
        let prefix = parts[..depth].join("/");
        rules
            .iter()
            .find(|rule| rule_matches(&rule.pattern, &prefix))
            .map_or(true, |rule| rule.action == FilterAction::Include)
    })
}

fn files_under(root: &Path, rules: &[IgnoreRule]) -> BTreeMap<PathBuf, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let rel = e.path().strip_prefix(root).ok()?.to_path_buf();
            if !passes_filters(&rel.to_string_lossy().replace('\\', "/"), rules) {
                return None;
            }
            let content = fs::read(e.path()).ok()?;
            Some((rel, content))
        })
        .collect()
}

fn ok_output(stdout: Vec<String>) -> ToolOutput {
    ToolOutput {
        exit_code: Some(0),
        stdout,
        stderr: String::new(),
    }
}

#[async_trait]
impl SyncTool for FakeSyncTool {
    async fn dry_run(&self, invocation: &SyncInvocation) -> Result<ToolOutput> {
        self.dry_run_calls.lock().unwrap().push(invocation.clone());

        if let Some(output) = self.scripted_dry_runs.lock().unwrap().pop_front() {
            return Ok(output);
        }

        let mut stdout = vec!["sending incremental file list".to_string()];
        if self.dirty_sources.lock().unwrap().contains(&invocation.source) {
            stdout.push(">f.st...... always-dirty".to_string());
        }

        let source = files_under(&invocation.source, &invocation.filters);
        let target = files_under(&invocation.destination, &invocation.filters);
        for (rel, content) in &source {
            match target.get(rel) {
                Some(existing) if existing == content => {}
                _ => stdout.push(format!(">f+++++++++ {}", rel.display())),
            }
        }
        for rel in target.keys().filter(|rel| !source.contains_key(*rel)) {
            stdout.push(format!("*deleting   {}", rel.display()));
        }

        stdout.push(String::new());
        stdout.push("sent 120 bytes  received 16 bytes  272.00 bytes/sec".to_string());
        stdout.push("total size is 64  speedup is 0.47 (DRY RUN)".to_string());
        Ok(ok_output(stdout))
    }

    async fn sync(&self, invocation: &SyncInvocation, _show_progress: bool) -> Result<ToolOutput> {
        self.sync_calls.lock().unwrap().push(invocation.clone());

        let delay = *self.sync_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        fs::create_dir_all(&invocation.destination)?;

        if self.failing_sources.lock().unwrap().contains(&invocation.source) {
            fs::write(invocation.destination.join(".half-written"), b"partial")?;
            return Ok(ToolOutput {
                exit_code: Some(23),
                stdout: Vec::new(),
                stderr: "rsync error: some files could not be transferred (code 23)".to_string(),
            });
        }

        let filters = &invocation.filters;
        let base = invocation
            .link_dest
            .as_deref()
            .map(|dir| files_under(dir, filters))
            .unwrap_or_default();
        for (rel, content) in files_under(&invocation.source, filters) {
            let target = invocation.destination.join(&rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            match (base.get(&rel), invocation.link_dest.as_deref()) {
                (Some(previous), Some(link_dest)) if *previous == content => {
                    fs::hard_link(link_dest.join(&rel), &target)?;
                }
                _ => fs::write(&target, &content)?,
            }
        }

        Ok(ok_output(vec!["sending incremental file list".to_string()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_wildcards() {
        assert!(glob_match(b"*.log", b"debug.log"));
        assert!(!glob_match(b"*.log", b"logs/debug.log"));
        assert!(glob_match(b"build/**", b"build/out/obj.o"));
        assert!(!glob_match(b"build/**", b"build"));
        assert!(glob_match(b"fil?.txt", b"file.txt"));
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let rules = vec![IgnoreRule::include("build/keep.txt"), IgnoreRule::exclude("build/**")];
        assert!(passes_filters("build/keep.txt", &rules));
        assert!(!passes_filters("build/app.bin", &rules));
        assert!(!passes_filters("build/out/obj.o", &rules));
        assert!(passes_filters("src/main.rs", &rules));

        let reversed = vec![IgnoreRule::exclude("build/**"), IgnoreRule::include("build/keep.txt")];
        assert!(!passes_filters("build/keep.txt", &reversed));
    }

    #[test]
    fn test_excluded_directory_hides_contents() {
        let rules = vec![IgnoreRule::include("*.txt"), IgnoreRule::exclude("cache")];
        assert!(!passes_filters("cache/notes.txt", &rules));
        assert!(passes_filters("notes.txt", &rules));
    }
}
