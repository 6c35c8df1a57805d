//! Progress display for a running sync.
//!
//! With `--info=progress2` the sync tool rewrites a single status line using
//! carriage returns; the overall percentage is the token ending in `%`.

use indicatif::{ProgressBar, ProgressStyle};

/// Extract an overall percentage (0-100) from one line of tool output.
pub fn extract_percentage(line: &str) -> Option<u8> {
    line.split_whitespace().find_map(|chunk| {
        let numeric = chunk.strip_suffix('%')?;
        if numeric.is_empty() || !numeric.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        numeric.parse::<u8>().ok().filter(|p| *p <= 100)
    })
}

/// Splits a byte stream into lines on `\n` and `\r`, decoding lossily so file
/// names with invalid UTF-8 never abort a run.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' || byte == b'\r' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Flush a trailing line without terminator.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

/// Terminal progress bar fed from tool output lines.
pub struct ProgressDisplay {
    bar: ProgressBar,
    last_percent: Option<u8>,
}

impl ProgressDisplay {
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        if let Ok(style) = ProgressStyle::default_bar().template("Progress: [{bar:30}] {pos}%") {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self {
            bar,
            last_percent: None,
        }
    }

    /// Update from one output line; returns the new percentage if it moved.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        let percent = extract_percentage(line)?;
        if self.last_percent == Some(percent) {
            return None;
        }
        self.last_percent = Some(percent);
        self.bar.set_position(u64::from(percent));
        Some(percent)
    }

    pub fn finish(&self) {
        if self.last_percent.is_some() {
            self.bar.finish();
        } else {
            self.bar.finish_and_clear();
        }
    }
}

impl Default for ProgressDisplay {
    fn default() -> Self {
        Self::new()
    }
}
