//! Parsing of rsync `--info=progress2` output.
//!
//! rsync rewrites its progress line with carriage returns, e.g.
//! `  1,234,567  42%   11.52MB/s    0:01:03 (xfr#5, to-chk=10/20)`.

use std::time::Duration;

/// Whole-transfer progress as reported by rsync.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    /// Bytes transferred so far
    pub transferred_bytes: u64,

    /// Percentage complete (0-100)
    pub percent_complete: u8,

    /// Current transfer speed, as printed by rsync
    pub speed: String,

    /// Estimated time remaining, as printed by rsync
    pub eta: String,
}

impl TransferProgress {
    /// One-line description for notifications.
    pub fn describe(&self) -> String {
        format!(
            "{}% done, {} transferred at {}, {} left",
            self.percent_complete,
            format_bytes(self.transferred_bytes),
            self.speed,
            self.eta
        )
    }
}

/// Parse one progress line; `None` for anything else rsync prints.
pub fn parse_progress_line(line: &str) -> Option<TransferProgress> {
    let mut fields = line.split_whitespace();

    let transferred_bytes = fields.next()?.replace(',', "").parse().ok()?;
    let percent_complete = fields.next()?.strip_suffix('%')?.parse().ok()?;
    let speed = fields.next()?;
    let eta = fields.next()?;
    if !speed.ends_with("/s") {
        return None;
    }

    Some(TransferProgress {
        transferred_bytes,
        percent_complete,
        speed: speed.to_string(),
        eta: eta.to_string(),
    })
}

/// Most recent progress line in a chunk of rsync output.
pub fn latest_progress(output: &str) -> Option<TransferProgress> {
    output
        .split(['\r', '\n'])
        .rev()
        .find_map(parse_progress_line)
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format duration as human-readable string
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
