//! Per-line keep/drop decision and on-disk record format.

use chrono::NaiveDateTime;

/// Timestamp prefix of every persisted record.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Identifier substring a line must contain to belong to `pid`.
pub fn owner_identifier(pid: u32) -> String {
    format!("({pid})")
}

/// True if the line is non-empty and mentions the owner identifier.
pub fn keep(line: &str, owner: &str) -> bool {
    !line.is_empty() && line.contains(owner)
}

/// Render a captured line as `"<timestamp>  <line>\n"`.
pub fn format(line: &str, timestamp: NaiveDateTime) -> Vec<u8> {
    format!("{}  {}\n", timestamp.format(TIMESTAMP_FORMAT), line).into_bytes()
}
