//! The external log-source process: severity tokens and command construction.

use crate::config::SourceConfig;
use std::process::Stdio;
use tokio::process::Command;

/// Minimum severity the log source should emit, in logcat's `*:<x>` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LevelFilter {
    #[default]
    Verbose,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Silent,
}

impl LevelFilter {
    pub fn token(self) -> &'static str {
        match self {
            LevelFilter::Verbose => "*:v",
            LevelFilter::Debug => "*:d",
            LevelFilter::Info => "*:i",
            LevelFilter::Warn => "*:w",
            LevelFilter::Error => "*:e",
            LevelFilter::Fatal => "*:f",
            LevelFilter::Silent => "*:s",
        }
    }

    /// Parse a level token. Empty or unrecognised input means verbose.
    pub fn parse_lenient(token: &str) -> Self {
        let token = token.trim();
        if token.is_empty() {
            return LevelFilter::Verbose;
        }
        match token.parse() {
            Ok(level) => level,
            Err(()) => {
                tracing::warn!(token, "unknown level filter, capturing verbose");
                LevelFilter::Verbose
            }
        }
    }
}

impl std::str::FromStr for LevelFilter {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "*:v" => Ok(LevelFilter::Verbose),
            "*:d" => Ok(LevelFilter::Debug),
            "*:i" => Ok(LevelFilter::Info),
            "*:w" => Ok(LevelFilter::Warn),
            "*:e" => Ok(LevelFilter::Error),
            "*:f" => Ok(LevelFilter::Fatal),
            "*:s" => Ok(LevelFilter::Silent),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for LevelFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Build the command arguments, replacing `{level}` and `{pid}` placeholders.
pub fn build_args(source: &SourceConfig, level: LevelFilter, owner_pid: u32) -> Vec<String> {
    let pid = owner_pid.to_string();
    source
        .args
        .iter()
        .map(|arg| arg.replace("{level}", level.token()).replace("{pid}", &pid))
        .collect()
}

/// Prepare the log-source command with stdout piped for line reading.
///
/// The child gets its own process group so teardown can terminate
/// everything it started, not just the direct child.
pub fn command(source: &SourceConfig, level: LevelFilter, owner_pid: u32) -> Command {
    let mut cmd = Command::new(&source.command);
    cmd.args(build_args(source, level, owner_pid))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .process_group(0)
        .kill_on_drop(true);
    cmd
}
