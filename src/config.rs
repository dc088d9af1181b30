use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Retention applied when none is configured or the configured value is out of range.
pub const DEFAULT_RETENTION_DAYS: u32 = 7;

/// Largest accepted retention window (two years).
pub const MAX_RETENTION_DAYS: u32 = 730;

/// Top-level configuration loaded from logkeep.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct LogkeepConfig {
    pub capture: CaptureConfig,
    pub source: SourceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub root: PathBuf,
    pub level: String,
    pub retention_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

/// Number of days of log files kept by the retention sweep.
///
/// Always within `1..=MAX_RETENTION_DAYS`; anything else collapses to
/// `DEFAULT_RETENTION_DAYS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindow(u32);

impl RetentionWindow {
    pub fn new(days: i64) -> Self {
        if days <= 0 || days > MAX_RETENTION_DAYS as i64 {
            return Self(DEFAULT_RETENTION_DAYS);
        }
        Self(days as u32)
    }

    pub fn days(self) -> u32 {
        self.0
    }
}

impl Default for RetentionWindow {
    fn default() -> Self {
        Self(DEFAULT_RETENTION_DAYS)
    }
}

/// Errors that can occur while loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl LogkeepConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn retention(&self) -> RetentionWindow {
        RetentionWindow::new(self.capture.retention_days)
    }
}

// --- Default implementations ---

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("logs"),
            level: "*:d".to_string(),
            retention_days: DEFAULT_RETENTION_DAYS as i64,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            command: "logcat".to_string(),
            args: vec!["{level}".to_string()],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
