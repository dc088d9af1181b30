//! On-disk layout of captured logs: `root/YYYYMM/YYYYMMDD.log`.
//!
//! Directory and file names double as the sort keys used by the retention
//! sweep, so they must stay fixed-width and zero-padded.

use chrono::NaiveDate;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Extension of every day file.
pub const LOG_EXTENSION: &str = ".log";

/// Advisory lock file held by the active session, inside the log root.
pub const LOCK_FILE_NAME: &str = ".lock";

/// Day key, e.g. `20230110`.
pub fn day_key(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Month key, e.g. `202301`.
pub fn month_key(date: NaiveDate) -> String {
    date.format("%Y%m").to_string()
}

/// Path of the day file for `date` under `root`.
pub fn log_file_path(root: &Path, date: NaiveDate) -> PathBuf {
    root.join(month_key(date))
        .join(format!("{}{}", day_key(date), LOG_EXTENSION))
}

/// Exclusive advisory lock on a log root.
///
/// Guarantees at most one writer per root across processes. Released when
/// dropped or explicitly via [`RootLock::release`].
#[derive(Debug)]
pub struct RootLock {
    file: File,
    path: PathBuf,
}

impl RootLock {
    pub fn acquire(root: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let path = root.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.try_lock_exclusive()?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) -> std::io::Result<()> {
        FileExt::unlock(&self.file)
    }
}

/// Append-only handle on the current day file.
///
/// Follows the calendar: when a write arrives for a later day than the one
/// currently open, the next day file is opened first.
#[derive(Debug)]
pub struct DailyLogFile {
    root: PathBuf,
    date: NaiveDate,
    path: PathBuf,
    file: File,
}

impl DailyLogFile {
    /// Open (creating if needed) the day file for `date`, positioned for append.
    pub fn open(root: &Path, date: NaiveDate) -> std::io::Result<Self> {
        let path = log_file_path(root, date);
        let file = open_append(&path)?;
        Ok(Self {
            root: root.to_path_buf(),
            date,
            path,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    /// Append `bytes` to the file for `today`, rolling over if the day changed.
    pub fn append(&mut self, bytes: &[u8], today: NaiveDate) -> std::io::Result<()> {
        if today != self.date {
            self.roll_over(today)?;
        }
        self.file.write_all(bytes)
    }

    fn roll_over(&mut self, today: NaiveDate) -> std::io::Result<()> {
        let path = log_file_path(&self.root, today);
        let file = open_append(&path)?;
        tracing::debug!(
            from = %self.path.display(),
            to = %path.display(),
            "day changed, rolling over log file"
        );
        self.file = file;
        self.path = path;
        self.date = today;
        Ok(())
    }

    /// Flush to disk and close.
    pub fn close(self) -> std::io::Result<()> {
        self.file.sync_all()
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
