//! Retention sweep over the log root.
//!
//! Month directories older than the cutoff month are removed wholesale. In
//! the cutoff month itself, day files dated on or before the cutoff day are
//! removed. Later months are never inspected. All comparisons are plain
//! string comparisons of the fixed-width keys.
//!
//! Errors on individual entries are logged and skipped; a sweep never fails.

use crate::config::RetentionWindow;
use crate::log_file::{day_key, month_key, LOG_EXTENSION};
use chrono::{Days, Local, NaiveDate};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static MONTH_DIR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{6}$").unwrap());
static DAY_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^(\d{{8}}){}$", regex::escape(LOG_EXTENSION))).unwrap()
});

/// What a sweep removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub months_removed: usize,
    pub files_removed: usize,
    pub errors: usize,
}

/// Sweep `root` relative to today's local date.
pub fn sweep(root: &Path, retention: RetentionWindow) -> SweepReport {
    sweep_at(root, retention, Local::now().date_naive())
}

/// Sweep `root` as if today were `today`.
pub fn sweep_at(root: &Path, retention: RetentionWindow, today: NaiveDate) -> SweepReport {
    let mut report = SweepReport::default();

    let Some(cutoff) = today.checked_sub_days(Days::new(retention.days() as u64)) else {
        return report;
    };
    let cutoff_day = day_key(cutoff);
    let cutoff_month = month_key(cutoff);

    let entries = match std::fs::read_dir(root) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
        Err(e) => {
            tracing::warn!(
                error = %e,
                root = %root.display(),
                "failed to read log root for retention"
            );
            report.errors += 1;
            return report;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, root = %root.display(), "failed to read log root entry");
                report.errors += 1;
                continue;
            }
        };
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        if !MONTH_DIR.is_match(&name) {
            continue;
        }

        if name.as_str() < cutoff_month.as_str() {
            match delete_path(&path, true) {
                Ok(()) => {
                    tracing::debug!(month = %name, "removed expired month");
                    report.months_removed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %path.display(),
                        "failed to remove expired month"
                    );
                    report.errors += 1;
                }
            }
        } else if name == cutoff_month {
            sweep_month(&path, &cutoff_day, &mut report);
        }
    }

    if report != SweepReport::default() {
        tracing::info!(
            root = %root.display(),
            cutoff = %cutoff_day,
            months_removed = report.months_removed,
            files_removed = report.files_removed,
            errors = report.errors,
            "retention sweep finished"
        );
    }
    report
}

/// Remove day files in `month_dir` dated on or before `cutoff_day`.
fn sweep_month(month_dir: &Path, cutoff_day: &str, report: &mut SweepReport) {
    let entries = match std::fs::read_dir(month_dir) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %month_dir.display(),
                "failed to read month directory"
            );
            report.errors += 1;
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %month_dir.display(),
                    "failed to read month directory entry"
                );
                report.errors += 1;
                continue;
            }
        };
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(day) = DAY_FILE.captures(name).and_then(|c| c.get(1)) else {
            continue;
        };

        if day.as_str() <= cutoff_day {
            match delete_path(&path, true) {
                Ok(()) => report.files_removed += 1,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %path.display(),
                        "failed to remove expired log file"
                    );
                    report.errors += 1;
                }
            }
        }
    }
}

/// Recursively delete `path`.
///
/// Files are removed directly. Directories have their contents removed
/// first; the directory itself is removed only when `remove_root` is set.
/// A missing path is not an error. Failures on individual children do not
/// stop the remaining children from being deleted; the first one is returned.
pub fn delete_path(path: &Path, remove_root: bool) -> std::io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if !metadata.is_dir() {
        return std::fs::remove_file(path);
    }

    let mut first_error = None;
    for entry in std::fs::read_dir(path)? {
        let result = entry.and_then(|entry| delete_path(&entry.path(), true));
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    if remove_root {
        std::fs::remove_dir(path)?;
    }
    Ok(())
}
