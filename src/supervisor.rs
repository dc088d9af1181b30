//! Single-slot registry of the active capture worker.
//!
//! At most one worker is registered at a time. `start` is a no-op while
//! it is alive and replaces it once it has terminated; a worker that ends
//! without being asked to stop clears its own registration. A stopped
//! worker is kept aside until the next `start`, which waits for it to
//! release the log root before the new session takes it.
//!
//! Calls are expected from one coordinating context. The slot is locked
//! internally only so the worker task can clear it.

use crate::config::{RetentionWindow, SourceConfig};
use crate::source::LevelFilter;
use crate::worker::{CaptureWorker, ExitHook, SessionConfig, SessionEnd};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tracing::{debug, error, info};

#[derive(Debug)]
struct Registration {
    session: u64,
    worker: CaptureWorker,
}

type Slot = Mutex<Option<Registration>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct CaptureSupervisor {
    owner_pid: u32,
    retention: RetentionWindow,
    source: SourceConfig,
    slot: Arc<Slot>,
    /// Worker asked to stop whose teardown may still be running.
    draining: Mutex<Option<CaptureWorker>>,
    next_session: AtomicU64,
}

impl CaptureSupervisor {
    /// Supervisor capturing lines attributed to the current process.
    pub fn new(source: SourceConfig) -> Self {
        Self {
            owner_pid: std::process::id(),
            retention: RetentionWindow::default(),
            source,
            slot: Arc::new(Mutex::new(None)),
            draining: Mutex::new(None),
            next_session: AtomicU64::new(1),
        }
    }

    /// Capture lines attributed to `pid` instead of the current process.
    pub fn with_owner_pid(mut self, pid: u32) -> Self {
        self.owner_pid = pid;
        self
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    /// Set the retention window for sessions started after this call.
    /// Values `<= 0` or above two years fall back to the default of 7 days.
    pub fn set_retention_days(&mut self, days: i64) {
        self.set_retention(RetentionWindow::new(days));
    }

    pub fn set_retention(&mut self, retention: RetentionWindow) {
        self.retention = retention;
    }

    pub fn retention(&self) -> RetentionWindow {
        self.retention
    }

    /// Create `dir` if it does not exist.
    pub fn init(dir: &Path) {
        if let Err(e) = std::fs::create_dir_all(dir) {
            error!(dir = %dir.display(), error = %e, "failed to create log directory");
        }
    }

    /// Start capturing at debug level into `root`.
    pub fn start(&self, root: &Path) {
        self.start_with_level(root, LevelFilter::Debug);
    }

    /// Start capturing into `root`, unless a worker is already alive.
    ///
    /// Must be called from within a tokio runtime; otherwise nothing starts
    /// and the failure is logged.
    pub fn start_with_level(&self, root: &Path, level: LevelFilter) {
        let mut slot = lock(&self.slot);
        if let Some(registration) = slot.as_ref() {
            if registration.worker.is_alive() {
                debug!(
                    session = registration.session,
                    root = %registration.worker.root().display(),
                    "capture worker is alive"
                );
                return;
            }
            debug!(session = registration.session, "capture worker is not alive, restarting");
        }

        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "cannot start capture outside a tokio runtime");
                return;
            }
        };

        let previous = lock(&self.draining).take().filter(CaptureWorker::is_alive);
        if let Some(previous) = &previous {
            debug!(root = %previous.root().display(), "previous worker still draining");
            previous.terminate_source();
        }

        let session = self.next_session.fetch_add(1, Ordering::SeqCst);
        let config = SessionConfig {
            root: root.to_path_buf(),
            level,
            owner_pid: self.owner_pid,
            retention: self.retention,
            source: self.source.clone(),
        };
        let registry = Arc::downgrade(&self.slot);
        let on_unexpected_exit: ExitHook = Box::new(move || {
            if let Some(slot) = registry.upgrade() {
                let mut slot = lock(&slot);
                if slot.as_ref().is_some_and(|r| r.session == session) {
                    *slot = None;
                    debug!(session, "capture worker exited, registration cleared");
                }
            }
        });

        info!(
            session,
            root = %root.display(),
            level = %level,
            retention_days = self.retention.days(),
            "starting capture"
        );
        let worker =
            CaptureWorker::spawn_after(&runtime, config, Some(on_unexpected_exit), previous);
        *slot = Some(Registration { session, worker });
    }

    /// Ask the active worker to stop and unregister it. Does not wait; the
    /// next `start` waits for its teardown instead.
    pub fn stop(&self) {
        if let Some(registration) = lock(&self.slot).take() {
            debug!(session = registration.session, "stopping capture worker");
            registration.worker.request_stop();
            *lock(&self.draining) = Some(registration.worker);
        }
    }

    /// Stop the active worker, terminate its log source so a pending read
    /// returns, and wait for teardown to finish.
    pub async fn shutdown(&self) -> Option<SessionEnd> {
        let previous = lock(&self.draining).take();
        if let Some(previous) = previous {
            previous.terminate_source();
            previous.join().await;
        }

        let registration = lock(&self.slot).take()?;
        debug!(session = registration.session, "shutting down capture worker");
        registration.worker.request_stop();
        registration.worker.terminate_source();
        registration.worker.join().await
    }

    /// True while a registered worker has not terminated. Clears the
    /// registration of a terminated worker.
    pub fn is_alive(&self) -> bool {
        let mut slot = lock(&self.slot);
        match slot.as_ref().map(|r| r.worker.is_alive()) {
            Some(true) => true,
            Some(false) => {
                if let Some(registration) = slot.take() {
                    debug!(session = registration.session, "capture worker is dead");
                }
                false
            }
            None => false,
        }
    }

    /// Pid of the running log-source process, if any.
    pub fn source_pid(&self) -> Option<u32> {
        lock(&self.slot)
            .as_ref()
            .and_then(|registration| registration.worker.source_pid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_RETENTION_DAYS;
    use crate::log_file::log_file_path;
    use chrono::Local;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::tempdir;

    const OWNER: u32 = 4242;
    const TICKING: &str = "while true; do echo '(4242) tick'; sleep 0.05; done";

    fn supervisor(script: &str) -> CaptureSupervisor {
        CaptureSupervisor::new(SourceConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        })
        .with_owner_pid(OWNER)
    }

    fn todays_file(root: &Path) -> PathBuf {
        log_file_path(root, Local::now().date_naive())
    }

    fn line_count(path: &Path) -> usize {
        std::fs::read_to_string(path)
            .map(|c| c.lines().count())
            .unwrap_or(0)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn test_set_retention_days_clamps() {
        let mut sup = supervisor("true");
        assert_eq!(sup.retention().days(), DEFAULT_RETENTION_DAYS);
        sup.set_retention_days(30);
        assert_eq!(sup.retention().days(), 30);
        sup.set_retention_days(0);
        assert_eq!(sup.retention().days(), DEFAULT_RETENTION_DAYS);
        sup.set_retention_days(730);
        assert_eq!(sup.retention().days(), 730);
        sup.set_retention_days(731);
        assert_eq!(sup.retention().days(), DEFAULT_RETENTION_DAYS);

        sup.set_retention(RetentionWindow::new(90));
        assert_eq!(sup.retention().days(), 90);
    }

    #[test]
    fn test_default_owner_is_current_process() {
        let sup = CaptureSupervisor::new(SourceConfig::default());
        assert_eq!(sup.owner_pid(), std::process::id());
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a/b/logs");
        CaptureSupervisor::init(&target);
        assert!(target.is_dir());
        CaptureSupervisor::init(&target);
        assert!(target.is_dir());
    }

    #[test]
    fn test_start_outside_runtime_does_nothing() {
        let dir = tempdir().unwrap();
        let sup = supervisor(TICKING);
        sup.start(dir.path());
        assert!(!sup.is_alive());
    }

    #[tokio::test]
    async fn test_not_alive_before_start() {
        let sup = supervisor(TICKING);
        assert!(!sup.is_alive());
        assert_eq!(sup.source_pid(), None);
        sup.stop();
        assert!(sup.shutdown().await.is_none());
    }

    #[tokio::test]
    async fn test_second_start_while_alive_is_noop() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("spawns");
        let script = format!("echo spawned >> '{}'; {TICKING}", marker.display());
        let sup = supervisor(&script);
        let root = dir.path().join("logs");

        sup.start(&root);
        wait_for(|| sup.source_pid().is_some()).await;
        let pid = sup.source_pid();

        sup.start(&root);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(sup.is_alive());
        assert_eq!(sup.source_pid(), pid);
        assert_eq!(line_count(&marker), 1);

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_clears_registration_and_file_stops_growing() {
        let dir = tempdir().unwrap();
        let sup = supervisor(TICKING);
        let path = todays_file(dir.path());

        sup.start(dir.path());
        wait_for(|| line_count(&path) > 0).await;
        let pid = sup.source_pid().expect("source pid");

        sup.stop();
        assert!(!sup.is_alive());
        assert_eq!(sup.source_pid(), None);

        // Teardown kills the source once the next line is read.
        wait_for(|| kill(Pid::from_raw(pid as i32), None).is_err()).await;
        let settled = line_count(&path);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(line_count(&path), settled);
    }

    #[tokio::test]
    async fn test_start_right_after_stop_resumes_capture() {
        let dir = tempdir().unwrap();
        let sup = supervisor("while true; do echo '(4242) tick'; sleep 0.5; done");
        let path = todays_file(dir.path());

        sup.start(dir.path());
        wait_for(|| line_count(&path) > 0).await;
        let first_pid = sup.source_pid().expect("source pid");

        // The stopped worker still holds the root lock at this point.
        sup.stop();
        sup.start(dir.path());
        assert!(sup.is_alive());

        wait_for(|| sup.source_pid().is_some_and(|pid| pid != first_pid)).await;
        let resumed = line_count(&path);
        wait_for(|| line_count(&path) > resumed).await;
        assert!(sup.is_alive());

        let end = sup.shutdown().await;
        assert!(matches!(end, Some(SessionEnd::Stopped)), "got {end:?}");
    }

    #[tokio::test]
    async fn test_shutdown_after_stop_waits_for_draining_worker() {
        let dir = tempdir().unwrap();
        let sup = supervisor("echo '(4242) hello'; exec sleep 30");
        let path = todays_file(dir.path());

        sup.start(dir.path());
        wait_for(|| line_count(&path) == 1).await;
        let pid = sup.source_pid().expect("source pid");

        sup.stop();
        let end = tokio::time::timeout(Duration::from_secs(10), sup.shutdown())
            .await
            .expect("shutdown timed out");
        assert!(end.is_none());
        assert!(kill(Pid::from_raw(pid as i32), None).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_teardown() {
        let dir = tempdir().unwrap();
        let sup = supervisor("echo '(4242) hello'; exec sleep 30");
        let path = todays_file(dir.path());

        sup.start(dir.path());
        wait_for(|| line_count(&path) == 1).await;

        let end = tokio::time::timeout(Duration::from_secs(10), sup.shutdown())
            .await
            .expect("shutdown timed out");
        assert!(matches!(end, Some(SessionEnd::Stopped)), "got {end:?}");
        assert!(!sup.is_alive());
    }

    #[tokio::test]
    async fn test_restart_after_source_killed_out_of_band() {
        let dir = tempdir().unwrap();
        let sup = supervisor(TICKING);
        let path = todays_file(dir.path());

        sup.start(dir.path());
        wait_for(|| line_count(&path) > 0).await;
        let first_pid = sup.source_pid().expect("source pid");

        kill(Pid::from_raw(first_pid as i32), Signal::SIGKILL).unwrap();
        wait_for(|| !sup.is_alive()).await;
        let before_restart = line_count(&path);

        sup.start(dir.path());
        wait_for(|| sup.source_pid().is_some()).await;
        assert!(sup.is_alive());
        assert_ne!(sup.source_pid(), Some(first_pid));

        wait_for(|| line_count(&path) > before_restart).await;
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_session_is_reported_dead() {
        let dir = tempdir().unwrap();
        let sup = CaptureSupervisor::new(SourceConfig {
            command: "nonexistent-binary-xyz".to_string(),
            args: vec![],
        });

        sup.start(dir.path());
        wait_for(|| !sup.is_alive()).await;
        assert_eq!(sup.source_pid(), None);
    }
}
