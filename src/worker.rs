//! Capture worker: one session of reading the log source into the day file.
//!
//! The worker runs as a tokio task and walks Init → Running → Stopping →
//! Terminated. Teardown runs exactly once on every exit path and releases
//! the source process, its output stream, the day file and the root lock,
//! each independently of the others.

use crate::config::{RetentionWindow, SourceConfig};
use crate::filter;
use crate::log_file::{log_file_path, DailyLogFile, RootLock};
use crate::retention;
use crate::source::{self, LevelFilter};
use chrono::{Local, NaiveDateTime};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Consecutive failed line writes after which the session gives up.
pub const MAX_CONSECUTIVE_WRITE_FAILURES: u32 = 3;

/// Everything a worker needs to run one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub root: PathBuf,
    pub level: LevelFilter,
    pub owner_pid: u32,
    pub retention: RetentionWindow,
    pub source: SourceConfig,
}

/// Errors that end a capture session.
#[derive(Debug)]
pub enum CaptureError {
    /// Another session holds the root lock.
    Locked {
        root: PathBuf,
        source: std::io::Error,
    },
    /// Failed to create or open the day file.
    Setup {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to spawn the log-source process.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// Failed to read from the log-source output.
    Io { source: std::io::Error },
    /// Writes to the day file kept failing.
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::Locked { root, source } => {
                write!(f, "failed to lock log root {}: {}", root.display(), source)
            }
            CaptureError::Setup { path, source } => {
                write!(f, "failed to open log file {}: {}", path.display(), source)
            }
            CaptureError::Spawn { command, source } => {
                write!(f, "failed to spawn log source {}: {}", command, source)
            }
            CaptureError::Io { source } => {
                write!(f, "I/O error reading log source: {}", source)
            }
            CaptureError::Write { path, source } => {
                write!(f, "failed to write log file {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CaptureError::Locked { source, .. } => Some(source),
            CaptureError::Setup { source, .. } => Some(source),
            CaptureError::Spawn { source, .. } => Some(source),
            CaptureError::Io { source } => Some(source),
            CaptureError::Write { source, .. } => Some(source),
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// A stop was requested.
    Stopped,
    /// The log source closed its output.
    EndOfStream,
    Failed(CaptureError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Init,
    Running,
    Stopping,
    Terminated,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Init,
            1 => WorkerState::Running,
            2 => WorkerState::Stopping,
            _ => WorkerState::Terminated,
        }
    }
}

/// Called when a session ends without a stop having been requested.
pub type ExitHook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
struct Shared {
    stop_requested: AtomicBool,
    source_pid: AtomicU32,
    state: AtomicU8,
}

impl Shared {
    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// Handle on a running capture task.
#[derive(Debug)]
pub struct CaptureWorker {
    root: PathBuf,
    shared: Arc<Shared>,
    task: JoinHandle<SessionEnd>,
}

impl CaptureWorker {
    /// Start a session on `runtime`. Never fails: setup errors end the task
    /// and are reported through [`CaptureWorker::join`] and the log.
    pub fn spawn(
        runtime: &Handle,
        config: SessionConfig,
        on_unexpected_exit: Option<ExitHook>,
    ) -> Self {
        Self::spawn_after(runtime, config, on_unexpected_exit, None)
    }

    /// Like [`CaptureWorker::spawn`], but the new session first waits for
    /// `previous` to finish its teardown and release the root.
    pub fn spawn_after(
        runtime: &Handle,
        config: SessionConfig,
        on_unexpected_exit: Option<ExitHook>,
        previous: Option<CaptureWorker>,
    ) -> Self {
        let shared = Arc::new(Shared {
            stop_requested: AtomicBool::new(false),
            source_pid: AtomicU32::new(0),
            state: AtomicU8::new(WorkerState::Init as u8),
        });
        let root = config.root.clone();
        let task = runtime.spawn(run(
            config,
            Arc::clone(&shared),
            on_unexpected_exit,
            previous,
        ));
        Self { root, shared, task }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ask the worker to stop. Takes effect after the in-flight read returns.
    pub fn request_stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.shared.stop_requested.load(Ordering::SeqCst)
    }

    /// True until the task has returned.
    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn state(&self) -> WorkerState {
        if self.task.is_finished() {
            return WorkerState::Terminated;
        }
        WorkerState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Pid of the log-source process while it is running.
    pub fn source_pid(&self) -> Option<u32> {
        match self.shared.source_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Signal the log source to exit so a blocked read sees end of stream.
    pub fn terminate_source(&self) {
        if let Some(pid) = self.source_pid() {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                if e != Errno::ESRCH {
                    tracing::warn!(pid, error = %e, "failed to signal log source");
                }
            }
        }
    }

    /// Wait for the task to finish. `None` if it panicked or was aborted.
    pub async fn join(self) -> Option<SessionEnd> {
        match self.task.await {
            Ok(end) => Some(end),
            Err(e) => {
                tracing::error!(error = %e, "capture worker task failed");
                None
            }
        }
    }
}

/// Resources owned by one session, released in teardown.
struct Session {
    shared: Arc<Shared>,
    lock: Option<RootLock>,
    file: Option<DailyLogFile>,
    child: Option<Child>,
    reader: Option<BufReader<ChildStdout>>,
}

async fn run(
    config: SessionConfig,
    shared: Arc<Shared>,
    on_unexpected_exit: Option<ExitHook>,
    previous: Option<CaptureWorker>,
) -> SessionEnd {
    if let Some(previous) = previous {
        tracing::debug!(
            root = %previous.root().display(),
            "waiting for previous session to drain"
        );
        previous.join().await;
        if shared.stop_requested.load(Ordering::SeqCst) {
            shared.set_state(WorkerState::Terminated);
            return SessionEnd::Stopped;
        }
    }

    let mut session = Session {
        shared: Arc::clone(&shared),
        lock: None,
        file: None,
        child: None,
        reader: None,
    };

    let end = match session.capture(&config).await {
        Ok(end) => end,
        Err(e) => {
            tracing::error!(root = %config.root.display(), error = %e, "capture session failed");
            SessionEnd::Failed(e)
        }
    };

    shared.set_state(WorkerState::Stopping);
    session.teardown().await;

    let deliberate = shared.stop_requested.load(Ordering::SeqCst);
    tracing::debug!(root = %config.root.display(), ?end, deliberate, "capture worker terminated");
    if !deliberate {
        if let Some(hook) = on_unexpected_exit {
            hook();
        }
    }
    shared.set_state(WorkerState::Terminated);
    end
}

impl Session {
    async fn capture(&mut self, config: &SessionConfig) -> Result<SessionEnd, CaptureError> {
        let lock = RootLock::acquire(&config.root).map_err(|e| CaptureError::Locked {
            root: config.root.clone(),
            source: e,
        })?;
        self.lock = Some(lock);

        retention::sweep(&config.root, config.retention);

        let today = Local::now().date_naive();
        let file = DailyLogFile::open(&config.root, today).map_err(|e| CaptureError::Setup {
            path: log_file_path(&config.root, today),
            source: e,
        })?;
        tracing::debug!(file = %file.path().display(), "opened log file");
        self.file = Some(file);

        let args = source::build_args(&config.source, config.level, config.owner_pid);
        tracing::info!(
            command = %config.source.command,
            args = ?args,
            root = %config.root.display(),
            "spawning log source"
        );
        let mut child = source::command(&config.source, config.level, config.owner_pid)
            .spawn()
            .map_err(|e| CaptureError::Spawn {
                command: config.source.command.clone(),
                source: e,
            })?;
        let pid = child.id().unwrap_or(0);
        self.shared.source_pid.store(pid, Ordering::SeqCst);
        let stdout = child.stdout.take();
        self.child = Some(child);
        let stdout = stdout.ok_or_else(|| CaptureError::Io {
            source: std::io::Error::other("log source stdout not captured"),
        })?;
        self.reader = Some(BufReader::with_capacity(1024, stdout));

        self.shared.set_state(WorkerState::Running);
        tracing::debug!(pid, "capture worker running");

        self.read_loop(&filter::owner_identifier(config.owner_pid)).await
    }

    async fn read_loop(&mut self, owner: &str) -> Result<SessionEnd, CaptureError> {
        let (Some(reader), Some(file)) = (self.reader.as_mut(), self.file.as_mut()) else {
            return Ok(SessionEnd::EndOfStream);
        };
        let shared = &self.shared;
        let stop_requested = || shared.stop_requested.load(Ordering::SeqCst);

        let mut buf = Vec::with_capacity(256);
        let mut failures = 0u32;
        loop {
            if stop_requested() {
                return Ok(SessionEnd::Stopped);
            }
            buf.clear();
            let n = reader
                .read_until(b'\n', &mut buf)
                .await
                .map_err(|e| CaptureError::Io { source: e })?;
            if stop_requested() {
                return Ok(SessionEnd::Stopped);
            }
            if n == 0 {
                return Ok(SessionEnd::EndOfStream);
            }

            let line = String::from_utf8_lossy(trim_line_ending(&buf));
            if !filter::keep(&line, owner) {
                continue;
            }

            let now = Local::now();
            append_record(file, &mut failures, &line, now.naive_local())?;
        }
    }

    /// Release process, stream, file and lock in that order. A failure on
    /// one does not prevent the others from being released.
    async fn teardown(&mut self) {
        if let Some(mut child) = self.child.take() {
            self.shared.source_pid.store(0, Ordering::SeqCst);
            destroy_source(&mut child).await;
        }

        drop(self.reader.take());

        if let Some(file) = self.file.take() {
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                tracing::error!(file = %path.display(), error = %e, "failed to close log file");
            }
        }

        if let Some(lock) = self.lock.take() {
            let path = lock.path().to_path_buf();
            if let Err(e) = lock.release() {
                tracing::warn!(
                    lock = %path.display(),
                    error = %e,
                    "failed to release log root lock"
                );
            }
        }
    }
}

/// Kill the source's process group (falling back to the child alone) and reap it.
async fn destroy_source(child: &mut Child) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {}
        Err(e) => {
            tracing::warn!(pid, error = %e, "failed to kill log source process group");
            if let Err(e) = child.start_kill() {
                tracing::error!(pid, error = %e, "failed to kill log source");
                return;
            }
        }
    }
    match child.wait().await {
        Ok(status) => tracing::debug!(pid, ?status, "log source exited"),
        Err(e) => tracing::error!(pid, error = %e, "failed to reap log source"),
    }
}

/// Append one captured line. A failed write is logged and tolerated until
/// `MAX_CONSECUTIVE_WRITE_FAILURES` happen in a row; a success resets the count.
fn append_record(
    file: &mut DailyLogFile,
    failures: &mut u32,
    line: &str,
    now: NaiveDateTime,
) -> Result<(), CaptureError> {
    let record = filter::format(line, now);
    match file.append(&record, now.date()) {
        Ok(()) => {
            *failures = 0;
            Ok(())
        }
        Err(e) => {
            *failures += 1;
            tracing::warn!(
                error = %e,
                file = %file.path().display(),
                attempt = *failures,
                "failed to write captured line"
            );
            if *failures >= MAX_CONSECUTIVE_WRITE_FAILURES {
                return Err(CaptureError::Write {
                    path: file.path().to_path_buf(),
                    source: e,
                });
            }
            Ok(())
        }
    }
}

fn trim_line_ending(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}
