//! Field-diagnostic log capture.
//!
//! A [`CaptureSupervisor`] runs at most one capture session at a time. A
//! session spawns the platform log source, keeps the lines attributed to the
//! owning process and appends them, timestamped, to `root/YYYYMM/YYYYMMDD.log`.
//! Day files older than the retention window are swept when a session starts.

pub mod config;
pub mod filter;
pub mod log_file;
pub mod logging;
pub mod retention;
pub mod source;
pub mod supervisor;
pub mod worker;

pub use config::{LogkeepConfig, RetentionWindow};
pub use source::LevelFilter;
pub use supervisor::CaptureSupervisor;
pub use worker::{CaptureError, CaptureWorker, SessionConfig, SessionEnd, WorkerState};
