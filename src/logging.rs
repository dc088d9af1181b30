//! Diagnostic output of logkeep itself, via tracing.
//!
//! Hosts that install their own subscriber do not need this.

use tracing_subscriber::EnvFilter;

/// Filter directive for the requested verbosity. `RUST_LOG`, when set, wins.
pub fn filter_directive(level: &str, verbose: bool, quiet: bool) -> String {
    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        level
    };
    format!("logkeep={level}")
}

/// Install a fmt subscriber. Returns false if one was already installed.
pub fn init(level: &str, verbose: bool, quiet: bool) -> bool {
    let directive = filter_directive(level, verbose, quiet);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&directive))
        .unwrap_or_else(|_| EnvFilter::new("logkeep=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .try_init()
        .is_ok()
}
