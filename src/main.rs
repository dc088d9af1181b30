use clap::Parser;
use logkeep::{CaptureSupervisor, LevelFilter, LogkeepConfig};
use std::path::PathBuf;

/// Capture this host's diagnostic log stream into dated files until Ctrl-C.
#[derive(Parser, Debug)]
#[command(name = "logkeep", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "logkeep.toml")]
    config: PathBuf,

    /// Log root directory (overrides config)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Level filter token, e.g. *:d (overrides config)
    #[arg(short, long)]
    level: Option<String>,

    /// Days of logs to keep (overrides config)
    #[arg(long, allow_hyphen_values = true)]
    retention_days: Option<i64>,

    /// Capture lines attributed to this pid instead of our own
    #[arg(long)]
    pid: Option<u32>,

    /// Print resolved settings and exit
    #[arg(long)]
    dry_run: bool,

    /// Extra logging
    #[arg(short, long)]
    verbose: bool,

    /// Only errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match LogkeepConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };
    logkeep::logging::init(&config.logging.level, cli.verbose, cli.quiet);
    tracing::debug!(?cli, "parsed CLI arguments");

    if let Some(root) = cli.root {
        config.capture.root = root;
    }
    if let Some(level) = cli.level {
        config.capture.level = level;
    }
    if let Some(days) = cli.retention_days {
        config.capture.retention_days = days;
    }
    let level = LevelFilter::parse_lenient(&config.capture.level);

    let mut supervisor = CaptureSupervisor::new(config.source.clone());
    if let Some(pid) = cli.pid {
        supervisor = supervisor.with_owner_pid(pid);
    }
    supervisor.set_retention(config.retention());

    if cli.dry_run {
        println!("root:           {}", config.capture.root.display());
        println!("level:          {level}");
        println!("retention_days: {}", supervisor.retention().days());
        println!("owner pid:      {}", supervisor.owner_pid());
        println!(
            "source:         {} {}",
            config.source.command,
            logkeep::source::build_args(&config.source, level, supervisor.owner_pid()).join(" ")
        );
        return;
    }

    CaptureSupervisor::init(&config.capture.root);
    supervisor.start_with_level(&config.capture.root, level);

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to wait for Ctrl-C");
    }
    tracing::info!("shutting down");
    if let Some(end) = supervisor.shutdown().await {
        tracing::debug!(?end, "capture session ended");
    }
}
