//! Stack daemon with WebSocket server
//!
//! Loads a stack file, tracks the compose project and serves operations.

use anyhow::Result;
use clap::Parser;
use stack_daemon::daemon::{self, DEFAULT_DAEMON_PORT};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "stackd")]
#[command(about = "Daemon that orchestrates a multi-service container stack", long_about = None)]
struct Args {
    /// Stack file
    #[arg(short, long, default_value = "stack.yaml")]
    config: PathBuf,

    /// Port to listen on
    #[arg(short, long, env = "STACK_DAEMON_PORT", default_value_t = DEFAULT_DAEMON_PORT)]
    port: u16,

    /// Log filter, e.g. `debug` or `stack_orchestration=trace`
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    stack_daemon::logging::init(args.log_level.as_deref(), "info");

    info!("Starting stack daemon on port {}", args.port);
    info!("Stack file: {}", args.config.display());

    smol::block_on(async { daemon::run(&args.config, args.port).await })
}
