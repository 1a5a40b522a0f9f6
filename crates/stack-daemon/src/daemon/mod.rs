//! Stack controller daemon

pub mod handlers;
pub mod server;

pub use server::{DaemonState, serve};

use anyhow::{Context, Result};
use async_net::TcpListener;
use stack_orchestration::ComposeRuntime;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Default daemon port
pub const DEFAULT_DAEMON_PORT: u16 = 9443;

/// Load the stack file and serve on 127.0.0.1:`port` until the process exits
pub async fn run(config_path: impl AsRef<Path>, port: u16) -> Result<()> {
    let config_path = config_path.as_ref();
    let config = stack_config::parse_file(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let config_dir = config_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let runtime: Arc<ComposeRuntime> = Arc::new(stack_config::compose_runtime(&config, config_dir));

    let state = DaemonState::new(&config, runtime)?.with_config_path(config_path);
    info!(
        "Loaded stack {} with {} services",
        config.name.as_deref().unwrap_or("unnamed"),
        config.services.len()
    );

    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;
    info!("Stack daemon listening on ws://{}", addr);

    serve(listener, Arc::new(state)).await
}
