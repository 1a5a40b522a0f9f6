//! Tracing setup shared by the binaries

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber on stderr.
///
/// An explicit `level` wins over `RUST_LOG`, which wins over `default_filter`.
pub fn init(level: Option<&str>, default_filter: &str) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
    };

    // A second init in the same process is a no-op
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
