//! Container runtime capability.
//!
//! The controller and the tracker never talk to a container engine directly;
//! they go through a [`ContainerRuntime`] handle passed in at construction.

mod compose;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use compose::ComposeRuntime;

use crate::state::{HealthState, ServiceStatus};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Lazy sequence of log lines. Dropping it stops the tail.
pub type LogStream = BoxStream<'static, String>;

/// Errors returned by a runtime call
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// The runtime could not be reached; the call may succeed if retried
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// The runtime rejected the call
    #[error("{0}")]
    Failed(String),
}

impl RuntimeError {
    /// Whether retrying the call may help
    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Unavailable(_))
    }
}

/// One container as reported by the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    /// Service the container belongs to
    pub service: String,
    /// Lifecycle status
    pub status: ServiceStatus,
    /// Health state
    pub health: HealthState,
    /// Exit code, when exited
    pub exit_code: Option<i32>,
}

/// Resource usage of one running container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    /// Service the container belongs to
    pub service: String,
    /// CPU usage in percent of one core
    pub cpu_percent: f64,
    /// Memory in use, bytes
    pub memory_usage: u64,
    /// Memory limit, bytes
    pub memory_limit: u64,
    /// Memory usage in percent of the limit
    pub memory_percent: f64,
    /// Bytes received over the network
    pub network_rx_bytes: u64,
    /// Bytes sent over the network
    pub network_tx_bytes: u64,
}

/// Operations the orchestration core needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// All containers of the stack
    async fn list(&self) -> Result<Vec<ContainerSnapshot>, RuntimeError>;

    /// Start a single service without its dependencies
    async fn start(&self, service: &str, profile: Option<&str>) -> Result<(), RuntimeError>;

    /// Stop a single service
    async fn stop(&self, service: &str) -> Result<(), RuntimeError>;

    /// Follow the logs of a service, beginning with the last `tail` lines
    async fn logs(&self, service: &str, tail: usize) -> Result<LogStream, RuntimeError>;

    /// One resource usage sample per running container
    async fn stats(&self) -> Result<Vec<ContainerStats>, RuntimeError>;
}
