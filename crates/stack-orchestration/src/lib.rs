//! # Stack Orchestration
//!
//! Dependency-aware orchestration for a multi-service container stack.
//!
//! Services declare startup dependencies with readiness conditions (plain start,
//! health-check pass, or run-to-completion). This crate turns those declarations
//! into a validated graph, computes safe start/stop/restart batches, executes
//! them against a container runtime with bounded parallelism, tracks the live
//! runtime state and streams state and log changes to subscribers.
//!
//! Components, leaves first:
//!
//! - [`GraphBuilder`] collects [`ServiceDefinition`]s into nodes and typed edges.
//! - [`DependencyResolver`] validates the graph and answers ordering queries.
//! - [`RuntimeStateTracker`] polls the [`ContainerRuntime`] and keeps a reconciled cache.
//! - [`OrchestrationController`] drives operations using the resolver and the tracker.
//! - [`EventStreamer`] fans state and log events out to subscribers.
//! - [`MetricsCollector`] samples resource usage and diagnoses services.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stack_orchestration::{
//!     ComposeRuntime, ControllerSettings, DependencyCondition, GraphBuilder,
//!     OperationOptions, OperationTarget, OrchestrationController, RuntimeStateTracker,
//!     ServiceDefinition, TrackerSettings,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver = GraphBuilder::from_definitions(vec![
//!     ServiceDefinition::new("db", "postgres:16"),
//!     ServiceDefinition::new("api", "example/api")
//!         .depends_on("db", DependencyCondition::Healthy),
//! ])
//! .build()?;
//!
//! let runtime = Arc::new(ComposeRuntime::new("localai"));
//! let tracker = Arc::new(RuntimeStateTracker::new(runtime.clone(), TrackerSettings::default()));
//! let _poller = tracker.spawn_poller();
//!
//! let controller = OrchestrationController::new(
//!     resolver,
//!     tracker,
//!     runtime,
//!     ControllerSettings::default(),
//! );
//! let operation = controller.start(
//!     OperationTarget::Service("api".to_string()),
//!     None,
//!     OperationOptions::default(),
//! )?;
//! let record = operation.wait().await;
//! println!("{:?}", record.status);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

mod cancel;
mod controller;
mod definition;
mod events;
mod graph;
mod metrics;
mod operation;
mod resolver;
pub mod runtime;
mod state;
mod tracker;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use cancel::CancellationToken;
pub use controller::{ControllerSettings, OrchestrationController, RetryPolicy};
pub use definition::{DependencyCondition, ServiceDefinition, DEFAULT_GROUP};
pub use events::{EventFilter, EventKind, EventStreamer, StreamEvent, StreamerSettings, Subscription};
pub use graph::{DependencyEdge, EdgeView, GraphBuilder, GraphView, NodeView, ServiceGraph, ServiceNode};
pub use metrics::{
    analyze_logs, analyze_metrics, analyze_restarts, Diagnostic, DiagnosticReport, MetricsCollector,
    MetricsSample, MetricsSettings, Severity, Thresholds, RESTART_WINDOW,
};
pub use operation::{
    OperationHandle, OperationKind, OperationOptions, OperationRecord, OperationStage,
    OperationStatus, OperationTarget, ServiceOutcome, ServicePhase, ServiceProgress,
};
pub use resolver::{DependencyResolver, GroupSummary, SelectionReport, ServiceDetail};
pub use runtime::{
    ComposeRuntime, ContainerRuntime, ContainerSnapshot, ContainerStats, LogStream, RuntimeError,
};
pub use state::{HealthState, ServiceRuntimeState, ServiceStatus, StateChange};
pub use tracker::{ConditionOutcome, RuntimeStateTracker, TrackerSettings};

#[cfg(any(test, feature = "test-utils"))]
pub use runtime::memory::{InMemoryRuntime, RuntimeCall, StartBehavior};

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for orchestration operations
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The dependency edges form a cycle
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected {
        /// Services participating in the cycle, in edge order
        cycle: Vec<String>,
    },

    /// Target not present in the graph
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// Two definitions share a name
    #[error("Service '{0}' is defined more than once")]
    DuplicateService(String),

    /// Stopping the targets would leave running dependents behind
    #[error(
        "Cannot stop {} while dependents are running: {}",
        services.join(", "),
        blocking.join(", ")
    )]
    DependencyNotSatisfied {
        /// Services that were requested
        services: Vec<String>,
        /// Running or starting dependents blocking the request
        blocking: Vec<String>,
    },

    /// A readiness condition was not reached in time
    #[error("Service '{service}' did not become {condition} within {timeout:?}")]
    HealthTimeout {
        /// Service that was awaited
        service: String,
        /// Condition required by its dependents
        condition: DependencyCondition,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// The container runtime could not be reached
    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// A runtime call for a single service failed
    #[error("Runtime call for '{service}' failed: {message}")]
    ServiceFailed {
        /// Service whose call failed
        service: String,
        /// Failure reported by the runtime or readiness check
        message: String,
    },

    /// Another operation holds the lock for some of the services
    #[error("Conflicting operation in progress for: {}", services.join(", "))]
    ConflictingOperation {
        /// Services that are already locked
        services: Vec<String>,
    },

    /// The selection mixes profile-exclusive services
    #[error("Profile conflict: {message}")]
    ProfileConflict {
        /// Services involved in the conflict
        services: Vec<String>,
        /// Description of the conflict
        message: String,
    },

    /// No operation with this id exists
    #[error("Operation not found: {0}")]
    OperationNotFound(Uuid),
}

/// Machine-readable error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`Error::CycleDetected`]
    CycleDetected,
    /// See [`Error::UnknownService`]
    UnknownService,
    /// See [`Error::DuplicateService`]
    DuplicateService,
    /// See [`Error::DependencyNotSatisfied`]
    DependencyNotSatisfied,
    /// See [`Error::HealthTimeout`]
    HealthTimeout,
    /// See [`Error::RuntimeUnavailable`]
    RuntimeUnavailable,
    /// See [`Error::ServiceFailed`]
    ServiceFailed,
    /// See [`Error::ConflictingOperation`]
    ConflictingOperation,
    /// See [`Error::ProfileConflict`]
    ProfileConflict,
    /// See [`Error::OperationNotFound`]
    OperationNotFound,
}

impl Error {
    /// Kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CycleDetected { .. } => ErrorKind::CycleDetected,
            Error::UnknownService(_) => ErrorKind::UnknownService,
            Error::DuplicateService(_) => ErrorKind::DuplicateService,
            Error::DependencyNotSatisfied { .. } => ErrorKind::DependencyNotSatisfied,
            Error::HealthTimeout { .. } => ErrorKind::HealthTimeout,
            Error::RuntimeUnavailable(_) => ErrorKind::RuntimeUnavailable,
            Error::ServiceFailed { .. } => ErrorKind::ServiceFailed,
            Error::ConflictingOperation { .. } => ErrorKind::ConflictingOperation,
            Error::ProfileConflict { .. } => ErrorKind::ProfileConflict,
            Error::OperationNotFound(_) => ErrorKind::OperationNotFound,
        }
    }

    /// Services this error is about
    pub fn services(&self) -> Vec<String> {
        match self {
            Error::CycleDetected { cycle } => cycle.clone(),
            Error::UnknownService(name) | Error::DuplicateService(name) => vec![name.clone()],
            Error::DependencyNotSatisfied { services, .. } => services.clone(),
            Error::HealthTimeout { service, .. } | Error::ServiceFailed { service, .. } => {
                vec![service.clone()]
            }
            Error::ConflictingOperation { services } | Error::ProfileConflict { services, .. } => {
                services.clone()
            }
            Error::RuntimeUnavailable(_) | Error::OperationNotFound(_) => Vec::new(),
        }
    }
}

/// User-visible failure: kind, offending services and blocking dependents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    /// Error kind
    pub kind: ErrorKind,
    /// Offending services
    pub services: Vec<String>,
    /// Blocking dependents, only set for `dependency_not_satisfied`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocking: Vec<String>,
    /// Human readable message
    pub message: String,
}

impl From<&Error> for FailureReport {
    fn from(error: &Error) -> Self {
        let blocking = match error {
            Error::DependencyNotSatisfied { blocking, .. } => blocking.clone(),
            _ => Vec::new(),
        };
        Self {
            kind: error.kind(),
            services: error.services(),
            blocking,
            message: error.to_string(),
        }
    }
}

impl From<Error> for FailureReport {
    fn from(error: Error) -> Self {
        Self::from(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_report_carries_blocking_dependents() {
        let error = Error::DependencyNotSatisfied {
            services: vec!["a".to_string(), "b".to_string()],
            blocking: vec!["c".to_string()],
        };
        let report = FailureReport::from(&error);
        assert_eq!(report.kind, ErrorKind::DependencyNotSatisfied);
        assert_eq!(report.services, vec!["a", "b"]);
        assert_eq!(report.blocking, vec!["c"]);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "dependency_not_satisfied");
    }

    #[test]
    fn cycle_message_lists_path() {
        let error = Error::CycleDetected {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(error.to_string(), "Dependency cycle detected: a -> b -> a");
    }
}
