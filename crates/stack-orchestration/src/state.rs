//! Live runtime state of services.

use crate::definition::DependencyCondition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a service container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// No container exists
    NotCreated,
    /// Start issued, not yet running
    Starting,
    /// Running
    Running,
    /// Stop issued, not yet stopped
    Stopping,
    /// Exited or created but not running
    Stopped,
    /// Restarting
    Restarting,
    /// Unknown or failed state
    Error,
}

impl ServiceStatus {
    /// Running, starting or restarting
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Running | ServiceStatus::Starting | ServiceStatus::Restarting
        )
    }

    /// Nothing left to stop
    pub fn is_inactive(&self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::NotCreated)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceStatus::NotCreated => "not_created",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Restarting => "restarting",
            ServiceStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Health check state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// No health check configured
    #[default]
    None,
    /// Health check has not passed yet
    Starting,
    /// Health check passing
    Healthy,
    /// Health check failing
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthState::None => "none",
            HealthState::Starting => "starting",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        };
        f.write_str(name)
    }
}

/// Last observed state of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRuntimeState {
    /// Service name
    pub service: String,
    /// Lifecycle status
    pub status: ServiceStatus,
    /// Health state
    pub health: HealthState,
    /// Exit code of the last run, when the container has exited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// When this state was observed
    pub observed_at: DateTime<Utc>,
}

impl ServiceRuntimeState {
    /// State observed now
    pub fn new(service: impl Into<String>, status: ServiceStatus, health: HealthState) -> Self {
        Self {
            service: service.into(),
            status,
            health,
            exit_code: None,
            observed_at: Utc::now(),
        }
    }

    /// Placeholder for a service without a container
    pub fn not_created(service: impl Into<String>) -> Self {
        Self::new(service, ServiceStatus::NotCreated, HealthState::None)
    }

    /// Set the exit code
    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Same status, health and exit code, ignoring the observation time
    pub fn same_as(&self, other: &ServiceRuntimeState) -> bool {
        self.status == other.status && self.health == other.health && self.exit_code == other.exit_code
    }

    /// Whether this state meets `condition`
    pub fn satisfies(&self, condition: DependencyCondition) -> bool {
        match condition {
            DependencyCondition::Started => self.status == ServiceStatus::Running,
            DependencyCondition::Healthy => {
                self.status == ServiceStatus::Running && self.health == HealthState::Healthy
            }
            DependencyCondition::CompletedSuccessfully => {
                self.status == ServiceStatus::Stopped && self.exit_code == Some(0)
            }
        }
    }

    /// Reason why `condition` can no longer be met from this state, if any
    pub fn failure_for(&self, condition: DependencyCondition) -> Option<String> {
        if self.status == ServiceStatus::Error {
            return Some(format!("{} is in error state", self.service));
        }
        match condition {
            DependencyCondition::Started => None,
            DependencyCondition::Healthy => (self.health == HealthState::Unhealthy)
                .then(|| format!("{} reported unhealthy", self.service)),
            DependencyCondition::CompletedSuccessfully => match self.exit_code {
                Some(code) if code != 0 && self.status == ServiceStatus::Stopped => {
                    Some(format!("{} exited with code {}", self.service, code))
                }
                _ => None,
            },
        }
    }
}

/// A change observed by the tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    /// Service name
    pub service: String,
    /// Previous state, if any was cached
    pub previous: Option<ServiceRuntimeState>,
    /// New state
    pub current: ServiceRuntimeState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditions() {
        let running = ServiceRuntimeState::new("db", ServiceStatus::Running, HealthState::Starting);
        assert!(running.satisfies(DependencyCondition::Started));
        assert!(!running.satisfies(DependencyCondition::Healthy));
        assert!(running.failure_for(DependencyCondition::Healthy).is_none());

        let healthy = ServiceRuntimeState::new("db", ServiceStatus::Running, HealthState::Healthy);
        assert!(healthy.satisfies(DependencyCondition::Healthy));

        let unhealthy =
            ServiceRuntimeState::new("db", ServiceStatus::Running, HealthState::Unhealthy);
        assert!(unhealthy.failure_for(DependencyCondition::Healthy).is_some());
    }

    #[test]
    fn completion_requires_zero_exit() {
        let done = ServiceRuntimeState::new("migrate", ServiceStatus::Stopped, HealthState::None)
            .with_exit_code(Some(0));
        assert!(done.satisfies(DependencyCondition::CompletedSuccessfully));

        let failed = done.clone().with_exit_code(Some(2));
        assert!(!failed.satisfies(DependencyCondition::CompletedSuccessfully));
        assert_eq!(
            failed
                .failure_for(DependencyCondition::CompletedSuccessfully)
                .as_deref(),
            Some("migrate exited with code 2")
        );
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ServiceStatus::NotCreated).unwrap(),
            "\"not_created\""
        );
    }
}
