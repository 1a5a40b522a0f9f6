//! Scripted in-memory runtime for tests.

use super::{ContainerRuntime, ContainerSnapshot, ContainerStats, LogStream, RuntimeError};
use crate::state::{HealthState, ServiceStatus};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// What a container does when started
#[derive(Debug, Clone, PartialEq)]
pub enum StartBehavior {
    /// Running, no health check
    Running,
    /// Running and immediately healthy
    Healthy,
    /// Running with a health check that has not passed yet
    HealthPending,
    /// Runs to completion with this exit code
    Completes(i32),
    /// The start call fails
    Fails(String),
}

/// A mutating call received by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    /// `start(service)`
    Start(String),
    /// `stop(service)`
    Stop(String),
}

#[derive(Default)]
struct Inner {
    containers: BTreeMap<String, ContainerSnapshot>,
    behaviors: HashMap<String, StartBehavior>,
    calls: Vec<RuntimeCall>,
    transient_failures: u32,
    offline: bool,
    logs: HashMap<String, Vec<String>>,
    stats: BTreeMap<String, ContainerStats>,
    log_followers: HashMap<String, Vec<async_channel::Sender<String>>>,
}

/// In-memory [`ContainerRuntime`] whose containers change state instantly
#[derive(Default)]
pub struct InMemoryRuntime {
    inner: Mutex<Inner>,
}

impl InMemoryRuntime {
    /// Empty runtime
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set how `service` behaves when started
    pub fn set_behavior(&self, service: &str, behavior: StartBehavior) {
        self.lock().behaviors.insert(service.to_string(), behavior);
    }

    /// Put a container into a given state
    pub fn set_state(&self, service: &str, status: ServiceStatus, health: HealthState) {
        self.lock().containers.insert(
            service.to_string(),
            ContainerSnapshot {
                service: service.to_string(),
                status,
                health,
                exit_code: None,
            },
        );
    }

    /// Change the health of an existing container
    pub fn set_health(&self, service: &str, health: HealthState) {
        if let Some(container) = self.lock().containers.get_mut(service) {
            container.health = health;
        }
    }

    /// Remove a container
    pub fn remove(&self, service: &str) {
        self.lock().containers.remove(service);
    }

    /// Fail the next `count` calls with a transient error
    pub fn fail_next(&self, count: u32) {
        self.lock().transient_failures = count;
    }

    /// Make every call fail with a transient error until set back
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Mutating calls received so far
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    /// Number of start calls for `service`
    pub fn start_count(&self, service: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| **call == RuntimeCall::Start(service.to_string()))
            .count()
    }

    /// Report `stats` for its service while that container is running
    pub fn set_stats(&self, stats: ContainerStats) {
        self.lock().stats.insert(stats.service.clone(), stats);
    }

    /// Append a log line and deliver it to followers
    pub fn push_log(&self, service: &str, line: &str) {
        let mut inner = self.lock();
        inner
            .logs
            .entry(service.to_string())
            .or_default()
            .push(line.to_string());
        if let Some(followers) = inner.log_followers.get_mut(service) {
            followers.retain(|tx| tx.try_send(line.to_string()).is_ok());
        }
    }

    fn check_reachable(inner: &mut Inner) -> Result<(), RuntimeError> {
        if inner.offline {
            return Err(RuntimeError::Unavailable("runtime offline".to_string()));
        }
        if inner.transient_failures > 0 {
            inner.transient_failures -= 1;
            return Err(RuntimeError::Unavailable("transient failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn list(&self) -> Result<Vec<ContainerSnapshot>, RuntimeError> {
        let inner = self.lock();
        if inner.offline {
            return Err(RuntimeError::Unavailable("runtime offline".to_string()));
        }
        Ok(inner.containers.values().cloned().collect())
    }

    async fn start(&self, service: &str, _profile: Option<&str>) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        Self::check_reachable(&mut inner)?;
        inner.calls.push(RuntimeCall::Start(service.to_string()));

        let behavior = inner
            .behaviors
            .get(service)
            .cloned()
            .unwrap_or(StartBehavior::Running);
        let (status, health, exit_code) = match behavior {
            StartBehavior::Running => (ServiceStatus::Running, HealthState::None, None),
            StartBehavior::Healthy => (ServiceStatus::Running, HealthState::Healthy, None),
            StartBehavior::HealthPending => (ServiceStatus::Running, HealthState::Starting, None),
            StartBehavior::Completes(code) => (ServiceStatus::Stopped, HealthState::None, Some(code)),
            StartBehavior::Fails(message) => return Err(RuntimeError::Failed(message)),
        };
        inner.containers.insert(
            service.to_string(),
            ContainerSnapshot {
                service: service.to_string(),
                status,
                health,
                exit_code,
            },
        );
        Ok(())
    }

    async fn stop(&self, service: &str) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        Self::check_reachable(&mut inner)?;
        inner.calls.push(RuntimeCall::Stop(service.to_string()));
        if let Some(container) = inner.containers.get_mut(service) {
            container.status = ServiceStatus::Stopped;
            container.health = HealthState::None;
            container.exit_code = Some(0);
        }
        Ok(())
    }

    async fn logs(&self, service: &str, tail: usize) -> Result<LogStream, RuntimeError> {
        let mut inner = self.lock();
        Self::check_reachable(&mut inner)?;
        let history = inner.logs.get(service).cloned().unwrap_or_default();
        let recent: Vec<String> = history[history.len().saturating_sub(tail)..].to_vec();

        let (tx, rx) = async_channel::unbounded();
        inner
            .log_followers
            .entry(service.to_string())
            .or_default()
            .push(tx);
        Ok(futures::stream::iter(recent).chain(rx).boxed())
    }

    async fn stats(&self) -> Result<Vec<ContainerStats>, RuntimeError> {
        let mut inner = self.lock();
        Self::check_reachable(&mut inner)?;
        Ok(inner
            .stats
            .values()
            .filter(|stats| {
                inner
                    .containers
                    .get(&stats.service)
                    .is_some_and(|container| container.status == ServiceStatus::Running)
            })
            .cloned()
            .collect())
    }
}
