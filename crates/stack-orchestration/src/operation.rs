//! Operation records and handles.

use crate::FailureReport;
use crate::cancel::CancellationToken;
use async_channel::Receiver;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Kind of operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Start services and their dependencies
    Start,
    /// Stop services, dependents first
    Stop,
    /// Stop then start the same closure
    Restart,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Start => "start",
            OperationKind::Stop => "stop",
            OperationKind::Restart => "restart",
        })
    }
}

/// What an operation acts on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum OperationTarget {
    /// A single service
    Service(String),
    /// Every member of a group
    Group(String),
}

impl fmt::Display for OperationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationTarget::Service(name) => write!(f, "service {}", name),
            OperationTarget::Group(name) => write!(f, "group {}", name),
        }
    }
}

/// Caller options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationOptions {
    /// Stop running dependents instead of refusing
    #[serde(default)]
    pub force: bool,
    /// Abort the whole operation on the first service failure
    #[serde(default)]
    pub strict: bool,
    /// Override the per-service readiness timeout, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_timeout_secs: Option<u64>,
}

/// Overall status of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Accepted, not started
    Pending,
    /// Executing batches
    Running,
    /// Every service succeeded
    Completed,
    /// Some branches failed or were skipped
    PartiallyFailed,
    /// Aborted
    Failed,
    /// Cancelled by the caller
    Cancelled,
}

impl OperationStatus {
    /// No further progress will happen
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Pending | OperationStatus::Running)
    }
}

/// Which half of an operation is executing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStage {
    /// Issuing stop calls
    Stopping,
    /// Issuing start calls
    Starting,
}

/// Per-service progress within an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServicePhase {
    /// Waiting for its batch
    Queued,
    /// Runtime call in flight
    Issuing,
    /// Waiting for the readiness its dependents require
    AwaitingCondition,
    /// Finished successfully
    Done,
    /// Not attempted or abandoned
    Skipped,
    /// Failed
    Error,
}

impl ServicePhase {
    /// Done, skipped or error
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServicePhase::Done | ServicePhase::Skipped | ServicePhase::Error)
    }
}

/// Final per-service result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceOutcome {
    /// Succeeded
    Success,
    /// Failed
    Error,
    /// Skipped
    Skipped,
}

/// Progress of one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceProgress {
    /// Current phase
    pub phase: ServicePhase,
    /// Reason for a skip or error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Already in the desired state, no runtime call was made
    #[serde(default)]
    pub no_op: bool,
}

impl ServiceProgress {
    fn queued() -> Self {
        Self {
            phase: ServicePhase::Queued,
            detail: None,
            no_op: false,
        }
    }

    /// Outcome once the phase is terminal
    pub fn outcome(&self) -> Option<ServiceOutcome> {
        match self.phase {
            ServicePhase::Done => Some(ServiceOutcome::Success),
            ServicePhase::Skipped => Some(ServiceOutcome::Skipped),
            ServicePhase::Error => Some(ServiceOutcome::Error),
            _ => None,
        }
    }
}

/// State of one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Operation id
    pub id: Uuid,
    /// Requested target
    pub target: OperationTarget,
    /// Kind
    pub kind: OperationKind,
    /// Profile used for start calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    /// Batches in start order for start/restart and stop order for stop
    pub batches: Vec<Vec<String>>,
    /// Index of the executing batch within the current stage
    pub current_batch: usize,
    /// Current stage
    pub stage: OperationStage,
    /// Per-service progress
    pub services: BTreeMap<String, ServiceProgress>,
    /// Overall status
    pub status: OperationStatus,
    /// Failures collected while executing
    pub failures: Vec<FailureReport>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time the operation became terminal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl OperationRecord {
    pub(crate) fn new(
        target: OperationTarget,
        kind: OperationKind,
        profile: Option<String>,
        batches: Vec<Vec<String>>,
    ) -> Self {
        let services = batches
            .iter()
            .flatten()
            .map(|name| (name.clone(), ServiceProgress::queued()))
            .collect();
        let stage = match kind {
            OperationKind::Start => OperationStage::Starting,
            OperationKind::Stop | OperationKind::Restart => OperationStage::Stopping,
        };
        Self {
            id: Uuid::new_v4(),
            target,
            kind,
            profile,
            batches,
            current_batch: 0,
            stage,
            services,
            status: OperationStatus::Pending,
            failures: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Final outcome per service, for services that reached a terminal phase
    pub fn outcomes(&self) -> BTreeMap<String, ServiceOutcome> {
        self.services
            .iter()
            .filter_map(|(name, progress)| progress.outcome().map(|o| (name.clone(), o)))
            .collect()
    }

    /// Phase of one service
    pub fn phase(&self, service: &str) -> Option<ServicePhase> {
        self.services.get(service).map(|progress| progress.phase)
    }

    pub(crate) fn set_phase(&mut self, service: &str, phase: ServicePhase, detail: Option<String>) {
        if let Some(progress) = self.services.get_mut(service) {
            progress.phase = phase;
            progress.detail = detail;
        }
    }

    /// Skip every service that has not reached a terminal phase
    pub(crate) fn skip_pending(&mut self, reason: &str) {
        for progress in self.services.values_mut() {
            if !progress.phase.is_terminal() {
                progress.phase = ServicePhase::Skipped;
                progress.detail = Some(reason.to_string());
            }
        }
    }

    pub(crate) fn finish(&mut self, status: OperationStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

/// Handle to a running or finished operation
#[derive(Debug, Clone)]
pub struct OperationHandle {
    record: Arc<Mutex<OperationRecord>>,
    cancel: CancellationToken,
    done: Receiver<()>,
}

impl OperationHandle {
    pub(crate) fn new(
        record: Arc<Mutex<OperationRecord>>,
        cancel: CancellationToken,
        done: Receiver<()>,
    ) -> Self {
        Self {
            record,
            cancel,
            done,
        }
    }

    /// Operation id
    pub fn id(&self) -> Uuid {
        self.snapshot().id
    }

    /// Copy of the current record
    pub fn snapshot(&self) -> OperationRecord {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Request cancellation. Calls already issued are allowed to finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the operation to become terminal and return the final record
    pub async fn wait(&self) -> OperationRecord {
        // The executor closes the channel when it finishes
        let _ = self.done.recv().await;
        self.snapshot()
    }
}
