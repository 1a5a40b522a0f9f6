//! Orchestration controller.
//!
//! The controller turns a start/stop/restart request into an [`OperationRecord`],
//! then executes its batches in order on a spawned task. Services within a batch
//! run concurrently, bounded by a shared worker pool. A service only enters
//! `issuing` once every dependency inside the operation is done, and a service
//! is only done once it meets the strongest readiness condition its dependents
//! in the operation require.

use crate::cancel::CancellationToken;
use crate::definition::DependencyCondition;
use crate::graph::ServiceNode;
use crate::operation::{
    OperationHandle, OperationKind, OperationOptions, OperationRecord, OperationStage,
    OperationStatus, OperationTarget, ServicePhase,
};
use crate::resolver::{DependencyResolver, GroupSummary, ServiceDetail};
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::state::{ServiceRuntimeState, ServiceStatus};
use crate::tracker::{ConditionOutcome, RuntimeStateTracker};
use crate::{Error, FailureReport, Result};
use smol::lock::Semaphore;
use smol::Timer;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Finished operations kept for lookup
const RETAINED_OPERATIONS: usize = 256;

/// Retry policy for transient runtime failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for any delay
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Runtime calls allowed in flight at once
    pub max_parallel: usize,
    /// Default per-service readiness timeout
    pub health_timeout: Duration,
    /// Retry policy for transient runtime failures
    pub retry: RetryPolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            health_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

/// Drives start, stop and restart operations
pub struct OrchestrationController {
    resolver: RwLock<Arc<DependencyResolver>>,
    tracker: Arc<RuntimeStateTracker>,
    runtime: Arc<dyn ContainerRuntime>,
    settings: ControllerSettings,
    workers: Arc<Semaphore>,
    locks: Arc<ServiceLocks>,
    operations: Mutex<HashMap<Uuid, OperationHandle>>,
}

/// Resolved operation before execution
struct Plan {
    kind: OperationKind,
    target: OperationTarget,
    profile: Option<String>,
    batches: Vec<Vec<String>>,
    members: BTreeSet<String>,
    stopping: BTreeSet<String>,
    mutating: BTreeSet<String>,
}

impl OrchestrationController {
    /// Create a controller over a validated graph
    pub fn new(
        resolver: DependencyResolver,
        tracker: Arc<RuntimeStateTracker>,
        runtime: Arc<dyn ContainerRuntime>,
        settings: ControllerSettings,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(settings.max_parallel.max(1)));
        Self {
            resolver: RwLock::new(Arc::new(resolver)),
            tracker,
            runtime,
            settings,
            workers,
            locks: Arc::new(ServiceLocks::default()),
            operations: Mutex::new(HashMap::new()),
        }
    }

    /// Current graph. Operations keep the graph they were planned against.
    pub fn resolver(&self) -> Arc<DependencyResolver> {
        Arc::clone(&self.resolver.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swap in a rebuilt graph
    pub fn replace_graph(&self, resolver: DependencyResolver) {
        let mut current = self.resolver.write().unwrap_or_else(PoisonError::into_inner);
        *current = Arc::new(resolver);
        info!("Service graph replaced");
    }

    /// The state tracker
    pub fn tracker(&self) -> &Arc<RuntimeStateTracker> {
        &self.tracker
    }

    /// Start `target` and everything it needs
    pub fn start(
        &self,
        target: OperationTarget,
        profile: Option<String>,
        options: OperationOptions,
    ) -> Result<OperationHandle> {
        let plan = self.plan_operation(OperationKind::Start, target, profile, &options)?;
        self.launch(plan, options)
    }

    /// Stop `target`. Refuses while dependents run unless `options.force` is set.
    pub fn stop(&self, target: OperationTarget, options: OperationOptions) -> Result<OperationHandle> {
        let plan = self.plan_operation(OperationKind::Stop, target, None, &options)?;
        self.launch(plan, options)
    }

    /// Stop then start `target` with the same batch plan
    pub fn restart(
        &self,
        target: OperationTarget,
        profile: Option<String>,
        options: OperationOptions,
    ) -> Result<OperationHandle> {
        let plan = self.plan_operation(OperationKind::Restart, target, profile, &options)?;
        self.launch(plan, options)
    }

    /// Compute the record an operation would execute, without running it
    pub fn preview(
        &self,
        kind: OperationKind,
        target: OperationTarget,
        profile: Option<String>,
        options: &OperationOptions,
    ) -> Result<OperationRecord> {
        let plan = self.plan_operation(kind, target, profile, options)?;
        Ok(OperationRecord::new(plan.target, plan.kind, plan.profile, plan.batches))
    }

    /// Current record of an operation
    pub fn operation(&self, id: Uuid) -> Result<OperationRecord> {
        self.handle(id).map(|handle| handle.snapshot())
    }

    /// Handle of an operation
    pub fn handle(&self, id: Uuid) -> Result<OperationHandle> {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(Error::OperationNotFound(id))
    }

    /// Cancel an operation
    pub fn cancel(&self, id: Uuid) -> Result<()> {
        let handle = self.handle(id)?;
        info!("Cancelling operation {}", id);
        handle.cancel();
        Ok(())
    }

    /// Records of all retained operations, newest first
    pub fn operations(&self) -> Vec<OperationRecord> {
        let mut records: Vec<OperationRecord> = self
            .operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|handle| handle.snapshot())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// State of every service in the graph
    pub fn status(&self) -> BTreeMap<String, ServiceRuntimeState> {
        let resolver = self.resolver();
        let states = self.tracker.snapshot();
        resolver
            .graph()
            .nodes()
            .map(|node| {
                let state = states
                    .get(&node.name)
                    .cloned()
                    .unwrap_or_else(|| ServiceRuntimeState::not_created(&node.name));
                (node.name.clone(), state)
            })
            .collect()
    }

    /// Groups with running counts
    pub fn groups(&self) -> Vec<GroupSummary> {
        self.resolver().group_summaries(&self.tracker.snapshot())
    }

    /// Graph and live information for one service
    pub fn service_detail(&self, name: &str) -> Result<ServiceDetail> {
        let mut detail = self.resolver().service_detail(name)?;
        detail.state = self.tracker.state(name);
        Ok(detail)
    }

    fn plan_operation(
        &self,
        kind: OperationKind,
        target: OperationTarget,
        profile: Option<String>,
        options: &OperationOptions,
    ) -> Result<Plan> {
        let resolver = self.resolver();
        let states = self.tracker.snapshot();
        let requested = resolver.resolve_target(&target)?;

        let (members, stopping, batches, mutating) = match kind {
            OperationKind::Start => {
                let members =
                    select_start_closure(&resolver, &target, requested, profile.as_deref())?;
                let batches = resolver.start_batches(&members);
                let mutating = members
                    .iter()
                    .filter(|name| status_of(&states, name) != ServiceStatus::Running)
                    .cloned()
                    .collect();
                (members, BTreeSet::new(), batches, mutating)
            }
            OperationKind::Stop | OperationKind::Restart => {
                let blocking = active_dependents(&resolver, &requested, &states)?;
                if !blocking.is_empty() && !options.force {
                    warn!(
                        "Refusing to {} {}: running dependents {}",
                        kind,
                        target,
                        blocking.join(", ")
                    );
                    return Err(Error::DependencyNotSatisfied {
                        services: requested.into_iter().collect(),
                        blocking,
                    });
                }

                let mut stopping = requested;
                stopping.extend(blocking);
                if kind == OperationKind::Stop {
                    let batches = resolver.stop_batches(&stopping);
                    let mutating = stopping
                        .iter()
                        .filter(|name| !status_of(&states, name).is_inactive())
                        .cloned()
                        .collect();
                    (stopping.clone(), stopping, batches, mutating)
                } else {
                    // Dependencies that are down come back up with the restart
                    let mut members = stopping.clone();
                    members.extend(
                        resolver
                            .closure(&stopping)?
                            .into_iter()
                            .filter(|name| needs_start(&resolver, &states, name)),
                    );
                    let batches = resolver.start_batches(&members);
                    let mutating = members.clone();
                    (members, stopping, batches, mutating)
                }
            }
        };

        Ok(Plan {
            kind,
            target,
            profile,
            batches,
            members,
            stopping,
            mutating,
        })
    }

    fn launch(&self, plan: Plan, options: OperationOptions) -> Result<OperationHandle> {
        let mut record = OperationRecord::new(
            plan.target.clone(),
            plan.kind,
            plan.profile.clone(),
            plan.batches.clone(),
        );
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = async_channel::bounded::<()>(1);

        // Every member counts, including the ones that look settled already
        let guard = self.locks.acquire(&plan.mutating, &plan.members)?;

        if plan.mutating.is_empty() {
            info!(
                "{} {} is a no-op, every service already in the desired state",
                plan.kind, plan.target
            );
            for progress in record.services.values_mut() {
                progress.phase = ServicePhase::Done;
                progress.no_op = true;
            }
            record.finish(OperationStatus::Completed);
            done_tx.close();
            drop(guard);
            let handle = OperationHandle::new(Arc::new(Mutex::new(record)), cancel, done_rx);
            self.register(handle.clone());
            return Ok(handle);
        }

        info!(
            "Accepted {} of {} as operation {} ({} batches)",
            plan.kind,
            plan.target,
            record.id,
            plan.batches.len()
        );

        let record = Arc::new(Mutex::new(record));
        let health_timeout = options
            .health_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.settings.health_timeout);
        let execution = Arc::new(Execution {
            record: Arc::clone(&record),
            resolver: self.resolver(),
            tracker: Arc::clone(&self.tracker),
            runtime: Arc::clone(&self.runtime),
            workers: Arc::clone(&self.workers),
            retry: self.settings.retry.clone(),
            health_timeout,
            cancel: cancel.clone(),
            aborted: AtomicBool::new(false),
            strict: options.strict,
            kind: plan.kind,
            profile: plan.profile,
            batches: plan.batches,
            members: plan.members,
            stopping: plan.stopping,
        });

        let handle = OperationHandle::new(record, cancel, done_rx);
        self.register(handle.clone());

        smol::spawn(async move {
            execution.run().await;
            drop(guard);
            done_tx.close();
        })
        .detach();

        Ok(handle)
    }

    fn register(&self, handle: OperationHandle) {
        let mut operations = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
        if operations.len() >= RETAINED_OPERATIONS {
            let mut finished: Vec<(Uuid, chrono::DateTime<chrono::Utc>)> = operations
                .iter()
                .map(|(id, handle)| (*id, handle.snapshot()))
                .filter(|(_, record)| record.status.is_terminal())
                .map(|(id, record)| (id, record.created_at))
                .collect();
            finished.sort_by_key(|(_, created_at)| *created_at);
            let excess = operations.len() + 1 - RETAINED_OPERATIONS;
            for (id, _) in finished.into_iter().take(excess) {
                operations.remove(&id);
            }
        }
        operations.insert(handle.id(), handle);
    }
}

fn status_of(states: &BTreeMap<String, ServiceRuntimeState>, name: &str) -> ServiceStatus {
    states
        .get(name)
        .map(|state| state.status)
        .unwrap_or(ServiceStatus::NotCreated)
}

/// Whether a dependency has to be started for its dependents to proceed.
///
/// Jobs that already ran to completion only count when some dependent needs
/// more than their successful exit.
fn needs_start(
    resolver: &DependencyResolver,
    states: &BTreeMap<String, ServiceRuntimeState>,
    name: &str,
) -> bool {
    let Some(state) = states.get(name) else {
        return true;
    };
    if state.status.is_active() {
        return false;
    }
    let completed = state.satisfies(DependencyCondition::CompletedSuccessfully);
    let only_completion = resolver
        .graph()
        .outgoing(name)
        .iter()
        .all(|edge| edge.condition == DependencyCondition::CompletedSuccessfully);
    !(completed && only_completion)
}

/// Active transitive dependents of `targets` that are not targets themselves
fn active_dependents(
    resolver: &DependencyResolver,
    targets: &BTreeSet<String>,
    states: &BTreeMap<String, ServiceRuntimeState>,
) -> Result<Vec<String>> {
    let mut dependents = BTreeSet::new();
    for target in targets {
        dependents.extend(resolver.transitive_dependents(target)?);
    }
    Ok(dependents
        .into_iter()
        .filter(|name| !targets.contains(name) && status_of(states, name).is_active())
        .collect())
}

/// Start closure with the profile policy applied.
///
/// With a profile, group targets drop members tagged for other profiles, and
/// any remaining service unavailable under the profile is a conflict. Without
/// one, all profile-tagged services in the closure must share a profile.
fn select_start_closure(
    resolver: &DependencyResolver,
    target: &OperationTarget,
    requested: BTreeSet<String>,
    profile: Option<&str>,
) -> Result<BTreeSet<String>> {
    let available = |name: &str, profile: &str| {
        resolver
            .node(name)
            .is_ok_and(|node| node.is_available_for(profile))
    };

    let requested: BTreeSet<String> = match (target, profile) {
        (OperationTarget::Group(_), Some(profile)) => requested
            .into_iter()
            .filter(|name| available(name.as_str(), profile))
            .collect(),
        _ => requested,
    };
    if requested.is_empty() {
        return Err(Error::ProfileConflict {
            services: Vec::new(),
            message: format!(
                "no member of {} is available for profile '{}'",
                target,
                profile.unwrap_or_default()
            ),
        });
    }

    let mut closure = resolver.closure(&requested)?;

    match profile {
        Some(profile) => {
            let mut needed = requested.clone();
            for name in &requested {
                needed.extend(resolver.transitive_dependencies(name)?);
            }
            // Required services of other profiles are left out
            closure.retain(|name| needed.contains(name) || available(name.as_str(), profile));

            let unavailable: Vec<String> = closure
                .iter()
                .filter(|name| !available(name.as_str(), profile))
                .cloned()
                .collect();
            if !unavailable.is_empty() {
                return Err(Error::ProfileConflict {
                    message: format!(
                        "{} not available for profile '{}'",
                        unavailable.join(", "),
                        profile
                    ),
                    services: unavailable,
                });
            }
        }
        None => {
            let tagged: Vec<&ServiceNode> = closure
                .iter()
                .filter_map(|name| resolver.node(name).ok())
                .filter(|node| node.is_profile_tagged())
                .collect();
            let mut common: Option<BTreeSet<String>> = None;
            for node in &tagged {
                common = Some(match common {
                    None => node.profiles.clone(),
                    Some(common) => common.intersection(&node.profiles).cloned().collect(),
                });
            }
            if common.is_some_and(|common| common.is_empty()) {
                let services: Vec<String> = tagged.iter().map(|node| node.name.clone()).collect();
                return Err(Error::ProfileConflict {
                    message: format!(
                        "{} belong to mutually exclusive profiles, select a profile",
                        services.join(", ")
                    ),
                    services,
                });
            }
        }
    }

    Ok(closure)
}

/// Exclusive claims on services being mutated
#[derive(Default)]
struct ServiceLocks {
    held: Mutex<BTreeSet<String>>,
}

impl ServiceLocks {
    /// Claim `services`, failing if any of `contested` is already held
    fn acquire(
        self: &Arc<Self>,
        services: &BTreeSet<String>,
        contested: &BTreeSet<String>,
    ) -> Result<LockGuard> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let conflicts: Vec<String> = contested
            .iter()
            .chain(services)
            .filter(|name| held.contains(*name))
            .cloned()
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect();
        if !conflicts.is_empty() {
            warn!("Conflicting operation holds {}", conflicts.join(", "));
            return Err(Error::ConflictingOperation {
                services: conflicts,
            });
        }
        held.extend(services.iter().cloned());
        Ok(LockGuard {
            locks: Arc::clone(self),
            services: services.clone(),
        })
    }
}

/// Releases the claimed services on drop
struct LockGuard {
    locks: Arc<ServiceLocks>,
    services: BTreeSet<String>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(PoisonError::into_inner);
        for name in &self.services {
            held.remove(name);
        }
    }
}

/// How a stage ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StageOutcome {
    Finished,
    Aborted,
    Cancelled,
}

/// How one service ended within a stage
#[derive(Debug)]
enum Step {
    Done,
    Skipped,
    Failed,
    Abort(Error),
}

/// Execution state of one operation, owned by its task
struct Execution {
    record: Arc<Mutex<OperationRecord>>,
    resolver: Arc<DependencyResolver>,
    tracker: Arc<RuntimeStateTracker>,
    runtime: Arc<dyn ContainerRuntime>,
    workers: Arc<Semaphore>,
    retry: RetryPolicy,
    health_timeout: Duration,
    cancel: CancellationToken,
    aborted: AtomicBool,
    strict: bool,
    kind: OperationKind,
    profile: Option<String>,
    batches: Vec<Vec<String>>,
    members: BTreeSet<String>,
    stopping: BTreeSet<String>,
}

impl Execution {
    fn update<R>(&self, f: impl FnOnce(&mut OperationRecord) -> R) -> R {
        let mut record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut record)
    }

    fn set_phase(&self, service: &str, phase: ServicePhase, detail: Option<String>) {
        self.update(|record| record.set_phase(service, phase, detail));
    }

    fn record_failure(&self, error: &Error) {
        self.update(|record| record.failures.push(FailureReport::from(error)));
    }

    fn halt_reason(&self) -> &'static str {
        if self.aborted.load(Ordering::SeqCst) {
            "operation aborted"
        } else {
            "cancelled"
        }
    }

    fn skip(&self, service: &str, reason: impl Into<String>) -> Step {
        let reason = reason.into();
        debug!("Skipping {}: {}", service, reason);
        self.set_phase(service, ServicePhase::Skipped, Some(reason));
        Step::Skipped
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    async fn run(&self) {
        let id = self.update(|record| {
            record.status = OperationStatus::Running;
            record.id
        });

        let outcome = match self.kind {
            OperationKind::Start => self.run_stage(OperationStage::Starting).await,
            OperationKind::Stop => self.run_stage(OperationStage::Stopping).await,
            OperationKind::Restart => match self.run_stage(OperationStage::Stopping).await {
                StageOutcome::Finished => {
                    self.update(|record| {
                        for progress in record.services.values_mut() {
                            if progress.phase == ServicePhase::Done {
                                progress.phase = ServicePhase::Queued;
                                progress.no_op = false;
                            }
                        }
                    });
                    self.run_stage(OperationStage::Starting).await
                }
                other => other,
            },
        };

        let status = self.update(|record| {
            let status = match outcome {
                StageOutcome::Cancelled if !self.aborted.load(Ordering::SeqCst) => {
                    OperationStatus::Cancelled
                }
                StageOutcome::Cancelled | StageOutcome::Aborted => OperationStatus::Failed,
                StageOutcome::Finished => {
                    if record
                        .services
                        .values()
                        .all(|progress| progress.phase == ServicePhase::Done)
                    {
                        OperationStatus::Completed
                    } else {
                        OperationStatus::PartiallyFailed
                    }
                }
            };
            record.skip_pending(self.halt_reason());
            record.finish(status);
            status
        });

        match status {
            OperationStatus::Completed => info!("Operation {} completed", id),
            OperationStatus::Failed => error!("Operation {} failed", id),
            other => warn!("Operation {} finished as {:?}", id, other),
        }
    }

    async fn run_stage(&self, stage: OperationStage) -> StageOutcome {
        let batches: Vec<Vec<String>> = match (self.kind, stage) {
            (OperationKind::Restart, OperationStage::Stopping) => {
                self.batches.iter().rev().cloned().collect()
            }
            _ => self.batches.clone(),
        };
        self.update(|record| {
            record.stage = stage;
            record.current_batch = 0;
        });

        for (index, batch) in batches.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return StageOutcome::Cancelled;
            }
            self.update(|record| record.current_batch = index);
            debug!("{:?} batch {}: {}", stage, index, batch.join(", "));

            let steps = futures::future::join_all(
                batch.iter().map(|service| self.run_service(stage, service)),
            )
            .await;

            for step in steps {
                match step {
                    Step::Abort(error) => {
                        error!("Aborting operation: {}", error);
                        self.record_failure(&error);
                        self.abort();
                    }
                    Step::Done | Step::Skipped | Step::Failed => {}
                }
            }

            if self.aborted.load(Ordering::SeqCst) {
                return StageOutcome::Aborted;
            }
        }

        if self.cancel.is_cancelled() {
            StageOutcome::Cancelled
        } else {
            StageOutcome::Finished
        }
    }

    async fn run_service(&self, stage: OperationStage, service: &str) -> Step {
        let terminal = self
            .update(|record| record.phase(service))
            .is_none_or(|phase| phase.is_terminal());
        if terminal {
            return Step::Skipped;
        }
        match stage {
            OperationStage::Starting => self.start_service(service).await,
            // Dependencies brought back by a restart were never stopped
            OperationStage::Stopping if !self.stopping.contains(service) => Step::Done,
            OperationStage::Stopping => self.stop_service(service).await,
        }
    }

    async fn start_service(&self, service: &str) -> Step {
        for (dependency, condition) in self.resolver.dependency_conditions(service) {
            if self.members.contains(&dependency) {
                if self.update(|record| record.phase(&dependency)) != Some(ServicePhase::Done) {
                    return self.skip(service, format!("dependency {} not satisfied", dependency));
                }
            } else {
                match self.wait_for(&dependency, condition).await {
                    Some(ConditionOutcome::Satisfied) => {}
                    Some(_) => {
                        let reason = format!("dependency {} not {}", dependency, condition);
                        return self.skip(service, reason);
                    }
                    None => return self.skip(service, self.halt_reason()),
                }
            }
        }

        if self.cancel.is_cancelled() {
            return self.skip(service, self.halt_reason());
        }

        let previous = self.tracker.state(service);
        let running = previous
            .as_ref()
            .is_some_and(|state| state.status == ServiceStatus::Running);

        if running && self.kind != OperationKind::Restart {
            debug!("{} already running", service);
            self.update(|record| {
                if let Some(progress) = record.services.get_mut(service) {
                    progress.no_op = true;
                }
            });
        } else {
            self.set_phase(service, ServicePhase::Issuing, None);
            let result = {
                let _permit = self.workers.acquire().await;
                if self.cancel.is_cancelled() {
                    return self.skip(service, self.halt_reason());
                }
                info!("Starting {}", service);
                self.tracker.record_transition(service, ServiceStatus::Starting);
                let profile = self.profile.as_deref();
                self.call_with_retry(service, || self.runtime.start(service, profile))
                    .await
            };

            match result {
                // Polls that began before the call returned are stale for this service
                Ok(()) => self.tracker.record_transition(service, ServiceStatus::Starting),
                Err(error) => {
                    self.tracker.record_transition(
                        service,
                        previous.map(|state| state.status).unwrap_or(ServiceStatus::NotCreated),
                    );
                    self.tracker.request_refresh();
                    return self.fail(service, error);
                }
            }
            self.tracker.request_refresh();
        }

        // Readiness demanded by dependents inside this operation
        let demanded: BTreeSet<DependencyCondition> = self
            .resolver
            .graph()
            .outgoing(service)
            .iter()
            .filter(|edge| self.members.contains(&edge.to))
            .map(|edge| edge.condition)
            .collect();
        if !demanded.is_empty() {
            self.set_phase(service, ServicePhase::AwaitingCondition, None);
        }
        for condition in demanded {
            match self.wait_for(service, condition).await {
                Some(ConditionOutcome::Satisfied) => {
                    debug!("{} is {}", service, condition);
                }
                Some(ConditionOutcome::TimedOut) => {
                    let error = Error::HealthTimeout {
                        service: service.to_string(),
                        condition,
                        timeout: self.health_timeout,
                    };
                    warn!("{}", error);
                    self.record_failure(&error);
                    self.set_phase(service, ServicePhase::Skipped, Some(error.to_string()));
                    return self.failed();
                }
                Some(ConditionOutcome::Failed(reason)) => {
                    return self.fail(
                        service,
                        Error::ServiceFailed {
                            service: service.to_string(),
                            message: reason,
                        },
                    );
                }
                None => return self.skip(service, self.halt_reason()),
            }
        }

        self.set_phase(service, ServicePhase::Done, None);
        Step::Done
    }

    async fn stop_service(&self, service: &str) -> Step {
        let dependents = self
            .resolver
            .transitive_dependents(service)
            .unwrap_or_default();
        for dependent in dependents.intersection(&self.stopping) {
            if self.update(|record| record.phase(dependent)) != Some(ServicePhase::Done) {
                return self.skip(service, format!("dependent {} was not stopped", dependent));
            }
        }

        if self.cancel.is_cancelled() {
            return self.skip(service, self.halt_reason());
        }

        let previous = self.tracker.state(service);
        if previous
            .as_ref()
            .is_none_or(|state| state.status.is_inactive())
        {
            debug!("{} already stopped", service);
            self.update(|record| {
                if let Some(progress) = record.services.get_mut(service) {
                    progress.no_op = true;
                }
            });
            self.set_phase(service, ServicePhase::Done, None);
            return Step::Done;
        }

        self.set_phase(service, ServicePhase::Issuing, None);
        let result = {
            let _permit = self.workers.acquire().await;
            if self.cancel.is_cancelled() {
                return self.skip(service, self.halt_reason());
            }
            info!("Stopping {}", service);
            self.tracker.record_transition(service, ServiceStatus::Stopping);
            self.call_with_retry(service, || self.runtime.stop(service))
                .await
        };

        match result {
            Ok(()) => self.tracker.record_transition(service, ServiceStatus::Stopping),
            Err(error) => {
                if let Some(previous) = previous {
                    self.tracker.record_transition(service, previous.status);
                }
                self.tracker.request_refresh();
                return self.fail(service, error);
            }
        }
        self.tracker.request_refresh();

        self.set_phase(service, ServicePhase::Done, None);
        Step::Done
    }

    fn fail(&self, service: &str, error: Error) -> Step {
        self.set_phase(service, ServicePhase::Error, Some(error.to_string()));
        if matches!(error, Error::RuntimeUnavailable(_)) {
            return Step::Abort(error);
        }
        warn!("{}", error);
        self.record_failure(&error);
        self.failed()
    }

    /// A service failed. In strict mode this halts sibling waits at once.
    fn failed(&self) -> Step {
        if self.strict && !self.aborted.load(Ordering::SeqCst) {
            warn!("Strict mode: aborting after first failure");
            self.abort();
        }
        Step::Failed
    }

    /// Wait for a condition; `None` when the operation was cancelled first
    async fn wait_for(
        &self,
        service: &str,
        condition: DependencyCondition,
    ) -> Option<ConditionOutcome> {
        let wait = async {
            Some(
                self.tracker
                    .await_condition(service, condition, self.health_timeout)
                    .await,
            )
        };
        let cancelled = async {
            self.cancel.cancelled().await;
            None
        };
        smol::future::or(wait, cancelled).await
    }

    async fn call_with_retry<F, Fut>(&self, service: &str, mut call: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<(), RuntimeError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        "Runtime call for {} failed ({}), retrying in {:?}",
                        service, e, delay
                    );
                    attempt += 1;
                    Timer::after(delay).await;
                }
                Err(RuntimeError::Unavailable(message)) => {
                    return Err(Error::RuntimeUnavailable(message));
                }
                Err(RuntimeError::Failed(message)) => {
                    return Err(Error::ServiceFailed {
                        service: service.to_string(),
                        message,
                    });
                }
            }
        }
    }
}
