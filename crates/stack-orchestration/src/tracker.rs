//! Runtime state tracking.
//!
//! The tracker polls the container runtime on a fixed interval, reconciles the
//! result into a cache and publishes one [`StateChange`] per delta. Readers get
//! snapshots of the cache, never a live reference.
//!
//! Optimistic transitions recorded by the controller are stamped. A poll whose
//! runtime query began before the stamp cannot overwrite that service, so a
//! slow listing never resurrects the state from before a start or stop.

use crate::definition::DependencyCondition;
use crate::runtime::ContainerRuntime;
use crate::state::{HealthState, ServiceRuntimeState, ServiceStatus, StateChange};
use crate::{Error, Result};
use async_channel::{Receiver, Sender};
use smol::Timer;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Restarts older than this are forgotten
const RESTART_HISTORY: Duration = Duration::from_secs(3600);

/// Tracker configuration
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    /// Interval between polls
    pub poll_interval: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Default)]
struct Cache {
    states: BTreeMap<String, ServiceRuntimeState>,
    /// When the last optimistic transition was recorded per service
    issued: HashMap<String, Instant>,
    /// Restarts the runtime performed on its own, oldest first
    restarts: HashMap<String, VecDeque<Instant>>,
}

impl Cache {
    fn held(&self, service: &str, since: Instant) -> bool {
        self.issued.get(service).is_some_and(|issued| *issued > since)
    }

    fn note_restart(&mut self, service: &str, at: Instant) {
        let history = self.restarts.entry(service.to_string()).or_default();
        history.push_back(at);
        while history
            .front()
            .is_some_and(|oldest| at.duration_since(*oldest) > RESTART_HISTORY)
        {
            history.pop_front();
        }
    }
}

/// Whether the runtime restarted a container between two observations
fn restarted(previous: &ServiceRuntimeState, current: &ServiceRuntimeState) -> bool {
    match current.status {
        ServiceStatus::Restarting => previous.status != ServiceStatus::Restarting,
        ServiceStatus::Running => {
            previous.status == ServiceStatus::Error
                || (previous.status == ServiceStatus::Stopped
                    && previous.exit_code.is_some_and(|code| code != 0))
        }
        _ => false,
    }
}

/// Result of waiting for a condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionOutcome {
    /// The condition holds
    Satisfied,
    /// The timeout elapsed first
    TimedOut,
    /// The condition can no longer be met
    Failed(String),
}

/// Polls the runtime and keeps a reconciled state cache
pub struct RuntimeStateTracker {
    runtime: Arc<dyn ContainerRuntime>,
    settings: TrackerSettings,
    cache: RwLock<Cache>,
    listeners: Mutex<Vec<Sender<StateChange>>>,
    refresh_tx: Sender<()>,
    refresh_rx: Receiver<()>,
}

impl RuntimeStateTracker {
    /// Create a tracker with an empty cache
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: TrackerSettings) -> Self {
        // Capacity one coalesces refresh requests that arrive during a poll
        let (refresh_tx, refresh_rx) = async_channel::bounded(1);
        Self {
            runtime,
            settings,
            cache: RwLock::new(Cache::default()),
            listeners: Mutex::new(Vec::new()),
            refresh_tx,
            refresh_rx,
        }
    }

    /// Query the runtime once and reconcile the cache.
    ///
    /// Returns the new snapshot. Containers that disappeared are dropped from
    /// the cache and reported as `not_created`. Services with a transition
    /// recorded after the query began keep their cached state.
    pub async fn poll(&self) -> Result<BTreeMap<String, ServiceRuntimeState>> {
        let began = Instant::now();
        let containers = self
            .runtime
            .list()
            .await
            .map_err(|e| Error::RuntimeUnavailable(e.to_string()))?;

        let mut observed = BTreeMap::new();
        for container in containers {
            let state = ServiceRuntimeState::new(&container.service, container.status, container.health)
                .with_exit_code(container.exit_code);
            observed.insert(container.service, state);
        }

        let mut changes = Vec::new();
        let snapshot = {
            let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
            let mut restarts = Vec::new();

            for (name, state) in &observed {
                if cache.held(name, began) {
                    continue;
                }
                let previous = cache.states.get(name);
                if previous.is_some_and(|previous| restarted(previous, state)) {
                    restarts.push(name.clone());
                }
                if previous.is_none_or(|previous| !previous.same_as(state)) {
                    changes.push(StateChange {
                        service: name.clone(),
                        previous: previous.cloned(),
                        current: state.clone(),
                    });
                }
            }
            for (name, previous) in cache.states.iter() {
                if !observed.contains_key(name)
                    && !cache.held(name, began)
                    && previous.status != ServiceStatus::NotCreated
                {
                    changes.push(StateChange {
                        service: name.clone(),
                        previous: Some(previous.clone()),
                        current: ServiceRuntimeState::not_created(name),
                    });
                }
            }

            for name in restarts {
                debug!("{} was restarted by the runtime", name);
                cache.note_restart(&name, began);
            }

            let held: Vec<(String, ServiceRuntimeState)> = cache
                .states
                .iter()
                .filter(|(name, _)| cache.held(name, began))
                .map(|(name, state)| (name.clone(), state.clone()))
                .collect();
            cache.states = observed;
            cache.states.extend(held);
            cache.issued.retain(|_, issued| *issued > began);
            cache.states.clone()
        };

        if !changes.is_empty() {
            debug!("Poll observed {} state changes", changes.len());
        }
        self.publish(changes);
        Ok(snapshot)
    }

    /// Copy of the cache
    pub fn snapshot(&self) -> BTreeMap<String, ServiceRuntimeState> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .states
            .clone()
    }

    /// Cached state of one service
    pub fn state(&self, service: &str) -> Option<ServiceRuntimeState> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .states
            .get(service)
            .cloned()
    }

    /// Restarts the runtime performed on its own within `window`
    pub fn restarts_within(&self, service: &str, window: Duration) -> usize {
        let now = Instant::now();
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .restarts
            .get(service)
            .map(|history| {
                history
                    .iter()
                    .filter(|at| now.duration_since(**at) <= window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Optimistic transition recorded when an operation issues a runtime call.
    ///
    /// Stamps the service even when the state is unchanged, so polls already
    /// in flight are ignored for it.
    pub fn record_transition(&self, service: &str, status: ServiceStatus) {
        let change = {
            let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
            cache.issued.insert(service.to_string(), Instant::now());
            let previous = cache.states.get(service).cloned();
            let health = match status {
                ServiceStatus::Starting | ServiceStatus::Restarting => HealthState::Starting,
                ServiceStatus::Running => previous.as_ref().map(|p| p.health).unwrap_or_default(),
                _ => HealthState::None,
            };
            let current = ServiceRuntimeState::new(service, status, health);
            if previous.as_ref().is_some_and(|p| p.same_as(&current)) {
                return;
            }
            cache.states.insert(service.to_string(), current.clone());
            StateChange {
                service: service.to_string(),
                previous,
                current,
            }
        };
        self.publish(vec![change]);
    }

    /// Receive every future state change
    pub fn subscribe_changes(&self) -> Receiver<StateChange> {
        let (tx, rx) = async_channel::unbounded();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn publish(&self, changes: Vec<StateChange>) {
        if changes.is_empty() {
            return;
        }
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|listener| {
            changes
                .iter()
                .all(|change| listener.try_send(change.clone()).is_ok())
        });
    }

    /// Ask the poller to run before its next tick
    pub fn request_refresh(&self) {
        let _ = self.refresh_tx.try_send(());
    }

    /// Wait until `service` meets `condition`.
    ///
    /// Checks the cache first, then waits on change notifications until the
    /// condition holds, becomes impossible, or the timeout elapses.
    pub async fn await_condition(
        &self,
        service: &str,
        condition: DependencyCondition,
        timeout: Duration,
    ) -> ConditionOutcome {
        let deadline = Instant::now() + timeout;
        // Subscribe before reading the cache so no change slips in between
        let changes = self.subscribe_changes();

        if let Some(outcome) = self
            .state(service)
            .and_then(|state| evaluate(&state, condition))
        {
            return outcome;
        }

        let wait = async {
            while let Ok(change) = changes.recv().await {
                if change.service != service {
                    continue;
                }
                if let Some(outcome) = evaluate(&change.current, condition) {
                    return outcome;
                }
            }
            futures::future::pending::<ConditionOutcome>().await
        };
        let expire = async {
            Timer::at(deadline).await;
            ConditionOutcome::TimedOut
        };
        smol::future::or(wait, expire).await
    }

    /// Spawn the background polling loop. Dropping the task stops it.
    pub fn spawn_poller(self: &Arc<Self>) -> smol::Task<()> {
        let tracker = Arc::clone(self);
        info!(
            "Starting runtime poller with interval {:?}",
            tracker.settings.poll_interval
        );
        smol::spawn(async move {
            let mut reachable = true;
            loop {
                match tracker.poll().await {
                    Ok(_) if !reachable => {
                        info!("Container runtime reachable again");
                        reachable = true;
                    }
                    Ok(_) => {}
                    Err(e) if reachable => {
                        warn!("Runtime poll failed: {}", e);
                        reachable = false;
                    }
                    Err(e) => debug!("Runtime poll failed: {}", e),
                }

                let tick = async {
                    Timer::after(tracker.settings.poll_interval).await;
                };
                let refresh = async {
                    let _ = tracker.refresh_rx.recv().await;
                };
                smol::future::or(tick, refresh).await;
            }
        })
    }
}

fn evaluate(state: &ServiceRuntimeState, condition: DependencyCondition) -> Option<ConditionOutcome> {
    if state.satisfies(condition) {
        Some(ConditionOutcome::Satisfied)
    } else {
        state.failure_for(condition).map(ConditionOutcome::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory::InMemoryRuntime;

    fn tracker(runtime: &Arc<InMemoryRuntime>) -> Arc<RuntimeStateTracker> {
        Arc::new(RuntimeStateTracker::new(
            runtime.clone(),
            TrackerSettings {
                poll_interval: Duration::from_millis(10),
            },
        ))
    }

    #[test]
    fn poll_emits_only_deltas() {
        smol::block_on(async {
            let runtime = Arc::new(InMemoryRuntime::new());
            runtime.set_state("db", ServiceStatus::Running, HealthState::Starting);
            let tracker = tracker(&runtime);
            let changes = tracker.subscribe_changes();

            tracker.poll().await.unwrap();
            assert_eq!(changes.try_recv().unwrap().service, "db");

            tracker.poll().await.unwrap();
            assert!(changes.try_recv().is_err());

            runtime.set_health("db", HealthState::Healthy);
            tracker.poll().await.unwrap();
            let change = changes.try_recv().unwrap();
            assert_eq!(change.previous.unwrap().health, HealthState::Starting);
            assert_eq!(change.current.health, HealthState::Healthy);
        });
    }

    #[test]
    fn removed_container_is_dropped_from_cache() {
        smol::block_on(async {
            let runtime = Arc::new(InMemoryRuntime::new());
            runtime.set_state("db", ServiceStatus::Stopped, HealthState::None);
            let tracker = tracker(&runtime);
            tracker.poll().await.unwrap();
            let changes = tracker.subscribe_changes();

            runtime.remove("db");
            let snapshot = tracker.poll().await.unwrap();
            assert!(snapshot.is_empty());
            assert_eq!(
                changes.try_recv().unwrap().current.status,
                ServiceStatus::NotCreated
            );
        });
    }

    #[test]
    fn poll_failure_is_runtime_unavailable() {
        smol::block_on(async {
            let runtime = Arc::new(InMemoryRuntime::new());
            runtime.set_offline(true);
            let tracker = tracker(&runtime);
            assert!(matches!(
                tracker.poll().await,
                Err(Error::RuntimeUnavailable(_))
            ));
        });
    }

    #[test]
    fn await_condition_wakes_on_change() {
        smol::block_on(async {
            let runtime = Arc::new(InMemoryRuntime::new());
            runtime.set_state("db", ServiceStatus::Running, HealthState::Starting);
            let tracker = tracker(&runtime);
            tracker.poll().await.unwrap();

            let waiter = {
                let tracker = tracker.clone();
                smol::spawn(async move {
                    tracker
                        .await_condition("db", DependencyCondition::Healthy, Duration::from_secs(5))
                        .await
                })
            };
            Timer::after(Duration::from_millis(20)).await;
            runtime.set_health("db", HealthState::Healthy);
            tracker.poll().await.unwrap();

            assert_eq!(waiter.await, ConditionOutcome::Satisfied);
        });
    }

    #[test]
    fn await_condition_times_out() {
        smol::block_on(async {
            let runtime = Arc::new(InMemoryRuntime::new());
            let tracker = tracker(&runtime);
            let outcome = tracker
                .await_condition("db", DependencyCondition::Started, Duration::from_millis(30))
                .await;
            assert_eq!(outcome, ConditionOutcome::TimedOut);
        });
    }

    #[test]
    fn await_completion_fails_on_nonzero_exit() {
        smol::block_on(async {
            let runtime = Arc::new(InMemoryRuntime::new());
            runtime.set_behavior("migrate", crate::runtime::memory::StartBehavior::Completes(3));
            runtime.start("migrate", None).await.unwrap();
            let tracker = tracker(&runtime);
            tracker.poll().await.unwrap();

            let outcome = tracker
                .await_condition(
                    "migrate",
                    DependencyCondition::CompletedSuccessfully,
                    Duration::from_secs(1),
                )
                .await;
            assert!(matches!(outcome, ConditionOutcome::Failed(_)));
        });
    }

    #[test]
    fn poll_started_before_a_transition_does_not_overwrite_it() {
        smol::block_on(async {
            let runtime = Arc::new(InMemoryRuntime::new());
            runtime.set_state("job", ServiceStatus::Stopped, HealthState::None);
            let tracker = tracker(&runtime);
            tracker.poll().await.unwrap();

            let began = Instant::now();
            Timer::after(Duration::from_millis(5)).await;
            tracker.record_transition("job", ServiceStatus::Starting);
            {
                let cache = tracker.cache.read().unwrap();
                assert!(cache.held("job", began));
            }

            // A poll beginning now is fresh and reconciles normally
            tracker.poll().await.unwrap();
            assert_eq!(tracker.state("job").unwrap().status, ServiceStatus::Stopped);
        });
    }

    #[test]
    fn runtime_restarts_are_counted() {
        smol::block_on(async {
            let runtime = Arc::new(InMemoryRuntime::new());
            runtime.set_state("worker", ServiceStatus::Running, HealthState::None);
            let tracker = tracker(&runtime);
            tracker.poll().await.unwrap();

            for _ in 0..3 {
                runtime.set_state("worker", ServiceStatus::Restarting, HealthState::None);
                tracker.poll().await.unwrap();
                runtime.set_state("worker", ServiceStatus::Running, HealthState::None);
                tracker.poll().await.unwrap();
            }
            assert_eq!(tracker.restarts_within("worker", Duration::from_secs(60)), 3);

            // Transitions issued by an operation are not restarts
            tracker.record_transition("worker", ServiceStatus::Restarting);
            runtime.set_state("worker", ServiceStatus::Running, HealthState::None);
            tracker.poll().await.unwrap();
            assert_eq!(tracker.restarts_within("worker", Duration::from_secs(60)), 3);
            assert_eq!(tracker.restarts_within("other", Duration::from_secs(60)), 0);
        });
    }

    #[test]
    fn poller_picks_up_changes_without_explicit_poll() {
        smol::block_on(async {
            let runtime = Arc::new(InMemoryRuntime::new());
            let tracker = tracker(&runtime);
            let _poller = tracker.spawn_poller();

            runtime.set_state("db", ServiceStatus::Running, HealthState::None);
            tracker.request_refresh();
            let outcome = tracker
                .await_condition("db", DependencyCondition::Started, Duration::from_secs(2))
                .await;
            assert_eq!(outcome, ConditionOutcome::Satisfied);
        });
    }
}
