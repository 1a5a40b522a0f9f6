//! Event fan-out to subscribers.
//!
//! Status changes from the tracker, log lines from actively tailed services
//! and metrics samples with their alerts are published to every matching
//! subscription. Each subscription owns a
//! bounded buffer; when it is full the oldest event is evicted, so a slow
//! subscriber never blocks the publisher. The next read after an eviction
//! yields a single `overflow` event carrying the number of dropped events.

use crate::metrics::{Diagnostic, MetricsSample};
use crate::runtime::ContainerRuntime;
use crate::state::ServiceRuntimeState;
use crate::tracker::RuntimeStateTracker;
use async_channel::{Receiver, Sender};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Streamer configuration
#[derive(Debug, Clone)]
pub struct StreamerSettings {
    /// Events buffered per subscriber before the oldest are dropped
    pub buffer_capacity: usize,
}

impl Default for StreamerSettings {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
        }
    }
}

/// Type of a streamed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Runtime state changed
    Status,
    /// Log line
    Log,
    /// Resource usage sample
    Metrics,
    /// A diagnostic threshold was crossed
    Alert,
    /// Events were dropped for this subscriber
    Overflow,
}

/// Event delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Event type
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Service the event is about
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// Event data
    pub payload: serde_json::Value,
    /// Publication time
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    /// Status event for a state
    pub fn status(state: &ServiceRuntimeState) -> Self {
        Self {
            kind: EventKind::Status,
            service: Some(state.service.clone()),
            payload: serde_json::to_value(state).unwrap_or_default(),
            timestamp: Utc::now(),
        }
    }

    /// Log event for one line
    pub fn log(service: &str, line: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Log,
            service: Some(service.to_string()),
            payload: serde_json::json!({ "line": line.into() }),
            timestamp: Utc::now(),
        }
    }

    /// Metrics event for one sample
    pub fn metrics(sample: &MetricsSample) -> Self {
        Self {
            kind: EventKind::Metrics,
            service: Some(sample.stats.service.clone()),
            payload: serde_json::to_value(sample).unwrap_or_default(),
            timestamp: Utc::now(),
        }
    }

    /// Alert event for a diagnostic
    pub fn alert(diagnostic: &Diagnostic) -> Self {
        Self {
            kind: EventKind::Alert,
            service: Some(diagnostic.service.clone()),
            payload: serde_json::to_value(diagnostic).unwrap_or_default(),
            timestamp: Utc::now(),
        }
    }

    fn overflow(dropped: u64) -> Self {
        Self {
            kind: EventKind::Overflow,
            service: None,
            payload: serde_json::json!({ "dropped": dropped }),
            timestamp: Utc::now(),
        }
    }
}

/// Which events a subscription receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFilter {
    /// Every event
    All,
    /// Events about one service
    Service(String),
}

impl EventFilter {
    /// Whether `event` passes the filter
    pub fn matches(&self, event: &StreamEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Service(name) => event.service.as_deref() == Some(name.as_str()),
        }
    }
}

impl From<Option<String>> for EventFilter {
    fn from(service: Option<String>) -> Self {
        service.map_or(EventFilter::All, EventFilter::Service)
    }
}

struct Slot {
    filter: EventFilter,
    sender: Sender<StreamEvent>,
    dropped: Arc<AtomicU64>,
}

struct LogTail {
    followers: usize,
    task: smol::Task<()>,
}

struct StreamerInner {
    runtime: Arc<dyn ContainerRuntime>,
    settings: StreamerSettings,
    subscribers: Mutex<HashMap<Uuid, Slot>>,
    tails: Mutex<HashMap<String, LogTail>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamerInner {
    fn publish(&self, event: StreamEvent) {
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|id, slot| {
            if !slot.filter.matches(&event) {
                return true;
            }
            match slot.sender.force_send(event.clone()) {
                Ok(Some(_evicted)) => {
                    if slot.dropped.fetch_add(1, Ordering::SeqCst) == 0 {
                        warn!("Subscriber {} is lagging, dropping oldest events", id);
                    }
                    true
                }
                Ok(None) => true,
                // Receiver gone
                Err(_) => false,
            }
        });
    }

    fn follow(self: &Arc<Self>, service: &str, lines: usize) {
        let mut tails = lock(&self.tails);
        if let Some(tail) = tails.get_mut(service) {
            if !tail.task.is_finished() {
                tail.followers += 1;
                return;
            }
        }

        info!("Starting log tail for {}", service);
        let weak = Arc::downgrade(self);
        let runtime = Arc::clone(&self.runtime);
        let name = service.to_string();
        let task = smol::spawn(async move {
            let mut stream = match runtime.logs(&name, lines).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Cannot tail logs for {}: {}", name, e);
                    return;
                }
            };
            while let Some(line) = stream.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.publish(StreamEvent::log(&name, line));
            }
            debug!("Log tail for {} ended", name);
        });

        let followers = tails.get(service).map_or(0, |tail| tail.followers) + 1;
        tails.insert(service.to_string(), LogTail { followers, task });
    }

    fn unfollow(&self, service: &str) {
        let released = {
            let mut tails = lock(&self.tails);
            match tails.get_mut(service) {
                Some(tail) if tail.followers > 1 => {
                    tail.followers -= 1;
                    None
                }
                Some(_) => tails.remove(service),
                None => None,
            }
        };
        if released.is_some() {
            // Dropping the task cancels the tail
            info!("Stopping log tail for {}", service);
        }
    }
}

/// Fans status and log events out to subscribers
#[derive(Clone)]
pub struct EventStreamer {
    inner: Arc<StreamerInner>,
}

impl EventStreamer {
    /// Create a streamer; log tails are read from `runtime`
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: StreamerSettings) -> Self {
        Self {
            inner: Arc::new(StreamerInner {
                runtime,
                settings,
                subscribers: Mutex::new(HashMap::new()),
                tails: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Forward every tracker change as a status event.
    ///
    /// The returned task ends when the streamer is dropped; dropping the task
    /// detaches the tracker.
    pub fn attach(&self, tracker: &RuntimeStateTracker) -> smol::Task<()> {
        let changes = tracker.subscribe_changes();
        let weak = Arc::downgrade(&self.inner);
        smol::spawn(async move {
            while let Ok(change) = changes.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.publish(StreamEvent::status(&change.current));
            }
        })
    }

    /// Publish an event to every matching subscriber. Never blocks.
    pub fn publish(&self, event: StreamEvent) {
        self.inner.publish(event);
    }

    /// Subscribe from now on.
    ///
    /// With a service filter and a `tail` size, the service's logs are
    /// followed for the lifetime of the subscription, starting with the last
    /// `tail` lines when this subscription starts the tail.
    pub fn subscribe(&self, filter: EventFilter, tail: Option<usize>) -> Subscription {
        let (sender, receiver) = async_channel::bounded(self.inner.settings.buffer_capacity.max(1));
        let id = Uuid::new_v4();
        let dropped = Arc::new(AtomicU64::new(0));

        lock(&self.inner.subscribers).insert(
            id,
            Slot {
                filter: filter.clone(),
                sender,
                dropped: Arc::clone(&dropped),
            },
        );

        let tailing = match (&filter, tail) {
            (EventFilter::Service(service), Some(lines)) => {
                self.inner.follow(service, lines);
                Some(service.clone())
            }
            _ => None,
        };
        debug!("Subscription {} created with filter {:?}", id, filter);

        Subscription {
            id,
            filter,
            events: Box::pin(receiver),
            dropped,
            tailing,
            streamer: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscribers).len()
    }

    /// Services whose logs are being followed
    pub fn tailed_services(&self) -> Vec<String> {
        let mut services: Vec<String> = lock(&self.inner.tails).keys().cloned().collect();
        services.sort();
        services
    }
}

/// A live subscription. Dropping it unsubscribes and releases its log tail.
pub struct Subscription {
    id: Uuid,
    filter: EventFilter,
    events: Pin<Box<Receiver<StreamEvent>>>,
    dropped: Arc<AtomicU64>,
    tailing: Option<String>,
    streamer: Weak<StreamerInner>,
}

impl Subscription {
    /// Subscription id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Filter in use
    pub fn filter(&self) -> &EventFilter {
        &self.filter
    }
}

impl Stream for Subscription {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let dropped = self.dropped.swap(0, Ordering::SeqCst);
        if dropped > 0 {
            return Poll::Ready(Some(StreamEvent::overflow(dropped)));
        }
        self.events.as_mut().poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.streamer.upgrade() else {
            return;
        };
        lock(&inner.subscribers).remove(&self.id);
        if let Some(service) = &self.tailing {
            inner.unfollow(service);
        }
        debug!("Subscription {} closed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory::InMemoryRuntime;
    use crate::state::{HealthState, ServiceStatus};
    use crate::tracker::TrackerSettings;
    use futures::FutureExt;

    fn streamer(runtime: Arc<InMemoryRuntime>, capacity: usize) -> EventStreamer {
        EventStreamer::new(
            runtime,
            StreamerSettings {
                buffer_capacity: capacity,
            },
        )
    }

    fn state(service: &str, status: ServiceStatus) -> ServiceRuntimeState {
        ServiceRuntimeState::new(service, status, HealthState::None)
    }

    #[test]
    fn overflow_emits_single_marker_then_resumes() {
        smol::block_on(async {
            let streamer = streamer(Arc::new(InMemoryRuntime::new()), 4);
            let mut sub = streamer.subscribe(EventFilter::All, None);

            for i in 0..10 {
                streamer.publish(StreamEvent::log("db", format!("line {}", i)));
            }

            let marker = sub.next().await.unwrap();
            assert_eq!(marker.kind, EventKind::Overflow);
            assert_eq!(marker.payload["dropped"], 6);

            for i in 6..10 {
                let event = sub.next().await.unwrap();
                assert_eq!(event.kind, EventKind::Log);
                assert_eq!(event.payload["line"], format!("line {}", i));
            }
            assert!(sub.next().now_or_never().is_none());

            streamer.publish(StreamEvent::log("db", "after"));
            let event = sub.next().await.unwrap();
            assert_eq!(event.kind, EventKind::Log);
            assert_eq!(event.payload["line"], "after");
            assert!(sub.next().now_or_never().is_none());
        });
    }

    #[test]
    fn filter_limits_events_to_one_service() {
        smol::block_on(async {
            let streamer = streamer(Arc::new(InMemoryRuntime::new()), 16);
            let mut db = streamer.subscribe(EventFilter::Service("db".into()), None);
            let mut all = streamer.subscribe(EventFilter::All, None);

            streamer.publish(StreamEvent::status(&state("redis", ServiceStatus::Running)));
            streamer.publish(StreamEvent::status(&state("db", ServiceStatus::Running)));

            assert_eq!(db.next().await.unwrap().service.as_deref(), Some("db"));
            assert!(db.next().now_or_never().is_none());
            assert_eq!(all.next().await.unwrap().service.as_deref(), Some("redis"));
            assert_eq!(all.next().await.unwrap().service.as_deref(), Some("db"));
        });
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let streamer = streamer(Arc::new(InMemoryRuntime::new()), 16);
        let sub = streamer.subscribe(EventFilter::All, None);
        assert_eq!(streamer.subscriber_count(), 1);
        drop(sub);
        assert_eq!(streamer.subscriber_count(), 0);
    }

    #[test]
    fn log_tail_is_shared_and_released() {
        smol::block_on(async {
            let runtime = Arc::new(InMemoryRuntime::new());
            for line in ["one", "two", "three"] {
                runtime.push_log("db", line);
            }
            let streamer = streamer(runtime.clone(), 16);

            let mut first = streamer.subscribe(EventFilter::Service("db".into()), Some(2));
            assert_eq!(first.next().await.unwrap().payload["line"], "two");
            assert_eq!(first.next().await.unwrap().payload["line"], "three");

            let mut second = streamer.subscribe(EventFilter::Service("db".into()), Some(2));
            assert_eq!(streamer.tailed_services(), vec!["db"]);

            runtime.push_log("db", "four");
            assert_eq!(first.next().await.unwrap().payload["line"], "four");
            assert_eq!(second.next().await.unwrap().payload["line"], "four");

            drop(first);
            assert_eq!(streamer.tailed_services(), vec!["db"]);
            drop(second);
            assert!(streamer.tailed_services().is_empty());
        });
    }

    #[test]
    fn attached_tracker_publishes_status_events() {
        smol::block_on(async {
            let runtime = Arc::new(InMemoryRuntime::new());
            let tracker = RuntimeStateTracker::new(runtime.clone(), TrackerSettings::default());
            let streamer = streamer(runtime.clone(), 16);
            let _pump = streamer.attach(&tracker);
            let mut sub = streamer.subscribe(EventFilter::All, None);

            runtime.set_state("db", ServiceStatus::Running, HealthState::Healthy);
            tracker.poll().await.unwrap();

            let event = sub.next().await.unwrap();
            assert_eq!(event.kind, EventKind::Status);
            assert_eq!(event.payload["status"], "running");
            assert_eq!(event.payload["health"], "healthy");
        });
    }
}
