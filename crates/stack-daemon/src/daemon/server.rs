//! WebSocket server for the stack daemon

use crate::daemon::handlers;
use crate::protocol::{Request, Response};
use anyhow::{Context, Result, anyhow};
use async_channel::Sender;
use async_net::{TcpListener, TcpStream};
use async_tungstenite::accept_async;
use async_tungstenite::tungstenite::Message;
use futures::{SinkExt, StreamExt};
use stack_config::Config;
use stack_orchestration::{
    ContainerRuntime, EventFilter, EventStreamer, MetricsCollector, OrchestrationController,
    RuntimeStateTracker,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Daemon state shared between connections
///
/// The controller, tracker, streamer and collector synchronize internally,
/// so connections share the state without an outer lock.
pub struct DaemonState {
    /// Operation controller
    pub controller: Arc<OrchestrationController>,
    /// Event fan-out
    pub streamer: EventStreamer,
    /// Resource usage sampling and diagnostics
    pub metrics: Arc<MetricsCollector>,
    config_path: Option<PathBuf>,
    _background: Vec<smol::Task<()>>,
}

impl DaemonState {
    /// Build the controller stack for `config` on top of `runtime` and start polling
    pub fn new(config: &Config, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let resolver = stack_config::build_graph(config).context("Invalid stack definition")?;

        let tracker = Arc::new(RuntimeStateTracker::new(
            Arc::clone(&runtime),
            config.settings.tracker(),
        ));
        let streamer = EventStreamer::new(Arc::clone(&runtime), config.settings.streamer());
        let metrics = Arc::new(MetricsCollector::new(
            Arc::clone(&runtime),
            Arc::clone(&tracker),
            config.settings.metrics(),
        ));
        let background = vec![
            streamer.attach(&tracker),
            tracker.spawn_poller(),
            metrics.spawn(streamer.clone()),
        ];

        let controller = Arc::new(OrchestrationController::new(
            resolver,
            tracker,
            runtime,
            config.settings.controller(),
        ));

        Ok(Self {
            controller,
            streamer,
            metrics,
            config_path: None,
            _background: background,
        })
    }

    /// Remember the stack file so `reload` can re-read it
    pub fn with_config_path(mut self, path: impl AsRef<Path>) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Re-read the stack file and swap the graph. Running operations keep
    /// the graph they were planned against.
    pub fn reload(&self) -> Result<usize> {
        let path = self
            .config_path
            .as_ref()
            .ok_or_else(|| anyhow!("Daemon was started without a stack file"))?;
        let config = stack_config::parse_file(path)?;
        let resolver = stack_config::build_graph(&config)?;
        let count = resolver.graph().nodes().count();
        self.controller.replace_graph(resolver);
        info!("Reloaded {} with {} services", path.display(), count);
        Ok(count)
    }
}

/// Accept connections until the listener fails permanently
pub async fn serve(listener: TcpListener, state: Arc<DaemonState>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!("New connection from {}", peer_addr);
                let state = state.clone();
                smol::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        error!("Connection handler error: {}", e);
                    }
                })
                .detach();
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Handle a WebSocket connection
async fn handle_connection(stream: TcpStream, state: Arc<DaemonState>) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .context("Failed to accept WebSocket connection")?;

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Responses and subscription events share one writer
    let (tx, rx) = async_channel::unbounded::<Response>();
    let writer = smol::spawn(async move {
        while let Ok(response) = rx.recv().await {
            let text = match serde_json::to_string(&response) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode response: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                debug!("Writer stopped: {}", e);
                break;
            }
        }
    });

    let mut subscriptions: HashMap<Uuid, smol::Task<()>> = HashMap::new();

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let response = match serde_json::from_str::<Request>(&text) {
                    Ok(Request::Subscribe { service, tail }) => {
                        subscribe(&state, service, tail, &tx, &mut subscriptions).await
                    }
                    Ok(Request::Unsubscribe { subscription }) => {
                        match subscriptions.remove(&subscription) {
                            Some(_task) => Some(Response::Unsubscribed { subscription }),
                            None => Some(Response::Rejected {
                                message: format!("Unknown subscription {}", subscription),
                            }),
                        }
                    }
                    Ok(Request::Diagnose { service }) => {
                        Some(handlers::diagnose(&state, &service).await)
                    }
                    Ok(request) => Some(handlers::handle_request(request, &state)),
                    Err(e) => {
                        error!("Failed to parse request: {}", e);
                        Some(Response::Rejected {
                            message: format!("Invalid request format: {}", e),
                        })
                    }
                };

                if let Some(response) = response {
                    if tx.send(response).await.is_err() {
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => {
                debug!("Client requested close");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
        }
    }

    // Dropping the forwarding tasks closes their subscriptions
    drop(subscriptions);
    tx.close();
    writer.await;

    debug!("Connection closed");
    Ok(())
}

/// Open a subscription and forward its events. The `subscribed` response is
/// queued before any event so clients learn the id first.
async fn subscribe(
    state: &DaemonState,
    service: Option<String>,
    tail: Option<usize>,
    tx: &Sender<Response>,
    subscriptions: &mut HashMap<Uuid, smol::Task<()>>,
) -> Option<Response> {
    if let Some(name) = &service {
        if let Err(e) = state.controller.resolver().node(name) {
            return Some(Response::from(e));
        }
    }

    let mut subscription = state.streamer.subscribe(EventFilter::from(service), tail);
    let id = subscription.id();
    if tx.send(Response::Subscribed { subscription: id }).await.is_err() {
        return None;
    }

    let events = tx.clone();
    let task = smol::spawn(async move {
        while let Some(event) = subscription.next().await {
            let message = Response::Event {
                subscription: id,
                event,
            };
            if events.send(message).await.is_err() {
                break;
            }
        }
    });
    subscriptions.insert(id, task);
    None
}
