//! WebSocket client for communicating with the daemon

use crate::protocol::{Request, Response};
use anyhow::{Context, Result, anyhow};
use async_net::TcpStream;
use async_tungstenite::tungstenite::Message;
use async_tungstenite::{WebSocketStream, client_async};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use tracing::debug;

/// Daemon client for sending requests
pub struct DaemonClient {
    ws: WebSocketStream<TcpStream>,
    /// Events that arrived while waiting for a response
    pending_events: VecDeque<Response>,
}

impl DaemonClient {
    /// Connect to the daemon on 127.0.0.1:`port`
    pub async fn connect(port: u16) -> Result<Self> {
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse()?;
        let url = format!("ws://{}/", addr);

        let stream = TcpStream::connect(addr)
            .await
            .context("Failed to connect to daemon")?;

        let (ws, _) = client_async(&url, stream)
            .await
            .context("Failed to establish WebSocket connection")?;

        debug!("Connected to daemon at {}", addr);

        Ok(Self {
            ws,
            pending_events: VecDeque::new(),
        })
    }

    /// Send a request and wait for its response. Subscription events that
    /// arrive first are kept for [`DaemonClient::next_event`].
    pub async fn send_request(&mut self, request: Request) -> Result<Response> {
        let request_json = serde_json::to_string(&request)?;
        self.ws.send(Message::Text(request_json.into())).await?;

        loop {
            match self.read().await? {
                event @ Response::Event { .. } => self.pending_events.push_back(event),
                response => return Ok(response),
            }
        }
    }

    /// Next subscription event
    pub async fn next_event(&mut self) -> Result<Response> {
        if let Some(event) = self.pending_events.pop_front() {
            return Ok(event);
        }
        self.read().await
    }

    async fn read(&mut self) -> Result<Response> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let response: Response =
                        serde_json::from_str(&text).context("Failed to parse daemon response")?;
                    return Ok(response);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err(anyhow!("Connection closed by daemon")),
                Some(Err(e)) => return Err(anyhow!("WebSocket error: {}", e)),
                None => return Err(anyhow!("Connection closed unexpectedly")),
                _ => return Err(anyhow!("Unexpected message type from daemon")),
            }
        }
    }

    /// Close the connection
    pub async fn close(&mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}
