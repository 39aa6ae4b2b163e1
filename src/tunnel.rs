//! Orchestrator WebSocket tunnel with a bounded outbound queue.
//!
//! The connection loop owns the socket. Registration, the messages returned
//! by [`TunnelHandler::on_connected`] and heartbeats are written directly;
//! everything else goes through [`OutboundSender`] and is delivered in
//! order while connected. Messages sent while disconnected wait in the queue
//! until the next registration. A full queue drops streaming updates;
//! replies wait for room.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::sandbox::{now_rfc3339, BoxFuture, SandboxProvider};
use crate::{AppError, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handle onto the outbound queue.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<Value>,
}

impl OutboundSender {
    /// Queue a streaming update. Never waits; a full queue drops it.
    pub fn send(&self, message: Value) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                warn!(
                    message_type = message_type(&message),
                    "outbound queue full; message dropped"
                );
            }
            Err(TrySendError::Closed(message)) => {
                debug!(
                    message_type = message_type(&message),
                    "tunnel stopped; message dropped"
                );
            }
        }
    }

    /// Queue a reply the orchestrator waits on, waiting for room when the
    /// queue is full.
    pub async fn send_reply(&self, message: Value) {
        if let Err(err) = self.tx.send(message).await {
            debug!(
                message_type = message_type(&err.0),
                "tunnel stopped; reply dropped"
            );
        }
    }
}

/// Create the outbound queue. The receiver goes to [`Tunnel::new`].
#[must_use]
pub fn outbound_channel(capacity: usize) -> (OutboundSender, mpsc::Receiver<Value>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (OutboundSender { tx }, rx)
}

fn message_type(message: &Value) -> &str {
    message.get("type").and_then(Value::as_str).unwrap_or("unknown")
}

/// Receiver side of the tunnel.
pub trait TunnelHandler: Send + Sync {
    /// Messages to write right after registration, ahead of the queue.
    fn on_connected(&self) -> BoxFuture<'_, Vec<Value>>;

    /// Handle one inbound message. Must not block the connection loop.
    fn on_message(&self, message: Value);
}

/// `register_agent` for this proxy.
#[must_use]
pub fn register_message(config: &ProxyConfig, sandbox: &dyn SandboxProvider) -> Value {
    let mut capabilities = config.agent.capabilities.clone();
    capabilities.insert(
        "runtime".into(),
        json!({ "platform": std::env::consts::OS, "arch": std::env::consts::ARCH }),
    );
    capabilities.insert(
        "sandbox".into(),
        json!({
            "provider": sandbox.kind().as_str(),
            "runtime": sandbox.runtime(),
            "agentMode": sandbox.agent_mode().as_str(),
            "image": config.sandbox.image,
            "workingDir": config.sandbox.working_dir,
        }),
    );
    capabilities.insert("acpTunnel".into(), Value::Bool(true));
    json!({
        "type": "register_agent",
        "agent": {
            "id": config.agent.id,
            "name": config.agent.display_name(),
            "max_concurrent": config.agent.max_concurrent,
            "capabilities": capabilities,
        },
    })
}

/// `heartbeat` for `agent_id`.
#[must_use]
pub fn heartbeat_message(agent_id: &str) -> Value {
    json!({ "type": "heartbeat", "agent_id": agent_id, "timestamp": now_rfc3339() })
}

/// Parse an inbound frame; only JSON objects with a string `type` pass.
#[must_use]
pub fn parse_inbound(raw: &[u8]) -> Option<Value> {
    let value: Value = serde_json::from_slice(raw).ok()?;
    value.get("type").and_then(Value::as_str)?;
    Some(value)
}

fn frame(message: &Value) -> Result<Message> {
    Ok(Message::Text(serde_json::to_string(message)?.into()))
}

/// Persistent orchestrator connection.
pub struct Tunnel {
    config: Arc<ProxyConfig>,
    register: Value,
    handler: Arc<dyn TunnelHandler>,
    outbound: mpsc::Receiver<Value>,
    pending: Option<Value>,
}

impl Tunnel {
    /// Tunnel sending `register` on every connect.
    #[must_use]
    pub fn new(
        config: Arc<ProxyConfig>,
        register: Value,
        handler: Arc<dyn TunnelHandler>,
        outbound: mpsc::Receiver<Value>,
    ) -> Self {
        Self {
            config,
            register,
            handler,
            outbound,
            pending: None,
        }
    }

    /// Connect, serve and reconnect until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let initial = Duration::from_millis(self.config.reconnect_initial_ms.max(1));
        let max = Duration::from_millis(self.config.reconnect_max_ms).max(initial);
        let mut backoff = initial;

        loop {
            let connected = tokio::select! {
                () = cancel.cancelled() => break,
                connected = self.connect() => connected,
            };
            match connected {
                Ok(socket) => {
                    info!(url = %self.config.orchestrator_url, "tunnel connected");
                    backoff = initial;
                    match self.serve(socket, &cancel).await {
                        Ok(()) => info!("tunnel closed"),
                        Err(error) => warn!(%error, delay = ?backoff, "tunnel connection lost; reconnecting"),
                    }
                }
                Err(error) => warn!(%error, delay = ?backoff, "tunnel connect failed; retrying"),
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                () = sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(max);
        }
        info!("tunnel task exiting");
    }

    async fn connect(&self) -> Result<Socket> {
        let mut request = self
            .config
            .orchestrator_url
            .as_str()
            .into_client_request()?;
        if let Some(token) = self.config.auth_token.as_deref().filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| AppError::Config("auth_token is not a valid header value".into()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (socket, _) = connect_async(request).await?;
        Ok(socket)
    }

    async fn serve(&mut self, socket: Socket, cancel: &CancellationToken) -> Result<()> {
        let (mut sink, mut stream) = socket.split();
        sink.send(frame(&self.register)?).await?;
        for message in self.handler.on_connected().await {
            sink.send(frame(&message)?).await?;
        }
        if let Some(message) = self.pending.take() {
            if let Err(error) = sink.send(frame(&message)?).await {
                self.pending = Some(message);
                return Err(error.into());
            }
        }

        let mut heartbeat = interval(Duration::from_secs(self.config.heartbeat_seconds.max(1)));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let handler = &self.handler;
        let outbound = &mut self.outbound;
        let pending = &mut self.pending;
        let agent_id = self.config.agent.id.as_str();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                inbound = stream.next() => match inbound {
                    None => return Err(AppError::Connection("orchestrator closed the connection".into())),
                    Some(Err(error)) => return Err(error.into()),
                    Some(Ok(Message::Text(text))) => dispatch(handler.as_ref(), text.as_bytes()),
                    Some(Ok(Message::Binary(bytes))) => dispatch(handler.as_ref(), &bytes),
                    Some(Ok(Message::Ping(payload))) => sink.send(Message::Pong(payload)).await?,
                    Some(Ok(Message::Close(_))) => {
                        return Err(AppError::Connection("orchestrator sent close".into()));
                    }
                    Some(Ok(_)) => {}
                },
                _ = heartbeat.tick() => {
                    sink.send(frame(&heartbeat_message(agent_id))?).await?;
                }
                message = outbound.recv() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    if let Err(error) = sink.send(frame(&message)?).await {
                        *pending = Some(message);
                        return Err(error.into());
                    }
                }
            }
        }
    }
}

fn dispatch(handler: &dyn TunnelHandler, raw: &[u8]) {
    match parse_inbound(raw) {
        Some(message) => {
            debug!(message_type = message_type(&message), "inbound message");
            handler.on_message(message);
        }
        None => warn!(len = raw.len(), "dropping inbound frame without a type"),
    }
}
