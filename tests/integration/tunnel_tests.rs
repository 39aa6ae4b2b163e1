//! Tunnel tests against a local WebSocket server: registration order,
//! queued delivery, inbound dispatch, reconnect and authentication.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use acp_proxy::sandbox::{BoxFuture, SandboxProvider};
use acp_proxy::tunnel::{heartbeat_message, outbound_channel, register_message, Tunnel, TunnelHandler};

use super::test_helpers::{test_config, FakeSandbox};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

struct RecordingHandler {
    connects: AtomicUsize,
    inbound: mpsc::UnboundedSender<Value>,
}

impl TunnelHandler for RecordingHandler {
    fn on_connected(&self) -> BoxFuture<'_, Vec<Value>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            vec![json!({ "type": "sandbox_inventory" })]
        })
    }

    fn on_message(&self, message: Value) {
        let _ = self.inbound.send(message);
    }
}

struct Harness {
    listener: TcpListener,
    tunnel: Tunnel,
    handler: Arc<RecordingHandler>,
    inbound: mpsc::UnboundedReceiver<Value>,
    sender: acp_proxy::tunnel::OutboundSender,
    _dir: tempfile::TempDir,
}

async fn harness(auth_token: Option<&str>) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(dir.path());
    config.orchestrator_url = format!("ws://{addr}/ws");
    config.auth_token = auth_token.map(str::to_owned);
    let config = Arc::new(config);

    let (tx, inbound) = mpsc::unbounded_channel();
    let handler = Arc::new(RecordingHandler {
        connects: AtomicUsize::new(0),
        inbound: tx,
    });
    let (sender, outbound) = outbound_channel(config.outbound_queue_capacity);
    let sandbox = FakeSandbox::default();
    let register = register_message(&config, &sandbox);
    let tunnel = Tunnel::new(
        config,
        register,
        Arc::clone(&handler) as Arc<dyn TunnelHandler>,
        outbound,
    );
    Harness {
        listener,
        tunnel,
        handler,
        inbound,
        sender,
        _dir: dir,
    }
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, listener.accept())
        .await
        .expect("connect within timeout")
        .expect("accept");
    tokio_tungstenite::accept_async(stream)
        .await
        .expect("websocket handshake")
}

async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        let message = tokio::time::timeout(STEP_TIMEOUT, ws.next())
            .await
            .expect("frame within timeout")
            .expect("socket open")
            .expect("frame");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).expect("frame is JSON");
        }
    }
}

// ── Connection lifecycle ─────────────────────────────────────────────────────

#[tokio::test]
async fn registers_then_flushes_connect_messages_then_queue() {
    let Harness {
        listener,
        tunnel,
        mut inbound,
        sender,
        _dir,
        ..
    } = harness(None).await;
    sender.send(json!({ "type": "agent_update", "run_id": "r1" }));

    let cancel = CancellationToken::new();
    let task = tokio::spawn(tunnel.run(cancel.clone()));
    let mut ws = accept(&listener).await;

    let register = next_json(&mut ws).await;
    assert_eq!(register["type"], "register_agent");
    assert_eq!(register["agent"]["id"], "agent-test");
    assert_eq!(next_json(&mut ws).await["type"], "sandbox_inventory");
    let queued = next_json(&mut ws).await;
    assert_eq!(queued["type"], "agent_update");
    assert_eq!(queued["run_id"], "r1");

    ws.send(Message::Text(
        json!({ "type": "acp_open", "run_id": "r1" }).to_string().into(),
    ))
    .await
    .expect("server send");
    ws.send(Message::Text("no type here".to_owned().into()))
        .await
        .expect("server send");
    ws.send(Message::Text(
        json!({ "type": "prompt_send", "run_id": "r1" }).to_string().into(),
    ))
    .await
    .expect("server send");

    let first = tokio::time::timeout(STEP_TIMEOUT, inbound.recv())
        .await
        .expect("dispatch within timeout")
        .expect("handler channel open");
    assert_eq!(first["type"], "acp_open");
    let second = tokio::time::timeout(STEP_TIMEOUT, inbound.recv())
        .await
        .expect("dispatch within timeout")
        .expect("handler channel open");
    assert_eq!(second["type"], "prompt_send");

    cancel.cancel();
    tokio::time::timeout(STEP_TIMEOUT, task)
        .await
        .expect("tunnel stops")
        .expect("join");
}

#[tokio::test]
async fn reconnects_and_registers_again() {
    let Harness {
        listener,
        tunnel,
        handler,
        sender,
        _dir,
        ..
    } = harness(None).await;

    let cancel = CancellationToken::new();
    let task = tokio::spawn(tunnel.run(cancel.clone()));

    let mut first = accept(&listener).await;
    assert_eq!(next_json(&mut first).await["type"], "register_agent");
    assert_eq!(next_json(&mut first).await["type"], "sandbox_inventory");
    drop(first);

    let mut second = accept(&listener).await;
    sender.send(json!({ "type": "prompt_result", "run_id": "r1" }));
    assert_eq!(next_json(&mut second).await["type"], "register_agent");
    assert_eq!(next_json(&mut second).await["type"], "sandbox_inventory");
    assert_eq!(next_json(&mut second).await["type"], "prompt_result");
    assert_eq!(handler.connects.load(Ordering::SeqCst), 2);

    cancel.cancel();
    tokio::time::timeout(STEP_TIMEOUT, task)
        .await
        .expect("tunnel stops")
        .expect("join");
}

#[tokio::test]
async fn bearer_token_is_sent_on_upgrade() {
    let Harness {
        listener,
        tunnel,
        _dir,
        ..
    } = harness(Some("tok-123")).await;

    let cancel = CancellationToken::new();
    let task = tokio::spawn(tunnel.run(cancel.clone()));

    let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, listener.accept())
        .await
        .expect("connect within timeout")
        .expect("accept");
    let seen = Arc::new(Mutex::new(None));
    let seen_in_callback = Arc::clone(&seen);
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        *seen_in_callback.lock().expect("lock") = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Ok(resp)
    })
    .await
    .expect("websocket handshake");

    assert_eq!(next_json(&mut ws).await["type"], "register_agent");
    assert_eq!(
        seen.lock().expect("lock").as_deref(),
        Some("Bearer tok-123")
    );

    cancel.cancel();
    tokio::time::timeout(STEP_TIMEOUT, task)
        .await
        .expect("tunnel stops")
        .expect("join");
}

// ── Payloads ─────────────────────────────────────────────────────────────────

#[test]
fn register_message_describes_agent_and_sandbox() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let sandbox = FakeSandbox::default();

    let message = register_message(&config, &sandbox as &dyn SandboxProvider);
    let agent = &message["agent"];
    assert_eq!(message["type"], "register_agent");
    assert_eq!(agent["name"], "Test Agent");
    assert_eq!(agent["max_concurrent"], 1);
    let sandbox_caps = &agent["capabilities"]["sandbox"];
    assert_eq!(sandbox_caps["provider"], "container_oci");
    assert_eq!(sandbox_caps["runtime"], "docker");
    assert_eq!(sandbox_caps["agentMode"], "entrypoint");
    assert_eq!(sandbox_caps["image"], "test-image");
    assert_eq!(agent["capabilities"]["acpTunnel"], true);
    assert_eq!(
        agent["capabilities"]["runtime"]["platform"],
        std::env::consts::OS
    );
}

#[test]
fn heartbeat_carries_agent_id_and_timestamp() {
    let beat = heartbeat_message("agent-test");
    assert_eq!(beat["type"], "heartbeat");
    assert_eq!(beat["agent_id"], "agent-test");
    assert!(beat["timestamp"].as_str().is_some_and(|t| !t.is_empty()));
}
