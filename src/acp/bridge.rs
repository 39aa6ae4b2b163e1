//! Agent bridge: JSON-RPC over one sandboxed process's stdio.
//!
//! The bridge owns a [`ProcessHandle`] and runs four tasks around it:
//!
//! - **writer**: drains a bounded frame channel into stdin ([`run_writer`]);
//! - **reader**: decodes stdout lines, resolves pending calls, pumps
//!   notifications and answers agent-initiated requests;
//! - **stderr**: redacts diagnostic lines and watches for the init marker;
//! - **exit watcher**: fails outstanding calls when the process ends and
//!   forwards the exit to the owner unless [`AgentBridge::close`] ran first.
//!
//! Pending calls live in a map keyed by request id. Each entry is a
//! [`oneshot`] sender that is removed exactly once: by its response, by its
//! timeout, or by bridge teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acp::codec::{NdjsonCodec, MAX_STDERR_LINE_BYTES};
use crate::acp::init_marker::{parse_marker_payload, InitResult, INIT_MARKER_PREFIX};
use crate::acp::jsonrpc::{self, id_key, RpcError, RpcMessage};
use crate::acp::redact::Redactor;
use crate::acp::writer::{run_writer, FRAME_CHANNEL_CAPACITY};
use crate::sandbox::process::{BoxedReader, ExitInfo, ProcessHandle};
use crate::sandbox::BoxFuture;
use crate::{AppError, Result};

/// Default per-call deadline.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(300);

/// How long the exit watcher lets the output readers drain after the
/// process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Value>>>>>;

// ── Owner callbacks ──────────────────────────────────────────────────────────

/// Which phase a stderr line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrKind {
    /// Emitted while the init script is still running.
    Init,
    /// Emitted by the agent itself.
    Agent,
}

impl StderrKind {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Agent => "agent",
        }
    }
}

/// Receives bridge events. Called from the bridge's tasks; implementations
/// must not block.
pub trait BridgeObserver: Send + Sync {
    /// A JSON-RPC notification from the agent, in stream order.
    fn on_notification(&self, method: &str, params: &Value);

    /// A redacted, non-blank stderr line.
    fn on_stderr(&self, kind: StderrKind, line: &str);

    /// The process exited without [`AgentBridge::close`] being called.
    fn on_exit(&self, info: ExitInfo);
}

/// Answers agent-initiated JSON-RPC requests.
pub trait AgentRequestHandler: Send + Sync {
    /// Handle one request. Errors are sent back as JSON-RPC error objects.
    fn handle_request(
        &self,
        id: Value,
        method: String,
        params: Value,
    ) -> BoxFuture<'_, std::result::Result<Value, RpcError>>;
}

/// Construction options for [`AgentBridge::start`].
pub struct BridgeOptions {
    /// Log label, usually the run id.
    pub label: String,
    /// Whether an init marker is expected on stderr.
    pub init_pending: bool,
    /// Applied to every stderr line before classification.
    pub redactor: Redactor,
    /// Event sink.
    pub observer: Arc<dyn BridgeObserver>,
    /// Handler for agent requests; `None` answers everything with
    /// method-not-found.
    pub handler: Option<Arc<dyn AgentRequestHandler>>,
}

// ── Init phase ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum InitPhase {
    NotRequired,
    Pending,
    Done(InitResult),
    Failed(AppError),
}

impl InitPhase {
    fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Settle a pending init with `phase`; later outcomes are ignored.
fn settle_init(init_tx: &watch::Sender<InitPhase>, phase: InitPhase) {
    init_tx.send_if_modified(|current| {
        if current.is_pending() {
            *current = phase;
            true
        } else {
            false
        }
    });
}

// ── Bridge ───────────────────────────────────────────────────────────────────

/// JSON-RPC client bound to one agent process.
pub struct AgentBridge {
    label: String,
    next_id: AtomicU64,
    pending: PendingMap,
    frames_tx: mpsc::Sender<Value>,
    init_tx: Arc<watch::Sender<InitPhase>>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
    kill: CancellationToken,
}

impl std::fmt::Debug for AgentBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentBridge")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl AgentBridge {
    /// Take ownership of `handle` and start the bridge tasks.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(handle: ProcessHandle, opts: BridgeOptions) -> Arc<Self> {
        let ProcessHandle {
            stdin,
            stdout,
            stderr,
            exit,
            kill,
        } = handle;
        let BridgeOptions {
            label,
            init_pending,
            redactor,
            observer,
            handler,
        } = opts;

        let initial = if init_pending {
            InitPhase::Pending
        } else {
            InitPhase::NotRequired
        };
        let (init_tx, _) = watch::channel(initial);
        let init_tx = Arc::new(init_tx);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);

        // Writer.
        {
            let label = label.clone();
            let pending = Arc::clone(&pending);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = run_writer(label, stdin, frames_rx, cancel).await {
                    fail_pending(&pending, &err).await;
                }
            });
        }

        // Reader.
        let reader_task = tokio::spawn(run_reader(
            label.clone(),
            stdout,
            Arc::clone(&pending),
            frames_tx.clone(),
            Arc::clone(&observer),
            handler,
            cancel.clone(),
        ));

        // Stderr.
        let stderr_task = match stderr {
            Some(stderr) => Some(tokio::spawn(run_stderr(
                label.clone(),
                stderr,
                redactor,
                Arc::clone(&init_tx),
                Arc::clone(&observer),
                cancel.clone(),
            ))),
            None => {
                settle_init(
                    &init_tx,
                    InitPhase::Failed(AppError::InitHandshake("stderr not available".into())),
                );
                None
            }
        };

        // Exit watcher.
        {
            let label = label.clone();
            let pending = Arc::clone(&pending);
            let init_tx = Arc::clone(&init_tx);
            let closed = Arc::clone(&closed);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let info = exit.await.unwrap_or_default();
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader_task).await;
                if let Some(task) = stderr_task {
                    let _ = tokio::time::timeout(DRAIN_TIMEOUT, task).await;
                }

                let err = AppError::Acp(format!(
                    "agent exited (code {:?}, signal {:?})",
                    info.code, info.signal
                ));
                fail_pending(&pending, &err).await;
                settle_init(
                    &init_tx,
                    InitPhase::Failed(AppError::InitHandshake(
                        "agent exited before reporting init result".into(),
                    )),
                );
                cancel.cancel();

                if closed.load(Ordering::SeqCst) {
                    debug!(label = %label, "agent exited after close");
                } else {
                    info!(label = %label, code = ?info.code, signal = ?info.signal, "agent exited");
                    observer.on_exit(info);
                }
            });
        }

        Arc::new(Self {
            label,
            next_id: AtomicU64::new(1),
            pending,
            frames_tx,
            init_tx,
            closed,
            cancel,
            kill,
        })
    }

    /// Log label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn write(&self, frame: Value) -> Result<()> {
        if self.is_closed() {
            return Err(AppError::Acp("agent not connected".into()));
        }
        self.frames_tx
            .send(frame)
            .await
            .map_err(|_| AppError::Acp("agent not connected".into()))
    }

    /// Send a request and wait for the matching response.
    ///
    /// # Errors
    ///
    /// - `AppError::Rpc` when the agent answers with an error object.
    /// - `AppError::RpcTimeout` when no response arrives within `timeout`.
    /// - `AppError::AgentClosed` when the bridge is closed meanwhile.
    /// - `AppError::Acp` when the agent is not connected or exits.
    pub async fn send_rpc(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        if self.is_closed() {
            return Err(AppError::Acp("agent not connected".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let key = id.to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(key.clone(), tx);

        if let Err(err) = self.write(jsonrpc::request(id, method, params)).await {
            self.pending.lock().await.remove(&key);
            return Err(err);
        }
        debug!(label = %self.label, id, method, "rpc sent");

        tokio::select! {
            biased;
            outcome = rx => outcome.unwrap_or(Err(AppError::AgentClosed)),
            () = tokio::time::sleep(timeout) => {
                self.pending.lock().await.remove(&key);
                Err(AppError::RpcTimeout {
                    method: method.to_owned(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
            () = self.cancel.cancelled() => {
                self.pending.lock().await.remove(&key);
                Err(AppError::AgentClosed)
            }
        }
    }

    /// Send a notification.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Acp("agent not connected")` after close.
    pub async fn send_notification(&self, method: &str, params: Value) -> Result<()> {
        self.write(jsonrpc::notification(method, params)).await
    }

    /// Wait for the init marker.
    ///
    /// Returns `{ok: true, exit_code: None}` at once when no init was
    /// expected. A marker reporting failure is returned as `ok: false`.
    ///
    /// # Errors
    ///
    /// `AppError::InitHandshake` on timeout (`init timeout after {ms}ms`), a
    /// malformed marker, missing stderr, or agent exit; `AppError::AgentClosed`
    /// if the bridge closes first.
    pub async fn wait_for_init_result(&self, timeout: Duration) -> Result<InitResult> {
        let mut rx = self.init_tx.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|phase| !phase.is_pending())
                .await
                .map(|phase| (*phase).clone())
        })
        .await;

        match waited {
            Err(_) => Err(AppError::InitHandshake(format!(
                "init timeout after {}ms",
                timeout.as_millis()
            ))),
            Ok(Err(_)) => Err(AppError::AgentClosed),
            Ok(Ok(InitPhase::NotRequired)) => Ok(InitResult::not_required()),
            Ok(Ok(InitPhase::Done(result))) => Ok(result),
            Ok(Ok(InitPhase::Failed(err))) => Err(err),
            Ok(Ok(InitPhase::Pending)) => Err(AppError::InitHandshake("init still pending".into())),
        }
    }

    /// Tear the bridge down. Idempotent.
    ///
    /// Aborts init waits, rejects every pending call with "agent closed",
    /// stops the stream tasks and terminates the process.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(label = %self.label, "closing agent bridge");
        settle_init(&self.init_tx, InitPhase::Failed(AppError::AgentClosed));
        fail_pending(&self.pending, &AppError::AgentClosed).await;
        self.cancel.cancel();
        self.kill.cancel();
    }
}

async fn fail_pending(pending: &PendingMap, err: &AppError) {
    let drained: Vec<_> = pending.lock().await.drain().collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(err.clone()));
    }
}

// ── Stream tasks ─────────────────────────────────────────────────────────────

async fn run_reader(
    label: String,
    stdout: BoxedReader,
    pending: PendingMap,
    frames_tx: mpsc::Sender<Value>,
    observer: Arc<dyn BridgeObserver>,
    handler: Option<Arc<dyn AgentRequestHandler>>,
    cancel: CancellationToken,
) {
    let mut lines = FramedRead::new(stdout, NdjsonCodec::new());

    loop {
        let line = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = lines.next() => match next {
                None => {
                    debug!(label = %label, "agent stdout closed");
                    break;
                }
                Some(Ok(line)) => line,
                Some(Err(AppError::Io(err))) => {
                    warn!(label = %label, %err, "agent stdout read failed");
                    break;
                }
                Some(Err(err)) => {
                    warn!(label = %label, %err, "skipping agent stdout line");
                    continue;
                }
            },
        };

        if line.trim().is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(err) => {
                warn!(label = %label, %err, "agent emitted non-JSON line, skipping");
                continue;
            }
        };

        match RpcMessage::classify(value) {
            Some(RpcMessage::Response { id, outcome }) => {
                let entry = match id_key(&id) {
                    Some(key) => pending.lock().await.remove(&key),
                    None => None,
                };
                match entry {
                    Some(tx) => {
                        let _ = tx.send(outcome.map_err(AppError::Rpc));
                    }
                    None => debug!(label = %label, %id, "dropping unmatched response"),
                }
            }
            Some(RpcMessage::Notification { method, params }) => {
                observer.on_notification(&method, &params);
            }
            Some(RpcMessage::Request { id, method, params }) => {
                let handler = handler.clone();
                let frames_tx = frames_tx.clone();
                tokio::spawn(async move {
                    let outcome = match handler {
                        Some(h) => h.handle_request(id.clone(), method.clone(), params).await,
                        None => Err(RpcError::method_not_found(&method)),
                    };
                    let frame = match outcome {
                        Ok(result) => jsonrpc::ok_response(id, result),
                        Err(err) => jsonrpc::error_response(id, &err),
                    };
                    let _ = frames_tx.send(frame).await;
                });
            }
            None => debug!(label = %label, "ignoring non-JSON-RPC message"),
        }
    }
}

async fn run_stderr(
    label: String,
    stderr: BoxedReader,
    redactor: Redactor,
    init_tx: Arc<watch::Sender<InitPhase>>,
    observer: Arc<dyn BridgeObserver>,
    cancel: CancellationToken,
) {
    let mut lines = FramedRead::new(stderr, NdjsonCodec::with_max_length(MAX_STDERR_LINE_BYTES));

    loop {
        let raw = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = lines.next() => match next {
                None => break,
                Some(Ok(line)) => line,
                Some(Err(AppError::Io(err))) => {
                    settle_init(&init_tx, InitPhase::Failed(AppError::InitHandshake(
                        format!("stderr read failed: {err}"),
                    )));
                    break;
                }
                Some(Err(err)) => {
                    warn!(label = %label, %err, "skipping agent stderr line");
                    continue;
                }
            },
        };

        let line = redactor.redact(&raw);
        if line.trim().is_empty() {
            continue;
        }
        let init_pending = init_tx.borrow().is_pending();

        if let Some(payload) = line.strip_prefix(INIT_MARKER_PREFIX) {
            if init_pending {
                let phase = match parse_marker_payload(payload) {
                    Ok(result) => {
                        info!(label = %label, ok = result.ok, exit_code = ?result.exit_code, "init marker received");
                        InitPhase::Done(result)
                    }
                    Err(err) => {
                        warn!(label = %label, %err, "malformed init marker");
                        InitPhase::Failed(err)
                    }
                };
                settle_init(&init_tx, phase);
            }
            continue;
        }

        let kind = if init_pending {
            StderrKind::Init
        } else {
            StderrKind::Agent
        };
        debug!(label = %label, kind = kind.as_str(), line = %line, "agent stderr");
        observer.on_stderr(kind, &line);
    }
}
