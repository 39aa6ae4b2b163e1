//! Inbound orchestrator messages and their handlers.
//!
//! Every message runs in its own task. Handlers never fail outward: errors
//! become `ok: false` replies.

pub mod acp_close;
pub mod acp_open;
pub mod prompt;
pub mod sandbox_control;
pub mod session_control;
pub mod session_permission;

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{error, warn};

use crate::config::ProxyConfig;
use crate::runs::registry::RunRegistry;
use crate::runs::workspace_git::{GitRunner, HostGit};
use crate::runs::InitPayload;
use crate::sandbox::{BoxFuture, SandboxProvider};
use crate::tunnel::{OutboundSender, TunnelHandler};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ProxyContext {
    /// Validated configuration.
    pub config: Arc<ProxyConfig>,
    /// Sandbox backend.
    pub sandbox: Arc<dyn SandboxProvider>,
    /// Live runs.
    pub runs: Arc<RunRegistry>,
    /// Outbound queue towards the orchestrator.
    pub outbound: OutboundSender,
    /// Concurrent prompt turns, sized by `agent.max_concurrent`.
    pub prompt_slots: Arc<Semaphore>,
    /// Host git used to check out run workspaces.
    pub git: Arc<dyn GitRunner>,
}

impl ProxyContext {
    /// Context with an empty run registry.
    #[must_use]
    pub fn new(
        config: Arc<ProxyConfig>,
        sandbox: Arc<dyn SandboxProvider>,
        outbound: OutboundSender,
    ) -> Self {
        let slots = usize::try_from(config.agent.max_concurrent).unwrap_or(1).max(1);
        Self {
            config,
            sandbox,
            runs: Arc::new(RunRegistry::new()),
            outbound,
            prompt_slots: Arc::new(Semaphore::new(slots)),
            git: Arc::new(HostGit),
        }
    }

    /// Replace the git runner.
    #[must_use]
    pub fn with_git(mut self, git: Arc<dyn GitRunner>) -> Self {
        self.git = git;
        self
    }

    /// Queue a streaming update for the orchestrator; dropped when the
    /// queue is full.
    pub fn send(&self, message: Value) {
        self.outbound.send(message);
    }

    /// Queue a handler's final reply; waits for queue room.
    pub async fn reply(&self, message: Value) {
        self.outbound.send_reply(message).await;
    }
}

// ── Inbound messages ─────────────────────────────────────────────────────────

/// `acp_open`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AcpOpen {
    /// Run id.
    pub run_id: String,
    /// Explicit instance name.
    pub instance_name: Option<String>,
    /// Keepalive TTL override.
    pub keepalive_ttl_seconds: Option<u64>,
    /// Init object.
    pub init: Option<InitPayload>,
}

/// `prompt_send`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PromptSend {
    /// Run id.
    pub run_id: String,
    /// Prompt id echoed in updates and the result.
    pub prompt_id: String,
    /// ACP content blocks.
    pub prompt: Value,
    /// Session to continue.
    pub session_id: Option<String>,
    /// Saved context for a new session.
    pub context: Option<String>,
    /// Working directory inside the workspace.
    pub cwd: Option<String>,
    /// `session/prompt` deadline.
    pub timeout_ms: Option<u64>,
    /// Explicit instance name.
    pub instance_name: Option<String>,
    /// Keepalive TTL override.
    pub keepalive_ttl_seconds: Option<u64>,
    /// Init object used when the agent has to be started.
    pub init: Option<InitPayload>,
}

/// `session_cancel`, `session_set_mode` and `session_set_model`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionControl {
    /// Run id.
    pub run_id: String,
    /// Correlation id echoed in the result.
    pub control_id: String,
    /// Session; defaults to the run's current session.
    pub session_id: Option<String>,
    /// Mode for `session_set_mode`.
    pub mode_id: Option<String>,
    /// Model for `session_set_model`.
    pub model_id: Option<String>,
}

/// `acp_close`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AcpClose {
    /// Run id.
    pub run_id: String,
    /// Also remove the sandbox instance.
    pub remove_instance: bool,
}

/// `sandbox_control`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SandboxControl {
    /// Run id, when the action targets a run.
    pub run_id: Option<String>,
    /// Instance name; defaults from the run.
    pub instance_name: Option<String>,
    /// Action name.
    pub action: String,
    /// Image for `remove_image`.
    pub image: Option<String>,
    /// `[{instance_name, run_id}]` the orchestrator expects to exist.
    pub expected_instances: Option<Value>,
    /// Plan `gc` without removing anything.
    pub dry_run: bool,
}

/// `session_permission`: the orchestrator's answer to a relayed
/// `permission_request`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionPermission {
    /// Run id.
    pub run_id: String,
    /// `request_id` from the `permission_request` update.
    pub request_id: Value,
    /// `selected` or `cancelled`.
    pub outcome: String,
    /// Chosen option when `outcome` is `selected`.
    pub option_id: Option<String>,
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

fn field(message: &Value, key: &str) -> Value {
    match message.get(key) {
        Some(Value::String(s)) => json!(s.trim()),
        Some(Value::Number(n)) => json!(n.to_string()),
        _ => Value::Null,
    }
}

/// `ok:false` reply for a message that failed to deserialize; `None` for
/// kinds that are never answered.
#[must_use]
pub fn malformed_reply(kind: &str, message: &Value, error: &str) -> Option<Value> {
    let run_id = field(message, "run_id");
    let mut reply = match kind {
        "acp_open" => json!({ "type": "acp_opened", "run_id": run_id }),
        "prompt_send" => json!({
            "type": "prompt_result",
            "run_id": run_id,
            "prompt_id": field(message, "prompt_id"),
        }),
        "session_cancel" | "session_set_mode" | "session_set_model" => json!({
            "type": "session_control_result",
            "run_id": run_id,
            "control_id": field(message, "control_id"),
        }),
        "acp_close" => json!({ "type": "acp_closed", "run_id": run_id }),
        "sandbox_control" => json!({
            "type": "sandbox_control_result",
            "run_id": run_id,
            "instance_name": field(message, "instance_name"),
            "action": field(message, "action"),
        }),
        _ => return None,
    };
    reply["ok"] = json!(false);
    reply["error"] = json!(error);
    Some(reply)
}

fn spawn_handler<T, F, Fut>(ctx: &ProxyContext, kind: &str, message: Value, handler: F)
where
    T: DeserializeOwned,
    F: FnOnce(ProxyContext, T) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    match T::deserialize(&message) {
        Ok(msg) => {
            tokio::spawn(handler(ctx.clone(), msg));
        }
        Err(err) => {
            warn!(message_type = kind, %err, "malformed inbound message");
            if let Some(reply) = malformed_reply(kind, &message, &format!("invalid message: {err}")) {
                let ctx = ctx.clone();
                tokio::spawn(async move { ctx.reply(reply).await });
            }
        }
    }
}

/// Route one inbound message to its handler task.
pub fn dispatch(ctx: &ProxyContext, message: Value) {
    let kind = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    match kind.as_str() {
        "acp_open" => spawn_handler(ctx, &kind, message, acp_open::handle),
        "prompt_send" => spawn_handler(ctx, &kind, message, prompt::handle),
        "session_cancel" => spawn_handler(ctx, &kind, message, |ctx, msg: SessionControl| {
            session_control::handle(ctx, session_control::ControlKind::Cancel, msg)
        }),
        "session_set_mode" => spawn_handler(ctx, &kind, message, |ctx, msg: SessionControl| {
            session_control::handle(ctx, session_control::ControlKind::SetMode, msg)
        }),
        "session_set_model" => spawn_handler(ctx, &kind, message, |ctx, msg: SessionControl| {
            session_control::handle(ctx, session_control::ControlKind::SetModel, msg)
        }),
        "acp_close" => spawn_handler(ctx, &kind, message, acp_close::handle),
        "sandbox_control" => spawn_handler(ctx, &kind, message, sandbox_control::handle),
        "session_permission" => spawn_handler(ctx, &kind, message, session_permission::handle),
        other => warn!(message_type = other, "unknown message type ignored"),
    }
}

impl TunnelHandler for ProxyContext {
    fn on_connected(&self) -> BoxFuture<'_, Vec<Value>> {
        Box::pin(async move {
            match sandbox_control::inventory_message(self, None).await {
                Ok(inventory) => vec![inventory],
                Err(err) => {
                    error!(%err, "inventory on connect failed");
                    Vec::new()
                }
            }
        })
    }

    fn on_message(&self, message: Value) {
        dispatch(self, message);
    }
}
