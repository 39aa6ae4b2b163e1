//! ACP sessions for prompts: create, load, recreate; prompt block checks.

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::acp::bridge::DEFAULT_RPC_TIMEOUT;
use crate::handlers::ProxyContext;
use crate::runs::agent::{ensure_initialized, with_auth_retry};
use crate::runs::registry::RunHandle;
use crate::runs::updates::{prompt_update, send_update};
use crate::{AppError, Result};

const CONTEXT_PRELUDE: &str = "You are resuming a task whose previous ACP session may have been \
lost when the agent restarted.\nBelow is the saved context. Read it, recover the current \
progress, then respond to the new user message.\n\n=== CONTEXT START ===";
const CONTEXT_SUFFIX: &str = "=== CONTEXT END ===\n\nUser message:";
const CONTEXT_URI: &str = "acp-proxy://context";

/// Content block kinds the agent accepts besides text and links.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromptCapabilities {
    /// `image` blocks.
    pub image: bool,
    /// `audio` blocks.
    pub audio: bool,
    /// Embedded `resource` blocks.
    pub embedded_context: bool,
}

impl PromptCapabilities {
    /// Read `agentCapabilities.promptCapabilities` from an `initialize`
    /// result.
    #[must_use]
    pub fn from_init_result(init: Option<&Value>) -> Self {
        let caps = init.and_then(|v| v.pointer("/agentCapabilities/promptCapabilities"));
        let flag = |name: &str| {
            caps.and_then(|c| c.get(name))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };
        Self {
            image: flag("image"),
            audio: flag("audio"),
            embedded_context: flag("embeddedContext"),
        }
    }
}

/// Whether the agent advertises `loadSession`.
#[must_use]
pub fn can_load_session(init: Option<&Value>) -> bool {
    init.and_then(|v| v.pointer("/agentCapabilities/loadSession"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Reject blocks the agent cannot take.
///
/// # Errors
///
/// Returns `AppError::Validation` naming the first unsupported block.
pub fn check_prompt_blocks(prompt: &[Value], caps: PromptCapabilities) -> Result<()> {
    for block in prompt {
        let kind = block.get("type").and_then(Value::as_str).unwrap_or_default();
        let allowed = match kind {
            "text" | "resource_link" => true,
            "image" => caps.image,
            "audio" => caps.audio,
            "resource" => caps.embedded_context,
            other => {
                return Err(AppError::Validation(format!(
                    "unknown ACP content block type: {other:?}"
                )))
            }
        };
        if !allowed {
            let capability = if kind == "resource" { "embeddedContext" } else { kind };
            return Err(AppError::Validation(format!(
                "agent does not enable promptCapabilities.{capability}; cannot send {kind} content"
            )));
        }
    }
    Ok(())
}

/// Prepend saved `context` to the first prompt of a new session.
#[must_use]
pub fn compose_prompt_with_context(
    context: Option<&str>,
    prompt: Vec<Value>,
    caps: PromptCapabilities,
) -> Vec<Value> {
    let Some(context) = context.map(str::trim).filter(|c| !c.is_empty()) else {
        return prompt;
    };
    let mut out = if caps.embedded_context {
        vec![
            json!({ "type": "text", "text": CONTEXT_PRELUDE }),
            json!({
                "type": "resource",
                "resource": { "uri": CONTEXT_URI, "mimeType": "text/markdown", "text": context },
            }),
            json!({ "type": "text", "text": CONTEXT_SUFFIX }),
        ]
    } else {
        vec![json!({
            "type": "text",
            "text": format!("{CONTEXT_PRELUDE}\n{context}\n{CONTEXT_SUFFIX}"),
        })]
    };
    out.extend(prompt);
    out
}

/// Whether a failed `session/prompt` should be retried on a new session.
///
/// Only errors reported by the agent count; timeouts and transport
/// failures never trigger a recreate.
#[must_use]
pub fn should_recreate_session(err: &AppError) -> bool {
    let message = match err {
        AppError::Rpc(rpc) => rpc.message.as_str(),
        AppError::Acp(msg) => msg.as_str(),
        _ => return false,
    };
    message.to_lowercase().contains("session")
}

/// Session chosen for a prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsuredSession {
    /// Session id to prompt.
    pub session_id: String,
    /// Prompt blocks, with context prepended for new sessions.
    pub prompt: Vec<Value>,
    /// Whether the session was created for this prompt.
    pub created: bool,
}

/// `session/new` in `cwd`; records the id on the run.
///
/// The new session is announced twice: a synthetic `prompt_update`
/// (`sessionUpdate: "session_created"`) in the active prompt's stream ahead
/// of the first agent output, and a run-level `agent_update` of type
/// `session_created`, which is sent even when no prompt is active.
///
/// # Errors
///
/// Returns the RPC error, or `AppError::Acp` when no session id comes back.
pub async fn new_session(ctx: &ProxyContext, run: &RunHandle, cwd: &str) -> Result<String> {
    let created = with_auth_retry(run, |agent| async move {
        agent
            .send_rpc("session/new", json!({ "cwd": cwd, "mcpServers": [] }), DEFAULT_RPC_TIMEOUT)
            .await
    })
    .await?;
    let session_id = created
        .get("sessionId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::Acp("session/new returned no sessionId".into()))?
        .to_owned();

    let prompt_id = {
        let mut state = run.state();
        state.seen_session_ids.insert(session_id.clone());
        state.acp_session_id = Some(session_id.clone());
        state.active_prompt_id.clone()
    };
    info!(run_id = run.run_id(), session_id = %session_id, "session created");

    ctx.send(prompt_update(
        run.run_id(),
        prompt_id.as_deref(),
        Some(&session_id),
        json!({ "sessionUpdate": "session_created", "content": { "type": "session_created" } }),
    ));
    if let Some(options) = created.get("configOptions").filter(|v| v.is_array()) {
        ctx.send(prompt_update(
            run.run_id(),
            prompt_id.as_deref(),
            Some(&session_id),
            json!({ "sessionUpdate": "config_option_update", "configOptions": options }),
        ));
    }
    send_update(
        ctx,
        run.run_id(),
        json!({ "type": "session_created", "session_id": session_id }),
    );
    Ok(session_id)
}

/// Pick or create the session for a prompt.
///
/// `requested` falls back to the run's last known session. A session not
/// seen on the current agent is loaded when the agent supports
/// `session/load`; load failures are logged and the id is used as is.
///
/// # Errors
///
/// Propagates `initialize` and `session/new` failures.
pub async fn ensure_session(
    ctx: &ProxyContext,
    run: &RunHandle,
    cwd: &str,
    requested: Option<&str>,
    context: Option<&str>,
    prompt: Vec<Value>,
) -> Result<EnsuredSession> {
    let init = ensure_initialized(ctx, run).await?;
    let caps = PromptCapabilities::from_init_result(Some(&init));

    let known = requested
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .or_else(|| run.state().acp_session_id.clone());

    let Some(session_id) = known else {
        let session_id = new_session(ctx, run, cwd).await?;
        return Ok(EnsuredSession {
            session_id,
            prompt: compose_prompt_with_context(context, prompt, caps),
            created: true,
        });
    };

    let first_seen = {
        let mut state = run.state();
        state.acp_session_id = Some(session_id.clone());
        state.seen_session_ids.insert(session_id.clone())
    };
    if first_seen && can_load_session(Some(&init)) {
        let sid = session_id.clone();
        let loaded = with_auth_retry(run, |agent| {
            let sid = sid.clone();
            async move {
                agent
                    .send_rpc(
                        "session/load",
                        json!({ "sessionId": sid, "cwd": cwd, "mcpServers": [] }),
                        DEFAULT_RPC_TIMEOUT,
                    )
                    .await
            }
        })
        .await;
        if let Err(err) = loaded {
            warn!(run_id = run.run_id(), session_id = %session_id, %err, "session/load failed");
        }
    }

    Ok(EnsuredSession {
        session_id,
        prompt,
        created: false,
    })
}
