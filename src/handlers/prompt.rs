//! `prompt_send`: run one prompt turn on the run's ACP session.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::handlers::{PromptSend, ProxyContext};
use crate::runs::agent::{ensure_initialized, open_run_agent, with_auth_retry};
use crate::runs::registry::{RunHandle, RunPhase};
use crate::runs::runtime::{ensure_runtime, RuntimeRequest};
use crate::runs::session::{
    check_prompt_blocks, compose_prompt_with_context, ensure_session, new_session,
    should_recreate_session, PromptCapabilities,
};
use crate::validate::resolve_workspace_guest_path;
use crate::{AppError, Result};

/// Default `session/prompt` deadline.
pub const DEFAULT_PROMPT_TIMEOUT_MS: u64 = 3_600_000;
const MIN_PROMPT_TIMEOUT_MS: u64 = 5_000;
const MAX_PROMPT_TIMEOUT_MS: u64 = 86_400_000;

/// Clamp a requested prompt deadline.
#[must_use]
pub fn prompt_timeout(requested: Option<u64>) -> Duration {
    Duration::from_millis(
        requested
            .unwrap_or(DEFAULT_PROMPT_TIMEOUT_MS)
            .clamp(MIN_PROMPT_TIMEOUT_MS, MAX_PROMPT_TIMEOUT_MS),
    )
}

/// Outcome of a successful turn.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptOutcome {
    /// Session that answered.
    pub session_id: String,
    /// `stopReason` from the agent.
    pub stop_reason: Option<String>,
    /// Whether a session was created for this turn.
    pub session_created: bool,
    /// Session replaced after a session error.
    pub session_recreated_from: Option<String>,
}

fn prompt_blocks(msg: &PromptSend) -> Result<Vec<Value>> {
    if msg.prompt_id.trim().is_empty() {
        return Err(AppError::Validation("prompt_id is required".into()));
    }
    msg.prompt
        .as_array()
        .cloned()
        .ok_or_else(|| AppError::Validation("prompt must be an array".into()))
}

async fn send_prompt(
    run: &RunHandle,
    session_id: &str,
    prompt: &[Value],
    timeout: Duration,
) -> Result<Value> {
    let params = json!({ "sessionId": session_id, "prompt": prompt });
    with_auth_retry(run, |agent| {
        let params = params.clone();
        async move { agent.send_rpc("session/prompt", params, timeout).await }
    })
    .await
}

async fn turn(
    ctx: &ProxyContext,
    run: &Arc<RunHandle>,
    msg: &PromptSend,
    prompt: Vec<Value>,
    cwd: &str,
) -> Result<PromptOutcome> {
    let init = ensure_initialized(ctx, run).await?;
    let caps = PromptCapabilities::from_init_result(Some(&init));
    check_prompt_blocks(&prompt, caps)?;
    let timeout = prompt_timeout(msg.timeout_ms);

    let ensured = ensure_session(
        ctx,
        run,
        cwd,
        msg.session_id.as_deref(),
        msg.context.as_deref(),
        prompt.clone(),
    )
    .await?;

    match send_prompt(run, &ensured.session_id, &ensured.prompt, timeout).await {
        Ok(result) => Ok(PromptOutcome {
            session_id: ensured.session_id,
            stop_reason: stop_reason(&result),
            session_created: ensured.created,
            session_recreated_from: None,
        }),
        Err(err) if !ensured.created && should_recreate_session(&err) => {
            warn!(
                run_id = run.run_id(),
                session_id = %ensured.session_id,
                %err,
                "session rejected; recreating"
            );
            let session_id = new_session(ctx, run, cwd).await?;
            let replay = compose_prompt_with_context(msg.context.as_deref(), prompt, caps);
            let result = send_prompt(run, &session_id, &replay, timeout).await?;
            Ok(PromptOutcome {
                session_id,
                stop_reason: stop_reason(&result),
                session_created: true,
                session_recreated_from: Some(ensured.session_id),
            })
        }
        Err(err) => Err(err),
    }
}

fn stop_reason(result: &Value) -> Option<String> {
    result
        .get("stopReason")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

async fn run_prompt(ctx: &ProxyContext, msg: &PromptSend) -> Result<PromptOutcome> {
    let prompt = prompt_blocks(msg)?;
    let _slot = ctx
        .prompt_slots
        .acquire()
        .await
        .map_err(|_| AppError::Acp("prompt limiter closed".into()))?;
    let workspace = &ctx.config.sandbox.working_dir;
    let cwd = match msg.cwd.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        Some(cwd) => resolve_workspace_guest_path(workspace, cwd)?,
        None => workspace.clone(),
    };

    let run = ensure_runtime(
        ctx,
        &RuntimeRequest {
            run_id: msg.run_id.clone(),
            instance_name: msg.instance_name.clone(),
            keepalive_ttl_seconds: msg.keepalive_ttl_seconds,
            init: msg.init.clone(),
        },
    )
    .await?;
    let _ops = run.lock_ops().await;
    open_run_agent(ctx, &run, msg.init.as_ref()).await?;

    {
        let mut state = run.state();
        state.active_prompt_id = Some(msg.prompt_id.trim().to_owned());
        state.phase = RunPhase::Prompting;
    }
    let outcome = turn(ctx, &run, msg, prompt, &cwd).await;
    {
        let mut state = run.state();
        state.active_prompt_id = None;
        state.phase = if state.agent.as_ref().is_some_and(|a| !a.is_closed()) {
            RunPhase::Ready
        } else {
            RunPhase::Closed
        };
    }
    run.touch();
    outcome
}

/// Handle `prompt_send`; always answers with `prompt_result`.
pub async fn handle(ctx: ProxyContext, msg: PromptSend) {
    let run_id = msg.run_id.trim().to_owned();
    let prompt_id = msg.prompt_id.trim().to_owned();
    let reply = match run_prompt(&ctx, &msg).await {
        Ok(outcome) => {
            info!(
                run_id = %run_id,
                prompt_id = %prompt_id,
                session_id = %outcome.session_id,
                stop_reason = ?outcome.stop_reason,
                "prompt finished"
            );
            json!({
                "type": "prompt_result",
                "run_id": run_id,
                "prompt_id": prompt_id,
                "ok": true,
                "session_id": outcome.session_id,
                "stop_reason": outcome.stop_reason,
                "session_created": outcome.session_created,
                "session_recreated_from": outcome.session_recreated_from,
            })
        }
        Err(err) => {
            warn!(run_id = %run_id, prompt_id = %prompt_id, %err, "prompt failed");
            json!({
                "type": "prompt_result",
                "run_id": run_id,
                "prompt_id": prompt_id,
                "ok": false,
                "error": err.to_string(),
            })
        }
    };
    ctx.reply(reply).await;
}
