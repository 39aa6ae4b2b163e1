//! `session_cancel`, `session_set_mode` and `session_set_model`.
//!
//! These bypass the run's op lock so a cancel reaches an in-flight prompt.

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::acp::bridge::DEFAULT_RPC_TIMEOUT;
use crate::handlers::{ProxyContext, SessionControl};
use crate::runs::agent::with_auth_retry;
use crate::{AppError, Result};

/// Which control was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// `session/cancel` notification.
    Cancel,
    /// `session/set_mode`.
    SetMode,
    /// `session/set_model`.
    SetModel,
}

fn required(value: Option<&str>, name: &str) -> Result<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| AppError::Validation(format!("{name} is required")))
}

async fn control(ctx: &ProxyContext, kind: ControlKind, msg: &SessionControl) -> Result<()> {
    let run = ctx
        .runs
        .get(msg.run_id.trim())
        .await
        .ok_or_else(|| AppError::NotFound("run_not_open".into()))?;
    let agent = run
        .agent()
        .filter(|a| !a.is_closed())
        .ok_or_else(|| AppError::NotFound("run_not_open".into()))?;
    let session_id = msg
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .or_else(|| run.state().acp_session_id.clone())
        .ok_or_else(|| AppError::NotFound("session_not_found".into()))?;

    let (method, params) = match kind {
        ControlKind::Cancel => {
            agent
                .send_notification("session/cancel", json!({ "sessionId": session_id }))
                .await?;
            info!(run_id = run.run_id(), session_id = %session_id, "session cancel sent");
            return Ok(());
        }
        ControlKind::SetMode => (
            "session/set_mode",
            json!({ "sessionId": session_id, "modeId": required(msg.mode_id.as_deref(), "mode_id")? }),
        ),
        ControlKind::SetModel => (
            "session/set_model",
            json!({ "sessionId": session_id, "modelId": required(msg.model_id.as_deref(), "model_id")? }),
        ),
    };
    with_auth_retry(&run, |agent| {
        let params = params.clone();
        async move { agent.send_rpc(method, params, DEFAULT_RPC_TIMEOUT).await }
    })
    .await?;
    run.touch();
    info!(run_id = run.run_id(), session_id = %session_id, method, "session control applied");
    Ok(())
}

fn error_code(err: &AppError) -> String {
    match err {
        AppError::NotFound(code) => code.clone(),
        other => other.to_string(),
    }
}

/// Handle a session control; always answers with `session_control_result`.
pub async fn handle(ctx: ProxyContext, kind: ControlKind, msg: SessionControl) {
    let run_id = msg.run_id.trim().to_owned();
    let control_id = msg.control_id.trim().to_owned();
    let outcome = if control_id.is_empty() {
        Err(AppError::Validation("control_id is required".into()))
    } else {
        control(&ctx, kind, &msg).await
    };
    let mut reply = json!({
        "type": "session_control_result",
        "run_id": run_id,
        "control_id": control_id,
        "ok": outcome.is_ok(),
    });
    if let Err(err) = outcome {
        warn!(run_id = %run_id, control = ?kind, %err, "session control failed");
        reply["error"] = Value::String(error_code(&err));
    }
    ctx.reply(reply).await;
}
