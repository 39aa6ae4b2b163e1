//! Outbound run-scoped messages.

use serde_json::{json, Value};

use crate::acp::init_marker::InitStep;
use crate::config::SandboxProviderKind;
use crate::handlers::ProxyContext;
use crate::sandbox::now_rfc3339;

/// `agent_update{run_id, content}`.
#[must_use]
pub fn agent_update(run_id: &str, content: Value) -> Value {
    json!({ "type": "agent_update", "run_id": run_id, "content": content })
}

/// Send an `agent_update`.
pub fn send_update(ctx: &ProxyContext, run_id: &str, content: Value) {
    ctx.send(agent_update(run_id, content));
}

/// Send a `text` update.
pub fn send_text(ctx: &ProxyContext, run_id: &str, text: impl Into<String>) {
    send_update(ctx, run_id, json!({ "type": "text", "text": text.into() }));
}

/// Send an `init_step` update.
pub fn send_init_step(ctx: &ProxyContext, run_id: &str, step: &InitStep) {
    let mut content = json!({ "type": "init_step", "stage": step.stage, "status": step.status });
    if let Some(message) = &step.message {
        content["message"] = json!(message);
    }
    send_update(ctx, run_id, content);
}

/// Send an error `text` update.
pub fn report_proxy_error(ctx: &ProxyContext, run_id: &str, message: &str) {
    send_text(ctx, run_id, format!("[proxy:error] {message}"));
}

/// `sandbox_instance_status` content.
#[must_use]
pub fn sandbox_instance_status(
    provider: SandboxProviderKind,
    runtime: Option<&str>,
    instance_name: &str,
    status: &str,
    last_error: Option<&str>,
) -> Value {
    let runtime = match provider {
        SandboxProviderKind::ContainerOci => runtime,
        SandboxProviderKind::Bwrap => None,
    };
    json!({
        "type": "sandbox_instance_status",
        "instance_name": instance_name,
        "provider": provider.as_str(),
        "runtime": runtime,
        "status": status,
        "last_seen_at": now_rfc3339(),
        "last_error": last_error,
    })
}

/// Send a `sandbox_instance_status` update for the configured provider.
pub fn send_sandbox_instance_status(
    ctx: &ProxyContext,
    run_id: &str,
    instance_name: &str,
    status: &str,
    last_error: Option<&str>,
) {
    let content = sandbox_instance_status(
        ctx.sandbox.kind(),
        ctx.sandbox.runtime(),
        instance_name,
        status,
        last_error,
    );
    send_update(ctx, run_id, content);
}

/// `prompt_update{run_id, prompt_id, session_id, update}`.
#[must_use]
pub fn prompt_update(
    run_id: &str,
    prompt_id: Option<&str>,
    session_id: Option<&str>,
    update: Value,
) -> Value {
    json!({
        "type": "prompt_update",
        "run_id": run_id,
        "prompt_id": prompt_id,
        "session_id": session_id,
        "update": update,
    })
}
