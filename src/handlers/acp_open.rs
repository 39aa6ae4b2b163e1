//! `acp_open`: prepare the run, start the agent and `initialize` it.

use serde_json::json;
use tracing::{info, warn};

use crate::handlers::{AcpOpen, ProxyContext};
use crate::runs::agent::open_run_agent;
use crate::runs::runtime::{ensure_runtime, RuntimeRequest};
use crate::runs::updates::report_proxy_error;
use crate::Result;

async fn open(ctx: &ProxyContext, msg: AcpOpen) -> Result<()> {
    let run = ensure_runtime(
        ctx,
        &RuntimeRequest {
            run_id: msg.run_id,
            instance_name: msg.instance_name,
            keepalive_ttl_seconds: msg.keepalive_ttl_seconds,
            init: msg.init.clone(),
        },
    )
    .await?;
    let _ops = run.lock_ops().await;
    open_run_agent(ctx, &run, msg.init.as_ref()).await?;
    run.touch();
    info!(run_id = run.run_id(), instance_name = run.instance_name(), "run opened");
    Ok(())
}

/// Handle `acp_open`; always answers with `acp_opened`.
pub async fn handle(ctx: ProxyContext, msg: AcpOpen) {
    let run_id = msg.run_id.trim().to_owned();
    let reply = match open(&ctx, msg).await {
        Ok(()) => json!({ "type": "acp_opened", "run_id": run_id, "ok": true }),
        Err(err) => {
            warn!(run_id = %run_id, %err, "acp_open failed");
            if !run_id.is_empty() {
                report_proxy_error(&ctx, &run_id, &err.to_string());
            }
            json!({ "type": "acp_opened", "run_id": run_id, "ok": false, "error": err.to_string() })
        }
    };
    ctx.reply(reply).await;
}
