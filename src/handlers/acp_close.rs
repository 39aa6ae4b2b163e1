//! `acp_close`: close the agent, optionally remove the instance, forget the
//! run.

use serde_json::json;
use tracing::{info, warn};

use crate::handlers::{AcpClose, ProxyContext};
use crate::runs::agent::retire_run;
use crate::runs::updates::send_sandbox_instance_status;
use crate::validate::{validate_instance_name, validate_run_id};
use crate::Result;

async fn close(ctx: &ProxyContext, msg: &AcpClose) -> Result<()> {
    let run_id = validate_run_id(&msg.run_id)?;
    let run = ctx.runs.remove(&run_id).await;
    let instance_name = match &run {
        Some(run) => {
            retire_run(run, "acp_close").await;
            run.instance_name().to_owned()
        }
        None => validate_instance_name(&format!("{}{run_id}", ctx.config.sandbox.instance_prefix))?,
    };
    if msg.remove_instance {
        ctx.sandbox.remove_instance(instance_name.clone()).await?;
        send_sandbox_instance_status(ctx, &run_id, &instance_name, "missing", None);
    }
    info!(run_id = %run_id, instance_name = %instance_name, remove_instance = msg.remove_instance, "run closed");
    Ok(())
}

/// Handle `acp_close`; always answers with `acp_closed`.
pub async fn handle(ctx: ProxyContext, msg: AcpClose) {
    let run_id = msg.run_id.trim().to_owned();
    let reply = match close(&ctx, &msg).await {
        Ok(()) => json!({ "type": "acp_closed", "run_id": run_id, "ok": true }),
        Err(err) => {
            warn!(run_id = %run_id, %err, "acp_close failed");
            json!({ "type": "acp_closed", "run_id": run_id, "ok": false, "error": err.to_string() })
        }
    };
    ctx.reply(reply).await;
}
