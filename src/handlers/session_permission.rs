//! `session_permission`: resolve a permission request parked for the
//! orchestrator. There is no reply; the agent gets the outcome.

use tracing::{info, warn};

use crate::acp::jsonrpc::id_key;
use crate::handlers::{ProxyContext, SessionPermission};
use crate::runs::permission::PermissionDecision;

/// Handle `session_permission`.
pub async fn handle(ctx: ProxyContext, msg: SessionPermission) {
    let run_id = msg.run_id.trim();
    let Some(request_id) = id_key(&msg.request_id) else {
        warn!(run_id, "session_permission without request_id");
        return;
    };
    let Some(run) = ctx.runs.get(run_id).await else {
        warn!(run_id, request_id = %request_id, "session_permission for unknown run");
        return;
    };
    let decision = PermissionDecision::from_message(&msg.outcome, msg.option_id.as_deref());
    if run.permissions().resolve(&request_id, &decision) {
        info!(run_id, request_id = %request_id, ?decision, "permission answered");
        run.touch();
    } else {
        warn!(run_id, request_id = %request_id, "no pending permission request");
    }
}
