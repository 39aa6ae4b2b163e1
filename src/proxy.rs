//! Top-level service: shared context, orchestrator tunnel and cleanup sweep
//! under one cancellation token.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ProxyConfig;
use crate::handlers::ProxyContext;
use crate::runs::agent::retire_run;
use crate::sandbox::SandboxProvider;
use crate::sweep::spawn_sweep_task;
use crate::tunnel::{outbound_channel, register_message, Tunnel};

/// The proxy process.
pub struct ProxyService {
    ctx: ProxyContext,
    outbound: mpsc::Receiver<Value>,
}

impl ProxyService {
    /// Wire the context and the outbound queue.
    #[must_use]
    pub fn new(config: Arc<ProxyConfig>, sandbox: Arc<dyn SandboxProvider>) -> Self {
        let (sender, outbound) = outbound_channel(config.outbound_queue_capacity);
        Self {
            ctx: ProxyContext::new(config, sandbox, sender),
            outbound,
        }
    }

    /// Shared handler context.
    #[must_use]
    pub fn context(&self) -> &ProxyContext {
        &self.ctx
    }

    /// Run the tunnel and the sweep until `cancel` fires, then close every
    /// agent. Sandbox instances are left for reuse.
    pub async fn run(self, cancel: CancellationToken) {
        let Self { ctx, outbound } = self;
        let register = register_message(&ctx.config, ctx.sandbox.as_ref());
        let tunnel = Tunnel::new(
            Arc::clone(&ctx.config),
            register,
            Arc::new(ctx.clone()),
            outbound,
        );
        let tunnel_handle = tokio::spawn(tunnel.run(cancel.clone()));
        let sweep_handle = spawn_sweep_task(ctx.clone(), cancel.clone());
        info!(
            agent_id = %ctx.config.agent.id,
            provider = ctx.sandbox.kind().as_str(),
            "acp proxy started"
        );

        cancel.cancelled().await;
        let runs = ctx.runs.snapshot().await;
        for run in &runs {
            retire_run(run, "shutdown").await;
        }
        let _ = tokio::join!(tunnel_handle, sweep_handle);
        info!(closed_runs = runs.len(), "acp proxy stopped");
    }
}
