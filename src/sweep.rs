//! Cleanup sweep for runs whose keepalive TTL has lapsed.
//!
//! Expired runs leave the registry before teardown starts, so each expiry
//! is torn down exactly once. Every teardown step is best-effort.

use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::handlers::ProxyContext;
use crate::runs::agent::retire_run;
use crate::runs::updates::send_sandbox_instance_status;
use crate::sandbox::InstanceStatus;

/// Spawn the sweep, ticking every `cleanup_interval_seconds`.
#[must_use]
pub fn spawn_sweep_task(ctx: ProxyContext, cancel: CancellationToken) -> JoinHandle<()> {
    let period = Duration::from_secs(ctx.config.cleanup_interval_seconds.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("cleanup sweep shutting down");
                    break;
                }
                _ = interval.tick() => {
                    sweep_once(&ctx, Instant::now()).await;
                }
            }
        }
    })
}

/// Tear down every run expired at `now`. Returns how many were removed.
pub async fn sweep_once(ctx: &ProxyContext, now: Instant) -> usize {
    let expired = ctx.runs.take_expired(now).await;
    for run in &expired {
        info!(run_id = run.run_id(), instance_name = run.instance_name(), "run expired");
        retire_run(run, "keepalive_expired").await;
        match ctx.sandbox.remove_instance(run.instance_name().to_owned()).await {
            Ok(()) => send_sandbox_instance_status(
                ctx,
                run.run_id(),
                run.instance_name(),
                InstanceStatus::Missing.as_str(),
                None,
            ),
            Err(err) => {
                warn!(run_id = run.run_id(), %err, "expired instance removal failed");
                send_sandbox_instance_status(
                    ctx,
                    run.run_id(),
                    run.instance_name(),
                    InstanceStatus::Missing.as_str(),
                    Some(&err.to_string()),
                );
            }
        }
    }
    expired.len()
}
