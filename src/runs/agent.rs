//! Agent lifecycle for a run: start, init handshake, `initialize`, close.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use crate::acp::bridge::{
    AgentBridge, BridgeObserver, BridgeOptions, StderrKind, DEFAULT_RPC_TIMEOUT,
};
use crate::acp::codec::{NdjsonCodec, MAX_STDERR_LINE_BYTES};
use crate::acp::init_marker::parse_step_line;
use crate::acp::jsonrpc::{id_key, AUTH_REQUIRED};
use crate::acp::redact::{pick_secret_values, Redactor};
use crate::handlers::ProxyContext;
use crate::runs::client::RunClient;
use crate::runs::registry::{RunHandle, RunPhase};
use crate::runs::updates::{
    prompt_update, send_init_step, send_sandbox_instance_status, send_text, send_update,
};
use crate::runs::{InitPayload, DEFAULT_INIT_TIMEOUT_SECONDS};
use crate::sandbox::process::{BoxedReader, ExitInfo};
use crate::sandbox::{now_rfc3339, AgentInit, AgentMode, ExecRequest, InstanceStatus, OpenAgentRequest};
use crate::{AppError, Result};

/// Client name sent in `initialize`.
pub const CLIENT_NAME: &str = "acp-proxy";
/// ACP protocol version sent in `initialize`.
pub const PROTOCOL_VERSION: u64 = 1;
/// Deadline for `authenticate`.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
/// Init env key always forwarded to the agent.
const ALWAYS_FORWARDED_ENV: &str = "CODEX_HOME";
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn not_connected() -> AppError {
    AppError::Acp("agent not connected".into())
}

/// Keep only allowlisted init env keys.
#[must_use]
pub fn filter_agent_env(
    allowlist: &[String],
    env: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(key, _)| {
            key.as_str() == ALWAYS_FORWARDED_ENV || allowlist.iter().any(|a| a.trim() == key.as_str())
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// `initialize` params; `terminal` mirrors `sandbox.terminal_enabled`.
#[must_use]
pub fn initialize_params(terminal: bool) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientInfo": { "name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION") },
        "clientCapabilities": {
            "fs": { "readTextFile": true, "writeTextFile": true },
            "terminal": terminal,
        },
    })
}

// ── Bridge observer ──────────────────────────────────────────────────────────

struct RunObserver {
    ctx: ProxyContext,
    run: Weak<RunHandle>,
    run_id: String,
}

impl BridgeObserver for RunObserver {
    fn on_notification(&self, method: &str, params: &Value) {
        let Some(run) = self.run.upgrade() else {
            return;
        };
        run.touch();
        match method {
            "session/update" => {
                let session_id = params.get("sessionId").and_then(Value::as_str);
                let update = params.get("update").cloned().unwrap_or(Value::Null);
                let prompt_id = run.state().active_prompt_id.clone();
                if update.get("sessionUpdate").and_then(Value::as_str) == Some("session_created") {
                    send_update(
                        &self.ctx,
                        &self.run_id,
                        json!({ "type": "session_created", "session_id": session_id }),
                    );
                }
                self.ctx.send(prompt_update(
                    &self.run_id,
                    prompt_id.as_deref(),
                    session_id,
                    update,
                ));
            }
            "$/cancel_request" => {
                let request_id = params.get("requestId").and_then(id_key);
                let cancelled = request_id
                    .as_deref()
                    .is_some_and(|id| run.permissions().cancel(id));
                debug!(run_id = %self.run_id, ?request_id, cancelled, "cancel_request");
            }
            other => debug!(run_id = %self.run_id, method = other, "unhandled notification"),
        }
    }

    fn on_stderr(&self, kind: StderrKind, line: &str) {
        match kind {
            StderrKind::Init => {
                if let Some(run) = self.run.upgrade() {
                    run.touch();
                }
                match parse_step_line(line) {
                    Some(step) => send_init_step(&self.ctx, &self.run_id, &step),
                    None => send_text(&self.ctx, &self.run_id, format!("[init:stderr] {line}")),
                }
            }
            StderrKind::Agent => {
                debug!(run_id = %self.run_id, text = line, "agent stderr");
                send_text(&self.ctx, &self.run_id, format!("[agent:stderr] {line}"));
            }
        }
    }

    fn on_exit(&self, info: ExitInfo) {
        let Some(run) = self.run.upgrade() else {
            return;
        };
        {
            let mut state = run.state();
            if state.suppress_next_exit {
                state.suppress_next_exit = false;
                return;
            }
        }
        info!(
            run_id = %self.run_id,
            instance_name = run.instance_name(),
            code = ?info.code,
            signal = ?info.signal,
            "agent exited"
        );
        send_update(
            &self.ctx,
            &self.run_id,
            json!({
                "type": "transport_disconnected",
                "instance_name": run.instance_name(),
                "code": info.code,
                "signal": info.signal,
                "at": now_rfc3339(),
                "reason": "agent_exit",
            }),
        );
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            close_agent(&run, "agent_exit").await;
            run.touch();
            ctx.reply(json!({
                "type": "acp_exit",
                "run_id": run.run_id(),
                "instance_name": run.instance_name(),
                "code": info.code,
                "signal": info.signal,
            }))
            .await;
        });
    }
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

/// Close the run's agent, if any, and reset agent-scoped state. Parked
/// permission requests are cancelled.
pub async fn close_agent(run: &RunHandle, reason: &str) {
    let agent = run.state().reset_agent();
    shut_down(run, agent, reason).await;
}

/// Close the agent of a run that is leaving the registry. An open racing
/// with this finds the run retired and discards its new agent.
pub async fn retire_run(run: &RunHandle, reason: &str) {
    let agent = run.state().retire();
    shut_down(run, agent, reason).await;
}

async fn shut_down(run: &RunHandle, agent: Option<Arc<AgentBridge>>, reason: &str) {
    run.permissions().cancel_all();
    if let Some(agent) = agent {
        agent.close().await;
        info!(run_id = run.run_id(), reason, "agent closed");
    }
}

/// Store `bridge` as the run's agent unless the run has left the registry
/// or been retired meanwhile.
async fn attach_agent(ctx: &ProxyContext, run: &Arc<RunHandle>, bridge: &Arc<AgentBridge>) -> bool {
    let registered = ctx
        .runs
        .get(run.run_id())
        .await
        .is_some_and(|current| Arc::ptr_eq(&current, run));
    if !registered {
        return false;
    }
    let mut state = run.state();
    if state.retired {
        return false;
    }
    state.agent = Some(Arc::clone(bridge));
    state.initialized = false;
    state.init_result = None;
    state.phase = RunPhase::Opening;
    true
}

async fn stream_init_output(
    ctx: ProxyContext,
    run_id: String,
    stream: BoxedReader,
    label: &'static str,
    redactor: Redactor,
) {
    let mut lines = FramedRead::new(stream, NdjsonCodec::with_max_length(MAX_STDERR_LINE_BYTES));
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(AppError::Io(err)) => {
                debug!(run_id = %run_id, err = %err, "init output read failed");
                break;
            }
            Err(err) => {
                debug!(run_id = %run_id, %err, "init output line skipped");
                continue;
            }
        };
        let text = redactor.redact(&line);
        if text.trim().is_empty() {
            continue;
        }
        if let Some(step) = parse_step_line(&text) {
            send_init_step(&ctx, &run_id, &step);
            continue;
        }
        debug!(run_id = %run_id, stream = label, text = %text, "init output");
        send_text(&ctx, &run_id, format!("[init:{label}] {text}"));
    }
}

/// Run the init script through `exec_process` (exec agent mode).
///
/// Output lines are redacted and surfaced as updates; the final
/// `init_result` is always reported.
///
/// # Errors
///
/// Returns `AppError::InitHandshake("init_failed")` when the script cannot
/// start, exits non-zero, or exceeds its deadline.
pub async fn run_init_script(
    ctx: &ProxyContext,
    run: &RunHandle,
    init: Option<&InitPayload>,
) -> Result<()> {
    let Some(init) = init else {
        return Ok(());
    };
    let Some(script) = init.script() else {
        return Ok(());
    };
    let run_id = run.run_id().to_owned();
    let timeout_seconds = init.timeout_seconds();
    let env = filter_agent_env(&ctx.config.agent_env_allowlist, &init.env);
    let redactor = Redactor::new(
        ctx.config
            .secret_values()
            .into_iter()
            .chain(pick_secret_values(&init.env)),
        &ctx.config.redact_patterns,
    );

    send_text(
        ctx,
        &run_id,
        format!("[init] start (bash, timeout={timeout_seconds}s)"),
    );

    let handle = match ctx
        .sandbox
        .exec_process(ExecRequest {
            instance_name: run.instance_name().to_owned(),
            command: vec!["bash".into(), "-lc".into(), script.to_owned()],
            cwd_in_guest: ctx.config.sandbox.working_dir.clone(),
            env,
        })
        .await
    {
        Ok(handle) => handle,
        Err(err) => {
            let message = err.to_string();
            send_update(
                ctx,
                &run_id,
                json!({ "type": "init_step", "stage": "init", "status": "failed", "message": message }),
            );
            send_update(ctx, &run_id, json!({ "type": "init_result", "ok": false, "error": message }));
            return Err(AppError::InitHandshake("init_failed".into()));
        }
    };

    let out_task = tokio::spawn(stream_init_output(
        ctx.clone(),
        run_id.clone(),
        handle.stdout,
        "stdout",
        redactor.clone(),
    ));
    let err_task = handle.stderr.map(|stderr| {
        tokio::spawn(stream_init_output(
            ctx.clone(),
            run_id.clone(),
            stderr,
            "stderr",
            redactor,
        ))
    });
    drop(handle.stdin);

    let exited = tokio::time::timeout(Duration::from_secs(timeout_seconds), handle.exit).await;
    let drain = async {
        let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, out_task).await;
        if let Some(task) = err_task {
            let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await;
        }
    };

    match exited {
        Err(_) => {
            handle.kill.cancel();
            drain.await;
            send_update(
                ctx,
                &run_id,
                json!({ "type": "init_result", "ok": false, "error": format!("timeout after {timeout_seconds}s") }),
            );
            Err(AppError::InitHandshake("init_failed".into()))
        }
        Ok(info) => {
            drain.await;
            let code = info.ok().and_then(|i| i.code);
            if code == Some(0) {
                send_update(ctx, &run_id, json!({ "type": "init_result", "ok": true }));
                send_text(ctx, &run_id, "[init] done");
                Ok(())
            } else {
                send_update(
                    ctx,
                    &run_id,
                    json!({
                        "type": "init_result",
                        "ok": false,
                        "exitCode": code,
                        "error": format!("exitCode={}", code.map_or_else(|| "null".to_owned(), |c| c.to_string())),
                    }),
                );
                Err(AppError::InitHandshake("init_failed".into()))
            }
        }
    }
}

/// Open the run's agent unless one is already live.
///
/// In entrypoint mode an init script travels with the open and its result
/// is awaited on stderr; on failure the agent is closed and the instance
/// stopped.
///
/// # Errors
///
/// Propagates sandbox errors and init handshake failures.
pub async fn start_agent(
    ctx: &ProxyContext,
    run: &Arc<RunHandle>,
    init: Option<&InitPayload>,
) -> Result<()> {
    if run.agent().is_some_and(|a| !a.is_closed()) {
        return Ok(());
    }
    let run_id = run.run_id().to_owned();
    let instance_name = run.instance_name().to_owned();
    let mode = ctx.sandbox.agent_mode();

    let raw_env = init.map(|i| i.env.clone()).unwrap_or_default();
    let agent_env = filter_agent_env(&ctx.config.agent_env_allowlist, &raw_env);
    let timeout_seconds = init.map_or(DEFAULT_INIT_TIMEOUT_SECONDS, InitPayload::timeout_seconds);
    let script = match mode {
        AgentMode::Entrypoint => init.and_then(InitPayload::script),
        AgentMode::Exec => None,
    };

    if mode == AgentMode::Entrypoint {
        let before = ctx.sandbox.inspect_instance(instance_name.clone()).await?;
        let recreate = script.is_some() && before.status != InstanceStatus::Missing;
        if before.status == InstanceStatus::Missing || recreate {
            send_sandbox_instance_status(ctx, &run_id, &instance_name, "creating", None);
        }
        if script.is_some() {
            send_text(
                ctx,
                &run_id,
                format!("[init] start (bash, timeout={timeout_seconds}s)"),
            );
        }
    }

    let mounts = run.state().mounts.clone();
    let opened = ctx
        .sandbox
        .open_agent(OpenAgentRequest {
            run_id: run_id.clone(),
            instance_name: instance_name.clone(),
            workspace_guest_path: ctx.config.sandbox.working_dir.clone(),
            mounts,
            agent_command: ctx.config.agent_command.clone(),
            init: Some(AgentInit {
                script: script.map(str::to_owned),
                timeout_seconds,
                env: agent_env.clone(),
            }),
        })
        .await?;

    let redactor = Redactor::new(
        ctx.config
            .secret_values()
            .into_iter()
            .chain(pick_secret_values(&agent_env))
            .chain(pick_secret_values(&raw_env)),
        &ctx.config.redact_patterns,
    );
    let init_pending = opened.init_pending;
    if init_pending {
        run.state().suppress_next_exit = true;
    }

    let observer = Arc::new(RunObserver {
        ctx: ctx.clone(),
        run: Arc::downgrade(run),
        run_id: run_id.clone(),
    });
    let mut client = RunClient::new(
        run_id.clone(),
        instance_name.clone(),
        ctx.config.sandbox.working_dir.clone(),
        Arc::clone(&ctx.sandbox),
    )
    .with_terminal(ctx.config.sandbox.terminal_enabled);
    if ctx.config.permission_ask {
        client = client.with_permission_ask(ctx.clone(), run);
    }
    let handler = Arc::new(client);
    let bridge = AgentBridge::start(
        opened.handle,
        BridgeOptions {
            label: run_id.clone(),
            init_pending,
            redactor,
            observer,
            handler: Some(handler),
        },
    );
    if !attach_agent(ctx, run, &bridge).await {
        warn!(run_id = %run_id, "run closed while its agent was starting");
        bridge.close().await;
        return Err(AppError::AgentClosed);
    }
    info!(run_id = %run_id, instance_name = %instance_name, created = opened.created, init_pending, "agent started");
    send_update(
        ctx,
        &run_id,
        json!({ "type": "transport_connected", "instance_name": instance_name, "at": now_rfc3339() }),
    );

    match ctx.sandbox.inspect_instance(instance_name.clone()).await {
        Ok(info) => {
            send_sandbox_instance_status(ctx, &run_id, &instance_name, info.status.as_str(), None);
        }
        Err(err) => warn!(run_id = %run_id, %err, "inspect after agent start failed"),
    }

    if !init_pending {
        return Ok(());
    }

    let outcome = bridge
        .wait_for_init_result(Duration::from_secs(timeout_seconds))
        .await;
    let failure = match outcome {
        Ok(result) if result.ok => None,
        Ok(result) => {
            send_update(
                ctx,
                &run_id,
                json!({
                    "type": "init_result",
                    "ok": false,
                    "exitCode": result.exit_code,
                    "error": result.exit_code.map_or_else(|| "init_failed".to_owned(), |c| format!("exitCode={c}")),
                }),
            );
            Some(AppError::InitHandshake(result.exit_code.map_or_else(
                || "init failed".to_owned(),
                |c| format!("init exitCode={c}"),
            )))
        }
        Err(err) => {
            send_update(
                ctx,
                &run_id,
                json!({ "type": "init_result", "ok": false, "error": err.to_string() }),
            );
            Some(err)
        }
    };

    if let Some(err) = failure {
        close_agent(run, "init_failed").await;
        if let Err(stop_err) = ctx.sandbox.stop_instance(instance_name.clone()).await {
            warn!(run_id = %run_id, err = %stop_err, "stop after init failure failed");
        }
        return Err(err);
    }

    run.state().suppress_next_exit = false;
    send_update(ctx, &run_id, json!({ "type": "init_result", "ok": true }));
    send_text(ctx, &run_id, "[init] done");
    Ok(())
}

/// Make sure the run has a live, started agent.
///
/// In exec mode the init script runs first, only when no agent is live.
/// Callers hold the run's op lock.
///
/// # Errors
///
/// Propagates init and start failures.
pub async fn ensure_agent(
    ctx: &ProxyContext,
    run: &Arc<RunHandle>,
    init: Option<&InitPayload>,
) -> Result<()> {
    if run.agent().is_some_and(|a| !a.is_closed()) {
        return Ok(());
    }
    if ctx.sandbox.agent_mode() == AgentMode::Exec {
        run_init_script(ctx, run, init).await?;
    }
    start_agent(ctx, run, init).await
}

/// Start the agent if needed and `initialize` it. A failure leaves an
/// opening run closed so that its keepalive can lapse.
///
/// # Errors
///
/// Propagates start and `initialize` failures.
pub async fn open_run_agent(
    ctx: &ProxyContext,
    run: &Arc<RunHandle>,
    init: Option<&InitPayload>,
) -> Result<Value> {
    let opened = match ensure_agent(ctx, run, init).await {
        Ok(()) => ensure_initialized(ctx, run).await,
        Err(err) => Err(err),
    };
    if opened.is_err() {
        let mut state = run.state();
        if state.phase == RunPhase::Opening {
            state.phase = RunPhase::Closed;
        }
    }
    opened
}

/// Send `initialize` once per agent and cache the result.
///
/// # Errors
///
/// Returns `AppError::Acp("agent not connected")` without an agent, or the
/// RPC error.
pub async fn ensure_initialized(ctx: &ProxyContext, run: &RunHandle) -> Result<Value> {
    let bridge = {
        let state = run.state();
        if state.initialized {
            if let Some(result) = &state.init_result {
                return Ok(result.clone());
            }
        }
        state.agent.clone().ok_or_else(not_connected)?
    };
    let result = bridge
        .send_rpc(
            "initialize",
            initialize_params(ctx.config.sandbox.terminal_enabled),
            DEFAULT_RPC_TIMEOUT,
        )
        .await?;
    {
        let mut state = run.state();
        state.initialized = true;
        state.init_result = Some(result.clone());
        if state.phase == RunPhase::Opening || state.phase == RunPhase::Closed {
            state.phase = RunPhase::Ready;
        }
    }
    Ok(result)
}

/// Run `call`, authenticating once and retrying when the agent answers
/// with the auth-required error.
///
/// # Errors
///
/// Returns the original error when no auth method is advertised, or the
/// `authenticate` / retry error.
pub async fn with_auth_retry<F, Fut>(run: &RunHandle, mut call: F) -> Result<Value>
where
    F: FnMut(Arc<AgentBridge>) -> Fut,
    Fut: Future<Output = Result<Value>>,
{
    let bridge = run.agent().ok_or_else(not_connected)?;
    match call(Arc::clone(&bridge)).await {
        Err(err) if err.rpc_code() == Some(AUTH_REQUIRED) => {
            let method_id = run
                .state()
                .init_result
                .as_ref()
                .and_then(|r| r.pointer("/authMethods/0/id"))
                .and_then(Value::as_str)
                .map(str::to_owned);
            let Some(method_id) = method_id else {
                return Err(err);
            };
            info!(run_id = run.run_id(), method_id = %method_id, "agent requires authentication");
            bridge
                .send_rpc("authenticate", json!({ "methodId": method_id }), AUTH_TIMEOUT)
                .await?;
            call(bridge).await
        }
        other => other,
    }
}
