//! Requests the agent sends to the proxy (the ACP "client" side).

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::acp::bridge::AgentRequestHandler;
use crate::acp::jsonrpc::{id_key, RpcError, RESOURCE_NOT_FOUND, SERVER_ERROR};
use crate::handlers::ProxyContext;
use crate::runs::permission::{default_outcome, usable_options};
use crate::runs::registry::RunHandle;
use crate::runs::terminal::{TerminalManager, TerminalSpec};
use crate::runs::updates::send_update;
use crate::sandbox::process::{collect_output, CaptureOutput};
use crate::sandbox::{BoxFuture, ExecRequest, SandboxProvider};
use crate::validate::resolve_workspace_guest_path;

const FS_READ_SCRIPT: &str = r#"cat -- "$1""#;
const FS_WRITE_SCRIPT: &str = r#"mkdir -p -- "$(dirname -- "$1")" && cat > "$1""#;
const FS_TIMEOUT: Duration = Duration::from_secs(60);

/// Slice `content` by 1-based `line` and `limit`.
#[must_use]
pub fn slice_lines(content: &str, line: Option<u64>, limit: Option<u64>) -> String {
    if line.is_none() && limit.is_none() {
        return content.to_owned();
    }
    if limit == Some(0) {
        return String::new();
    }
    let start = usize::try_from(line.unwrap_or(1).saturating_sub(1)).unwrap_or(usize::MAX);
    let lines = content.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
    let taken: Vec<&str> = match limit {
        Some(n) => lines
            .skip(start)
            .take(usize::try_from(n).unwrap_or(usize::MAX))
            .collect(),
        None => lines.skip(start).collect(),
    };
    taken.join("\n")
}

struct PermissionAsk {
    ctx: ProxyContext,
    run: Weak<RunHandle>,
}

/// Answers agent requests for one run by executing inside its instance.
pub struct RunClient {
    run_id: String,
    instance_name: String,
    workspace_guest_root: String,
    sandbox: Arc<dyn SandboxProvider>,
    terminal_enabled: bool,
    terminals: TerminalManager,
    ask: Option<PermissionAsk>,
}

impl RunClient {
    /// Client for the run's instance. Terminals are off and permission
    /// requests are answered locally until enabled.
    #[must_use]
    pub fn new(
        run_id: String,
        instance_name: String,
        workspace_guest_root: String,
        sandbox: Arc<dyn SandboxProvider>,
    ) -> Self {
        Self {
            run_id,
            instance_name,
            workspace_guest_root,
            sandbox,
            terminal_enabled: false,
            terminals: TerminalManager::default(),
            ask: None,
        }
    }

    /// Serve `terminal/*` requests.
    #[must_use]
    pub fn with_terminal(mut self, enabled: bool) -> Self {
        self.terminal_enabled = enabled;
        self
    }

    /// Relay permission requests to the orchestrator through `run`.
    #[must_use]
    pub fn with_permission_ask(mut self, ctx: ProxyContext, run: &Arc<RunHandle>) -> Self {
        self.ask = Some(PermissionAsk {
            ctx,
            run: Arc::downgrade(run),
        });
        self
    }

    fn guest_path(&self, params: &Value) -> Result<String, RpcError> {
        let path = params
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("path is required"))?;
        resolve_workspace_guest_path(&self.workspace_guest_root, path)
            .map_err(|err| RpcError::invalid_params(err.to_string()))
    }

    async fn exec_script(
        &self,
        script: &str,
        path: &str,
        input: Option<Vec<u8>>,
    ) -> Result<CaptureOutput, RpcError> {
        let handle = self
            .sandbox
            .exec_process(ExecRequest {
                instance_name: self.instance_name.clone(),
                command: vec![
                    "sh".into(),
                    "-c".into(),
                    script.to_owned(),
                    "sh".into(),
                    path.to_owned(),
                ],
                cwd_in_guest: self.workspace_guest_root.clone(),
                env: BTreeMap::new(),
            })
            .await
            .map_err(|err| RpcError::internal(err.to_string()))?;
        collect_output(handle, input, FS_TIMEOUT)
            .await
            .map_err(|err| RpcError::internal(err.to_string()))
    }

    async fn read_text_file(&self, params: Value) -> Result<Value, RpcError> {
        let path = self.guest_path(&params)?;
        let out = self.exec_script(FS_READ_SCRIPT, &path, None).await?;
        if !out.success() {
            let text = format!("{}\n{}", out.stdout, out.stderr).to_lowercase();
            if text.contains("no such file") || text.contains("not found") {
                return Err(RpcError::new(RESOURCE_NOT_FOUND, "resource not found"));
            }
            return Err(RpcError::internal(out.diagnostic().to_owned()));
        }
        let line = params.get("line").and_then(Value::as_u64);
        let limit = params.get("limit").and_then(Value::as_u64);
        Ok(json!({ "content": slice_lines(&out.stdout, line, limit) }))
    }

    async fn write_text_file(&self, params: Value) -> Result<Value, RpcError> {
        let path = self.guest_path(&params)?;
        let content = params
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .as_bytes()
            .to_vec();
        let out = self.exec_script(FS_WRITE_SCRIPT, &path, Some(content)).await?;
        if !out.success() {
            return Err(RpcError::internal(out.diagnostic().to_owned()));
        }
        info!(run_id = %self.run_id, path = %path, "agent wrote file");
        Ok(json!({}))
    }

    async fn request_permission(&self, id: &Value, params: Value) -> Result<Value, RpcError> {
        let options = usable_options(&params);
        let Some(ask) = &self.ask else {
            return Ok(json!({ "outcome": default_outcome(&options) }));
        };
        if options.is_empty() {
            warn!(run_id = %self.run_id, "permission request without options");
            return Ok(json!({ "outcome": { "outcome": "cancelled" } }));
        }
        let (Some(run), Some(request_id)) = (ask.run.upgrade(), id_key(id)) else {
            return Ok(json!({ "outcome": { "outcome": "cancelled" } }));
        };
        let Some(decided) = run.permissions().park(&request_id, options.clone()) else {
            warn!(run_id = %self.run_id, request_id = %request_id, "permission request already pending");
            return Ok(json!({ "outcome": default_outcome(&options) }));
        };
        let prompt_id = run.state().active_prompt_id.clone();
        send_update(
            &ask.ctx,
            &self.run_id,
            json!({
                "type": "permission_request",
                "request_id": request_id,
                "session_id": params.get("sessionId").and_then(Value::as_str),
                "prompt_id": prompt_id,
                "tool_call": params.get("toolCall").cloned().unwrap_or(Value::Null),
                "options": options,
            }),
        );
        drop(run);
        info!(run_id = %self.run_id, request_id = %request_id, "permission request relayed");
        let outcome = decided
            .await
            .unwrap_or_else(|_| json!({ "outcome": "cancelled" }));
        Ok(json!({ "outcome": outcome }))
    }

    async fn create_terminal(&self, params: Value) -> Result<Value, RpcError> {
        let spec = TerminalSpec::from_params(&params)?;
        let cwd = resolve_workspace_guest_path(&self.workspace_guest_root, &spec.cwd)
            .map_err(|err| RpcError::invalid_params(err.to_string()))?;
        let handle = self
            .sandbox
            .exec_process(ExecRequest {
                instance_name: self.instance_name.clone(),
                command: spec.command,
                cwd_in_guest: cwd,
                env: spec.env,
            })
            .await
            .map_err(|err| RpcError::internal(err.to_string()))?;
        info!(run_id = %self.run_id, "terminal created");
        Ok(self.terminals.adopt(handle, spec.output_byte_limit))
    }
}

impl AgentRequestHandler for RunClient {
    fn handle_request(
        &self,
        id: Value,
        method: String,
        params: Value,
    ) -> BoxFuture<'_, std::result::Result<Value, RpcError>> {
        Box::pin(async move {
            debug!(run_id = %self.run_id, method = %method, "agent request");
            if method.starts_with("terminal/") && !self.terminal_enabled {
                return Err(RpcError::new(SERVER_ERROR, "terminal disabled"));
            }
            match method.as_str() {
                "session/request_permission" => self.request_permission(&id, params).await,
                "fs/read_text_file" => self.read_text_file(params).await,
                "fs/write_text_file" => self.write_text_file(params).await,
                "terminal/create" => self.create_terminal(params).await,
                "terminal/output" => self.terminals.output(&params),
                "terminal/wait_for_exit" => self.terminals.wait_for_exit(&params).await,
                "terminal/kill" => self.terminals.kill(&params),
                "terminal/release" => self.terminals.release(&params),
                other => Err(RpcError::method_not_found(other)),
            }
        })
    }
}
