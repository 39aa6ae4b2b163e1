//! ACP `terminal/*` requests backed by processes in the run's instance.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::acp::jsonrpc::{RpcError, RESOURCE_NOT_FOUND};
use crate::sandbox::process::{BoxedReader, ExitInfo};
use crate::sandbox::ProcessHandle;

/// Default `outputByteLimit`.
pub const DEFAULT_OUTPUT_BYTE_LIMIT: usize = 2 * 1024 * 1024;
const MIN_OUTPUT_BYTE_LIMIT: usize = 4096;
const MAX_OUTPUT_BYTE_LIMIT: usize = 64 * 1024 * 1024;
const READ_CHUNK: usize = 8192;

/// Clamp a requested `outputByteLimit`.
#[must_use]
pub fn output_byte_limit(requested: Option<u64>) -> usize {
    requested
        .map_or(DEFAULT_OUTPUT_BYTE_LIMIT, |n| usize::try_from(n).unwrap_or(usize::MAX))
        .clamp(MIN_OUTPUT_BYTE_LIMIT, MAX_OUTPUT_BYTE_LIMIT)
}

/// `terminal/create` params, already validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalSpec {
    /// Command followed by its arguments.
    pub command: Vec<String>,
    /// `env` entries with a non-blank name.
    pub env: BTreeMap<String, String>,
    /// Requested cwd, before workspace resolution.
    pub cwd: String,
    /// Retained output bytes.
    pub output_byte_limit: usize,
}

impl TerminalSpec {
    /// Read `terminal/create` params.
    ///
    /// # Errors
    ///
    /// Returns invalid-params when the command is missing.
    pub fn from_params(params: &Value) -> Result<Self, RpcError> {
        let program = params
            .get("command")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| RpcError::invalid_params("command is required"))?;
        let mut command = vec![program.to_owned()];
        command.extend(
            params
                .get("args")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(Value::as_str)
                .filter(|a| !a.is_empty())
                .map(str::to_owned),
        );
        let env = params
            .get("env")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|item| {
                let name = item.get("name").and_then(Value::as_str)?.trim();
                if name.is_empty() {
                    return None;
                }
                let value = item.get("value").and_then(Value::as_str).unwrap_or_default();
                Some((name.to_owned(), value.to_owned()))
            })
            .collect();
        let cwd = params
            .get("cwd")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(".")
            .to_owned();
        Ok(Self {
            command,
            env,
            cwd,
            output_byte_limit: output_byte_limit(params.get("outputByteLimit").and_then(Value::as_u64)),
        })
    }
}

/// Keep the last `limit` bytes of `buf`, starting on a character boundary.
/// Returns whether anything was cut.
pub fn trim_to_byte_limit(buf: &mut Vec<u8>, limit: usize) -> bool {
    if buf.len() <= limit {
        return false;
    }
    let mut cut = buf.len() - limit;
    while cut < buf.len() && (buf[cut] & 0b1100_0000) == 0b1000_0000 {
        cut += 1;
    }
    buf.drain(..cut);
    true
}

#[derive(Debug, Default)]
struct Output {
    bytes: Vec<u8>,
    truncated: bool,
}

fn exit_json(info: &ExitInfo) -> Value {
    json!({ "exitCode": info.code, "signal": info.signal })
}

struct Terminal {
    output: Mutex<Output>,
    limit: usize,
    exit: watch::Receiver<Option<ExitInfo>>,
    kill: CancellationToken,
}

impl Terminal {
    fn output(&self) -> MutexGuard<'_, Output> {
        self.output.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, chunk: &[u8]) {
        let mut output = self.output();
        output.bytes.extend_from_slice(chunk);
        if trim_to_byte_limit(&mut output.bytes, self.limit) {
            output.truncated = true;
        }
    }
}

async fn pump(terminal: Arc<Terminal>, mut stream: BoxedReader) {
    let mut buf = vec![0_u8; READ_CHUNK];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => terminal.append(&buf[..n]),
            Err(err) => {
                debug!(%err, "terminal stream read failed");
                break;
            }
        }
    }
}

/// Terminals created by one agent.
#[derive(Default)]
pub struct TerminalManager {
    terminals: Mutex<HashMap<String, Arc<Terminal>>>,
}

impl TerminalManager {
    fn terminals(&self) -> MutexGuard<'_, HashMap<String, Arc<Terminal>>> {
        self.terminals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, params: &Value) -> Result<Arc<Terminal>, RpcError> {
        let id = params
            .get("terminalId")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("terminalId is required"))?;
        self.terminals()
            .get(id)
            .cloned()
            .ok_or_else(|| RpcError::new(RESOURCE_NOT_FOUND, "resource not found"))
    }

    /// Adopt a started process; returns the `terminal/create` result.
    pub fn adopt(&self, handle: ProcessHandle, output_byte_limit: usize) -> Value {
        let (exit_tx, exit_rx) = watch::channel(None);
        let terminal = Arc::new(Terminal {
            output: Mutex::new(Output::default()),
            limit: output_byte_limit,
            exit: exit_rx,
            kill: handle.kill,
        });
        drop(handle.stdin);
        tokio::spawn(pump(Arc::clone(&terminal), handle.stdout));
        if let Some(stderr) = handle.stderr {
            tokio::spawn(pump(Arc::clone(&terminal), stderr));
        }
        let exit = handle.exit;
        tokio::spawn(async move {
            let info = exit.await.unwrap_or(ExitInfo {
                code: None,
                signal: None,
            });
            let _ = exit_tx.send(Some(info));
        });

        let terminal_id = Uuid::new_v4().to_string();
        self.terminals().insert(terminal_id.clone(), terminal);
        json!({ "terminalId": terminal_id })
    }

    /// `terminal/output`.
    ///
    /// # Errors
    ///
    /// Returns resource-not-found for an unknown terminal.
    pub fn output(&self, params: &Value) -> Result<Value, RpcError> {
        let terminal = self.get(params)?;
        let exit_status = terminal.exit.borrow().as_ref().map(exit_json);
        let output = terminal.output();
        Ok(json!({
            "output": String::from_utf8_lossy(&output.bytes),
            "truncated": output.truncated,
            "exitStatus": exit_status,
        }))
    }

    /// `terminal/wait_for_exit`.
    ///
    /// # Errors
    ///
    /// Returns resource-not-found for an unknown terminal.
    pub async fn wait_for_exit(&self, params: &Value) -> Result<Value, RpcError> {
        let terminal = self.get(params)?;
        let mut exit = terminal.exit.clone();
        let status = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RpcError::internal("terminal exit lost"))?
            .as_ref()
            .map(exit_json)
            .unwrap_or(Value::Null);
        Ok(status)
    }

    /// `terminal/kill`.
    ///
    /// # Errors
    ///
    /// Returns resource-not-found for an unknown terminal.
    pub fn kill(&self, params: &Value) -> Result<Value, RpcError> {
        self.get(params)?.kill.cancel();
        Ok(json!({}))
    }

    /// `terminal/release`: kill and forget.
    ///
    /// # Errors
    ///
    /// Returns resource-not-found for an unknown terminal.
    pub fn release(&self, params: &Value) -> Result<Value, RpcError> {
        let terminal = self.get(params)?;
        terminal.kill.cancel();
        if let Some(id) = params.get("terminalId").and_then(Value::as_str) {
            self.terminals().remove(id);
        }
        Ok(json!({}))
    }
}

impl Drop for TerminalManager {
    fn drop(&mut self) {
        for terminal in self.terminals().values() {
            terminal.kill.cancel();
        }
    }
}
