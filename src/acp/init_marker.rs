//! Sentinel stderr lines emitted by the sandbox entrypoint around the init
//! script.
//!
//! `__ACP_PROXY_INIT_RESULT__:{"ok":true,"exitCode":0}` reports completion;
//! `__ACP_PROXY_INIT_STEP__:stage:status:message` reports progress.

use serde::Serialize;
use serde_json::Value;

use crate::{AppError, Result};

/// Prefix of the init completion marker.
pub const INIT_MARKER_PREFIX: &str = "__ACP_PROXY_INIT_RESULT__:";

/// Prefix of an init progress line.
pub const INIT_STEP_PREFIX: &str = "__ACP_PROXY_INIT_STEP__:";

/// Outcome of a sandbox init script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InitResult {
    /// Whether the script succeeded.
    pub ok: bool,
    /// Script exit code, when known.
    #[serde(rename = "exitCode")]
    pub exit_code: Option<i64>,
}

impl InitResult {
    /// Result reported when no init was required.
    #[must_use]
    pub const fn not_required() -> Self {
        Self {
            ok: true,
            exit_code: None,
        }
    }
}

/// Progress report from the init script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitStep {
    /// Stage name, e.g. `clone`.
    pub stage: String,
    /// `start`, `progress`, `done` or `error`.
    pub status: String,
    /// Free-form detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Parse the JSON payload that follows [`INIT_MARKER_PREFIX`].
///
/// Anything other than `"ok": true` counts as failure; a non-numeric
/// `exitCode` is treated as unknown.
///
/// # Errors
///
/// Returns [`AppError::InitHandshake`] carrying the raw payload when it is not
/// valid JSON.
pub fn parse_marker_payload(raw: &str) -> Result<InitResult> {
    let payload = raw.trim();
    let value: Value = serde_json::from_str(payload).map_err(|err| {
        AppError::InitHandshake(format!(
            "init marker JSON parse failed: {err}; payload={payload:?}"
        ))
    })?;
    Ok(InitResult {
        ok: value.get("ok").and_then(Value::as_bool) == Some(true),
        exit_code: value.get("exitCode").and_then(Value::as_i64),
    })
}

/// Split an init step line into its parts. Returns `None` when `line` is not
/// a step line or names no stage.
#[must_use]
pub fn parse_step_line(line: &str) -> Option<InitStep> {
    let rest = line.strip_prefix(INIT_STEP_PREFIX)?;
    let mut parts = rest.splitn(3, ':');
    let stage = parts.next().map(str::trim).filter(|s| !s.is_empty())?;
    let status = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("progress");
    let message = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned);
    Some(InitStep {
        stage: stage.to_owned(),
        status: status.to_owned(),
        message,
    })
}
