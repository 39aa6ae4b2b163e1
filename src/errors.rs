//! Error types shared across the proxy.

use std::fmt::{Display, Formatter};

use crate::acp::jsonrpc::RpcError;

/// Shared proxy result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Proxy error enumeration covering all domain failure modes.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Configuration parsing or validation failure, including conflicting
    /// mount layouts.
    Config(String),
    /// Orchestrator tunnel connect or send failure.
    Connection(String),
    /// Agent stdio framing, bridge I/O, or agent process failure.
    Acp(String),
    /// The agent bridge was closed while the operation was outstanding.
    AgentClosed,
    /// No response arrived for an RPC within its deadline.
    RpcTimeout {
        /// JSON-RPC method that timed out.
        method: String,
        /// Deadline that elapsed, in milliseconds.
        timeout_ms: u64,
    },
    /// The agent answered an RPC with a JSON-RPC error object.
    Rpc(RpcError),
    /// Init handshake failure: malformed marker, missing stderr, timeout or
    /// a failed init script.
    InitHandshake(String),
    /// An existing sandbox instance is in a different agent mode.
    SandboxState(String),
    /// Sandbox backend command failure.
    Sandbox(String),
    /// Inbound message failed validation.
    Validation(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Connection(msg) => write!(f, "connection: {msg}"),
            Self::Acp(msg) => write!(f, "acp: {msg}"),
            Self::AgentClosed => write!(f, "agent closed"),
            Self::RpcTimeout { method, timeout_ms } => {
                write!(f, "rpc timeout after {timeout_ms}ms: {method}")
            }
            Self::Rpc(err) => write!(f, "rpc error {}: {}", err.code, err.message),
            Self::InitHandshake(msg) => write!(f, "init: {msg}"),
            Self::SandboxState(msg) => write!(f, "sandbox state: {msg}"),
            Self::Sandbox(msg) => write!(f, "sandbox: {msg}"),
            Self::Validation(msg) => write!(f, "invalid message: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// JSON-RPC error code when this error came back from the agent.
    #[must_use]
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            Self::Rpc(err) => Some(err.code),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Acp(format!("invalid json: {err}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection(err.to_string())
    }
}
