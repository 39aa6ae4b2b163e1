//! Agent Client Protocol (ACP) stdio handling.
//!
//! The proxy speaks newline-delimited JSON-RPC 2.0 with the agent process
//! running inside each sandbox. An [`AgentBridge`](bridge::AgentBridge) owns
//! one process's stdio and provides request/response correlation,
//! notification pumping and the init-marker handshake on stderr.
//!
//! Submodules:
//! - `codec`: [`LinesCodec`](tokio_util::codec::LinesCodec)-based line framing.
//! - `jsonrpc`: message classification and frame builders.
//! - `writer`: the single stdin writer task.
//! - `redact`: secret redaction for forwarded diagnostics.
//! - `init_marker`: init result and progress line parsing.
//! - `bridge`: the bridge itself.

pub mod bridge;
pub mod codec;
pub mod init_marker;
pub mod jsonrpc;
pub mod redact;
pub mod writer;
