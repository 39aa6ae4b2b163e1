//! Per-run state and the operations that drive a run's sandbox and agent.
//!
//! A run is created by the first `acp_open` (or `prompt_send`) that names it
//! and lives in the [`registry::RunRegistry`] until it is closed or its
//! keepalive TTL lapses.

pub mod agent;
pub mod agent_inputs;
pub mod client;
pub mod permission;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod terminal;
pub mod updates;
pub mod workspace_git;

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Default init script deadline, in seconds.
pub const DEFAULT_INIT_TIMEOUT_SECONDS: u64 = 300;
const MIN_INIT_TIMEOUT_SECONDS: u64 = 1;
const MAX_INIT_TIMEOUT_SECONDS: u64 = 3600;

/// `init` object carried by `acp_open` and `prompt_send`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitPayload {
    /// Bash script run before the agent starts.
    #[serde(default)]
    pub script: Option<String>,
    /// Script deadline; clamped to 1..=3600.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Environment for the script and, after allowlisting, the agent.
    /// Numbers and booleans are taken as their text; nulls are dropped.
    #[serde(default, deserialize_with = "scalar_env")]
    pub env: BTreeMap<String, String>,
    /// Raw agent-inputs manifest.
    #[serde(default, rename = "agentInputs")]
    pub agent_inputs: Option<Value>,
}

fn scalar_env<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    let mut env = BTreeMap::new();
    for (key, value) in raw {
        let text = match value {
            Value::Null => continue,
            Value::String(s) => s,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Array(_) | Value::Object(_) => {
                return Err(D::Error::custom(format!("init.env.{key} must be a scalar")));
            }
        };
        env.insert(key, text);
    }
    Ok(env)
}

impl InitPayload {
    /// Non-blank init script, if any.
    #[must_use]
    pub fn script(&self) -> Option<&str> {
        self.script
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Effective script deadline in seconds.
    #[must_use]
    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds
            .unwrap_or(DEFAULT_INIT_TIMEOUT_SECONDS)
            .clamp(MIN_INIT_TIMEOUT_SECONDS, MAX_INIT_TIMEOUT_SECONDS)
    }
}
