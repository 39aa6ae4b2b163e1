//! Sandbox providers.
//!
//! A [`SandboxProvider`] realizes "an agent process reachable through a
//! [`ProcessHandle`]" from a declarative request. One implementation exists
//! per backend and the backend is chosen once at startup from configuration:
//!
//! - `container`: OCI containers driven through docker, podman or nerdctl;
//!   the agent is the container's entrypoint process.
//! - `bwrap`: Linux namespaces through bubblewrap; the agent is exec'd into
//!   an in-memory instance.

pub mod bwrap;
pub mod container;
pub mod entrypoint;
pub mod process;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{SandboxConfig, SandboxProviderKind};
use crate::Result;

pub use process::{ExitInfo, ProcessHandle};

/// Boxed future returned by object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Label marking instances created by this proxy.
pub const LABEL_MANAGED: &str = "acp-proxy.managed";
/// Label recording how the agent runs inside the instance.
pub const LABEL_AGENT_MODE: &str = "acp-proxy.agent_mode";
/// Label recording the owning run.
pub const LABEL_RUN_ID: &str = "acp-proxy.run_id";

// ── Shared types ─────────────────────────────────────────────────────────────

/// Backend-reported instance state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// No such instance.
    Missing,
    /// Instance exists and is running.
    Running,
    /// Instance exists but is not running.
    Stopped,
}

impl InstanceStatus {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

/// How the agent process is started inside an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    /// The agent is the instance's main process.
    Entrypoint,
    /// The agent is exec'd into an already running instance.
    Exec,
}

impl AgentMode {
    /// Label and wire value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entrypoint => "entrypoint",
            Self::Exec => "exec",
        }
    }
}

/// Snapshot of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxInstanceInfo {
    /// Instance name.
    pub instance_name: String,
    /// Current state.
    pub status: InstanceStatus,
    /// Creation time, when the backend reports one.
    pub created_at: Option<String>,
    /// Owning run, from the instance labels.
    pub run_id: Option<String>,
}

impl SandboxInstanceInfo {
    /// Info for an instance that does not exist.
    #[must_use]
    pub fn missing(instance_name: &str) -> Self {
        Self {
            instance_name: instance_name.to_owned(),
            status: InstanceStatus::Missing,
            created_at: None,
            run_id: None,
        }
    }
}

/// Mount access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountAccess {
    /// Read-only.
    Ro,
    /// Read-write.
    Rw,
}

/// Host directory bound into an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    /// Absolute host path.
    pub host_path: PathBuf,
    /// Absolute guest path.
    pub guest_path: String,
    /// Access mode.
    pub access: MountAccess,
}

impl Mount {
    /// Read-write mount.
    #[must_use]
    pub fn rw(host_path: impl Into<PathBuf>, guest_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            guest_path: guest_path.into(),
            access: MountAccess::Rw,
        }
    }

    /// Read-only mount.
    #[must_use]
    pub fn ro(host_path: impl Into<PathBuf>, guest_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            guest_path: guest_path.into(),
            access: MountAccess::Ro,
        }
    }

    /// `host:guest[:ro]`, as accepted by `-v`.
    #[must_use]
    pub fn to_spec_string(&self) -> String {
        let suffix = match self.access {
            MountAccess::Ro => ":ro",
            MountAccess::Rw => "",
        };
        format!("{}:{}{suffix}", self.host_path.display(), self.guest_path)
    }
}

/// Configured volumes as mounts.
#[must_use]
pub fn config_volume_mounts(config: &SandboxConfig) -> Vec<Mount> {
    config
        .volumes
        .iter()
        .map(|v| {
            if v.read_only {
                Mount::ro(&v.host_path, v.guest_path.clone())
            } else {
                Mount::rw(&v.host_path, v.guest_path.clone())
            }
        })
        .collect()
}

/// Request for [`SandboxProvider::ensure_instance_running`].
#[derive(Debug, Clone)]
pub struct EnsureInstanceRequest {
    /// Owning run.
    pub run_id: String,
    /// Target instance.
    pub instance_name: String,
    /// Composed per-run mounts.
    pub mounts: Vec<Mount>,
    /// Workspace guest path.
    pub workspace_guest_path: String,
}

/// Request for [`SandboxProvider::exec_process`].
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Target instance.
    pub instance_name: String,
    /// Command and arguments.
    pub command: Vec<String>,
    /// Working directory inside the instance.
    pub cwd_in_guest: String,
    /// Extra environment.
    pub env: BTreeMap<String, String>,
}

/// Init step attached to an agent start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentInit {
    /// Bash script run before the agent starts.
    pub script: Option<String>,
    /// Deadline for the script.
    pub timeout_seconds: u64,
    /// Environment for the script and the agent.
    pub env: BTreeMap<String, String>,
}

impl AgentInit {
    /// Non-blank init script, if any.
    #[must_use]
    pub fn script(&self) -> Option<&str> {
        self.script
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Request for [`SandboxProvider::open_agent`].
#[derive(Debug, Clone)]
pub struct OpenAgentRequest {
    /// Owning run.
    pub run_id: String,
    /// Target instance.
    pub instance_name: String,
    /// Workspace guest path (agent cwd).
    pub workspace_guest_path: String,
    /// Composed per-run mounts.
    pub mounts: Vec<Mount>,
    /// Agent command line.
    pub agent_command: Vec<String>,
    /// Init script and environment.
    pub init: Option<AgentInit>,
}

/// Outcome of [`SandboxProvider::open_agent`].
#[derive(Debug)]
pub struct OpenAgentResult {
    /// Agent stdio.
    pub handle: ProcessHandle,
    /// Whether a new instance was created.
    pub created: bool,
    /// Whether the init marker must be awaited on stderr.
    pub init_pending: bool,
}

// ── Provider trait ───────────────────────────────────────────────────────────

/// Sandbox backend capability set.
///
/// All management calls are idempotent: stopping a stopped instance or
/// removing a missing one succeeds.
pub trait SandboxProvider: Send + Sync {
    /// Backend kind.
    fn kind(&self) -> SandboxProviderKind;

    /// Runtime CLI name, when the backend has one.
    fn runtime(&self) -> Option<&str>;

    /// How the agent is started.
    fn agent_mode(&self) -> AgentMode;

    /// Current state of `instance_name`.
    fn inspect_instance(&self, instance_name: String) -> BoxFuture<'_, Result<SandboxInstanceInfo>>;

    /// Prepare the instance for use by a run.
    fn ensure_instance_running(
        &self,
        req: EnsureInstanceRequest,
    ) -> BoxFuture<'_, Result<SandboxInstanceInfo>>;

    /// Instances known to the backend; `managed_only` restricts to ours.
    fn list_instances(&self, managed_only: bool) -> BoxFuture<'_, Result<Vec<SandboxInstanceInfo>>>;

    /// Stop an instance.
    fn stop_instance(&self, instance_name: String) -> BoxFuture<'_, Result<()>>;

    /// Remove an instance.
    fn remove_instance(&self, instance_name: String) -> BoxFuture<'_, Result<()>>;

    /// Remove an image.
    fn remove_image(&self, image: String) -> BoxFuture<'_, Result<()>>;

    /// Start an auxiliary process inside an instance.
    fn exec_process(&self, req: ExecRequest) -> BoxFuture<'_, Result<ProcessHandle>>;

    /// Start or attach to the agent process for a run.
    fn open_agent(&self, req: OpenAgentRequest) -> BoxFuture<'_, Result<OpenAgentResult>>;
}

/// Build the provider selected by configuration.
#[must_use]
pub fn provider_from_config(config: &SandboxConfig) -> Arc<dyn SandboxProvider> {
    match config.provider {
        SandboxProviderKind::ContainerOci => Arc::new(container::OciCliSandbox::new(
            config.clone(),
            container::CliContainerDriver::new(config.runtime),
        )),
        SandboxProviderKind::Bwrap => Arc::new(bwrap::BwrapSandbox::new(config.clone())),
    }
}

/// Current time as an RFC 3339 string.
#[must_use]
pub fn now_rfc3339() -> String {
    let now: DateTime<Utc> = Utc::now();
    now.to_rfc3339()
}
