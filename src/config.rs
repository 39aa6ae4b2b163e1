//! Proxy configuration parsing, environment overrides, and validation.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// Sandbox backend selected at startup.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxProviderKind {
    /// Containers driven through an OCI-compatible CLI.
    ContainerOci,
    /// Linux namespaces via `bwrap`.
    Bwrap,
}

impl SandboxProviderKind {
    /// Wire name reported to the orchestrator.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContainerOci => "container_oci",
            Self::Bwrap => "bwrap",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "container_oci" => Ok(Self::ContainerOci),
            "bwrap" => Ok(Self::Bwrap),
            other => Err(AppError::Config(format!("unknown sandbox provider: {other}"))),
        }
    }
}

/// Container CLI used by the `container_oci` backend.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerCli {
    /// `docker`
    Docker,
    /// `podman`
    Podman,
    /// `nerdctl`
    Nerdctl,
}

impl ContainerCli {
    /// Executable name.
    #[must_use]
    pub fn program(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
            Self::Nerdctl => "nerdctl",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw.trim() {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            "nerdctl" => Ok(Self::Nerdctl),
            other => Err(AppError::Config(format!("unknown container runtime: {other}"))),
        }
    }
}

/// How a run's host workspace is checked out from its repository.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceCheckout {
    /// `git worktree add` from a shared per-repository cache.
    Worktree,
    /// A full clone per run.
    Clone,
}

/// Extra host directory mounted into every sandbox.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct VolumeConfig {
    /// Absolute host path.
    pub host_path: PathBuf,
    /// Absolute guest path.
    pub guest_path: String,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Identity advertised in `register_agent`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Stable agent identifier.
    pub id: String,
    /// Display name; defaults to `id`.
    #[serde(default)]
    pub name: Option<String>,
    /// Maximum concurrent runs the orchestrator may place here.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Free-form capabilities merged into the registration payload.
    #[serde(default)]
    pub capabilities: serde_json::Map<String, serde_json::Value>,
}

impl AgentConfig {
    /// Name reported to the orchestrator.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.id)
    }
}

/// Workspace guest path used when none is configured.
pub const DEFAULT_WORKING_DIR: &str = "/workspace";

/// Sandbox backend settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SandboxConfig {
    /// Backend implementation.
    #[serde(default = "default_provider")]
    pub provider: SandboxProviderKind,
    /// Container CLI for `container_oci`.
    #[serde(default = "default_runtime")]
    pub runtime: ContainerCli,
    /// Container image for `container_oci`.
    #[serde(default)]
    pub image: String,
    /// Workspace guest path.
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// Host directory holding per-run workspaces and homes.
    #[serde(default)]
    pub workspace_host_root: PathBuf,
    /// Mount a per-run host directory at the guest home.
    #[serde(default = "default_true")]
    pub per_run_root_enabled: bool,
    /// Default guest home when `init.env` names none.
    #[serde(default = "default_user_home_guest_path")]
    pub user_home_guest_path: String,
    /// Default keepalive TTL for runs.
    #[serde(default = "default_keepalive_ttl_seconds")]
    pub keepalive_ttl_seconds: u64,
    /// Instance name prefix; instance names are `prefix + run_id`.
    #[serde(default = "default_instance_prefix")]
    pub instance_prefix: String,
    /// Environment applied to every sandbox process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Extra mounts applied to every instance.
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
    /// CPU limit passed as `--cpus`.
    #[serde(default)]
    pub cpus: Option<f64>,
    /// Memory limit passed as `--memory {n}m`.
    #[serde(default)]
    pub memory_mib: Option<u64>,
    /// Extra arguments appended to the container `run` command.
    #[serde(default)]
    pub extra_run_args: Vec<String>,
    /// `bwrap` executable.
    #[serde(default = "default_bwrap_path")]
    pub bwrap_path: String,
    /// Serve ACP `terminal/*` requests.
    #[serde(default)]
    pub terminal_enabled: bool,
    /// Checkout strategy for runs that name a repository.
    #[serde(default = "default_workspace_checkout")]
    pub workspace_checkout: WorkspaceCheckout,
}

fn default_provider() -> SandboxProviderKind {
    SandboxProviderKind::ContainerOci
}

fn default_workspace_checkout() -> WorkspaceCheckout {
    WorkspaceCheckout::Worktree
}

fn default_runtime() -> ContainerCli {
    ContainerCli::Docker
}

fn default_working_dir() -> String {
    DEFAULT_WORKING_DIR.into()
}

fn default_true() -> bool {
    true
}

fn default_user_home_guest_path() -> String {
    "/root".into()
}

fn default_keepalive_ttl_seconds() -> u64 {
    1800
}

fn default_instance_prefix() -> String {
    "acp-run-".into()
}

fn default_bwrap_path() -> String {
    "bwrap".into()
}

fn default_max_concurrent() -> u32 {
    1
}

fn default_heartbeat_seconds() -> u64 {
    30
}

fn default_reconnect_initial_ms() -> u64 {
    1000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_cleanup_interval_seconds() -> u64 {
    60
}

fn default_agent_command() -> Vec<String> {
    vec![
        "npx".into(),
        "--yes".into(),
        "@zed-industries/codex-acp".into(),
    ]
}

fn parse_flag(raw: &str) -> bool {
    let raw = raw.trim();
    raw == "1" || raw.eq_ignore_ascii_case("true")
}

/// Proxy configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ProxyConfig {
    /// Orchestrator WebSocket endpoint.
    pub orchestrator_url: String,
    /// Bearer token for the orchestrator connection.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Heartbeat interval.
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,
    /// First reconnect delay.
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    /// Reconnect delay cap.
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Outbound buffer size while the tunnel is down.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    /// Cleanup sweep period.
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    /// Command launched inside the sandbox as the ACP agent.
    #[serde(default = "default_agent_command")]
    pub agent_command: Vec<String>,
    /// `init.env` keys forwarded to the agent process.
    #[serde(default)]
    pub agent_env_allowlist: Vec<String>,
    /// Additional regexes redacted from diagnostic lines.
    #[serde(default)]
    pub redact_patterns: Vec<String>,
    /// Relay agent permission requests to the orchestrator instead of
    /// answering them locally.
    #[serde(default)]
    pub permission_ask: bool,
    /// Registration identity.
    pub agent: AgentConfig,
    /// Sandbox backend.
    pub sandbox: SandboxConfig,
}

impl ProxyConfig {
    /// Load, override from the environment, and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, an override is malformed, or validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_env_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string without looking at
    /// the process environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ACP_PROXY_*` overrides using `lookup` as the variable source.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when an override value cannot be parsed.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("ACP_PROXY_ORCHESTRATOR_URL") {
            self.orchestrator_url = url.trim().to_owned();
        }
        if let Some(token) = get("ACP_PROXY_AUTH_TOKEN") {
            self.auth_token = Some(token.trim().to_owned());
        }
        if let Some(id) = get("ACP_PROXY_AGENT_ID") {
            self.agent.id = id.trim().to_owned();
        }
        if let Some(provider) = get("ACP_PROXY_SANDBOX_PROVIDER") {
            self.sandbox.provider = SandboxProviderKind::parse(&provider)?;
        }
        if let Some(image) = get("ACP_PROXY_SANDBOX_IMAGE") {
            self.sandbox.image = image.trim().to_owned();
        }
        if let Some(runtime) = get("ACP_PROXY_CONTAINER_RUNTIME") {
            self.sandbox.runtime = ContainerCli::parse(&runtime)?;
        }
        if let Some(root) = get("ACP_PROXY_WORKSPACE_HOST_ROOT") {
            self.sandbox.workspace_host_root = PathBuf::from(root.trim());
        }
        if let Some(flag) = get("ACP_PROXY_TERMINAL_ENABLED") {
            self.sandbox.terminal_enabled = parse_flag(&flag);
        }
        if let Some(flag) = get("ACP_PROXY_PERMISSION_ASK") {
            self.permission_ask = parse_flag(&flag);
        }
        if let Some(secs) = get("ACP_PROXY_HEARTBEAT_SECONDS") {
            self.heartbeat_seconds = secs.trim().parse().map_err(|err| {
                AppError::Config(format!("ACP_PROXY_HEARTBEAT_SECONDS invalid: {err}"))
            })?;
        }
        Ok(())
    }

    /// Secret values that must never appear in forwarded diagnostics.
    #[must_use]
    pub fn secret_values(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .auth_token
            .iter()
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty())
            .collect();
        out.extend(crate::acp::redact::pick_secret_values(&self.sandbox.env));
        out
    }

    fn validate(&mut self) -> Result<()> {
        let url = self.orchestrator_url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(AppError::Config(
                "orchestrator_url must start with ws:// or wss://".into(),
            ));
        }
        self.orchestrator_url = url.to_owned();

        if self.agent.id.trim().is_empty() {
            return Err(AppError::Config("agent.id must not be empty".into()));
        }
        if self.agent.max_concurrent == 0 {
            return Err(AppError::Config(
                "agent.max_concurrent must be greater than zero".into(),
            ));
        }
        if self.heartbeat_seconds == 0 {
            return Err(AppError::Config(
                "heartbeat_seconds must be greater than zero".into(),
            ));
        }
        if self.cleanup_interval_seconds == 0 {
            return Err(AppError::Config(
                "cleanup_interval_seconds must be greater than zero".into(),
            ));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(AppError::Config(
                "outbound_queue_capacity must be greater than zero".into(),
            ));
        }
        if self.reconnect_max_ms < self.reconnect_initial_ms {
            self.reconnect_max_ms = self.reconnect_initial_ms;
        }
        if self.agent_command.is_empty() {
            return Err(AppError::Config("agent_command must not be empty".into()));
        }

        let sandbox = &mut self.sandbox;
        if sandbox.provider == SandboxProviderKind::ContainerOci && sandbox.image.trim().is_empty()
        {
            return Err(AppError::Config(
                "sandbox.image is required for container_oci".into(),
            ));
        }
        if !sandbox.working_dir.starts_with('/') {
            return Err(AppError::Config(
                "sandbox.working_dir must be an absolute guest path".into(),
            ));
        }
        if sandbox.workspace_host_root.as_os_str().is_empty() {
            return Err(AppError::Config(
                "sandbox.workspace_host_root must be set".into(),
            ));
        }
        if sandbox.workspace_host_root.is_relative() {
            let cwd = env::current_dir()
                .map_err(|err| AppError::Config(format!("cannot resolve cwd: {err}")))?;
            sandbox.workspace_host_root = cwd.join(&sandbox.workspace_host_root);
        }
        if !(60..=86_400).contains(&sandbox.keepalive_ttl_seconds) {
            warn!(
                value = sandbox.keepalive_ttl_seconds,
                "sandbox.keepalive_ttl_seconds out of range, clamping"
            );
            sandbox.keepalive_ttl_seconds = sandbox.keepalive_ttl_seconds.clamp(60, 86_400);
        }
        crate::validate::validate_instance_name(&format!("{}x", sandbox.instance_prefix))
            .map_err(|err| AppError::Config(format!("sandbox.instance_prefix invalid: {err}")))?;
        for volume in &sandbox.volumes {
            if !volume.host_path.is_absolute() || !volume.guest_path.starts_with('/') {
                return Err(AppError::Config(format!(
                    "sandbox.volumes entries must use absolute paths: {}",
                    volume.guest_path
                )));
            }
        }

        Ok(())
    }
}
