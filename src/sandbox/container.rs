//! OCI container backend driven through a container CLI.
//!
//! [`ContainerDriver`] is the seam between the instance state machine in
//! [`OciCliSandbox`] and the actual `docker`/`podman`/`nerdctl` binary, so the
//! state machine can be exercised against a scripted driver.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{ContainerCli, SandboxConfig, SandboxProviderKind, DEFAULT_WORKING_DIR};
use crate::sandbox::entrypoint::build_entrypoint_script;
use crate::sandbox::process::{run_capture, spawn_process, CaptureOutput, SpawnSpec};
use crate::sandbox::{
    config_volume_mounts, AgentMode, BoxFuture, EnsureInstanceRequest, ExecRequest,
    InstanceStatus, Mount, MountAccess, OpenAgentRequest, OpenAgentResult, ProcessHandle,
    SandboxInstanceInfo, SandboxProvider, LABEL_AGENT_MODE, LABEL_MANAGED, LABEL_RUN_ID,
};
use crate::{AppError, Result};

/// Deadline for management CLI calls (`inspect`, `rm`, `stop`, …).
const CLI_TIMEOUT: Duration = Duration::from_secs(120);

/// Fragments of CLI output meaning the target does not exist.
const MISSING_MARKERS: &[&str] = &["no such container", "no such object", "not found", "no such image"];

fn is_missing_output(out: &CaptureOutput) -> bool {
    let text = format!("{}\n{}", out.stdout, out.stderr).to_ascii_lowercase();
    MISSING_MARKERS.iter().any(|m| text.contains(m))
}

/// Map a CLI state string to an [`InstanceStatus`].
#[must_use]
pub fn parse_state(raw: &str) -> InstanceStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => InstanceStatus::Missing,
        "running" | "restarting" => InstanceStatus::Running,
        _ => InstanceStatus::Stopped,
    }
}

fn label_value(raw: &str) -> Option<String> {
    let v = raw.trim();
    if v.is_empty() || v == "<no value>" {
        None
    } else {
        Some(v.to_owned())
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

/// Arguments for an interactive `run`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Entrypoint override.
    pub entrypoint: Option<String>,
    /// Working directory (`-w`).
    pub working_dir: String,
    /// Labels (`--label`).
    pub labels: BTreeMap<String, String>,
    /// Environment (`-e`).
    pub env: BTreeMap<String, String>,
    /// Mounts (`-v`).
    pub mounts: Vec<Mount>,
    /// Extra CLI arguments placed before the image.
    pub extra_args: Vec<String>,
    /// Command after the image.
    pub cmd: Vec<String>,
}

/// Container CLI operations used by [`OciCliSandbox`].
pub trait ContainerDriver: Send + Sync {
    /// CLI program name.
    fn program(&self) -> &str;

    /// Inspect one container.
    fn inspect(&self, name: String) -> BoxFuture<'_, Result<SandboxInstanceInfo>>;

    /// Read a container's labels.
    fn labels(&self, name: String) -> BoxFuture<'_, Result<BTreeMap<String, String>>>;

    /// `run -i …` with stdio attached.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sandbox` if the CLI cannot be spawned.
    fn run_interactive(&self, spec: RunSpec) -> Result<ProcessHandle>;

    /// `start -ai name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sandbox` if the CLI cannot be spawned.
    fn start_attached(&self, name: String) -> Result<ProcessHandle>;

    /// `attach --sig-proxy=false name`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sandbox` if the CLI cannot be spawned.
    fn attach(&self, name: String) -> Result<ProcessHandle>;

    /// `exec -i -w cwd -e … name cmd…`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sandbox` if the CLI cannot be spawned.
    fn exec(&self, req: ExecRequest) -> Result<ProcessHandle>;

    /// `start name`.
    fn start(&self, name: String) -> BoxFuture<'_, Result<()>>;

    /// `stop name`; missing containers succeed.
    fn stop(&self, name: String) -> BoxFuture<'_, Result<()>>;

    /// `rm -f name`; missing containers succeed.
    fn remove(&self, name: String) -> BoxFuture<'_, Result<()>>;

    /// `rmi image`; missing images succeed.
    fn remove_image(&self, image: String) -> BoxFuture<'_, Result<()>>;

    /// `ps -a`, optionally filtered to managed containers.
    fn list(&self, managed_only: bool) -> BoxFuture<'_, Result<Vec<SandboxInstanceInfo>>>;
}

/// [`ContainerDriver`] backed by the real CLI binary.
#[derive(Debug, Clone)]
pub struct CliContainerDriver {
    cli: ContainerCli,
}

impl CliContainerDriver {
    /// Driver for `cli`.
    #[must_use]
    pub fn new(cli: ContainerCli) -> Self {
        Self { cli }
    }

    fn spec(&self, args: Vec<String>, label: &str) -> SpawnSpec {
        SpawnSpec::new(self.cli.program(), args, label)
    }

    async fn capture(&self, args: Vec<String>, label: &str) -> Result<CaptureOutput> {
        run_capture(&self.spec(args, label), CLI_TIMEOUT).await
    }

    /// Run a management command, treating "missing" output as success.
    async fn idempotent(&self, args: Vec<String>, target: &str) -> Result<()> {
        let verb = args.first().cloned().unwrap_or_default();
        let out = self.capture(args, target).await?;
        if out.success() || is_missing_output(&out) {
            debug!(target, verb, "container command done");
            return Ok(());
        }
        Err(AppError::Sandbox(format!(
            "{} {verb} {target} failed: {}",
            self.cli.program(),
            out.diagnostic()
        )))
    }

    /// Arguments for `run`.
    #[must_use]
    pub fn run_args(spec: &RunSpec) -> Vec<String> {
        let mut args: Vec<String> = vec!["run".into(), "-i".into(), "--name".into(), spec.name.clone()];
        if let Some(entrypoint) = &spec.entrypoint {
            args.push("--entrypoint".into());
            args.push(entrypoint.clone());
        }
        if !spec.working_dir.is_empty() {
            args.push("-w".into());
            args.push(spec.working_dir.clone());
        }
        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.env {
            if key.trim().is_empty() {
                continue;
            }
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        for mount in &spec.mounts {
            args.push("-v".into());
            args.push(mount.to_spec_string());
        }
        args.extend(spec.extra_args.iter().cloned());
        args.push(spec.image.clone());
        args.extend(spec.cmd.iter().cloned());
        args
    }
}

impl ContainerDriver for CliContainerDriver {
    fn program(&self) -> &str {
        self.cli.program()
    }

    fn inspect(&self, name: String) -> BoxFuture<'_, Result<SandboxInstanceInfo>> {
        Box::pin(async move {
            let format = format!(
                "{{{{.State.Status}}}}|{{{{.Created}}}}|{{{{index .Config.Labels \"{LABEL_RUN_ID}\"}}}}"
            );
            let out = self
                .capture(
                    vec!["inspect".into(), "--format".into(), format, name.clone()],
                    &name,
                )
                .await?;
            if !out.success() {
                if is_missing_output(&out) {
                    return Ok(SandboxInstanceInfo::missing(&name));
                }
                return Err(AppError::Sandbox(format!(
                    "inspect {name} failed: {}",
                    out.diagnostic()
                )));
            }
            let line = out.stdout.lines().next().unwrap_or_default();
            let mut parts = line.splitn(3, '|');
            let status = parse_state(parts.next().unwrap_or_default());
            let created_at = parts.next().and_then(label_value);
            let run_id = parts.next().and_then(label_value);
            Ok(SandboxInstanceInfo {
                instance_name: name,
                status,
                created_at,
                run_id,
            })
        })
    }

    fn labels(&self, name: String) -> BoxFuture<'_, Result<BTreeMap<String, String>>> {
        Box::pin(async move {
            let out = self
                .capture(
                    vec![
                        "inspect".into(),
                        "--format".into(),
                        "{{json .Config.Labels}}".into(),
                        name.clone(),
                    ],
                    &name,
                )
                .await?;
            if !out.success() {
                if is_missing_output(&out) {
                    return Ok(BTreeMap::new());
                }
                return Err(AppError::Sandbox(format!(
                    "inspect labels {name} failed: {}",
                    out.diagnostic()
                )));
            }
            let raw = out.stdout.trim();
            if raw.is_empty() || raw == "null" {
                return Ok(BTreeMap::new());
            }
            serde_json::from_str(raw)
                .map_err(|err| AppError::Sandbox(format!("invalid labels for {name}: {err}")))
        })
    }

    fn run_interactive(&self, spec: RunSpec) -> Result<ProcessHandle> {
        info!(
            runtime = self.cli.program(),
            image = %spec.image,
            name = %spec.name,
            "container run"
        );
        spawn_process(&self.spec(Self::run_args(&spec), &spec.name))
    }

    fn start_attached(&self, name: String) -> Result<ProcessHandle> {
        info!(runtime = self.cli.program(), name = %name, "container start-attach");
        spawn_process(&self.spec(vec!["start".into(), "-ai".into(), name.clone()], &name))
    }

    fn attach(&self, name: String) -> Result<ProcessHandle> {
        info!(runtime = self.cli.program(), name = %name, "container attach");
        spawn_process(&self.spec(
            vec!["attach".into(), "--sig-proxy=false".into(), name.clone()],
            &name,
        ))
    }

    fn exec(&self, req: ExecRequest) -> Result<ProcessHandle> {
        let mut args: Vec<String> = vec!["exec".into(), "-i".into()];
        if !req.cwd_in_guest.is_empty() {
            args.push("-w".into());
            args.push(req.cwd_in_guest.clone());
        }
        for (key, value) in &req.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(req.instance_name.clone());
        args.extend(req.command.iter().cloned());
        spawn_process(&self.spec(args, &req.instance_name))
    }

    fn start(&self, name: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let out = self.capture(vec!["start".into(), name.clone()], &name).await?;
            if out.success() {
                Ok(())
            } else {
                Err(AppError::Sandbox(format!(
                    "start {name} failed: {}",
                    out.diagnostic()
                )))
            }
        })
    }

    fn stop(&self, name: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.idempotent(vec!["stop".into(), name.clone()], &name).await })
    }

    fn remove(&self, name: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.idempotent(vec!["rm".into(), "-f".into(), name.clone()], &name)
                .await
        })
    }

    fn remove_image(&self, image: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.idempotent(vec!["rmi".into(), image.clone()], &image).await })
    }

    fn list(&self, managed_only: bool) -> BoxFuture<'_, Result<Vec<SandboxInstanceInfo>>> {
        Box::pin(async move {
            let mut args: Vec<String> = vec!["ps".into(), "-a".into()];
            if managed_only {
                args.push("--filter".into());
                args.push(format!("label={LABEL_MANAGED}=1"));
            }
            args.push("--format".into());
            args.push(format!(
                "{{{{.Names}}}}\t{{{{.State}}}}\t{{{{.CreatedAt}}}}\t{{{{.Label \"{LABEL_RUN_ID}\"}}}}"
            ));
            let out = self.capture(args, "ps").await?;
            if !out.success() {
                return Err(AppError::Sandbox(format!("ps failed: {}", out.diagnostic())));
            }
            Ok(out
                .stdout
                .lines()
                .filter_map(|line| {
                    let mut cols = line.split('\t');
                    let name = cols.next().map(str::trim).filter(|n| !n.is_empty())?;
                    let status = parse_state(cols.next().unwrap_or_default());
                    Some(SandboxInstanceInfo {
                        instance_name: name.to_owned(),
                        status: if status == InstanceStatus::Missing {
                            InstanceStatus::Stopped
                        } else {
                            status
                        },
                        created_at: cols.next().and_then(label_value),
                        run_id: cols.next().and_then(label_value),
                    })
                })
                .collect())
        })
    }
}

// ── Provider ─────────────────────────────────────────────────────────────────

/// Container provider: the agent is each container's entrypoint process.
pub struct OciCliSandbox<D> {
    config: SandboxConfig,
    driver: D,
}

impl<D: ContainerDriver> OciCliSandbox<D> {
    /// Provider over `driver`.
    #[must_use]
    pub fn new(config: SandboxConfig, driver: D) -> Self {
        Self { config, driver }
    }

    /// The underlying driver.
    #[must_use]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn all_mounts(&self, mounts: &[Mount]) -> Vec<Mount> {
        let mut out = mounts.to_vec();
        out.extend(config_volume_mounts(&self.config));
        out
    }

    fn extra_args(&self) -> Vec<String> {
        let mut args = self.config.extra_run_args.clone();
        if let Some(cpus) = self.config.cpus {
            args.push("--cpus".into());
            args.push(cpus.to_string());
        }
        if let Some(mib) = self.config.memory_mib {
            args.push("--memory".into());
            args.push(format!("{mib}m"));
        }
        args
    }

    async fn open(&self, req: OpenAgentRequest) -> Result<OpenAgentResult> {
        let name = req.instance_name.clone();
        let init_script = req
            .init
            .as_ref()
            .and_then(|i| i.script())
            .map(str::to_owned);

        let mut before = self.driver.inspect(name.clone()).await?;

        // Init must run fresh on a clean instance.
        if init_script.is_some() && before.status != InstanceStatus::Missing {
            info!(instance_name = %name, "init script requested, recreating instance");
            if let Err(err) = self.driver.remove(name.clone()).await {
                warn!(instance_name = %name, %err, "failed to remove instance before recreate");
            }
            before = SandboxInstanceInfo::missing(&name);
        }

        if before.status != InstanceStatus::Missing {
            let labels = self.driver.labels(name.clone()).await?;
            let mode = labels
                .get(LABEL_AGENT_MODE)
                .map(|m| m.trim())
                .unwrap_or_default();
            if !mode.is_empty() && mode != AgentMode::Entrypoint.as_str() {
                return Err(AppError::SandboxState(format!(
                    "existing instance {name} is in agent mode {mode:?}, expected entrypoint; \
                     remove the sandbox instance manually and retry"
                )));
            }
        }

        match before.status {
            InstanceStatus::Missing => {
                let working_dir = [self.config.working_dir.trim(), req.workspace_guest_path.trim()]
                    .into_iter()
                    .find(|dir| !dir.is_empty())
                    .unwrap_or(DEFAULT_WORKING_DIR)
                    .to_owned();
                let empty = BTreeMap::new();
                let init_env = req.init.as_ref().map_or(&empty, |i| &i.env);
                let script =
                    build_entrypoint_script(&working_dir, init_script.as_deref(), init_env);

                let mut labels = BTreeMap::new();
                labels.insert(LABEL_MANAGED.to_owned(), "1".to_owned());
                labels.insert(
                    LABEL_AGENT_MODE.to_owned(),
                    AgentMode::Entrypoint.as_str().to_owned(),
                );
                if !req.run_id.trim().is_empty() {
                    labels.insert(LABEL_RUN_ID.to_owned(), req.run_id.trim().to_owned());
                }

                let mut cmd = vec!["-lc".to_owned(), script, "--".to_owned()];
                cmd.extend(req.agent_command.iter().cloned());

                let handle = self.driver.run_interactive(RunSpec {
                    name,
                    image: self.config.image.clone(),
                    entrypoint: Some("bash".into()),
                    working_dir,
                    labels,
                    env: self.config.env.clone(),
                    mounts: self.all_mounts(&req.mounts),
                    extra_args: self.extra_args(),
                    cmd,
                })?;
                Ok(OpenAgentResult {
                    handle,
                    created: true,
                    init_pending: init_script.is_some(),
                })
            }
            InstanceStatus::Stopped => Ok(OpenAgentResult {
                handle: self.driver.start_attached(name)?,
                created: false,
                init_pending: false,
            }),
            InstanceStatus::Running => Ok(OpenAgentResult {
                handle: self.driver.attach(name)?,
                created: false,
                init_pending: false,
            }),
        }
    }

    async fn ensure(&self, req: EnsureInstanceRequest) -> Result<SandboxInstanceInfo> {
        for mount in &req.mounts {
            if mount.access == MountAccess::Rw {
                tokio::fs::create_dir_all(&mount.host_path).await.map_err(|err| {
                    AppError::Sandbox(format!(
                        "failed to create host dir {}: {err}",
                        mount.host_path.display()
                    ))
                })?;
            }
        }
        let info = self.driver.inspect(req.instance_name.clone()).await?;
        match info.status {
            InstanceStatus::Stopped => {
                self.driver.start(req.instance_name.clone()).await?;
                self.driver.inspect(req.instance_name).await
            }
            // A missing instance is created by `open_agent`, with the agent
            // as its entrypoint.
            InstanceStatus::Running | InstanceStatus::Missing => Ok(info),
        }
    }
}

impl<D: ContainerDriver> SandboxProvider for OciCliSandbox<D> {
    fn kind(&self) -> SandboxProviderKind {
        SandboxProviderKind::ContainerOci
    }

    fn runtime(&self) -> Option<&str> {
        Some(self.driver.program())
    }

    fn agent_mode(&self) -> AgentMode {
        AgentMode::Entrypoint
    }

    fn inspect_instance(&self, instance_name: String) -> BoxFuture<'_, Result<SandboxInstanceInfo>> {
        self.driver.inspect(instance_name)
    }

    fn ensure_instance_running(
        &self,
        req: EnsureInstanceRequest,
    ) -> BoxFuture<'_, Result<SandboxInstanceInfo>> {
        Box::pin(self.ensure(req))
    }

    fn list_instances(&self, managed_only: bool) -> BoxFuture<'_, Result<Vec<SandboxInstanceInfo>>> {
        self.driver.list(managed_only)
    }

    fn stop_instance(&self, instance_name: String) -> BoxFuture<'_, Result<()>> {
        self.driver.stop(instance_name)
    }

    fn remove_instance(&self, instance_name: String) -> BoxFuture<'_, Result<()>> {
        self.driver.remove(instance_name)
    }

    fn remove_image(&self, image: String) -> BoxFuture<'_, Result<()>> {
        self.driver.remove_image(image)
    }

    fn exec_process(&self, req: ExecRequest) -> BoxFuture<'_, Result<ProcessHandle>> {
        Box::pin(async move {
            if req.command.is_empty() {
                return Err(AppError::Sandbox("command is empty".into()));
            }
            self.driver.exec(req)
        })
    }

    fn open_agent(&self, req: OpenAgentRequest) -> BoxFuture<'_, Result<OpenAgentResult>> {
        Box::pin(self.open(req))
    }
}
