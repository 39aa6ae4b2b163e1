//! Namespace sandbox backend built on bubblewrap.
//!
//! Instances exist only in this process's memory: an instance is a host
//! workspace directory plus a mount set, and every process started for it
//! runs under a fresh `bwrap` invocation with the host root bound read-only.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{SandboxConfig, SandboxProviderKind};
use crate::sandbox::process::{spawn_process, SpawnSpec};
use crate::sandbox::{
    config_volume_mounts, now_rfc3339, AgentMode, BoxFuture, EnsureInstanceRequest, ExecRequest,
    InstanceStatus, Mount, MountAccess, OpenAgentRequest, OpenAgentResult, ProcessHandle,
    SandboxInstanceInfo, SandboxProvider,
};
use crate::validate::{normalize_guest_path, resolve_workspace_guest_path};
use crate::{AppError, Result};

#[derive(Debug)]
struct BwrapInstance {
    run_id: Option<String>,
    workspace_host_path: PathBuf,
    mounts: Vec<Mount>,
    created_at: String,
    agent_kill: Option<CancellationToken>,
}

/// Build the `bwrap` argument vector for one process.
///
/// # Errors
///
/// Returns `AppError::Validation` when `cwd_in_guest` leaves the workspace or
/// a mount guest path is not absolute.
pub fn build_bwrap_args(
    workspace_host_path: &Path,
    workspace_guest_path: &str,
    mounts: &[Mount],
    cwd_in_guest: &str,
    command: &[String],
) -> Result<Vec<String>> {
    let workspace_guest = normalize_guest_path(workspace_guest_path)?;
    let cwd = resolve_workspace_guest_path(&workspace_guest, cwd_in_guest)?;

    let mut args: Vec<String> = [
        "--die-with-parent",
        "--new-session",
        "--unshare-all",
        "--share-net",
        "--ro-bind",
        "/",
        "/",
        "--dev",
        "/dev",
        "--proc",
        "/proc",
        "--tmpfs",
        "/tmp",
        "--dir",
    ]
    .iter()
    .map(|s| (*s).to_owned())
    .collect();
    args.push(workspace_guest.clone());
    args.push("--bind".into());
    args.push(workspace_host_path.display().to_string());
    args.push(workspace_guest.clone());

    for mount in mounts {
        let guest = normalize_guest_path(&mount.guest_path)?;
        if guest == workspace_guest {
            continue;
        }
        if let Some((parent, _)) = guest.rsplit_once('/') {
            if !parent.is_empty() {
                args.push("--dir".into());
                args.push(parent.to_owned());
            }
        }
        args.push(
            match mount.access {
                MountAccess::Ro => "--ro-bind",
                MountAccess::Rw => "--bind",
            }
            .into(),
        );
        args.push(mount.host_path.display().to_string());
        args.push(guest);
    }

    args.push("--chdir".into());
    args.push(cwd);
    args.push("--".into());
    args.extend(command.iter().cloned());
    Ok(args)
}

/// Whether `path` is `root` or beneath it, without `..` components.
fn host_path_within(root: &Path, path: &Path) -> bool {
    !path.components().any(|c| matches!(c, Component::ParentDir)) && path.starts_with(root)
}

/// Bubblewrap provider; agents run in exec mode.
pub struct BwrapSandbox {
    config: SandboxConfig,
    instances: Mutex<HashMap<String, BwrapInstance>>,
}

impl BwrapSandbox {
    /// Provider for `config`.
    #[must_use]
    pub fn new(config: SandboxConfig) -> Self {
        info!(
            workspace_host_root = %config.workspace_host_root.display(),
            bwrap = %config.bwrap_path,
            "bubblewrap sandbox ready"
        );
        Self {
            config,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_workspace_host_path(
        &self,
        run_id: &str,
        mounts: &[Mount],
        existing: Option<&BwrapInstance>,
    ) -> Result<PathBuf> {
        let root = &self.config.workspace_host_root;
        let from_mount = mounts
            .iter()
            .find(|m| m.guest_path == self.config.working_dir)
            .map(|m| m.host_path.clone());
        let path = from_mount
            .or_else(|| {
                let id = run_id.trim();
                (!id.is_empty()).then(|| root.join(format!("run-{id}")))
            })
            .or_else(|| existing.map(|e| e.workspace_host_path.clone()))
            .ok_or_else(|| AppError::Sandbox("workspace host path missing".into()))?;
        if !host_path_within(root, &path) {
            return Err(AppError::Sandbox(format!(
                "workspace host path {} is outside workspace_host_root",
                path.display()
            )));
        }
        Ok(path)
    }

    fn mounts_for(&self, inst: &BwrapInstance) -> Vec<Mount> {
        let mut mounts = inst.mounts.clone();
        mounts.extend(config_volume_mounts(&self.config));
        mounts
    }

    fn spawn(
        &self,
        inst: &BwrapInstance,
        cwd_in_guest: &str,
        command: &[String],
        env: BTreeMap<String, String>,
        label: &str,
    ) -> Result<ProcessHandle> {
        let args = build_bwrap_args(
            &inst.workspace_host_path,
            &self.config.working_dir,
            &self.mounts_for(inst),
            cwd_in_guest,
            command,
        )?;
        debug!(label, ?args, "bwrap spawn");
        spawn_process(&SpawnSpec {
            program: self.config.bwrap_path.clone(),
            args,
            env,
            cwd: Some(inst.workspace_host_path.clone()),
            label: label.to_owned(),
        })
    }

    fn info(name: &str, inst: &BwrapInstance) -> SandboxInstanceInfo {
        SandboxInstanceInfo {
            instance_name: name.to_owned(),
            status: InstanceStatus::Running,
            created_at: Some(inst.created_at.clone()),
            run_id: inst.run_id.clone(),
        }
    }

    async fn ensure(&self, req: EnsureInstanceRequest) -> Result<SandboxInstanceInfo> {
        let mut instances = self.instances.lock().await;
        let existing = instances.get(&req.instance_name);
        let workspace = self.resolve_workspace_host_path(&req.run_id, &req.mounts, existing)?;
        tokio::fs::create_dir_all(&workspace).await?;

        let inst = instances
            .entry(req.instance_name.clone())
            .or_insert_with(|| BwrapInstance {
                run_id: Some(req.run_id.clone()).filter(|r| !r.trim().is_empty()),
                workspace_host_path: workspace.clone(),
                mounts: Vec::new(),
                created_at: now_rfc3339(),
                agent_kill: None,
            });
        inst.workspace_host_path = workspace;
        inst.mounts = req.mounts;
        Ok(Self::info(&req.instance_name, inst))
    }

    async fn open(&self, req: OpenAgentRequest) -> Result<OpenAgentResult> {
        if req.agent_command.is_empty() {
            return Err(AppError::Sandbox("agent_command is empty".into()));
        }
        let mut instances = self.instances.lock().await;
        let existing = instances.get(&req.instance_name);
        let workspace = self.resolve_workspace_host_path(&req.run_id, &req.mounts, existing)?;
        tokio::fs::create_dir_all(&workspace).await?;

        let created = existing.is_none();
        let inst = instances
            .entry(req.instance_name.clone())
            .or_insert_with(|| BwrapInstance {
                run_id: Some(req.run_id.clone()).filter(|r| !r.trim().is_empty()),
                workspace_host_path: workspace.clone(),
                mounts: Vec::new(),
                created_at: now_rfc3339(),
                agent_kill: None,
            });
        inst.workspace_host_path = workspace;
        inst.mounts.clone_from(&req.mounts);

        // One agent per instance: a previous agent process is replaced.
        if let Some(previous) = inst.agent_kill.take() {
            info!(instance_name = %req.instance_name, "replacing previous bwrap agent");
            previous.cancel();
        }

        let mut env = self.config.env.clone();
        if let Some(init) = &req.init {
            env.extend(init.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        let handle = self.spawn(
            inst,
            &req.workspace_guest_path,
            &req.agent_command,
            env,
            &req.instance_name,
        )?;
        inst.agent_kill = Some(handle.kill.clone());
        info!(instance_name = %req.instance_name, created, "bwrap agent started");

        Ok(OpenAgentResult {
            handle,
            created,
            init_pending: false,
        })
    }
}

impl SandboxProvider for BwrapSandbox {
    fn kind(&self) -> SandboxProviderKind {
        SandboxProviderKind::Bwrap
    }

    fn runtime(&self) -> Option<&str> {
        None
    }

    fn agent_mode(&self) -> AgentMode {
        AgentMode::Exec
    }

    fn inspect_instance(&self, instance_name: String) -> BoxFuture<'_, Result<SandboxInstanceInfo>> {
        Box::pin(async move {
            let instances = self.instances.lock().await;
            Ok(instances.get(&instance_name).map_or_else(
                || SandboxInstanceInfo::missing(&instance_name),
                |inst| Self::info(&instance_name, inst),
            ))
        })
    }

    fn ensure_instance_running(
        &self,
        req: EnsureInstanceRequest,
    ) -> BoxFuture<'_, Result<SandboxInstanceInfo>> {
        Box::pin(self.ensure(req))
    }

    fn list_instances(&self, _managed_only: bool) -> BoxFuture<'_, Result<Vec<SandboxInstanceInfo>>> {
        Box::pin(async move {
            let instances = self.instances.lock().await;
            let mut out: Vec<_> = instances
                .iter()
                .map(|(name, inst)| Self::info(name, inst))
                .collect();
            out.sort_by(|a, b| a.instance_name.cmp(&b.instance_name));
            Ok(out)
        })
    }

    fn stop_instance(&self, instance_name: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(inst) = self.instances.lock().await.get_mut(&instance_name) {
                if let Some(kill) = inst.agent_kill.take() {
                    kill.cancel();
                }
            }
            Ok(())
        })
    }

    fn remove_instance(&self, instance_name: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(inst) = self.instances.lock().await.remove(&instance_name) {
                if let Some(kill) = inst.agent_kill {
                    kill.cancel();
                }
            }
            Ok(())
        })
    }

    fn remove_image(&self, image: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            Err(AppError::Sandbox(format!(
                "bwrap does not support remove_image ({image})"
            )))
        })
    }

    fn exec_process(&self, req: ExecRequest) -> BoxFuture<'_, Result<ProcessHandle>> {
        Box::pin(async move {
            if req.command.is_empty() {
                return Err(AppError::Sandbox("command is empty".into()));
            }
            let instances = self.instances.lock().await;
            let inst = instances.get(&req.instance_name).ok_or_else(|| {
                AppError::NotFound(format!("instance {} is missing", req.instance_name))
            })?;
            let mut env = self.config.env.clone();
            env.extend(req.env.clone());
            self.spawn(inst, &req.cwd_in_guest, &req.command, env, &req.instance_name)
        })
    }

    fn open_agent(&self, req: OpenAgentRequest) -> BoxFuture<'_, Result<OpenAgentResult>> {
        Box::pin(self.open(req))
    }
}
