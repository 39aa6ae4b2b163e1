//! Run runtime: mount composition and sandbox preparation for a run.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::config::SandboxConfig;
use crate::handlers::ProxyContext;
use crate::runs::agent_inputs::{parse_agent_inputs, AgentInputsManifest};
use crate::runs::registry::{clamp_keepalive_ttl, RunHandle};
use crate::runs::updates::send_sandbox_instance_status;
use crate::runs::workspace_git::ensure_workspace_git;
use crate::runs::InitPayload;
use crate::sandbox::{AgentMode, EnsureInstanceRequest, InstanceStatus, Mount};
use crate::validate::{guest_path_within, normalize_guest_path, validate_instance_name, validate_run_id};
use crate::{AppError, Result};

/// Directories created inside every per-run home.
pub const HOME_SCAFFOLD: &[&str] = &[".codex/skills"];

/// What `ensure_runtime` needs from an inbound message.
#[derive(Debug, Clone, Default)]
pub struct RuntimeRequest {
    /// Run id (validated here).
    pub run_id: String,
    /// Explicit instance name; defaults to prefix + run id.
    pub instance_name: Option<String>,
    /// Requested keepalive TTL.
    pub keepalive_ttl_seconds: Option<u64>,
    /// Init object, if any.
    pub init: Option<InitPayload>,
}

/// Host and guest layout of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPlan {
    /// Host directory for the workspace.
    pub host_workspace_path: PathBuf,
    /// Host directory for the guest home, when per-run homes are enabled.
    pub host_user_home_path: Option<PathBuf>,
    /// Guest home path.
    pub user_home_guest_path: String,
    /// Mounts, workspace first.
    pub mounts: Vec<Mount>,
}

/// Lexically resolve `.` and `..` in an absolute host path.
fn normalize_host_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

fn workspace_host_root(config: &SandboxConfig) -> Result<PathBuf> {
    let root = &config.workspace_host_root;
    if root.as_os_str().is_empty() {
        return Err(AppError::Config("sandbox.workspace_host_root is not set".into()));
    }
    let root = if root.is_absolute() {
        root.clone()
    } else {
        std::env::current_dir()?.join(root)
    };
    Ok(normalize_host_path(&root))
}

/// Default host workspace and home directories of a run.
///
/// # Errors
///
/// Returns `AppError::Config` when no workspace root is configured.
pub fn default_host_paths(config: &SandboxConfig, run_id: &str) -> Result<(PathBuf, PathBuf)> {
    let root = workspace_host_root(config)?;
    Ok((
        root.join(format!("run-{run_id}")),
        root.join(format!("home-{run_id}")),
    ))
}

/// Whether `path` lies strictly below the workspace root.
///
/// # Errors
///
/// Returns `AppError::Config` when no workspace root is configured.
pub fn is_under_workspace_root(config: &SandboxConfig, path: &Path) -> Result<bool> {
    let root = workspace_host_root(config)?;
    let path = normalize_host_path(path);
    Ok(path != root && path.starts_with(&root))
}

/// Guest home: `USER_HOME`, then `HOME`, then the configured default.
///
/// # Errors
///
/// Returns `AppError::Config` when the home is, or lies inside, the
/// workspace guest path, and `AppError::Validation` when it is not a clean
/// absolute path.
pub fn resolve_user_home_guest_path(
    config: &SandboxConfig,
    init_env: &BTreeMap<String, String>,
) -> Result<String> {
    let hint = ["USER_HOME", "HOME"]
        .iter()
        .filter_map(|key| init_env.get(*key))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .unwrap_or(&config.user_home_guest_path);
    let home = normalize_guest_path(hint)?;
    let workspace = normalize_guest_path(&config.working_dir)?;
    if guest_path_within(&workspace, &home) {
        return Err(AppError::Config(format!(
            "USER_HOME/HOME must not be {workspace} or inside {workspace}"
        )));
    }
    Ok(home)
}

/// Compose the mount set for a run without touching the file system.
///
/// # Errors
///
/// Returns `AppError::Config` for a missing workspace root, a conflicting
/// guest home, or host paths outside the workspace root.
pub fn plan_mounts(
    config: &SandboxConfig,
    run_id: &str,
    init_env: &BTreeMap<String, String>,
    inputs: Option<&AgentInputsManifest>,
) -> Result<MountPlan> {
    let root = workspace_host_root(config)?;
    let user_home_guest_path = resolve_user_home_guest_path(config, init_env)?;

    let (default_workspace, default_home) = default_host_paths(config, run_id)?;
    let bind = inputs.and_then(AgentInputsManifest::workspace_bind);
    let host_workspace_path = match &bind {
        Some(path) if path.is_absolute() => normalize_host_path(path),
        _ => default_workspace,
    };
    if !host_workspace_path.starts_with(&root) {
        return Err(AppError::Config(if bind.is_some() {
            "agentInputs WORKSPACE bindMount hostPath must be under sandbox.workspace_host_root".into()
        } else {
            "workspace host path is outside sandbox.workspace_host_root".into()
        }));
    }

    let mut mounts = vec![Mount::rw(&host_workspace_path, config.working_dir.clone())];
    let host_user_home_path = if config.per_run_root_enabled {
        mounts.push(Mount::rw(&default_home, user_home_guest_path.clone()));
        Some(default_home)
    } else {
        None
    };
    if let Some(inputs) = inputs {
        let home_guest = host_user_home_path
            .as_ref()
            .map(|_| user_home_guest_path.as_str());
        mounts.extend(inputs.extra_mounts(&config.working_dir, home_guest));
    }

    Ok(MountPlan {
        host_workspace_path,
        host_user_home_path,
        user_home_guest_path,
        mounts,
    })
}

/// Create the host directories of `plan`, including the home scaffold.
///
/// # Errors
///
/// Returns `AppError::Io` when a directory cannot be created.
pub async fn prepare_host_dirs(plan: &MountPlan) -> Result<()> {
    tokio::fs::create_dir_all(&plan.host_workspace_path).await?;
    if let Some(home) = &plan.host_user_home_path {
        for dir in HOME_SCAFFOLD {
            tokio::fs::create_dir_all(home.join(dir)).await?;
        }
    }
    Ok(())
}

/// Init env with the agent-inputs `envPatch` applied.
#[must_use]
pub fn effective_init_env(
    init: Option<&InitPayload>,
    inputs: Option<&AgentInputsManifest>,
) -> BTreeMap<String, String> {
    let mut env = init.map(|i| i.env.clone()).unwrap_or_default();
    if let Some(inputs) = inputs {
        inputs.patch_env(&mut env);
    }
    env
}

/// Resolve mounts, check out the host workspace when the init env names a
/// repository, prepare the sandbox instance and register the run.
///
/// Nothing is registered unless every step succeeds.
///
/// # Errors
///
/// Propagates validation, configuration, file-system and sandbox errors.
pub async fn ensure_runtime(ctx: &ProxyContext, req: &RuntimeRequest) -> Result<Arc<RunHandle>> {
    let run_id = validate_run_id(&req.run_id)?;
    let instance_name = match req.instance_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => validate_instance_name(name)?,
        _ => validate_instance_name(&format!("{}{run_id}", ctx.config.sandbox.instance_prefix))?,
    };
    let ttl = clamp_keepalive_ttl(
        req.keepalive_ttl_seconds,
        ctx.config.sandbox.keepalive_ttl_seconds,
    );

    let inputs = parse_agent_inputs(req.init.as_ref().and_then(|i| i.agent_inputs.as_ref()))?;
    let init_env = effective_init_env(req.init.as_ref(), inputs.as_ref());
    let plan = plan_mounts(&ctx.config.sandbox, &run_id, &init_env, inputs.as_ref())?;

    prepare_host_dirs(&plan).await?;
    ensure_workspace_git(
        ctx,
        &run_id,
        &workspace_host_root(&ctx.config.sandbox)?,
        &plan.host_workspace_path,
        &init_env,
    )
    .await?;
    if let Some(inputs) = &inputs {
        inputs
            .apply_host_items(
                &run_id,
                &plan.host_workspace_path,
                plan.host_user_home_path.as_deref(),
            )
            .await?;
    }

    let info = ctx
        .sandbox
        .ensure_instance_running(EnsureInstanceRequest {
            run_id: run_id.clone(),
            instance_name: instance_name.clone(),
            mounts: plan.mounts.clone(),
            workspace_guest_path: ctx.config.sandbox.working_dir.clone(),
        })
        .await?;
    send_sandbox_instance_status(ctx, &run_id, &instance_name, info.status.as_str(), None);
    if ctx.sandbox.agent_mode() == AgentMode::Exec && info.status != InstanceStatus::Running {
        return Err(AppError::Sandbox(format!(
            "instance {instance_name} is not running: {}",
            info.status.as_str()
        )));
    }

    let run = ctx.runs.get_or_create(&run_id, &instance_name, ttl).await?;
    {
        let mut state = run.state();
        state.host_workspace_path = Some(plan.host_workspace_path.clone());
        state.host_user_home_path = plan.host_user_home_path.clone();
        state.user_home_guest_path = Some(plan.user_home_guest_path.clone());
        state.mounts = plan.mounts;
    }
    info!(
        run_id = %run_id,
        instance_name = %instance_name,
        workspace = %plan.host_workspace_path.display(),
        "run runtime ready"
    );
    Ok(run)
}
