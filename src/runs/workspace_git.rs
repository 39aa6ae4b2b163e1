//! Host-side git checkout of a run's workspace.
//!
//! When the init env names a repository, the run's host workspace is
//! checked out before any agent inputs land in it. `worktree` mode keeps
//! one bare-ish clone per repository under `<root>/_repo-cache/` and adds a
//! worktree per run; `clone` mode clones straight into the workspace.
//! Either way the work happens under a per-repository lock file, and a
//! workspace that already has `.git` is left alone.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::config::WorkspaceCheckout;
use crate::handlers::ProxyContext;
use crate::runs::updates::send_update;
use crate::sandbox::process::{run_capture, SpawnSpec};
use crate::sandbox::BoxFuture;
use crate::{AppError, Result};

/// Repository to check out.
pub const REPO_URL_ENV: &str = "TUIXIU_REPO_URL";
/// Branch created for the run.
pub const RUN_BRANCH_ENV: &str = "TUIXIU_RUN_BRANCH";
/// Branch the run branch starts from; defaults to `main`.
pub const BASE_BRANCH_ENV: &str = "TUIXIU_BASE_BRANCH";
/// `ssh` selects SSH auth; anything else is HTTP.
pub const AUTH_MODE_ENV: &str = "TUIXIU_GIT_AUTH_MODE";
const SSH_COMMAND_ENV: &str = "TUIXIU_GIT_SSH_COMMAND";
const SSH_KEY_ENV: &str = "TUIXIU_GIT_SSH_KEY";
const SSH_KEY_B64_ENV: &str = "TUIXIU_GIT_SSH_KEY_B64";
const SSH_KEY_PATH_ENV: &str = "TUIXIU_GIT_SSH_KEY_PATH";
const HTTP_USERNAME_ENV: &str = "TUIXIU_GIT_HTTP_USERNAME";
const HTTP_PASSWORD_ENV: &str = "TUIXIU_GIT_HTTP_PASSWORD";

const DEFAULT_BASE_BRANCH: &str = "main";
const DEFAULT_HTTP_USERNAME: &str = "x-access-token";
const REPO_CACHE_DIR: &str = "_repo-cache";
const LOCKS_DIR: &str = "_locks";
const LOCK_POLL: Duration = Duration::from_millis(200);
const LOCK_TIMEOUT: Duration = Duration::from_secs(300);
const GIT_TIMEOUT: Duration = Duration::from_secs(600);

fn env_value<'a>(env: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// Repository, run branch and base branch taken from the init env.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitWorkspaceRequest {
    /// Clone URL.
    pub repo_url: String,
    /// Branch created (or reset) for the run.
    pub branch: String,
    /// Starting point of `branch`.
    pub base_branch: String,
}

impl GitWorkspaceRequest {
    /// Read the request; `None` when no repository is named.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` when a repository is named without a
    /// run branch.
    pub fn from_env(env: &BTreeMap<String, String>) -> Result<Option<Self>> {
        let Some(repo_url) = env_value(env, REPO_URL_ENV) else {
            return Ok(None);
        };
        let branch = env_value(env, RUN_BRANCH_ENV).ok_or_else(|| {
            AppError::Validation(format!("{RUN_BRANCH_ENV} is required with {REPO_URL_ENV}"))
        })?;
        Ok(Some(Self {
            repo_url: repo_url.to_owned(),
            branch: branch.to_owned(),
            base_branch: env_value(env, BASE_BRANCH_ENV)
                .unwrap_or(DEFAULT_BASE_BRANCH)
                .to_owned(),
        }))
    }
}

fn repo_slug(repo_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo_url.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Shared clone of `repo_url` under the workspace root.
#[must_use]
pub fn repo_cache_dir(root: &Path, repo_url: &str) -> PathBuf {
    root.join(REPO_CACHE_DIR).join(repo_slug(repo_url))
}

/// Lock file guarding `repo_url`'s cache and checkouts.
#[must_use]
pub fn repo_lock_path(root: &Path, repo_url: &str) -> PathBuf {
    root.join(REPO_CACHE_DIR)
        .join(LOCKS_DIR)
        .join(format!("{}.lock", repo_slug(repo_url)))
}

// ── Credentials ──────────────────────────────────────────────────────────────

/// Environment for host git commands. Holds the temp directory with the
/// askpass script or key file; dropping it removes them.
#[derive(Debug, Default)]
pub struct HostGitEnv {
    /// Variables added to every git invocation.
    pub env: BTreeMap<String, String>,
    scratch: Option<TempDir>,
}

impl HostGitEnv {
    /// Temp directory backing the credentials, if one was needed.
    #[must_use]
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }
}

fn askpass_script(username: &str, password: &str) -> String {
    let quote = |s: &str| format!("'{}'", s.replace('\'', r"'\''"));
    format!(
        "#!/bin/sh\ncase \"$1\" in\n  *Username*|*username*) printf '%s\\n' {} ;;\n  *) printf '%s\\n' {} ;;\nesac\n",
        quote(username),
        quote(password)
    )
}

#[cfg(unix)]
fn restrict_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

fn ssh_git_env(init_env: &BTreeMap<String, String>, mut out: HostGitEnv) -> Result<HostGitEnv> {
    if let Some(command) = env_value(init_env, SSH_COMMAND_ENV) {
        out.env.insert("GIT_SSH_COMMAND".into(), command.to_owned());
        return Ok(out);
    }
    let scratch = tempfile::Builder::new().prefix("acp-proxy-git-ssh-").tempdir()?;
    let key_path = env_value(init_env, SSH_KEY_PATH_ENV)
        .map_or_else(|| scratch.path().join("git_key"), PathBuf::from);
    if let Some(encoded) = env_value(init_env, SSH_KEY_B64_ENV) {
        let key = STANDARD
            .decode(encoded)
            .map_err(|err| AppError::Validation(format!("{SSH_KEY_B64_ENV} is not base64: {err}")))?;
        std::fs::write(&key_path, key)?;
    } else if let Some(key) = env_value(init_env, SSH_KEY_ENV) {
        std::fs::write(&key_path, format!("{key}\n"))?;
    }
    if key_path.exists() {
        restrict_mode(&key_path, 0o600)?;
    }
    out.env.insert(
        "GIT_SSH_COMMAND".into(),
        format!(
            "ssh -i \"{}\" -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
            key_path.display()
        ),
    );
    out.scratch = Some(scratch);
    Ok(out)
}

/// Build the git environment for the init env's credentials.
///
/// SSH mode uses `TUIXIU_GIT_SSH_COMMAND` or a key written to a temp file.
/// HTTP mode installs an askpass script when a password is present and
/// otherwise runs anonymously.
///
/// # Errors
///
/// Returns an error when the temp directory cannot be written or the
/// base64 key does not decode.
pub fn host_git_env(init_env: &BTreeMap<String, String>) -> Result<HostGitEnv> {
    let mut out = HostGitEnv::default();
    out.env.insert("GIT_TERMINAL_PROMPT".into(), "0".into());

    let ssh = env_value(init_env, AUTH_MODE_ENV).is_some_and(|m| m.eq_ignore_ascii_case("ssh"));
    if ssh {
        return ssh_git_env(init_env, out);
    }

    let Some(password) = env_value(init_env, HTTP_PASSWORD_ENV) else {
        return Ok(out);
    };
    let username = env_value(init_env, HTTP_USERNAME_ENV).unwrap_or(DEFAULT_HTTP_USERNAME);
    let scratch = tempfile::Builder::new().prefix("acp-proxy-git-askpass-").tempdir()?;
    let script = scratch.path().join("askpass.sh");
    std::fs::write(&script, askpass_script(username, password))?;
    restrict_mode(&script, 0o700)?;
    out.env.insert("GIT_ASKPASS".into(), script.display().to_string());
    out.env.insert("GCM_INTERACTIVE".into(), "Never".into());
    out.scratch = Some(scratch);
    Ok(out)
}

// ── Runner ───────────────────────────────────────────────────────────────────

/// Runs host git commands.
pub trait GitRunner: Send + Sync {
    /// Run `git args…` with `env` added; fails on a non-zero exit.
    fn git<'a>(
        &'a self,
        args: Vec<String>,
        env: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<()>>;
}

/// [`GitRunner`] backed by the host `git` binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostGit;

impl GitRunner for HostGit {
    fn git<'a>(
        &'a self,
        args: Vec<String>,
        env: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut spec = SpawnSpec::new("git", args, "workspace-git");
            spec.env.clone_from(env);
            let out = run_capture(&spec, GIT_TIMEOUT).await?;
            if out.success() {
                Ok(())
            } else {
                Err(AppError::Sandbox(format!("git failed: {}", out.diagnostic())))
            }
        })
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|&p| p.to_owned()).collect()
}

// ── Checkout ─────────────────────────────────────────────────────────────────

async fn with_repo_lock<F, Fut, T>(lock_path: &Path, task: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    if let Some(parent) = lock_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let started = Instant::now();
    loop {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
            .await
        {
            Ok(file) => {
                let result = task().await;
                drop(file);
                if let Err(err) = tokio::fs::remove_file(lock_path).await {
                    warn!(lock = %lock_path.display(), %err, "repo lock removal failed");
                }
                return result;
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                if started.elapsed() > LOCK_TIMEOUT {
                    return Err(AppError::Sandbox(format!(
                        "repo cache lock timeout: {}",
                        lock_path.display()
                    )));
                }
                tokio::time::sleep(LOCK_POLL).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

async fn reset_dir(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    tokio::fs::create_dir_all(path).await?;
    Ok(())
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

struct Checkout<'a> {
    ctx: &'a ProxyContext,
    run_id: &'a str,
    req: &'a GitWorkspaceRequest,
    env: &'a BTreeMap<String, String>,
}

impl Checkout<'_> {
    fn step(&self, stage: &str, status: &str) {
        send_update(
            self.ctx,
            self.run_id,
            json!({ "type": "init_step", "stage": stage, "status": status }),
        );
    }

    async fn git(&self, args: Vec<String>) -> Result<()> {
        debug!(run_id = %self.run_id, ?args, "git");
        self.ctx.git.git(args, self.env).await
    }

    async fn update_cache(&self, cache: &Path) -> Result<()> {
        let cache_arg = path_arg(cache);
        if tokio::fs::metadata(cache.join(".git")).await.is_ok() {
            self.git(args(["-C", &cache_arg, "remote", "set-url", "origin", &self.req.repo_url]))
                .await?;
            self.git(args(["-C", &cache_arg, "fetch", "--prune", "origin"])).await?;
            return self.git(args(["-C", &cache_arg, "worktree", "prune"])).await;
        }
        reset_dir(cache).await?;
        self.git(args([
            "clone",
            "--branch",
            &self.req.base_branch,
            "--single-branch",
            &self.req.repo_url,
            &cache_arg,
        ]))
        .await
    }

    async fn worktree(&self, root: &Path, workspace: &Path) -> Result<()> {
        let cache = repo_cache_dir(root, &self.req.repo_url);
        self.update_cache(&cache).await?;
        reset_dir(workspace).await?;
        let base = format!("origin/{}", self.req.base_branch);
        self.git(args([
            "-C",
            &path_arg(&cache),
            "worktree",
            "add",
            "-B",
            &self.req.branch,
            &path_arg(workspace),
            &base,
        ]))
        .await?;
        self.step("clone", "done");
        self.step("checkout", "done");
        Ok(())
    }

    async fn fresh_clone(&self, workspace: &Path) -> Result<()> {
        let ws = path_arg(workspace);
        reset_dir(workspace).await?;
        self.git(args([
            "clone",
            "--branch",
            &self.req.base_branch,
            "--single-branch",
            &self.req.repo_url,
            &ws,
        ]))
        .await?;
        self.step("clone", "done");

        self.step("checkout", "start");
        let base = format!("origin/{}", self.req.base_branch);
        if let Err(err) = self
            .git(args(["-C", &ws, "checkout", "-B", &self.req.branch, &base]))
            .await
        {
            debug!(run_id = %self.run_id, %err, "checkout from base failed; branching in place");
            self.git(args(["-C", &ws, "checkout", "-B", &self.req.branch])).await?;
        }
        self.step("checkout", "done");
        Ok(())
    }
}

/// Check out the run's host workspace when the init env names a repository.
///
/// Progress is reported as `init_step` updates (`auth`, `clone`,
/// `checkout`, `ready`); a failure is reported as stage `init`, status
/// `failed`.
///
/// # Errors
///
/// Returns an error when the request is incomplete, credentials cannot be
/// prepared, the lock times out, or a git command fails.
pub async fn ensure_workspace_git(
    ctx: &ProxyContext,
    run_id: &str,
    root: &Path,
    workspace: &Path,
    init_env: &BTreeMap<String, String>,
) -> Result<()> {
    let Some(req) = GitWorkspaceRequest::from_env(init_env)? else {
        return Ok(());
    };
    if tokio::fs::metadata(workspace.join(".git")).await.is_ok() {
        debug!(run_id, workspace = %workspace.display(), "workspace already checked out");
        return Ok(());
    }

    let result = checkout_workspace(ctx, run_id, &req, root, workspace, init_env).await;
    match &result {
        Ok(()) => {
            send_update(ctx, run_id, json!({ "type": "init_step", "stage": "ready", "status": "done" }));
            info!(run_id, branch = %req.branch, workspace = %workspace.display(), "workspace checked out");
        }
        Err(err) => {
            send_update(
                ctx,
                run_id,
                json!({ "type": "init_step", "stage": "init", "status": "failed", "message": err.to_string() }),
            );
        }
    }
    result
}

async fn checkout_workspace(
    ctx: &ProxyContext,
    run_id: &str,
    req: &GitWorkspaceRequest,
    root: &Path,
    workspace: &Path,
    init_env: &BTreeMap<String, String>,
) -> Result<()> {
    send_update(ctx, run_id, json!({ "type": "init_step", "stage": "auth", "status": "start" }));
    let git_env = host_git_env(init_env)?;
    send_update(ctx, run_id, json!({ "type": "init_step", "stage": "auth", "status": "done" }));

    let checkout = Checkout {
        ctx,
        run_id,
        req,
        env: &git_env.env,
    };
    let lock = repo_lock_path(root, &req.repo_url);
    with_repo_lock(&lock, || async {
        if tokio::fs::metadata(workspace.join(".git")).await.is_ok() {
            return Ok(());
        }
        checkout.step("clone", "start");
        match ctx.config.sandbox.workspace_checkout {
            WorkspaceCheckout::Worktree => checkout.worktree(root, workspace).await,
            WorkspaceCheckout::Clone => checkout.fresh_clone(workspace).await,
        }
    })
    .await
}
