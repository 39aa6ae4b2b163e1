//! Host process spawning for sandbox backends.
//!
//! Every sandboxed process, whether a container CLI attach or a `bwrap`
//! invocation, is a host child process whose stdio becomes a
//! [`ProcessHandle`]. The handle is exclusively owned by one agent bridge or
//! one exec caller.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{AppError, Result};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Host environment variables inherited by backend CLI processes.
///
/// Everything else is stripped with `env_clear()`; secrets for the agent are
/// passed explicitly into the sandbox instead.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "TERM",
    "TMPDIR",
    "XDG_RUNTIME_DIR",
    "DOCKER_HOST",
    "DOCKER_CONFIG",
    "CONTAINER_HOST",
    "RUST_LOG",
];

/// Time a terminated process gets to exit before it is killed.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Boxed async reader for process output streams.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed async writer for process input streams.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ── Handle ───────────────────────────────────────────────────────────────────

/// How a sandboxed process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal number, when killed by a signal.
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Stdio and lifecycle of one sandboxed process.
pub struct ProcessHandle {
    /// Process stdin.
    pub stdin: BoxedWriter,
    /// Process stdout.
    pub stdout: BoxedReader,
    /// Process stderr, when the backend exposes it.
    pub stderr: Option<BoxedReader>,
    /// Resolves once with the exit status.
    pub exit: oneshot::Receiver<ExitInfo>,
    /// Cancelling this token terminates the process.
    pub kill: CancellationToken,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("has_stderr", &self.stderr.is_some())
            .field("killed", &self.kill.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    /// Request termination. Idempotent.
    pub fn close(&self) {
        self.kill.cancel();
    }
}

// ── Spawning ─────────────────────────────────────────────────────────────────

/// What to launch on the host.
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    /// Executable.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Extra environment on top of [`ALLOWED_ENV_VARS`].
    pub env: BTreeMap<String, String>,
    /// Working directory on the host.
    pub cwd: Option<PathBuf>,
    /// Label used in logs (usually the instance name).
    pub label: String,
}

impl SpawnSpec {
    /// Spec for `program args…` with no extra environment.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>, label: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            label: label.into(),
            ..Self::default()
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.env_clear();
        for &key in ALLOWED_ENV_VARS {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.envs(&self.env);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

/// Spawn a host process with piped stdio and start its exit monitor.
///
/// # Errors
///
/// Returns `AppError::Sandbox` when the OS refuses to spawn the process or a
/// pipe cannot be captured.
pub fn spawn_process(spec: &SpawnSpec) -> Result<ProcessHandle> {
    let mut cmd = spec.command();
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Sandbox(format!("failed to spawn {}: {err}", spec.program)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Sandbox("failed to capture process stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Sandbox("failed to capture process stdout".into()))?;
    let stderr = child.stderr.take();

    debug!(label = %spec.label, program = %spec.program, pid = ?child.id(), "process spawned");

    let kill = CancellationToken::new();
    let (exit_tx, exit_rx) = oneshot::channel();
    monitor_exit(spec.label.clone(), child, exit_tx, kill.clone());

    Ok(ProcessHandle {
        stdin: Box::new(stdin),
        stdout: Box::new(stdout),
        stderr: stderr.map(|s| Box::new(s) as BoxedReader),
        exit: exit_rx,
        kill,
    })
}

/// Wait for `child` to exit, terminating it when `kill` fires, and deliver
/// the exit status exactly once.
fn monitor_exit(
    label: String,
    mut child: Child,
    exit_tx: oneshot::Sender<ExitInfo>,
    kill: CancellationToken,
) {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            () = kill.cancelled() => terminate(&label, &mut child).await,
        };
        let info = match status {
            Ok(status) => ExitInfo::from_status(status),
            Err(err) => {
                warn!(label = %label, %err, "error waiting for sandbox process");
                ExitInfo::default()
            }
        };
        info!(label = %label, code = ?info.code, signal = ?info.signal, "sandbox process exited");
        let _ = exit_tx.send(info);
    });
}

async fn terminate(label: &str, child: &mut Child) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            debug!(label = %label, %err, "SIGTERM failed");
        }
        if let Ok(status) = tokio::time::timeout(KILL_GRACE, child.wait()).await {
            return status;
        }
    }
    warn!(label = %label, "process ignored SIGTERM, killing");
    child.kill().await.ok();
    child.wait().await
}

// ── Captured runs ────────────────────────────────────────────────────────────

/// Result of a short-lived CLI invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureOutput {
    /// Exit code (`None` when killed by a signal).
    pub code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CaptureOutput {
    /// Whether the command exited with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Trimmed stderr, falling back to stdout.
    #[must_use]
    pub fn diagnostic(&self) -> &str {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim()
        } else {
            err
        }
    }
}

/// Run a CLI command to completion and capture its output.
///
/// # Errors
///
/// Returns `AppError::Sandbox` if the process cannot be spawned or does not
/// finish within `timeout`.
pub async fn run_capture(spec: &SpawnSpec, timeout: Duration) -> Result<CaptureOutput> {
    let mut cmd = spec.command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| {
            AppError::Sandbox(format!(
                "{} {} timed out after {}s",
                spec.program,
                spec.args.first().map_or("", String::as_str),
                timeout.as_secs()
            ))
        })?
        .map_err(|err| AppError::Sandbox(format!("failed to run {}: {err}", spec.program)))?;

    Ok(CaptureOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Feed `input` to a handle's stdin, then collect stdout and stderr until the
/// process exits.
///
/// # Errors
///
/// Returns `AppError::Sandbox` on timeout or when the exit status never
/// arrives.
pub async fn collect_output(
    handle: ProcessHandle,
    input: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<CaptureOutput> {
    let ProcessHandle {
        mut stdin,
        mut stdout,
        stderr,
        exit,
        kill,
    } = handle;

    let work = async move {
        if let Some(bytes) = input {
            stdin.write_all(&bytes).await?;
        }
        stdin.shutdown().await?;
        drop(stdin);

        let mut out = Vec::new();
        let mut err = Vec::new();
        let read_err = async {
            if let Some(mut stderr) = stderr {
                stderr.read_to_end(&mut err).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (read_out, read_err) = tokio::join!(stdout.read_to_end(&mut out), read_err);
        read_out?;
        read_err?;
        let info = exit
            .await
            .map_err(|_| AppError::Sandbox("process exit status lost".into()))?;
        Ok::<_, AppError>(CaptureOutput {
            code: info.code,
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
        })
    };

    match tokio::time::timeout(timeout, work).await {
        Ok(result) => result,
        Err(_) => {
            kill.cancel();
            Err(AppError::Sandbox(format!(
                "process timed out after {}s",
                timeout.as_secs()
            )))
        }
    }
}
