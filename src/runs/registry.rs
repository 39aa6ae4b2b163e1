//! Run registry: run id to per-run runtime state.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::acp::bridge::AgentBridge;
use crate::runs::permission::PermissionRelay;
use crate::sandbox::Mount;
use crate::{AppError, Result};

/// Lower bound for a requested keepalive TTL, in seconds.
pub const MIN_KEEPALIVE_TTL_SECONDS: u64 = 60;
/// Upper bound for a requested keepalive TTL, in seconds.
pub const MAX_KEEPALIVE_TTL_SECONDS: u64 = 24 * 3600;

/// Clamp a requested TTL, falling back to `default_seconds`.
#[must_use]
pub fn clamp_keepalive_ttl(requested: Option<u64>, default_seconds: u64) -> Duration {
    let secs = requested
        .unwrap_or(default_seconds)
        .clamp(MIN_KEEPALIVE_TTL_SECONDS, MAX_KEEPALIVE_TTL_SECONDS);
    Duration::from_secs(secs)
}

/// Run-level state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Sandbox and agent are being prepared.
    Opening,
    /// Agent initialized, idle.
    Ready,
    /// A prompt is in flight.
    Prompting,
    /// No live agent.
    Closed,
}

impl RunPhase {
    /// Lowercase name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opening => "opening",
            Self::Ready => "ready",
            Self::Prompting => "prompting",
            Self::Closed => "closed",
        }
    }
}

/// Mutable part of a run. Guarded by a synchronous lock that is never held
/// across an await point.
#[derive(Debug)]
pub struct RunState {
    /// Idle time before the sweep tears the run down.
    pub keepalive_ttl: Duration,
    /// When the run expires; `None` while disarmed.
    pub expires_at: Option<Instant>,
    /// Last agent or orchestrator activity.
    pub last_used_at: Instant,
    /// Host directory mounted at the workspace guest path.
    pub host_workspace_path: Option<PathBuf>,
    /// Host directory mounted at the guest home.
    pub host_user_home_path: Option<PathBuf>,
    /// Guest home path.
    pub user_home_guest_path: Option<String>,
    /// Composed mount set.
    pub mounts: Vec<Mount>,
    /// Live agent bridge.
    pub agent: Option<Arc<AgentBridge>>,
    /// Swallow the next agent exit (set while an entrypoint init runs).
    pub suppress_next_exit: bool,
    /// Whether `initialize` succeeded on the current agent.
    pub initialized: bool,
    /// `initialize` result of the current agent.
    pub init_result: Option<Value>,
    /// Session ids created or loaded on the current agent.
    pub seen_session_ids: HashSet<String>,
    /// Most recent ACP session id; survives agent restarts.
    pub acp_session_id: Option<String>,
    /// Prompt whose updates are currently streaming.
    pub active_prompt_id: Option<String>,
    /// State machine position.
    pub phase: RunPhase,
    /// Set once the run has been closed or swept; no agent may attach
    /// afterwards.
    pub retired: bool,
}

impl RunState {
    fn new(keepalive_ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            keepalive_ttl,
            expires_at: Some(now + keepalive_ttl),
            last_used_at: now,
            host_workspace_path: None,
            host_user_home_path: None,
            user_home_guest_path: None,
            mounts: Vec::new(),
            agent: None,
            suppress_next_exit: false,
            initialized: false,
            init_result: None,
            seen_session_ids: HashSet::new(),
            acp_session_id: None,
            active_prompt_id: None,
            phase: RunPhase::Opening,
            retired: false,
        }
    }

    /// Retire the run and hand back its agent for closing.
    pub fn retire(&mut self) -> Option<Arc<AgentBridge>> {
        self.retired = true;
        self.reset_agent()
    }

    /// Drop the agent and everything scoped to it.
    pub fn reset_agent(&mut self) -> Option<Arc<AgentBridge>> {
        self.initialized = false;
        self.init_result = None;
        self.seen_session_ids.clear();
        self.active_prompt_id = None;
        self.suppress_next_exit = false;
        self.phase = RunPhase::Closed;
        self.agent.take()
    }
}

/// One registered run.
pub struct RunHandle {
    run_id: String,
    instance_name: String,
    state: Mutex<RunState>,
    ops: AsyncMutex<()>,
    permissions: PermissionRelay,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("instance_name", &self.instance_name)
            .finish_non_exhaustive()
    }
}

impl RunHandle {
    /// Fresh run in the `opening` phase with its expiry armed.
    #[must_use]
    pub fn new(run_id: String, instance_name: String, keepalive_ttl: Duration) -> Self {
        Self {
            run_id,
            instance_name,
            state: Mutex::new(RunState::new(keepalive_ttl)),
            ops: AsyncMutex::new(()),
            permissions: PermissionRelay::default(),
        }
    }

    /// Run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Sandbox instance name.
    #[must_use]
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Lock the mutable state.
    pub fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serialize `acp_open` / `prompt_send` work on this run.
    pub async fn lock_ops(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.ops.lock().await
    }

    /// Permission requests parked for the orchestrator.
    #[must_use]
    pub fn permissions(&self) -> &PermissionRelay {
        &self.permissions
    }

    /// Current agent bridge, if one is open.
    #[must_use]
    pub fn agent(&self) -> Option<Arc<AgentBridge>> {
        self.state().agent.clone()
    }

    /// Record activity and push the expiry out by the TTL.
    pub fn touch(&self) {
        let mut state = self.state();
        let now = Instant::now();
        state.last_used_at = now;
        state.expires_at = Some(now + state.keepalive_ttl);
    }

    /// Whether the run is idle past its expiry at `now`. Runs that are
    /// opening or prompting never expire.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        let state = self.state();
        !matches!(state.phase, RunPhase::Opening | RunPhase::Prompting)
            && state.expires_at.is_some_and(|at| at <= now)
    }
}

/// Map of live runs.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: AsyncMutex<HashMap<String, Arc<RunHandle>>>,
}

impl RunRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a run.
    pub async fn get(&self, run_id: &str) -> Option<Arc<RunHandle>> {
        self.runs.lock().await.get(run_id).cloned()
    }

    /// Return the run for `run_id`, registering a new one if absent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` when the run exists with a different
    /// instance name.
    pub async fn get_or_create(
        &self,
        run_id: &str,
        instance_name: &str,
        keepalive_ttl: Duration,
    ) -> Result<Arc<RunHandle>> {
        let mut runs = self.runs.lock().await;
        if let Some(run) = runs.get(run_id) {
            if run.instance_name != instance_name {
                return Err(AppError::Validation(format!(
                    "run {run_id} is bound to instance {}",
                    run.instance_name
                )));
            }
            run.state().keepalive_ttl = keepalive_ttl;
            run.touch();
            return Ok(Arc::clone(run));
        }
        let run = Arc::new(RunHandle::new(
            run_id.to_owned(),
            instance_name.to_owned(),
            keepalive_ttl,
        ));
        runs.insert(run_id.to_owned(), Arc::clone(&run));
        debug!(run_id, instance_name, "run registered");
        Ok(run)
    }

    /// Remove a run.
    pub async fn remove(&self, run_id: &str) -> Option<Arc<RunHandle>> {
        self.runs.lock().await.remove(run_id)
    }

    /// All runs, in no particular order.
    pub async fn snapshot(&self) -> Vec<Arc<RunHandle>> {
        self.runs.lock().await.values().cloned().collect()
    }

    /// Whether any run owns `instance_name`.
    pub async fn owns_instance(&self, instance_name: &str) -> bool {
        self.runs
            .lock()
            .await
            .values()
            .any(|run| run.instance_name == instance_name)
    }

    /// Remove and return every run expired at `now`.
    pub async fn take_expired(&self, now: Instant) -> Vec<Arc<RunHandle>> {
        let mut runs = self.runs.lock().await;
        let expired: Vec<String> = runs
            .iter()
            .filter(|(_, run)| run.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        expired.iter().filter_map(|id| runs.remove(id)).collect()
    }

    /// Number of registered runs.
    pub async fn len(&self) -> usize {
        self.runs.lock().await.len()
    }

    /// Whether no run is registered.
    pub async fn is_empty(&self) -> bool {
        self.runs.lock().await.is_empty()
    }
}
