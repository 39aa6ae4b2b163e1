//! Permission requests relayed to the orchestrator.
//!
//! When `permission_ask` is on, a `session/request_permission` from the
//! agent is parked here under its JSON-RPC id and announced as a
//! `permission_request` update. The orchestrator answers with a
//! `session_permission` message; `$/cancel_request` from the agent or an
//! agent close cancels it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::debug;

/// Orchestrator answer to a parked request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    /// An option was picked; unknown or missing ids fall back to the
    /// default outcome.
    Selected(Option<String>),
    /// The request was denied or withdrawn.
    Cancelled,
}

impl PermissionDecision {
    /// Parse the `outcome` / `option_id` pair of `session_permission`.
    #[must_use]
    pub fn from_message(outcome: &str, option_id: Option<&str>) -> Self {
        if outcome.trim().eq_ignore_ascii_case("selected") {
            Self::Selected(option_id.map(str::trim).filter(|id| !id.is_empty()).map(str::to_owned))
        } else {
            Self::Cancelled
        }
    }
}

fn option_id(option: &Value) -> Option<&str> {
    option.get("optionId").and_then(Value::as_str)
}

/// Options carrying a string `optionId`.
#[must_use]
pub fn usable_options(params: &Value) -> Vec<Value> {
    params
        .get("options")
        .and_then(Value::as_array)
        .map(|options| {
            options
                .iter()
                .filter(|o| option_id(o).is_some())
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Pick the permission outcome: `allow_once`, else the first option, else
/// cancelled.
#[must_use]
pub fn default_outcome(options: &[Value]) -> Value {
    let preferred = options
        .iter()
        .find(|o| o.get("kind").and_then(Value::as_str) == Some("allow_once"))
        .or_else(|| options.first());
    match preferred
        .and_then(option_id)
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        Some(option_id) => json!({ "outcome": "selected", "optionId": option_id }),
        None => json!({ "outcome": "cancelled" }),
    }
}

/// Map an orchestrator decision onto the offered options.
#[must_use]
pub fn decision_outcome(options: &[Value], decision: &PermissionDecision) -> Value {
    match decision {
        PermissionDecision::Cancelled => json!({ "outcome": "cancelled" }),
        PermissionDecision::Selected(Some(id)) if options.iter().any(|o| option_id(o) == Some(id)) => {
            json!({ "outcome": "selected", "optionId": id })
        }
        PermissionDecision::Selected(_) => default_outcome(options),
    }
}

struct Parked {
    options: Vec<Value>,
    tx: oneshot::Sender<Value>,
}

/// Parked permission requests of one run.
#[derive(Default)]
pub struct PermissionRelay {
    parked: Mutex<HashMap<String, Parked>>,
}

impl std::fmt::Debug for PermissionRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionRelay")
            .field("parked", &self.len())
            .finish()
    }
}

impl PermissionRelay {
    fn parked(&self) -> MutexGuard<'_, HashMap<String, Parked>> {
        self.parked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a request; `None` when `request_id` is already parked.
    pub fn park(&self, request_id: &str, options: Vec<Value>) -> Option<oneshot::Receiver<Value>> {
        let mut parked = self.parked();
        if parked.contains_key(request_id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        parked.insert(request_id.to_owned(), Parked { options, tx });
        Some(rx)
    }

    /// Answer a parked request. Returns `false` when nothing matched.
    pub fn resolve(&self, request_id: &str, decision: &PermissionDecision) -> bool {
        let Some(parked) = self.parked().remove(request_id) else {
            return false;
        };
        let outcome = decision_outcome(&parked.options, decision);
        debug!(request_id, outcome = %outcome, "permission resolved");
        let _ = parked.tx.send(outcome);
        true
    }

    /// Cancel one parked request.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.resolve(request_id, &PermissionDecision::Cancelled)
    }

    /// Cancel every parked request.
    pub fn cancel_all(&self) {
        let drained: Vec<Parked> = self.parked().drain().map(|(_, p)| p).collect();
        for parked in drained {
            let _ = parked.tx.send(json!({ "outcome": "cancelled" }));
        }
    }

    /// Forget a request whose waiter gave up.
    pub fn forget(&self, request_id: &str) {
        self.parked().remove(request_id);
    }

    /// Number of parked requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.parked().len()
    }

    /// Whether nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
