//! Agent-inputs manifest: files and mounts prepared before the agent starts.
//!
//! ```json
//! { "version": 1,
//!   "envPatch": { "HOME": "/root" },
//!   "items": [{ "id": "repo", "apply": "bindMount", "access": "rw",
//!               "source": { "type": "hostPath", "path": "/data/ws/run-1" },
//!               "target": { "root": "WORKSPACE", "path": "" } }] }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::sandbox::{Mount, MountAccess};
use crate::{AppError, Result};

const ENV_PATCH_KEYS: &[&str] = &["HOME", "USER", "LOGNAME"];

/// How an item is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApplyMethod {
    /// Bind the host path into the instance.
    BindMount,
    /// Download and unpack an archive (not supported).
    DownloadExtract,
    /// Write inline text to a file.
    WriteFile,
    /// Copy a host file or directory.
    Copy,
}

/// Item source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InputSource {
    /// Absolute host path.
    HostPath {
        /// Host path.
        path: String,
    },
    /// Text carried in the manifest.
    InlineText {
        /// File content.
        text: String,
    },
    /// Remote archive.
    HttpZip {
        /// Archive location.
        uri: String,
    },
}

/// Root a target path is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetRoot {
    /// The run workspace.
    Workspace,
    /// The run's guest home.
    UserHome,
}

/// Item target.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InputTarget {
    /// Root.
    pub root: TargetRoot,
    /// Relative path below the root; empty means the root itself.
    #[serde(default)]
    pub path: String,
}

impl InputTarget {
    /// Whether the target is the root itself.
    #[must_use]
    pub fn is_root(&self) -> bool {
        relative_parts(&self.path).is_empty()
    }
}

/// One manifest item.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentInputItem {
    /// Item id, for logs and errors.
    pub id: String,
    /// Apply method.
    pub apply: ApplyMethod,
    /// Mount access for `bindMount`.
    #[serde(default)]
    pub access: Option<MountAccess>,
    /// Source.
    pub source: InputSource,
    /// Target.
    pub target: InputTarget,
}

/// Parsed manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentInputsManifest {
    /// Always 1.
    pub version: u32,
    /// Overrides for `HOME`, `USER` and `LOGNAME`.
    #[serde(default, rename = "envPatch")]
    pub env_patch: Option<BTreeMap<String, String>>,
    /// Items, applied in order.
    pub items: Vec<AgentInputItem>,
}

fn relative_parts(raw: &str) -> Vec<&str> {
    raw.split(['/', '\\'])
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect()
}

fn check_relative(id: &str, raw: &str) -> Result<()> {
    let trimmed = raw.trim();
    if trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(AppError::Validation(format!(
            "agentInputs item {id}: target.path must be relative"
        )));
    }
    if relative_parts(trimmed).contains(&"..") {
        return Err(AppError::Validation(format!(
            "agentInputs item {id}: target.path must not escape its root"
        )));
    }
    Ok(())
}

/// Parse and validate `init.agentInputs`. `None` when absent.
///
/// # Errors
///
/// Returns `AppError::Validation` for malformed manifests, unsupported
/// versions, disallowed `envPatch` keys, escaping target paths, unsupported
/// `downloadExtract` items and source types that do not fit the apply
/// method.
pub fn parse_agent_inputs(raw: Option<&Value>) -> Result<Option<AgentInputsManifest>> {
    let Some(raw) = raw.filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let manifest: AgentInputsManifest = serde_json::from_value(raw.clone())
        .map_err(|err| AppError::Validation(format!("invalid agentInputs: {err}")))?;
    if manifest.version != 1 {
        return Err(AppError::Validation(format!(
            "unsupported agentInputs version {}",
            manifest.version
        )));
    }
    if let Some(patch) = &manifest.env_patch {
        if let Some(key) = patch.keys().find(|k| !ENV_PATCH_KEYS.contains(&k.as_str())) {
            return Err(AppError::Validation(format!(
                "agentInputs envPatch key not allowed: {key}"
            )));
        }
    }
    for item in &manifest.items {
        let id = item.id.trim();
        if id.is_empty() {
            return Err(AppError::Validation("agentInputs item id is empty".into()));
        }
        check_relative(id, &item.target.path)?;
        let source_ok = match item.apply {
            ApplyMethod::DownloadExtract => {
                return Err(AppError::Validation(format!(
                    "agentInputs item {id}: downloadExtract is not supported"
                )))
            }
            ApplyMethod::BindMount | ApplyMethod::Copy => {
                matches!(&item.source, InputSource::HostPath { path } if Path::new(path.trim()).is_absolute())
            }
            ApplyMethod::WriteFile => matches!(item.source, InputSource::InlineText { .. }),
        };
        if !source_ok {
            return Err(AppError::Validation(format!(
                "agentInputs item {id}: source does not match apply method"
            )));
        }
    }
    Ok(Some(manifest))
}

impl AgentInputsManifest {
    /// Host path of a `bindMount` targeting the workspace root.
    #[must_use]
    pub fn workspace_bind(&self) -> Option<PathBuf> {
        self.items.iter().find_map(|item| match (&item.apply, &item.source) {
            (ApplyMethod::BindMount, InputSource::HostPath { path })
                if item.target.root == TargetRoot::Workspace && item.target.is_root() =>
            {
                Some(PathBuf::from(path.trim()))
            }
            _ => None,
        })
    }

    /// Remaining `bindMount` items as mounts.
    #[must_use]
    pub fn extra_mounts(&self, workspace_guest: &str, home_guest: Option<&str>) -> Vec<Mount> {
        self.items
            .iter()
            .filter_map(|item| {
                let InputSource::HostPath { path } = &item.source else {
                    return None;
                };
                if item.apply != ApplyMethod::BindMount {
                    return None;
                }
                let root = match item.target.root {
                    TargetRoot::Workspace if item.target.is_root() => return None,
                    TargetRoot::Workspace => workspace_guest,
                    TargetRoot::UserHome => home_guest?,
                };
                let rel = relative_parts(&item.target.path).join("/");
                let guest = if rel.is_empty() {
                    root.to_owned()
                } else {
                    format!("{}/{rel}", root.trim_end_matches('/'))
                };
                Some(Mount {
                    host_path: PathBuf::from(path.trim()),
                    guest_path: guest,
                    access: item.access.unwrap_or(MountAccess::Rw),
                })
            })
            .collect()
    }

    /// Apply `envPatch` on top of `env`.
    pub fn patch_env(&self, env: &mut BTreeMap<String, String>) {
        if let Some(patch) = &self.env_patch {
            env.extend(patch.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }

    /// Materialize `writeFile` and `copy` items on the host.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` when an item targets the user home and
    /// none is mounted, or `AppError::Io` when a file operation fails.
    pub async fn apply_host_items(
        &self,
        run_id: &str,
        workspace_host: &Path,
        home_host: Option<&Path>,
    ) -> Result<()> {
        for item in &self.items {
            let root = match item.target.root {
                TargetRoot::Workspace => workspace_host,
                TargetRoot::UserHome => home_host.ok_or_else(|| {
                    AppError::Validation(format!(
                        "agentInputs item {}: no per-run user home",
                        item.id
                    ))
                })?,
            };
            let target = relative_parts(&item.target.path)
                .into_iter()
                .fold(root.to_path_buf(), |acc, seg| acc.join(seg));

            match (&item.apply, &item.source) {
                (ApplyMethod::WriteFile, InputSource::InlineText { text }) => {
                    if let Some(parent) = target.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&target, text).await?;
                }
                (ApplyMethod::Copy, InputSource::HostPath { path }) => {
                    let from = PathBuf::from(path.trim());
                    let to = target.clone();
                    tokio::task::spawn_blocking(move || copy_tree(&from, &to))
                        .await
                        .map_err(|err| AppError::Io(format!("copy task failed: {err}")))??;
                }
                _ => continue,
            }
            info!(run_id, item_id = %item.id, target = %target.display(), "agent input applied");
        }
        Ok(())
    }
}

/// Replace `to` with a recursive copy of `from`.
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if to.is_dir() {
        std::fs::remove_dir_all(to)?;
    } else if to.exists() {
        std::fs::remove_file(to)?;
    }
    copy_entry(from, to)
}

fn copy_entry(from: &Path, to: &Path) -> Result<()> {
    if from.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_entry(&entry.path(), &to.join(entry.file_name()))?;
        }
    } else {
        std::fs::copy(from, to)?;
    }
    Ok(())
}
