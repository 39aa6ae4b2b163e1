//! Validation of identifiers and guest paths received from the orchestrator.

use crate::{AppError, Result};

const MAX_ID_LEN: usize = 200;

/// Validate and trim a run identifier.
///
/// # Errors
///
/// Returns `AppError::Validation` when the id is empty, longer than 200
/// characters, or contains a path or drive separator.
pub fn validate_run_id(raw: &str) -> Result<String> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(AppError::Validation("run_id is empty".into()));
    }
    if id.chars().count() > MAX_ID_LEN {
        return Err(AppError::Validation("run_id is too long".into()));
    }
    if id.contains(['/', '\\', ':']) {
        return Err(AppError::Validation(
            "run_id must not contain '/', '\\' or ':'".into(),
        ));
    }
    Ok(id.to_owned())
}

/// Validate and trim a sandbox instance name.
///
/// # Errors
///
/// Returns `AppError::Validation` unless the name matches
/// `[A-Za-z0-9][A-Za-z0-9_.-]*` and is at most 200 characters.
pub fn validate_instance_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !first_ok || !rest_ok {
        return Err(AppError::Validation(format!(
            "instance_name is invalid: {name:?}"
        )));
    }
    if name.len() > MAX_ID_LEN {
        return Err(AppError::Validation("instance_name is too long".into()));
    }
    Ok(name.to_owned())
}

/// Normalize an absolute POSIX guest path, rejecting `..` segments.
///
/// # Errors
///
/// Returns `AppError::Validation` for empty, relative, or `..`-bearing paths.
pub fn normalize_guest_path(raw: &str) -> Result<String> {
    let path = raw.trim();
    if path.is_empty() {
        return Err(AppError::Validation("guest path is empty".into()));
    }
    if !path.starts_with('/') {
        return Err(AppError::Validation(format!(
            "guest path must be absolute: {path}"
        )));
    }
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                return Err(AppError::Validation(format!(
                    "guest path must not contain '..': {path}"
                )))
            }
            other => parts.push(other),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Whether `path` equals `root` or lies beneath it. Both must be normalized.
#[must_use]
pub fn guest_path_within(root: &str, path: &str) -> bool {
    if root == "/" {
        return true;
    }
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Resolve a possibly-relative path requested by the agent against the
/// workspace guest root, refusing anything that escapes it.
///
/// # Errors
///
/// Returns `AppError::Validation` for empty paths or paths outside `root`.
pub fn resolve_workspace_guest_path(root: &str, requested: &str) -> Result<String> {
    let requested = requested.trim();
    if requested.is_empty() {
        return Err(AppError::Validation("path is empty".into()));
    }
    let root = normalize_guest_path(root)?;
    let candidate = if requested.starts_with('/') {
        requested.to_owned()
    } else {
        format!("{root}/{requested}")
    };
    let normalized = normalize_guest_path(&candidate)?;
    if guest_path_within(&root, &normalized) {
        Ok(normalized)
    } else {
        Err(AppError::Validation(
            "path is outside workspace root".into(),
        ))
    }
}
