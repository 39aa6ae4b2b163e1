//! `sandbox_control`: administrative actions on sandbox instances, plus
//! the `sandbox_inventory` report.

use std::collections::HashSet;
use std::path::PathBuf;

use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SandboxProviderKind;
use crate::handlers::{ProxyContext, SandboxControl};
use crate::runs::agent::{close_agent, retire_run};
use crate::runs::runtime::{default_host_paths, ensure_runtime, is_under_workspace_root, RuntimeRequest};
use crate::runs::updates::send_sandbox_instance_status;
use crate::sandbox::{now_rfc3339, InstanceStatus, SandboxInstanceInfo};
use crate::validate::{validate_instance_name, validate_run_id};
use crate::{AppError, Result};

const UNSUPPORTED_ACTION: &str = "unsupported_action";

/// An instance the orchestrator expects to exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedInstance {
    /// Instance name.
    pub instance_name: String,
    /// Run id.
    pub run_id: String,
}

/// Parse `expected_instances`; `None` unless it is an array. Invalid
/// entries are skipped.
#[must_use]
pub fn parse_expected_instances(raw: Option<&Value>) -> Option<Vec<ExpectedInstance>> {
    let items = raw?.as_array()?;
    let parsed = items
        .iter()
        .filter_map(|item| {
            let name = item.get("instance_name").and_then(Value::as_str)?;
            let run_id = item.get("run_id").and_then(Value::as_str)?;
            match (validate_instance_name(name), validate_run_id(run_id)) {
                (Ok(instance_name), Ok(run_id)) => Some(ExpectedInstance {
                    instance_name,
                    run_id,
                }),
                (Err(err), _) | (_, Err(err)) => {
                    warn!(%err, "invalid expected_instances entry");
                    None
                }
            }
        })
        .collect();
    Some(parsed)
}

fn instance_run_id(ctx: &ProxyContext, info: &SandboxInstanceInfo) -> Option<String> {
    info.run_id.clone().or_else(|| {
        info.instance_name
            .strip_prefix(ctx.config.sandbox.instance_prefix.as_str())
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
    })
}

/// Build `sandbox_inventory` from the managed instances.
///
/// # Errors
///
/// Propagates `list_instances` failures.
pub async fn inventory_message(ctx: &ProxyContext, expected: Option<&Value>) -> Result<Value> {
    let captured_at = now_rfc3339();
    let instances = ctx.sandbox.list_instances(true).await?;
    let known: HashSet<&str> = instances.iter().map(|i| i.instance_name.as_str()).collect();
    let listed: Vec<Value> = instances
        .iter()
        .map(|i| {
            json!({
                "instance_name": i.instance_name,
                "run_id": instance_run_id(ctx, i),
                "status": i.status.as_str(),
                "created_at": i.created_at,
                "last_seen_at": captured_at,
            })
        })
        .collect();
    let runtime = match ctx.sandbox.kind() {
        SandboxProviderKind::ContainerOci => ctx.sandbox.runtime(),
        SandboxProviderKind::Bwrap => None,
    };

    let mut message = json!({
        "type": "sandbox_inventory",
        "inventory_id": Uuid::new_v4().to_string(),
        "provider": ctx.sandbox.kind().as_str(),
        "runtime": runtime,
        "captured_at": captured_at,
        "instances": listed,
    });
    if let Some(expected) = parse_expected_instances(expected) {
        let missing: Vec<Value> = expected
            .iter()
            .filter(|e| !known.contains(e.instance_name.as_str()))
            .map(|e| json!({ "instance_name": e.instance_name, "run_id": e.run_id }))
            .collect();
        message["missing_instances"] = Value::Array(missing);
    }
    Ok(message)
}

/// Managed instances with no registered run and not in `expected`.
///
/// Without an expected list only instances that are not running qualify
/// when `skip_running` is set.
async fn orphans(
    ctx: &ProxyContext,
    expected: Option<&[ExpectedInstance]>,
    skip_running: bool,
) -> Result<Vec<SandboxInstanceInfo>> {
    let mut out = Vec::new();
    for info in ctx.sandbox.list_instances(true).await? {
        if ctx.runs.owns_instance(&info.instance_name).await {
            continue;
        }
        let keep = match expected {
            Some(expected) => expected.iter().any(|e| e.instance_name == info.instance_name),
            None => skip_running && info.status == InstanceStatus::Running,
        };
        if !keep {
            out.push(info);
        }
    }
    Ok(out)
}

async fn remove_dirs(ctx: &ProxyContext, paths: &[PathBuf]) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    for path in paths {
        if !is_under_workspace_root(&ctx.config.sandbox, path)? {
            return Err(AppError::Validation(format!(
                "refusing to remove {} outside sandbox.workspace_host_root",
                path.display()
            )));
        }
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => removed.push(path.display().to_string()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(removed)
}

async fn run_dirs(ctx: &ProxyContext, run_id: &str) -> Result<Vec<PathBuf>> {
    let (workspace, home) = default_host_paths(&ctx.config.sandbox, run_id)?;
    let Some(run) = ctx.runs.get(run_id).await else {
        return Ok(vec![workspace, home]);
    };
    let state = run.state();
    Ok(vec![
        state.host_workspace_path.clone().unwrap_or(workspace),
        state.host_user_home_path.clone().unwrap_or(home),
    ])
}

// ── Actions ──────────────────────────────────────────────────────────────────

struct Target {
    run_id: Option<String>,
    instance_name: String,
}

async fn target(ctx: &ProxyContext, msg: &SandboxControl) -> Result<Target> {
    let run_id = match msg.run_id.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        Some(raw) => Some(validate_run_id(raw)?),
        None => None,
    };
    let explicit = msg
        .instance_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());
    let instance_name = match (explicit, &run_id) {
        (Some(name), _) => validate_instance_name(name)?,
        (None, Some(run_id)) => match ctx.runs.get(run_id).await {
            Some(run) => run.instance_name().to_owned(),
            None => validate_instance_name(&format!(
                "{}{run_id}",
                ctx.config.sandbox.instance_prefix
            ))?,
        },
        (None, None) => {
            return Err(AppError::Validation(
                "run_id or instance_name is required".into(),
            ))
        }
    };
    Ok(Target {
        run_id,
        instance_name,
    })
}

fn required_run_id(target: &Target) -> Result<&str> {
    target
        .run_id
        .as_deref()
        .ok_or_else(|| AppError::Validation("run_id is required".into()))
}

fn report_status(ctx: &ProxyContext, target: &Target, status: &str) {
    if let Some(run_id) = &target.run_id {
        send_sandbox_instance_status(ctx, run_id, &target.instance_name, status, None);
    }
}

async fn inspect(ctx: &ProxyContext, target: &Target) -> Result<Value> {
    let info = ctx.sandbox.inspect_instance(target.instance_name.clone()).await?;
    report_status(ctx, target, info.status.as_str());
    Ok(json!({ "status": info.status.as_str(), "details": { "created_at": info.created_at } }))
}

async fn ensure_running(ctx: &ProxyContext, target: &Target) -> Result<Value> {
    let run = ensure_runtime(
        ctx,
        &RuntimeRequest {
            run_id: required_run_id(target)?.to_owned(),
            instance_name: Some(target.instance_name.clone()),
            ..RuntimeRequest::default()
        },
    )
    .await?;
    let info = ctx.sandbox.inspect_instance(run.instance_name().to_owned()).await?;
    Ok(json!({ "status": info.status.as_str(), "details": { "created_at": info.created_at } }))
}

async fn stop(ctx: &ProxyContext, target: &Target) -> Result<Value> {
    if let Some(run_id) = &target.run_id {
        if let Some(run) = ctx.runs.get(run_id).await {
            close_agent(&run, "sandbox_control_stop").await;
        }
    }
    ctx.sandbox.stop_instance(target.instance_name.clone()).await?;
    let info = ctx.sandbox.inspect_instance(target.instance_name.clone()).await?;
    report_status(ctx, target, info.status.as_str());
    Ok(json!({ "status": info.status.as_str() }))
}

async fn remove(ctx: &ProxyContext, target: &Target) -> Result<Value> {
    if let Some(run_id) = &target.run_id {
        if let Some(run) = ctx.runs.remove(run_id).await {
            retire_run(&run, "sandbox_control_remove").await;
        }
    }
    ctx.sandbox.remove_instance(target.instance_name.clone()).await?;
    report_status(ctx, target, InstanceStatus::Missing.as_str());
    Ok(json!({ "status": InstanceStatus::Missing.as_str() }))
}

async fn remove_workspace(ctx: &ProxyContext, target: &Target) -> Result<Value> {
    let run_id = required_run_id(target)?;
    if ctx
        .runs
        .get(run_id)
        .await
        .is_some_and(|run| run.agent().is_some_and(|a| !a.is_closed()))
    {
        return Err(AppError::Validation(format!("run {run_id} still has a live agent")));
    }
    let dirs = run_dirs(ctx, run_id).await?;
    let removed = remove_dirs(ctx, &dirs).await?;
    info!(run_id, removed = ?removed, "run workspace removed");
    Ok(json!({ "removed": removed }))
}

async fn prune_orphans(ctx: &ProxyContext, msg: &SandboxControl) -> Result<Value> {
    let expected = parse_expected_instances(msg.expected_instances.as_ref());
    let mut deleted = Vec::new();
    for info in orphans(ctx, expected.as_deref(), false).await? {
        match ctx.sandbox.remove_instance(info.instance_name.clone()).await {
            Ok(()) => deleted.push(json!({
                "instance_name": info.instance_name,
                "run_id": instance_run_id(ctx, &info),
            })),
            Err(err) => warn!(instance_name = %info.instance_name, %err, "orphan removal failed"),
        }
    }
    let mut inventory = inventory_message(ctx, msg.expected_instances.as_ref()).await?;
    inventory["deleted_instances"] = Value::Array(deleted.clone());
    ctx.reply(inventory).await;
    Ok(json!({ "deleted_instances": deleted }))
}

async fn gc(ctx: &ProxyContext, msg: &SandboxControl) -> Result<Value> {
    let expected = parse_expected_instances(msg.expected_instances.as_ref());
    let mut planned = Vec::new();
    for info in orphans(ctx, expected.as_deref(), true).await? {
        let run_id = instance_run_id(ctx, &info);
        let workspace = match &run_id {
            Some(id) if validate_run_id(id).is_ok() => {
                Some(default_host_paths(&ctx.config.sandbox, id)?)
            }
            _ => None,
        };
        planned.push((info, run_id, workspace));
    }
    let describe = |(info, run_id, workspace): &(SandboxInstanceInfo, Option<String>, Option<(PathBuf, PathBuf)>)| {
        json!({
            "instance_name": info.instance_name,
            "run_id": run_id,
            "status": info.status.as_str(),
            "workspace": workspace.as_ref().map(|(w, _)| w.display().to_string()),
        })
    };
    if msg.dry_run {
        let deletes: Vec<Value> = planned.iter().map(describe).collect();
        return Ok(json!({ "dry_run": true, "planned": { "deletes": deletes } }));
    }

    let mut deleted = Vec::new();
    for entry in &planned {
        let (info, _, workspace) = entry;
        if let Err(err) = ctx.sandbox.remove_instance(info.instance_name.clone()).await {
            warn!(instance_name = %info.instance_name, %err, "gc instance removal failed");
            continue;
        }
        if let Some((workspace, home)) = workspace {
            if let Err(err) = remove_dirs(ctx, &[workspace.clone(), home.clone()]).await {
                warn!(instance_name = %info.instance_name, %err, "gc workspace removal failed");
            }
        }
        deleted.push(describe(entry));
    }
    info!(deleted = deleted.len(), "sandbox gc finished");
    Ok(json!({ "dry_run": false, "deleted": deleted }))
}

async fn remove_image(ctx: &ProxyContext, msg: &SandboxControl) -> Result<Value> {
    let image = msg
        .image
        .as_deref()
        .map(str::trim)
        .filter(|i| !i.is_empty())
        .ok_or_else(|| AppError::Validation("image is required".into()))?;
    ctx.sandbox.remove_image(image.to_owned()).await?;
    Ok(json!({ "image": image }))
}

async fn apply(ctx: &ProxyContext, action: &str, msg: &SandboxControl) -> Result<Value> {
    match action {
        "report_inventory" => {
            ctx.reply(inventory_message(ctx, msg.expected_instances.as_ref()).await?)
                .await;
            Ok(json!({}))
        }
        "remove_image" => remove_image(ctx, msg).await,
        "prune_orphans" => prune_orphans(ctx, msg).await,
        "gc" => gc(ctx, msg).await,
        "inspect" => inspect(ctx, &target(ctx, msg).await?).await,
        "ensure_running" => ensure_running(ctx, &target(ctx, msg).await?).await,
        "stop" => stop(ctx, &target(ctx, msg).await?).await,
        "remove" => remove(ctx, &target(ctx, msg).await?).await,
        "remove_workspace" => remove_workspace(ctx, &target(ctx, msg).await?).await,
        _ => Err(AppError::Validation(UNSUPPORTED_ACTION.into())),
    }
}

/// Handle `sandbox_control`; always answers with `sandbox_control_result`.
pub async fn handle(ctx: ProxyContext, msg: SandboxControl) {
    let action = msg.action.trim().to_owned();
    let run_id = msg
        .run_id
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_owned);
    let instance_name = msg
        .instance_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_owned);

    let mut reply = Map::new();
    reply.insert("type".into(), json!("sandbox_control_result"));
    reply.insert("run_id".into(), json!(run_id));
    reply.insert("instance_name".into(), json!(instance_name));
    reply.insert("action".into(), json!(action));

    match apply(&ctx, &action, &msg).await {
        Ok(extra) => {
            reply.insert("ok".into(), Value::Bool(true));
            if let Value::Object(extra) = extra {
                reply.extend(extra);
            }
        }
        Err(AppError::Validation(code)) if code == UNSUPPORTED_ACTION => {
            warn!(action = %action, "unsupported sandbox action");
            reply.insert("ok".into(), Value::Bool(false));
            reply.insert("error".into(), json!(UNSUPPORTED_ACTION));
        }
        Err(err) => {
            let message = err.to_string();
            warn!(action = %action, run_id = ?run_id, %err, "sandbox control failed");
            if let (Some(run_id), Some(instance_name)) = (&run_id, &instance_name) {
                send_sandbox_instance_status(&ctx, run_id, instance_name, "error", Some(&message));
            }
            reply.insert("ok".into(), Value::Bool(false));
            reply.insert("error".into(), json!(message));
        }
    }
    ctx.reply(Value::Object(reply)).await;
}
