//! Host workspace checkout driven by the repository keys in the init env.

use std::sync::Arc;

use serde_json::Value;

use acp_proxy::config::WorkspaceCheckout;
use acp_proxy::handlers::{acp_open, AcpOpen};
use acp_proxy::runs::InitPayload;

use super::test_helpers::{drain, test_context, test_context_with, updates_of, RecordingGit};

const REPO: &str = "https://example.com/acme/app.git";

fn repo_open(run_id: &str, branch: Option<&str>) -> AcpOpen {
    let mut init = InitPayload::default();
    init.env.insert("TUIXIU_REPO_URL".into(), REPO.into());
    init.env.insert("TUIXIU_GIT_HTTP_PASSWORD".into(), "ghp_secret".into());
    if let Some(branch) = branch {
        init.env.insert("TUIXIU_RUN_BRANCH".into(), branch.into());
    }
    AcpOpen {
        run_id: run_id.into(),
        init: Some(init),
        ..AcpOpen::default()
    }
}

fn steps(messages: &[Value]) -> Vec<String> {
    updates_of(messages, "init_step")
        .iter()
        .map(|s| format!("{}:{}", s["stage"].as_str().unwrap_or(""), s["status"].as_str().unwrap_or("")))
        .collect()
}

fn opened(messages: &[Value]) -> &Value {
    messages
        .iter()
        .find(|m| m["type"] == "acp_opened")
        .expect("acp_opened sent")
}

#[tokio::test]
async fn worktree_checkout_runs_once_per_workspace() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, _sandbox) = test_context(temp.path());
    let git = Arc::new(RecordingGit::default());
    let ctx = ctx.with_git(git.clone());

    acp_open::handle(ctx.clone(), repo_open("r1", Some("run/r1"))).await;

    let messages = drain(&mut rx);
    assert_eq!(opened(&messages)["ok"], true);
    assert_eq!(
        steps(&messages),
        ["auth:start", "auth:done", "clone:start", "clone:done", "checkout:done", "ready:done"]
    );

    let workspace = temp.path().join("run-r1").display().to_string();
    let calls = git.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0][..5], ["clone", "--branch", "main", "--single-branch", REPO]);
    let cache = calls[0][5].clone();
    assert!(cache.starts_with(&temp.path().join("_repo-cache").display().to_string()));
    assert_eq!(
        calls[1],
        ["-C", cache.as_str(), "worktree", "add", "-B", "run/r1", workspace.as_str(), "origin/main"]
    );
    assert!(git.envs()[0].contains_key("GIT_ASKPASS"));
    assert_eq!(git.envs()[0].get("GIT_TERMINAL_PROMPT").map(String::as_str), Some("0"));

    let locks = temp.path().join("_repo-cache").join("_locks");
    assert_eq!(std::fs::read_dir(&locks).expect("locks dir").count(), 0);

    acp_open::handle(ctx.clone(), repo_open("r1", Some("run/r1"))).await;
    assert_eq!(opened(&drain(&mut rx))["ok"], true);
    assert_eq!(git.calls().len(), 2);
}

#[tokio::test]
async fn clone_mode_checks_out_the_branch_in_place() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, _sandbox) = test_context_with(temp.path(), |c| {
        c.sandbox.workspace_checkout = WorkspaceCheckout::Clone;
    });
    let git = Arc::new(RecordingGit::default());
    let ctx = ctx.with_git(git.clone());

    acp_open::handle(ctx.clone(), repo_open("r1", Some("run/r1"))).await;

    let messages = drain(&mut rx);
    assert_eq!(opened(&messages)["ok"], true);
    assert_eq!(
        steps(&messages),
        ["auth:start", "auth:done", "clone:start", "clone:done", "checkout:start", "checkout:done", "ready:done"]
    );
    let workspace = temp.path().join("run-r1").display().to_string();
    assert_eq!(
        git.calls(),
        vec![
            vec!["clone", "--branch", "main", "--single-branch", REPO, workspace.as_str()],
            vec!["-C", workspace.as_str(), "checkout", "-B", "run/r1", "origin/main"],
        ]
    );
}

#[tokio::test]
async fn repository_without_branch_fails_the_open() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context(temp.path());
    let git = Arc::new(RecordingGit::default());
    let ctx = ctx.with_git(git.clone());

    acp_open::handle(ctx.clone(), repo_open("r1", None)).await;

    let messages = drain(&mut rx);
    let reply = opened(&messages);
    assert_eq!(reply["ok"], false);
    assert!(reply["error"]
        .as_str()
        .is_some_and(|e| e.contains("TUIXIU_RUN_BRANCH")));
    assert!(git.calls().is_empty());
    assert!(sandbox.calls().is_empty());
    assert!(ctx.runs.is_empty().await);
}
