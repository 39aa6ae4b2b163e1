//! End-to-end handler flows over the fake sandbox: `acp_open`,
//! `prompt_send`, session controls and `acp_close`.

use std::time::Duration;

use serde_json::{json, Value};

use acp_proxy::handlers::{acp_close, acp_open, dispatch, prompt, session_control};
use acp_proxy::handlers::{AcpClose, AcpOpen, PromptSend, SessionControl};
use acp_proxy::runs::InitPayload;

use super::test_helpers::{
    drain, recv_type, test_context, test_context_with, updates_of, wait_until, FAKE_SESSION_ID,
};

fn prompt_msg(run_id: &str, prompt_id: &str) -> PromptSend {
    PromptSend {
        run_id: run_id.into(),
        prompt_id: prompt_id.into(),
        prompt: json!([{ "type": "text", "text": "list the files" }]),
        ..PromptSend::default()
    }
}

fn by_type<'a>(messages: &'a [Value], kind: &str) -> Vec<&'a Value> {
    messages.iter().filter(|m| m["type"] == kind).collect()
}

// ── acp_open ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn acp_open_starts_and_initializes_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context(temp.path());

    acp_open::handle(
        ctx.clone(),
        AcpOpen {
            run_id: "r1".into(),
            ..AcpOpen::default()
        },
    )
    .await;

    let messages = drain(&mut rx);
    let opened = by_type(&messages, "acp_opened");
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0]["ok"], true);
    assert_eq!(opened[0]["run_id"], "r1");

    assert_eq!(updates_of(&messages, "transport_connected").len(), 1);
    let statuses: Vec<&str> = updates_of(&messages, "sandbox_instance_status")
        .iter()
        .filter_map(|c| c["status"].as_str())
        .collect();
    assert!(statuses.contains(&"creating"));
    assert!(statuses.contains(&"running"));

    assert_eq!(sandbox.calls_of("open_agent"), vec!["open_agent:acp-run-r1"]);
    assert_eq!(sandbox.agent_methods(), vec!["initialize"]);
    let run = ctx.runs.get("r1").await.expect("run registered");
    assert!(run.agent().is_some());
    assert!(temp.path().join("run-r1").is_dir());
}

#[tokio::test]
async fn reopening_reuses_the_live_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context(temp.path());
    let open = AcpOpen {
        run_id: "r1".into(),
        ..AcpOpen::default()
    };

    acp_open::handle(ctx.clone(), open.clone()).await;
    acp_open::handle(ctx.clone(), open).await;

    let opened: Vec<Value> = drain(&mut rx)
        .into_iter()
        .filter(|m| m["type"] == "acp_opened")
        .collect();
    assert_eq!(opened.len(), 2);
    assert!(opened.iter().all(|m| m["ok"] == true));
    assert_eq!(sandbox.calls_of("open_agent").len(), 1);
    assert_eq!(sandbox.agent_methods(), vec!["initialize"]);
}

#[tokio::test]
async fn home_inside_workspace_fails_before_touching_the_sandbox() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context(temp.path());
    let mut init = InitPayload::default();
    init.env.insert("HOME".into(), "/workspace".into());

    acp_open::handle(
        ctx.clone(),
        AcpOpen {
            run_id: "r1".into(),
            init: Some(init),
            ..AcpOpen::default()
        },
    )
    .await;

    let messages = drain(&mut rx);
    let opened = by_type(&messages, "acp_opened");
    assert_eq!(opened[0]["ok"], false);
    assert!(opened[0]["error"]
        .as_str()
        .is_some_and(|e| e.contains("USER_HOME/HOME")));
    assert!(sandbox.calls().is_empty());
    assert!(ctx.runs.is_empty().await);
}

#[tokio::test]
async fn invalid_run_id_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context(temp.path());

    acp_open::handle(
        ctx.clone(),
        AcpOpen {
            run_id: "../escape".into(),
            ..AcpOpen::default()
        },
    )
    .await;

    let messages = drain(&mut rx);
    assert_eq!(by_type(&messages, "acp_opened")[0]["ok"], false);
    assert!(sandbox.calls().is_empty());
}

#[tokio::test]
async fn acp_open_waits_for_the_init_marker() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context(temp.path());
    sandbox.report_init_marker();

    acp_open::handle(
        ctx.clone(),
        AcpOpen {
            run_id: "r1".into(),
            init: Some(InitPayload {
                script: Some("git clone https://example.com/repo.git .".into()),
                ..InitPayload::default()
            }),
            ..AcpOpen::default()
        },
    )
    .await;

    let messages = drain(&mut rx);
    assert_eq!(by_type(&messages, "acp_opened")[0]["ok"], true);
    let steps = updates_of(&messages, "init_step");
    assert!(steps
        .iter()
        .any(|s| s["stage"] == "clone" && s["status"] == "done"));
    let results = updates_of(&messages, "init_result");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["ok"], true);
    assert_eq!(sandbox.agent_methods(), vec!["initialize"]);

    let run = ctx.runs.get("r1").await.expect("run registered");
    assert!(!run.state().suppress_next_exit);
}

#[tokio::test]
async fn malformed_open_still_gets_a_reply() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context(temp.path());

    dispatch(
        &ctx,
        json!({ "type": "acp_open", "run_id": " r1 ", "init": { "env": { "X": [1] } } }),
    );
    dispatch(
        &ctx,
        json!({ "type": "prompt_send", "run_id": "r1", "prompt_id": 7, "timeout_ms": "soon" }),
    );

    let mut replies = Vec::new();
    for _ in 0..2 {
        let reply = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("reply within 5s")
            .expect("outbound open");
        replies.push(reply);
    }

    let opened = by_type(&replies, "acp_opened")[0];
    assert_eq!(opened["ok"], false);
    assert_eq!(opened["run_id"], "r1");
    assert!(opened["error"]
        .as_str()
        .is_some_and(|e| e.starts_with("invalid message")));
    let result = by_type(&replies, "prompt_result")[0];
    assert_eq!(result["ok"], false);
    assert_eq!(result["prompt_id"], "7");
    assert!(sandbox.calls().is_empty());
}

// ── prompt_send ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn prompt_streams_updates_then_result() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context(temp.path());

    prompt::handle(ctx.clone(), prompt_msg("r1", "p1")).await;

    let messages = drain(&mut rx);
    let chunks: Vec<&Value> = by_type(&messages, "prompt_update")
        .into_iter()
        .filter(|m| m["update"]["sessionUpdate"] == "agent_message_chunk")
        .collect();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0]["prompt_id"], "p1");
    assert_eq!(chunks[0]["session_id"], FAKE_SESSION_ID);

    let results = by_type(&messages, "prompt_result");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["ok"], true);
    assert_eq!(results[0]["session_id"], FAKE_SESSION_ID);
    assert_eq!(results[0]["stop_reason"], "end_turn");
    assert_eq!(results[0]["session_created"], true);

    let chunk_at = messages
        .iter()
        .position(|m| m["update"]["sessionUpdate"] == "agent_message_chunk")
        .expect("chunk present");
    let result_at = messages
        .iter()
        .position(|m| m["type"] == "prompt_result")
        .expect("result present");
    assert!(chunk_at < result_at, "updates precede the result");

    assert_eq!(
        sandbox.agent_methods(),
        vec!["initialize", "session/new", "session/prompt"]
    );
}

#[tokio::test]
async fn second_prompt_reuses_the_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context(temp.path());

    prompt::handle(ctx.clone(), prompt_msg("r1", "p1")).await;
    prompt::handle(ctx.clone(), prompt_msg("r1", "p2")).await;

    let messages = drain(&mut rx);
    let results = by_type(&messages, "prompt_result");
    assert_eq!(results.len(), 2);
    assert_eq!(results[1]["prompt_id"], "p2");
    assert_eq!(results[1]["session_created"], false);
    assert_eq!(
        sandbox
            .agent_methods()
            .iter()
            .filter(|m| *m == "session/new")
            .count(),
        1
    );
    let run = ctx.runs.get("r1").await.expect("run registered");
    assert!(run.state().active_prompt_id.is_none());
}

#[tokio::test]
async fn unsupported_prompt_block_fails_the_prompt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context(temp.path());
    let mut msg = prompt_msg("r1", "p1");
    msg.prompt = json!([{ "type": "image", "data": "AAAA", "mimeType": "image/png" }]);

    prompt::handle(ctx.clone(), msg).await;

    let messages = drain(&mut rx);
    let results = by_type(&messages, "prompt_result");
    assert_eq!(results[0]["ok"], false);
    assert!(results[0]["error"]
        .as_str()
        .is_some_and(|e| e.contains("promptCapabilities.image")));
    assert!(!sandbox.agent_methods().contains(&"session/prompt".to_owned()));
}

#[tokio::test]
async fn cwd_outside_workspace_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context(temp.path());
    let mut msg = prompt_msg("r1", "p1");
    msg.cwd = Some("/etc".into());

    prompt::handle(ctx.clone(), msg).await;

    let messages = drain(&mut rx);
    assert_eq!(by_type(&messages, "prompt_result")[0]["ok"], false);
    assert!(sandbox.calls().is_empty());
}

// ── Session controls ─────────────────────────────────────────────────────────

#[tokio::test]
async fn set_mode_reaches_the_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context(temp.path());
    prompt::handle(ctx.clone(), prompt_msg("r1", "p1")).await;
    drain(&mut rx);

    session_control::handle(
        ctx.clone(),
        session_control::ControlKind::SetMode,
        SessionControl {
            run_id: "r1".into(),
            control_id: "c1".into(),
            mode_id: Some("plan".into()),
            ..SessionControl::default()
        },
    )
    .await;

    let messages = drain(&mut rx);
    let results = by_type(&messages, "session_control_result");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["ok"], true);
    assert_eq!(results[0]["control_id"], "c1");
    assert!(sandbox
        .agent_methods()
        .contains(&"session/set_mode".to_owned()));
}

#[tokio::test]
async fn cancel_is_sent_as_a_notification() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context(temp.path());
    prompt::handle(ctx.clone(), prompt_msg("r1", "p1")).await;
    drain(&mut rx);

    session_control::handle(
        ctx.clone(),
        session_control::ControlKind::Cancel,
        SessionControl {
            run_id: "r1".into(),
            control_id: "c2".into(),
            ..SessionControl::default()
        },
    )
    .await;

    let messages = drain(&mut rx);
    assert_eq!(by_type(&messages, "session_control_result")[0]["ok"], true);

    // The notification has no reply; wait for the agent to record it.
    for _ in 0..50 {
        if sandbox
            .agent_methods()
            .contains(&"session/cancel".to_owned())
        {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("session/cancel never reached the agent");
}

#[tokio::test]
async fn control_on_unknown_run_reports_run_not_open() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, _sandbox) = test_context(temp.path());

    session_control::handle(
        ctx.clone(),
        session_control::ControlKind::Cancel,
        SessionControl {
            run_id: "nope".into(),
            control_id: "c1".into(),
            ..SessionControl::default()
        },
    )
    .await;

    let messages = drain(&mut rx);
    let result = by_type(&messages, "session_control_result")[0];
    assert_eq!(result["ok"], false);
    assert_eq!(result["error"], "run_not_open");
}

#[tokio::test]
async fn control_without_session_reports_session_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, _sandbox) = test_context(temp.path());
    acp_open::handle(
        ctx.clone(),
        AcpOpen {
            run_id: "r1".into(),
            ..AcpOpen::default()
        },
    )
    .await;
    drain(&mut rx);

    session_control::handle(
        ctx.clone(),
        session_control::ControlKind::SetModel,
        SessionControl {
            run_id: "r1".into(),
            control_id: "c1".into(),
            model_id: Some("gpt".into()),
            ..SessionControl::default()
        },
    )
    .await;

    let messages = drain(&mut rx);
    assert_eq!(
        by_type(&messages, "session_control_result")[0]["error"],
        "session_not_found"
    );
}

#[tokio::test]
async fn control_id_is_required() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, _sandbox) = test_context(temp.path());

    session_control::handle(
        ctx.clone(),
        session_control::ControlKind::Cancel,
        SessionControl {
            run_id: "r1".into(),
            ..SessionControl::default()
        },
    )
    .await;

    let messages = drain(&mut rx);
    let result = by_type(&messages, "session_control_result")[0];
    assert_eq!(result["ok"], false);
    assert!(result["error"]
        .as_str()
        .is_some_and(|e| e.contains("control_id")));
}

// ── acp_close ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn close_with_remove_drops_run_and_instance() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context(temp.path());
    acp_open::handle(
        ctx.clone(),
        AcpOpen {
            run_id: "r1".into(),
            ..AcpOpen::default()
        },
    )
    .await;
    let agent = ctx
        .runs
        .get("r1")
        .await
        .and_then(|run| run.agent())
        .expect("agent started");
    drain(&mut rx);

    acp_close::handle(
        ctx.clone(),
        AcpClose {
            run_id: "r1".into(),
            remove_instance: true,
        },
    )
    .await;

    let messages = drain(&mut rx);
    let closed = by_type(&messages, "acp_closed");
    assert_eq!(closed[0]["ok"], true);
    assert!(agent.is_closed());
    assert!(ctx.runs.is_empty().await);
    assert_eq!(sandbox.calls_of("remove"), vec!["remove:acp-run-r1"]);
    assert!(updates_of(&messages, "sandbox_instance_status")
        .iter()
        .any(|c| c["status"] == "missing"));
}

#[tokio::test]
async fn close_without_remove_keeps_instance() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context(temp.path());
    acp_open::handle(
        ctx.clone(),
        AcpOpen {
            run_id: "r1".into(),
            ..AcpOpen::default()
        },
    )
    .await;
    drain(&mut rx);

    acp_close::handle(
        ctx.clone(),
        AcpClose {
            run_id: "r1".into(),
            remove_instance: false,
        },
    )
    .await;

    assert_eq!(by_type(&drain(&mut rx), "acp_closed")[0]["ok"], true);
    assert!(ctx.runs.is_empty().await);
    assert!(sandbox.calls_of("remove").is_empty());
    assert!(sandbox.has_instance("acp-run-r1"));
}

#[tokio::test]
async fn new_session_is_announced_in_the_stream_and_on_the_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, _sandbox) = test_context(temp.path());

    prompt::handle(ctx.clone(), prompt_msg("r1", "p1")).await;

    let messages = drain(&mut rx);
    let in_stream: Vec<&Value> = by_type(&messages, "prompt_update")
        .into_iter()
        .filter(|m| m["update"]["sessionUpdate"] == "session_created")
        .collect();
    assert_eq!(in_stream.len(), 1);
    assert_eq!(in_stream[0]["prompt_id"], "p1");
    assert_eq!(in_stream[0]["session_id"], FAKE_SESSION_ID);

    let on_run = updates_of(&messages, "session_created");
    assert_eq!(on_run.len(), 1);
    assert_eq!(on_run[0]["session_id"], FAKE_SESSION_ID);
}

// ── Limits and backpressure ──────────────────────────────────────────────────

#[tokio::test]
async fn prompts_beyond_max_concurrent_wait_for_a_slot() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context_with(temp.path(), |c| c.agent.max_concurrent = 1);
    let gate = sandbox.gate_prompts();

    tokio::spawn(prompt::handle(ctx.clone(), prompt_msg("r1", "p1")));
    wait_until("first prompt at the agent", || {
        sandbox.agent_methods().contains(&"session/prompt".to_owned())
    })
    .await;
    tokio::spawn(prompt::handle(ctx.clone(), prompt_msg("r2", "p2")));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(sandbox.calls_of("open_agent"), vec!["open_agent:acp-run-r1"]);
    assert!(ctx.runs.get("r2").await.is_none());

    gate.add_permits(1);
    let first = recv_type(&mut rx, "prompt_result").await;
    assert_eq!(first["prompt_id"], "p1");
    assert_eq!(first["ok"], true);

    wait_until("second run opened", || sandbox.calls_of("open_agent").len() == 2).await;
    gate.add_permits(1);
    let second = recv_type(&mut rx, "prompt_result").await;
    assert_eq!(second["prompt_id"], "p2");
    assert_eq!(second["ok"], true);
}

#[tokio::test]
async fn prompt_result_survives_a_full_outbound_queue() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context_with(temp.path(), |c| c.outbound_queue_capacity = 4);
    tokio::spawn(acp_open::handle(
        ctx.clone(),
        AcpOpen {
            run_id: "r1".into(),
            ..AcpOpen::default()
        },
    ));
    assert_eq!(recv_type(&mut rx, "acp_opened").await["ok"], true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    drain(&mut rx);

    for n in 0..4 {
        ctx.send(json!({ "type": "filler", "n": n }));
    }
    let turn = tokio::spawn(prompt::handle(ctx.clone(), prompt_msg("r1", "p1")));
    wait_until("prompt at the agent", || {
        sandbox.agent_methods().contains(&"session/prompt".to_owned())
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!turn.is_finished(), "reply waits for queue room");

    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let message = rx.recv().await.expect("outbound open");
            if message["type"] == "prompt_result" {
                return message;
            }
            seen.push(message);
        }
    })
    .await
    .expect("prompt_result delivered");
    assert_eq!(result["ok"], true);
    assert_eq!(by_type(&seen, "filler").len(), 4);
    turn.await.expect("prompt task");
}

// ── Close races ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn close_during_a_prompt_fails_it_with_agent_closed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context(temp.path());
    let _gate = sandbox.gate_prompts();

    tokio::spawn(prompt::handle(ctx.clone(), prompt_msg("r1", "p1")));
    wait_until("prompt at the agent", || {
        sandbox.agent_methods().contains(&"session/prompt".to_owned())
    })
    .await;

    acp_close::handle(
        ctx.clone(),
        AcpClose {
            run_id: "r1".into(),
            remove_instance: false,
        },
    )
    .await;

    let result = recv_type(&mut rx, "prompt_result").await;
    assert_eq!(result["ok"], false);
    assert_eq!(result["prompt_id"], "p1");
    assert_eq!(result["error"], "agent closed");
    wait_until("agent stopped", || sandbox.live_agents() == 0).await;
}

#[tokio::test]
async fn close_racing_an_open_discards_the_new_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (ctx, mut rx, sandbox) = test_context(temp.path());
    let gate = sandbox.gate_opens();
    let open = AcpOpen {
        run_id: "r1".into(),
        ..AcpOpen::default()
    };

    let opening = tokio::spawn(acp_open::handle(ctx.clone(), open.clone()));
    wait_until("open_agent called", || sandbox.calls_of("open_agent").len() == 1).await;
    acp_close::handle(
        ctx.clone(),
        AcpClose {
            run_id: "r1".into(),
            remove_instance: false,
        },
    )
    .await;
    gate.add_permits(1);
    opening.await.expect("open task");

    let opened = recv_type(&mut rx, "acp_opened").await;
    assert_eq!(opened["ok"], false);
    assert_eq!(opened["error"], "agent closed");
    assert!(ctx.runs.is_empty().await);
    wait_until("orphan agent stopped", || sandbox.live_agents() == 0).await;

    gate.add_permits(1);
    acp_open::handle(ctx.clone(), open).await;
    assert_eq!(recv_type(&mut rx, "acp_opened").await["ok"], true);
    let run = ctx.runs.get("r1").await.expect("run registered again");
    assert!(run.agent().is_some_and(|a| !a.is_closed()));
    assert_eq!(sandbox.live_agents(), 1);
}
