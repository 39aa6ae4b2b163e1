//! Unit tests for stderr redaction and the init marker protocol.

use std::collections::BTreeMap;

use acp_proxy::acp::init_marker::{
    parse_marker_payload, parse_step_line, InitResult, INIT_STEP_PREFIX,
};
use acp_proxy::acp::redact::{pick_secret_values, Redactor, REDACTED};
use acp_proxy::AppError;

// ── Redaction ────────────────────────────────────────────────────────────────

#[test]
fn secrets_and_patterns_are_replaced() {
    let redactor = Redactor::new(
        vec!["hunter2-secret".to_owned()],
        &["ghp_[A-Za-z0-9]+".to_owned()],
    );

    let line = redactor.redact("token=hunter2-secret gh=ghp_abc123 ok");
    assert_eq!(line, format!("token={REDACTED} gh={REDACTED} ok"));
}

#[test]
fn short_values_are_not_secrets() {
    let redactor = Redactor::new(vec!["abc".to_owned()], &[]);
    assert_eq!(redactor.redact("abc abc"), "abc abc");
}

#[test]
fn extra_secrets_extend_a_copy() {
    let base = Redactor::new(Vec::new(), &[]);
    let extended = base.with_secrets(vec!["sk-live-1234".to_owned()]);

    assert_eq!(base.redact("sk-live-1234"), "sk-live-1234");
    assert_eq!(extended.redact("sk-live-1234"), REDACTED);
}

#[test]
fn secret_keys_are_detected_by_name() {
    let env: BTreeMap<String, String> = [
        ("OPENAI_API_KEY", "sk-abcdef"),
        ("GITHUB_TOKEN", "ghp_123456"),
        ("EDITOR", "vim-editor"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v.to_owned()))
    .collect();

    let mut picked = pick_secret_values(&env);
    picked.sort();
    assert_eq!(picked, vec!["ghp_123456".to_owned(), "sk-abcdef".to_owned()]);
}

// ── Init marker ──────────────────────────────────────────────────────────────

#[test]
fn marker_payload_success_and_failure() {
    assert_eq!(
        parse_marker_payload(r#"{"ok":true,"exitCode":0}"#).expect("valid"),
        InitResult {
            ok: true,
            exit_code: Some(0)
        }
    );
    assert_eq!(
        parse_marker_payload(r#" {"ok":false,"exitCode":17} "#).expect("valid"),
        InitResult {
            ok: false,
            exit_code: Some(17)
        }
    );
}

#[test]
fn malformed_marker_is_a_handshake_error() {
    let err = parse_marker_payload("{not json").expect_err("invalid JSON");
    assert!(matches!(&err, AppError::InitHandshake(msg) if msg.contains("payload")));
}

#[test]
fn step_lines_split_into_three_parts() {
    let step = parse_step_line(&format!("{INIT_STEP_PREFIX}clone:done:fetched: 3 refs"))
        .expect("step line");
    assert_eq!(step.stage, "clone");
    assert_eq!(step.status, "done");
    assert_eq!(step.message.as_deref(), Some("fetched: 3 refs"));

    assert!(parse_step_line("plain stderr").is_none());
    assert!(parse_step_line(&format!("{INIT_STEP_PREFIX}:start")).is_none());
}
