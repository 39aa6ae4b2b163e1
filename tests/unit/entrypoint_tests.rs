//! Unit tests for the container entrypoint script.

use std::collections::BTreeMap;

use acp_proxy::acp::init_marker::INIT_MARKER_PREFIX;
use acp_proxy::sandbox::entrypoint::build_entrypoint_script;

fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

#[test]
fn script_without_init_execs_agent() {
    let script = build_entrypoint_script("/workspace", None, &BTreeMap::new());

    assert!(script.starts_with("set -euo pipefail"));
    assert!(script.contains("workspace='/workspace'"));
    assert!(!script.contains(INIT_MARKER_PREFIX));
    assert!(script.ends_with(r#"exec "$@""#));
}

#[test]
fn init_script_reports_marker_on_stderr() {
    let script = build_entrypoint_script("/workspace", Some("git clone x ."), &BTreeMap::new());

    assert!(script.contains("git clone x ."));
    assert!(script.contains(&format!("marker='{INIT_MARKER_PREFIX}'")));
    assert!(script.contains(r#"{"ok":false,"exitCode":%s}"#));
    assert!(script.contains(r#"{"ok":true,"exitCode":0}"#));

    let init_at = script.find("git clone").expect("init body");
    let exec_at = script.find(r#"exec "$@""#).expect("exec line");
    assert!(init_at < exec_at, "init must run before the agent");
}

#[test]
fn blank_init_script_is_ignored() {
    let script = build_entrypoint_script("/workspace", Some("   \n"), &BTreeMap::new());
    assert!(!script.contains(INIT_MARKER_PREFIX));
}

#[test]
fn env_is_exported_quoted_and_invalid_keys_dropped() {
    let script = build_entrypoint_script(
        "/workspace",
        None,
        &env(&[("GOOD_KEY", "it's"), ("bad-key", "x"), ("1NUM", "y")]),
    );

    assert!(script.contains(r"export GOOD_KEY=$'it\'s'"));
    assert!(!script.contains("bad-key"));
    assert!(!script.contains("1NUM"));
}
