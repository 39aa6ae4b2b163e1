//! Unit tests for agent-inputs manifest parsing and host materialization.

use serde_json::json;

use acp_proxy::runs::agent_inputs::{parse_agent_inputs, ApplyMethod, InputSource};
use acp_proxy::AppError;

// ── Parsing ──────────────────────────────────────────────────────────────────

#[test]
fn absent_or_null_manifest_is_none() {
    assert!(parse_agent_inputs(None).expect("absent").is_none());
    assert!(parse_agent_inputs(Some(&json!(null))).expect("null").is_none());
}

#[test]
fn valid_manifest_parses_items_in_order() {
    let manifest = parse_agent_inputs(Some(&json!({
        "version": 1,
        "items": [
            {
                "id": "agents-md",
                "apply": "writeFile",
                "source": { "type": "inlineText", "text": "# rules" },
                "target": { "root": "WORKSPACE", "path": "AGENTS.md" }
            },
            {
                "id": "cfg",
                "apply": "copy",
                "source": { "type": "hostPath", "path": "/etc/agent" },
                "target": { "root": "USER_HOME", "path": ".config/agent" }
            }
        ]
    })))
    .expect("manifest parses")
    .expect("manifest present");

    assert_eq!(manifest.items.len(), 2);
    assert_eq!(manifest.items[0].apply, ApplyMethod::WriteFile);
    assert!(matches!(&manifest.items[1].source, InputSource::HostPath { path } if path == "/etc/agent"));
}

#[test]
fn unsupported_version_is_rejected() {
    let result = parse_agent_inputs(Some(&json!({ "version": 2, "items": [] })));
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[test]
fn env_patch_keys_are_restricted() {
    let ok = parse_agent_inputs(Some(&json!({
        "version": 1,
        "envPatch": { "HOME": "/root", "USER": "agent", "LOGNAME": "agent" },
        "items": []
    })));
    assert!(ok.is_ok());

    let bad = parse_agent_inputs(Some(&json!({
        "version": 1,
        "envPatch": { "PATH": "/evil" },
        "items": []
    })));
    assert!(matches!(bad, Err(AppError::Validation(msg)) if msg.contains("PATH")));
}

#[test]
fn escaping_or_absolute_targets_are_rejected() {
    for path in ["../up", "/abs", "a/../../b"] {
        let result = parse_agent_inputs(Some(&json!({
            "version": 1,
            "items": [{
                "id": "x",
                "apply": "writeFile",
                "source": { "type": "inlineText", "text": "" },
                "target": { "root": "WORKSPACE", "path": path }
            }]
        })));
        assert!(result.is_err(), "{path} must be rejected");
    }
}

#[test]
fn download_extract_is_not_supported() {
    let result = parse_agent_inputs(Some(&json!({
        "version": 1,
        "items": [{
            "id": "zip",
            "apply": "downloadExtract",
            "source": { "type": "httpZip", "uri": "https://example.invalid/a.zip" },
            "target": { "root": "WORKSPACE", "path": "vendor" }
        }]
    })));
    assert!(matches!(result, Err(AppError::Validation(msg)) if msg.contains("downloadExtract")));
}

#[test]
fn source_must_match_apply_method() {
    let result = parse_agent_inputs(Some(&json!({
        "version": 1,
        "items": [{
            "id": "m",
            "apply": "bindMount",
            "source": { "type": "inlineText", "text": "nope" },
            "target": { "root": "WORKSPACE", "path": "x" }
        }]
    })));
    assert!(result.is_err());

    let relative_host = parse_agent_inputs(Some(&json!({
        "version": 1,
        "items": [{
            "id": "m",
            "apply": "copy",
            "source": { "type": "hostPath", "path": "relative/dir" },
            "target": { "root": "WORKSPACE", "path": "x" }
        }]
    })));
    assert!(relative_host.is_err());
}

// ── Host items ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn write_file_and_copy_land_under_their_roots() {
    let temp = tempfile::tempdir().expect("tempdir");
    let source = temp.path().join("source");
    std::fs::create_dir_all(source.join("nested")).expect("source dir");
    std::fs::write(source.join("nested/a.txt"), "alpha").expect("source file");
    let workspace = temp.path().join("run-1");
    let home = temp.path().join("home-1");

    let manifest = parse_agent_inputs(Some(&json!({
        "version": 1,
        "items": [
            {
                "id": "notes",
                "apply": "writeFile",
                "source": { "type": "inlineText", "text": "hello" },
                "target": { "root": "WORKSPACE", "path": "docs/NOTES.md" }
            },
            {
                "id": "tree",
                "apply": "copy",
                "source": { "type": "hostPath", "path": source.display().to_string() },
                "target": { "root": "USER_HOME", "path": "copied" }
            }
        ]
    })))
    .expect("manifest parses")
    .expect("manifest present");

    manifest
        .apply_host_items("1", &workspace, Some(&home))
        .await
        .expect("items applied");

    let notes = std::fs::read_to_string(workspace.join("docs/NOTES.md")).expect("notes written");
    assert_eq!(notes, "hello");
    let copied = std::fs::read_to_string(home.join("copied/nested/a.txt")).expect("tree copied");
    assert_eq!(copied, "alpha");
}

#[tokio::test]
async fn user_home_item_without_home_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    let manifest = parse_agent_inputs(Some(&json!({
        "version": 1,
        "items": [{
            "id": "rc",
            "apply": "writeFile",
            "source": { "type": "inlineText", "text": "x" },
            "target": { "root": "USER_HOME", "path": ".rc" }
        }]
    })))
    .expect("manifest parses")
    .expect("manifest present");

    let result = manifest.apply_host_items("1", temp.path(), None).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
}
