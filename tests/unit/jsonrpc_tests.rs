//! Unit tests for JSON-RPC message classification and frame builders.

use serde_json::json;

use acp_proxy::acp::jsonrpc::{
    self, id_key, RpcError, RpcMessage, AUTH_REQUIRED, INTERNAL_ERROR, METHOD_NOT_FOUND,
};

// ── Classification ───────────────────────────────────────────────────────────

#[test]
fn request_has_id_and_method() {
    let msg = RpcMessage::classify(json!({
        "jsonrpc": "2.0",
        "id": 3,
        "method": "fs/read_text_file",
        "params": { "path": "/workspace/a.txt" }
    }));

    assert_eq!(
        msg,
        Some(RpcMessage::Request {
            id: json!(3),
            method: "fs/read_text_file".into(),
            params: json!({ "path": "/workspace/a.txt" }),
        })
    );
}

#[test]
fn notification_without_params_gets_null() {
    let msg = RpcMessage::classify(json!({ "jsonrpc": "2.0", "method": "session/update" }));

    assert_eq!(
        msg,
        Some(RpcMessage::Notification {
            method: "session/update".into(),
            params: serde_json::Value::Null,
        })
    );
}

#[test]
fn error_response_carries_code() {
    let msg = RpcMessage::classify(json!({
        "jsonrpc": "2.0",
        "id": "9",
        "error": { "code": AUTH_REQUIRED, "message": "auth required" }
    }));

    let Some(RpcMessage::Response { id, outcome }) = msg else {
        panic!("expected a response");
    };
    assert_eq!(id, json!("9"));
    let err = outcome.expect_err("error outcome");
    assert_eq!(err.code, AUTH_REQUIRED);
    assert_eq!(err.message, "auth required");
}

/// An error object without a numeric code still surfaces its message.
#[test]
fn loose_error_object_maps_to_internal() {
    let msg = RpcMessage::classify(json!({ "id": 1, "error": { "message": "boom" } }));

    let Some(RpcMessage::Response { outcome, .. }) = msg else {
        panic!("expected a response");
    };
    let err = outcome.expect_err("error outcome");
    assert_eq!(err.code, INTERNAL_ERROR);
    assert_eq!(err.message, "boom");
}

#[test]
fn null_id_with_method_is_a_notification() {
    let msg = RpcMessage::classify(json!({ "id": null, "method": "ping" }));
    assert!(matches!(msg, Some(RpcMessage::Notification { .. })));
}

#[test]
fn non_rpc_values_are_ignored() {
    assert!(RpcMessage::classify(json!([1, 2])).is_none());
    assert!(RpcMessage::classify(json!({ "hello": "world" })).is_none());
}

// ── Ids and frames ───────────────────────────────────────────────────────────

#[test]
fn numeric_and_string_ids_correlate() {
    assert_eq!(id_key(&json!(5)), id_key(&json!("5")));
    assert!(id_key(&json!({ "id": 5 })).is_none());
}

#[test]
fn frames_are_versioned() {
    let req = jsonrpc::request(1, "initialize", json!({}));
    assert_eq!(req["jsonrpc"], "2.0");
    assert_eq!(req["id"], 1);

    let err = jsonrpc::error_response(json!(4), &RpcError::method_not_found("x/y"));
    assert_eq!(err["error"]["code"], METHOD_NOT_FOUND);
    assert!(err["error"].get("data").is_none());
}
