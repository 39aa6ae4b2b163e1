//! Unit tests for configuration parsing, validation and environment
//! overrides.

use std::io::Write;

use acp_proxy::config::{ContainerCli, SandboxProviderKind, WorkspaceCheckout};
use acp_proxy::{AppError, ProxyConfig};

fn sample_toml(root: &str) -> String {
    format!(
        r#"
orchestrator_url = "ws://127.0.0.1:9000/agents"
auth_token = "proxy-token-123"

[agent]
id = "agent-1"

[sandbox]
image = "ghcr.io/acme/agent:latest"
workspace_host_root = '{root}'

[sandbox.env]
GITHUB_TOKEN = "ghp_abcdef"
LANG = "C.UTF-8"
"#
    )
}

fn parse(toml: &str) -> Result<ProxyConfig, AppError> {
    ProxyConfig::from_toml_str(toml)
}

// ── Defaults ─────────────────────────────────────────────────────────────────

#[test]
fn minimal_config_gets_defaults() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = parse(&sample_toml(temp.path().to_str().expect("utf8 path")))
        .expect("config parses");

    assert_eq!(config.agent.display_name(), "agent-1");
    assert_eq!(config.agent.max_concurrent, 1);
    assert_eq!(config.heartbeat_seconds, 30);
    assert_eq!(config.sandbox.provider, SandboxProviderKind::ContainerOci);
    assert_eq!(config.sandbox.runtime, ContainerCli::Docker);
    assert_eq!(config.sandbox.working_dir, "/workspace");
    assert_eq!(config.sandbox.user_home_guest_path, "/root");
    assert_eq!(config.sandbox.instance_prefix, "acp-run-");
    assert_eq!(config.sandbox.keepalive_ttl_seconds, 1800);
    assert!(config.sandbox.per_run_root_enabled);
    assert!(!config.sandbox.terminal_enabled);
    assert_eq!(config.sandbox.workspace_checkout, WorkspaceCheckout::Worktree);
    assert!(!config.permission_ask);
    assert!(!config.agent_command.is_empty());
}

#[test]
fn secrets_include_token_and_secret_env() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = parse(&sample_toml(temp.path().to_str().expect("utf8 path")))
        .expect("config parses");

    let secrets = config.secret_values();
    assert!(secrets.contains(&"proxy-token-123".to_owned()));
    assert!(secrets.contains(&"ghp_abcdef".to_owned()));
    assert!(!secrets.contains(&"C.UTF-8".to_owned()));
}

// ── Validation ───────────────────────────────────────────────────────────────

#[test]
fn orchestrator_url_must_be_websocket() {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = sample_toml(temp.path().to_str().expect("utf8 path"))
        .replace("ws://127.0.0.1:9000/agents", "http://127.0.0.1:9000");

    assert!(matches!(parse(&toml), Err(AppError::Config(_))));
}

#[test]
fn container_provider_requires_image() {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = sample_toml(temp.path().to_str().expect("utf8 path"))
        .replace("image = \"ghcr.io/acme/agent:latest\"", "image = \"\"");

    let err = parse(&toml).expect_err("image is required");
    assert!(err.to_string().contains("sandbox.image"));
}

#[test]
fn bwrap_provider_needs_no_image() {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = sample_toml(temp.path().to_str().expect("utf8 path")).replace(
        "image = \"ghcr.io/acme/agent:latest\"",
        "provider = \"bwrap\"",
    );

    let config = parse(&toml).expect("bwrap config parses");
    assert_eq!(config.sandbox.provider, SandboxProviderKind::Bwrap);
}

#[test]
fn empty_agent_id_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = sample_toml(temp.path().to_str().expect("utf8 path"))
        .replace("id = \"agent-1\"", "id = \"  \"");

    assert!(matches!(parse(&toml), Err(AppError::Config(_))));
}

#[test]
fn keepalive_ttl_is_clamped() {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = sample_toml(temp.path().to_str().expect("utf8 path")).replace(
        "[sandbox]\n",
        "[sandbox]\nkeepalive_ttl_seconds = 5\n",
    );
    let config = parse(&toml).expect("config parses");
    assert_eq!(config.sandbox.keepalive_ttl_seconds, 60);
}

#[test]
fn invalid_instance_prefix_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let toml = sample_toml(temp.path().to_str().expect("utf8 path")).replace(
        "[sandbox]\n",
        "[sandbox]\ninstance_prefix = \"-bad/\"\n",
    );

    assert!(matches!(parse(&toml), Err(AppError::Config(_))));
}

// ── Environment overrides ────────────────────────────────────────────────────

#[test]
fn overrides_come_from_lookup() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = parse(&sample_toml(temp.path().to_str().expect("utf8 path")))
        .expect("config parses");

    config
        .apply_env_overrides(|key| match key {
            "ACP_PROXY_AGENT_ID" => Some("agent-from-env".to_owned()),
            "ACP_PROXY_CONTAINER_RUNTIME" => Some("podman".to_owned()),
            "ACP_PROXY_AUTH_TOKEN" => Some("   ".to_owned()),
            _ => None,
        })
        .expect("overrides apply");

    assert_eq!(config.agent.id, "agent-from-env");
    assert_eq!(config.sandbox.runtime, ContainerCli::Podman);
    assert_eq!(config.auth_token.as_deref(), Some("proxy-token-123"));
}

#[test]
fn flag_overrides_accept_one_and_true() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = parse(&sample_toml(temp.path().to_str().expect("utf8 path")))
        .expect("config parses");

    config
        .apply_env_overrides(|key| match key {
            "ACP_PROXY_TERMINAL_ENABLED" => Some("1".to_owned()),
            "ACP_PROXY_PERMISSION_ASK" => Some("TRUE".to_owned()),
            _ => None,
        })
        .expect("overrides apply");

    assert!(config.sandbox.terminal_enabled);
    assert!(config.permission_ask);
}

#[test]
fn malformed_override_is_a_config_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = parse(&sample_toml(temp.path().to_str().expect("utf8 path")))
        .expect("config parses");

    let result = config.apply_env_overrides(|key| {
        (key == "ACP_PROXY_HEARTBEAT_SECONDS").then(|| "soon".to_owned())
    });
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
#[serial_test::serial]
fn load_from_path_applies_process_env() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("config.toml");
    let mut file = std::fs::File::create(&path).expect("create config file");
    file.write_all(sample_toml(temp.path().to_str().expect("utf8 path")).as_bytes())
        .expect("write config file");

    std::env::set_var("ACP_PROXY_ORCHESTRATOR_URL", "wss://orchestrator.example/ws");
    let loaded = ProxyConfig::load_from_path(&path);
    std::env::remove_var("ACP_PROXY_ORCHESTRATOR_URL");

    let config = loaded.expect("config loads");
    assert_eq!(config.orchestrator_url, "wss://orchestrator.example/ws");
}

#[test]
fn missing_file_is_a_config_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let result = ProxyConfig::load_from_path(temp.path().join("absent.toml"));
    assert!(matches!(result, Err(AppError::Config(_))));
}
