//! Bash entrypoint for containers whose main process is the agent.
//!
//! The script prepares the workspace, exports the init environment, runs the
//! init script (if any) with its output on stderr, reports the result as an
//! init marker line and finally `exec`s the agent command passed after `--`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::acp::init_marker::INIT_MARKER_PREFIX;

/// Quote `value` as a bash `$'…'` string.
#[must_use]
pub fn bash_ansi_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 3);
    out.push_str("$'");
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Quote `value` as a single-quoted POSIX shell word.
#[must_use]
pub fn shell_single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Whether `key` is usable as a shell variable name.
#[must_use]
pub fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Render the entrypoint script.
#[must_use]
pub fn build_entrypoint_script(
    working_dir: &str,
    init_script: Option<&str>,
    init_env: &BTreeMap<String, String>,
) -> String {
    let mut lines: Vec<String> = vec![
        "set -euo pipefail".into(),
        format!("workspace={}", shell_single_quote(working_dir)),
        r#"mkdir -p "$workspace" >/dev/null 2>&1 || true"#.into(),
    ];

    for (key, value) in init_env {
        if is_valid_env_key(key) {
            lines.push(format!("export {key}={}", bash_ansi_quote(value)));
        }
    }

    if let Some(script) = init_script.map(str::trim).filter(|s| !s.is_empty()) {
        lines.push(format!("marker={}", shell_single_quote(INIT_MARKER_PREFIX)));
        lines.push("set +e".into());
        lines.push("(".into());
        lines.push(script.to_owned());
        lines.push(") 1>&2".into());
        lines.push("code=$?".into());
        lines.push("set -e".into());
        lines.push("if [ $code -ne 0 ]; then".into());
        lines.push(r#"  printf '%s{"ok":false,"exitCode":%s}\n' "$marker" "$code" >&2"#.into());
        lines.push("  exit $code".into());
        lines.push("fi".into());
        lines.push(r#"printf '%s{"ok":true,"exitCode":0}\n' "$marker" >&2"#.into());
    }

    lines.push("if [ $# -eq 0 ]; then".into());
    lines.push(r#"  echo "agent_command is empty" >&2"#.into());
    lines.push("  exit 2".into());
    lines.push("fi".into());
    lines.push(r#"exec "$@""#.into());

    lines.join("\n")
}
