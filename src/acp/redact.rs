//! Secret redaction for diagnostic lines forwarded to the orchestrator.

use std::collections::BTreeMap;

use regex::Regex;
use tracing::warn;

/// Replacement text for redacted values.
pub const REDACTED: &str = "[REDACTED]";

const SECRET_KEY_MARKERS: &[&str] = &[
    "TOKEN",
    "SECRET",
    "PASSWORD",
    "PASSWD",
    "API_KEY",
    "APIKEY",
    "PRIVATE_KEY",
    "CREDENTIAL",
    "AUTH",
];

/// Values shorter than this are never treated as secrets; redacting them
/// would mangle ordinary output.
const MIN_SECRET_LEN: usize = 4;

/// Pick the values of secret-looking keys from an environment map.
#[must_use]
pub fn pick_secret_values(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter()
        .filter(|(key, _)| {
            let upper = key.to_ascii_uppercase();
            SECRET_KEY_MARKERS.iter().any(|m| upper.contains(m))
        })
        .map(|(_, value)| value.trim().to_owned())
        .filter(|value| value.len() >= MIN_SECRET_LEN)
        .collect()
}

/// Replaces known secret values and configured patterns in text.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
    patterns: Vec<Regex>,
}

impl Redactor {
    /// Build a redactor from literal secrets and regex patterns.
    ///
    /// Invalid patterns are logged and skipped.
    #[must_use]
    pub fn new(secrets: impl IntoIterator<Item = String>, patterns: &[String]) -> Self {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .filter(|s| s.len() >= MIN_SECRET_LEN)
            .collect();
        // Longest first so a secret containing another is replaced whole.
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        secrets.dedup();

        let patterns = patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(err) => {
                    warn!(pattern = %p, %err, "invalid redact pattern, skipping");
                    None
                }
            })
            .collect();

        Self { secrets, patterns }
    }

    /// Copy of this redactor with extra literal secrets.
    #[must_use]
    pub fn with_secrets(&self, extra: impl IntoIterator<Item = String>) -> Self {
        let mut secrets = self.secrets.clone();
        secrets.extend(extra.into_iter().filter(|s| s.len() >= MIN_SECRET_LEN));
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        secrets.dedup();
        Self {
            secrets,
            patterns: self.patterns.clone(),
        }
    }

    /// Redact `line`.
    #[must_use]
    pub fn redact(&self, line: &str) -> String {
        let mut out = line.to_owned();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        for re in &self.patterns {
            if re.is_match(&out) {
                out = re.replace_all(&out, REDACTED).into_owned();
            }
        }
        out
    }
}
