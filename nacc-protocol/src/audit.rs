//! Append-only audit records.
//!
//! One JSON object per line, LF-terminated, UTF-8, no BOM. Sequence numbers
//! are assigned at enqueue time by the orchestrator's audit writer and form
//! the gap-free prefix 1..=N within a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ListFiles,
    ReadFile,
    WriteFile,
    ExecuteCommand,
    SyncPath,
    AgentProbe,
    BackendSwitch,
    NodeRegister,
    HealthTransition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Strictly increasing, gap-free within one run. Assigned by the writer.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// Opaque caller identity, or "system" for orchestrator-internal events.
    pub actor: String,
    pub action: AuditAction,
    /// Node id, or "*" for fleet-wide actions.
    pub target: String,
    /// sha256 of the canonical JSON input, hex.
    pub fingerprint: String,
    pub outcome: AuditOutcome,
    /// Stage fallback markers and other small annotations.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub detail: std::collections::BTreeMap<String, serde_json::Value>,
}

/// Fingerprint a request body: sha256 over its canonical JSON form.
///
/// Canonical here means serde_json with object keys sorted, which
/// `serde_json::Value` gives us by re-serializing through a `BTreeMap`.
pub fn request_fingerprint(input: &serde_json::Value) -> String {
    let canonical = canonicalize(input);
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex_digest(hasher)
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: std::collections::BTreeMap<_, _> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            serde_json::to_value(sorted).unwrap_or_default()
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

fn hex_digest(hasher: Sha256) -> String {
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fingerprint_ignores_key_order() {
        let a = serde_json::json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = serde_json::json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(request_fingerprint(&a), request_fingerprint(&b));
    }

    #[test]
    fn fingerprint_distinguishes_values() {
        let a = serde_json::json!({"argv": ["echo", "hi"]});
        let b = serde_json::json!({"argv": ["echo", "ho"]});
        assert_ne!(request_fingerprint(&a), request_fingerprint(&b));
    }

    #[test]
    fn event_line_is_single_json_object() {
        let event = AuditEvent {
            seq: 1,
            timestamp: Utc::now(),
            actor: "system".to_string(),
            action: AuditAction::HealthTransition,
            target: "node-a".to_string(),
            fingerprint: request_fingerprint(&serde_json::json!({})),
            outcome: AuditOutcome::Success,
            detail: Default::default(),
        };
        let line = serde_json::to_string(&event).unwrap();
        assert!(!line.contains('\n'));
        let parsed: AuditEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.seq, 1);
        assert_eq!(parsed.action, AuditAction::HealthTransition);
    }
}
