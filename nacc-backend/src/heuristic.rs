//! Deterministic heuristic backend.
//!
//! A pure function of (prompt, context): the same input always yields the
//! same completion within a run. When the planner sets a `stage` context
//! key the completion is a well-formed decision for that stage, computed
//! with the same scoring rules the planner's own fallbacks use; otherwise
//! the completion is a digest summary in the manner of a dry model.
//!
//! Planner context contract (all values are scalars; lists travel as
//! pre-serialized JSON strings):
//!
//! - `stage`: "router" | "security" | "execution" | "sync"
//! - `candidates`: JSON array of {node_id, tags, cpu_percent, memory_percent}
//! - `tag_hints`: JSON array of strings
//! - `parallelism`: number
//! - `argv0`, `allowed_commands`: security-stage inputs
//! - `timeout_requested`: number, execution stage

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{BackendContext, BackendError, ContextValue, LlmBackend};

pub struct HeuristicBackend;

#[derive(Debug, Deserialize)]
struct Candidate {
    node_id: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default = "full_load")]
    cpu_percent: f32,
    #[serde(default = "full_load")]
    memory_percent: f32,
}

fn full_load() -> f32 {
    100.0
}

#[async_trait]
impl LlmBackend for HeuristicBackend {
    fn kind(&self) -> &'static str {
        "heuristic"
    }

    async fn complete(
        &self,
        prompt: &str,
        context: &BackendContext,
    ) -> Result<String, BackendError> {
        match stage(context) {
            Some("router") => Ok(route(context)),
            Some("security") => Ok(authorize(context)),
            Some("execution") => Ok(execution_profile(context)),
            Some("sync") => Ok(r#"{"strategy":"mirror"}"#.to_string()),
            _ => Ok(summary(prompt, context)),
        }
    }
}

fn stage(context: &BackendContext) -> Option<&str> {
    match context.get("stage") {
        Some(ContextValue::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

fn str_value<'a>(context: &'a BackendContext, key: &str) -> Option<&'a str> {
    match context.get(key) {
        Some(ContextValue::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

fn num_value(context: &BackendContext, key: &str) -> Option<f64> {
    match context.get(key) {
        Some(ContextValue::Number(n)) => Some(*n),
        _ => None,
    }
}

/// Tag overlap first, inverse load as the tie-break, top-k.
fn route(context: &BackendContext) -> String {
    let candidates: Vec<Candidate> = str_value(context, "candidates")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    let hints: Vec<String> = str_value(context, "tag_hints")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    let parallelism = num_value(context, "parallelism").unwrap_or(1.0).max(1.0) as usize;

    let mut scored: Vec<(usize, f32, &Candidate)> = candidates
        .iter()
        .map(|candidate| {
            let overlap = candidate
                .tags
                .iter()
                .filter(|tag| hints.contains(tag))
                .count();
            let load = (candidate.cpu_percent + candidate.memory_percent) / 2.0;
            (overlap, load, candidate)
        })
        .collect();
    scored.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then(a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .then(a.2.node_id.cmp(&b.2.node_id))
    });

    let selected: Vec<&str> = scored
        .iter()
        .take(parallelism)
        .map(|(_, _, candidate)| candidate.node_id.as_str())
        .collect();
    let reason = if hints.is_empty() {
        format!("selected {} by lowest load", selected.join(", "))
    } else {
        format!(
            "selected {} by overlap with tags [{}] and lowest load",
            selected.join(", "),
            hints.join(", ")
        )
    };
    serde_json::json!({
        "selected_node_ids": selected,
        "router_reason": reason,
    })
    .to_string()
}

/// Deny iff `argv0` is missing from the allow-list intersection.
fn authorize(context: &BackendContext) -> String {
    let argv0 = str_value(context, "argv0").unwrap_or_default();
    let allowed: Vec<String> = str_value(context, "allowed_commands")
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default();
    if argv0.is_empty() || allowed.iter().any(|cmd| cmd == argv0) {
        r#"{"verdict":"allow"}"#.to_string()
    } else {
        serde_json::json!({
            "verdict": "deny",
            "reason": format!("command '{argv0}' is not allowed on every selected node"),
        })
        .to_string()
    }
}

fn execution_profile(context: &BackendContext) -> String {
    let requested = num_value(context, "timeout_requested").unwrap_or(30.0);
    let timeout = requested.clamp(1.0, 600.0) as u64;
    serde_json::json!({ "timeout_seconds": timeout }).to_string()
}

/// Free-form prompts get a digest summary, never an error.
fn summary(prompt: &str, context: &BackendContext) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    if let Ok(canonical) = serde_json::to_string(context) {
        hasher.update(canonical.as_bytes());
    }
    let digest = hasher.finalize();
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    serde_json::json!({
        "summary": {
            "prompt_digest": short,
            "context_keys": context.keys().collect::<Vec<_>>(),
        },
        "explanation": "heuristic backend completion",
    })
    .to_string()
}
