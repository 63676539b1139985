//! The request planner: router → security → execution (→ sync).
//!
//! Every stage is one call to the active completion backend with a
//! stage-specific prompt and a flat context map; the completion is parsed
//! into a typed decision. A backend failure or an unparseable completion
//! falls back to the deterministic heuristic for that stage only, and the
//! resulting plan carries a `*_fallback` marker that the audit trail
//! records. The orchestrator never retries a backend call.

use std::collections::BTreeMap;
use std::sync::Arc;

use nacc_backend::heuristic::HeuristicBackend;
use nacc_backend::manager::BackendManager;
use nacc_backend::{BackendContext, ContextValue, LlmBackend};
use nacc_protocol::{
    DEFAULT_COMMAND_TIMEOUT_SECS, ExecProfile, ExecutionPlan, MAX_COMMAND_TIMEOUT_SECS,
    SecurityVerdict, SyncStrategy,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::registry::NodeSnapshot;

/// What the planner needs to know about a command request.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub description: String,
    pub argv: Vec<String>,
    pub tag_hints: Vec<String>,
    pub parallelism: usize,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RouterDecision {
    selected_node_ids: Vec<String>,
    #[serde(default)]
    router_reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
enum SecurityDecision {
    Allow,
    Deny {
        #[serde(default)]
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
struct ExecDecision {
    timeout_seconds: u64,
    #[serde(default)]
    env_overrides: BTreeMap<String, String>,
    #[serde(default)]
    sandbox_hints: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SyncDecision {
    strategy: SyncStrategy,
}

pub struct Planner {
    backends: Arc<BackendManager>,
}

impl Planner {
    pub fn new(backends: Arc<BackendManager>) -> Self {
        Self { backends }
    }

    /// Run the fixed pipeline for a command request against one health
    /// snapshot. The snapshot is the same one dispatch will filter on.
    pub async fn plan_command(
        &self,
        spec: &CommandSpec,
        snapshot: &[NodeSnapshot],
    ) -> ExecutionPlan {
        let healthy: Vec<&NodeSnapshot> = snapshot.iter().filter(|node| node.healthy).collect();
        if healthy.is_empty() {
            return ExecutionPlan::denied("no healthy candidate nodes", "no candidates to route");
        }

        // Router.
        let router_context = self.router_context(spec, &healthy);
        let router_prompt = format!(
            "You are the router agent of a node control plane. Choose an ordered subset \
             of node ids for this task and give one short reason. Respond with a JSON \
             object {{\"selected_node_ids\": [...], \"router_reason\": \"...\"}}.\n\
             Task: {}",
            spec.description
        );
        let (router, router_fallback) = self
            .stage_decision::<RouterDecision>(
                "router",
                &router_prompt,
                &router_context,
                |decision| validate_router(decision, &healthy),
            )
            .await;
        let Some(router) = router else {
            return ExecutionPlan::denied(
                "router produced no usable selection",
                "router stage failed",
            );
        };

        // Security: the allow-list intersection across the selected nodes.
        let intersection = allowlist_intersection(&router.selected_node_ids, snapshot);
        let argv0 = spec.argv.first().cloned().unwrap_or_default();
        let mut security_context = BackendContext::new();
        security_context.insert("stage".into(), "security".into());
        security_context.insert("argv0".into(), basename(&argv0).into());
        security_context.insert(
            "allowed_commands".into(),
            serde_json::to_string(&intersection).unwrap_or_default().into(),
        );
        let security_prompt = format!(
            "You are the security agent. Decide whether command '{argv0}' may run on the \
             selected nodes. Respond with {{\"verdict\":\"allow\"}} or \
             {{\"verdict\":\"deny\",\"reason\":\"...\"}}."
        );
        let (security, security_fallback) = self
            .stage_decision::<SecurityDecision>(
                "security",
                &security_prompt,
                &security_context,
                Some,
            )
            .await;
        let verdict = match security {
            Some(SecurityDecision::Allow) => SecurityVerdict::Allow,
            Some(SecurityDecision::Deny { reason }) => SecurityVerdict::Deny { reason },
            None => SecurityVerdict::Deny {
                reason: "security stage produced no verdict".to_string(),
            },
        };
        if let SecurityVerdict::Deny { reason } = &verdict {
            let mut plan = ExecutionPlan::denied(reason.clone(), router.router_reason);
            plan.router_fallback = router_fallback;
            plan.security_fallback = security_fallback;
            return plan;
        }

        // Execution profile.
        let mut exec_context = BackendContext::new();
        exec_context.insert("stage".into(), "execution".into());
        exec_context.insert(
            "timeout_requested".into(),
            ContextValue::Number(
                spec.timeout_seconds.unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS) as f64,
            ),
        );
        let exec_prompt = format!(
            "You are the execution agent. Produce an execution profile for running \
             {:?} on {} node(s). Respond with {{\"timeout_seconds\": N}} and optional \
             \"env_overrides\" and \"sandbox_hints\".",
            spec.argv,
            router.selected_node_ids.len()
        );
        let (exec, exec_fallback) = self
            .stage_decision::<ExecDecision>("execution", &exec_prompt, &exec_context, Some)
            .await;
        let profile = match exec {
            Some(decision) => ExecProfile {
                timeout_seconds: decision.timeout_seconds.clamp(1, MAX_COMMAND_TIMEOUT_SECS),
                env_overrides: decision.env_overrides,
                sandbox_hints: decision.sandbox_hints,
            },
            None => ExecProfile {
                timeout_seconds: spec
                    .timeout_seconds
                    .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS)
                    .clamp(1, MAX_COMMAND_TIMEOUT_SECS),
                ..ExecProfile::default()
            },
        };

        let parallelism = spec
            .parallelism
            .max(1)
            .min(router.selected_node_ids.len());
        ExecutionPlan {
            selected_node_ids: router.selected_node_ids,
            parallelism,
            router_reason: router.router_reason,
            security_verdict: SecurityVerdict::Allow,
            exec_profile: profile,
            router_fallback,
            security_fallback,
            exec_fallback,
        }
    }

    /// Strategy selection for sync requests that left it unspecified.
    /// Returns (strategy, fallback_used).
    pub async fn plan_sync_strategy(&self, source_path: &str) -> (SyncStrategy, bool) {
        let mut context = BackendContext::new();
        context.insert("stage".into(), "sync".into());
        let prompt = format!(
            "You are the sync agent. Pick a strategy for replicating '{source_path}': \
             respond with {{\"strategy\":\"mirror\"}}, {{\"strategy\":\"append\"}} or \
             {{\"strategy\":\"dry_run\"}}."
        );
        let (decision, fallback) = self
            .stage_decision::<SyncDecision>("sync", &prompt, &context, Some)
            .await;
        (
            decision.map(|d| d.strategy).unwrap_or(SyncStrategy::Mirror),
            fallback,
        )
    }

    fn router_context(&self, spec: &CommandSpec, healthy: &[&NodeSnapshot]) -> BackendContext {
        let candidates: Vec<serde_json::Value> = healthy
            .iter()
            .map(|node| {
                serde_json::json!({
                    "node_id": node.node_id,
                    "tags": node.tags,
                    "cpu_percent": node.cpu_percent,
                    "memory_percent": node.memory_percent,
                })
            })
            .collect();
        let mut context = BackendContext::new();
        context.insert("stage".into(), "router".into());
        context.insert(
            "candidates".into(),
            serde_json::Value::Array(candidates).to_string().into(),
        );
        context.insert(
            "tag_hints".into(),
            serde_json::to_string(&spec.tag_hints).unwrap_or_default().into(),
        );
        context.insert(
            "parallelism".into(),
            ContextValue::Number(spec.parallelism.max(1) as f64),
        );
        context
    }

    /// One stage: active backend first, heuristic on failure. `validate`
    /// both checks and normalizes the parsed decision; returning `None`
    /// rejects it and triggers the fallback path.
    async fn stage_decision<T: DeserializeOwned>(
        &self,
        stage: &str,
        prompt: &str,
        context: &BackendContext,
        validate: impl Fn(T) -> Option<T> + Copy,
    ) -> (Option<T>, bool) {
        let backend = self.backends.active().await;
        match backend.complete(prompt, context).await {
            Ok(completion) => {
                if let Some(decision) = parse_decision(&completion).and_then(validate) {
                    return (Some(decision), false);
                }
                tracing::warn!(stage, "backend completion unparseable; using heuristic");
            }
            Err(err) => {
                tracing::warn!(stage, error = %err, "backend failed; using heuristic");
            }
        }
        let fallback = HeuristicBackend
            .complete(prompt, context)
            .await
            .ok()
            .and_then(|completion| parse_decision(&completion))
            .and_then(validate);
        (fallback, true)
    }
}

fn basename(argv0: &str) -> String {
    std::path::Path::new(argv0)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| argv0.to_string())
}

fn validate_router(decision: RouterDecision, healthy: &[&NodeSnapshot]) -> Option<RouterDecision> {
    if decision.selected_node_ids.is_empty() {
        return None;
    }
    let mut seen = std::collections::BTreeSet::new();
    for id in &decision.selected_node_ids {
        // Duplicates rejected; so is anything outside the healthy snapshot.
        if !seen.insert(id) || !healthy.iter().any(|node| &node.node_id == id) {
            return None;
        }
    }
    Some(decision)
}

fn allowlist_intersection(selected: &[String], snapshot: &[NodeSnapshot]) -> Vec<String> {
    let mut iter = selected.iter().filter_map(|id| {
        snapshot
            .iter()
            .find(|node| &node.node_id == id)
            .map(|node| node.allowed_commands.clone())
    });
    let Some(first) = iter.next() else {
        return Vec::new();
    };
    iter.fold(first, |acc, list| {
        acc.into_iter().filter(|cmd| list.contains(cmd)).collect()
    })
}

/// Completions may wrap their JSON in prose; take the first balanced object.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_decision<T: DeserializeOwned>(completion: &str) -> Option<T> {
    let object = extract_json_object(completion)?;
    serde_json::from_str(object).ok()
}
