//! Execution plans produced by the orchestrator's planner.

use serde::{Deserialize, Serialize};

/// Verdict from the security stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum SecurityVerdict {
    Allow,
    Deny { reason: String },
}

impl SecurityVerdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, SecurityVerdict::Allow)
    }
}

/// Execution profile from the execution stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecProfile {
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub env_overrides: std::collections::BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sandbox_hints: Vec<String>,
}

impl Default for ExecProfile {
    fn default() -> Self {
        Self {
            timeout_seconds: crate::DEFAULT_COMMAND_TIMEOUT_SECS,
            env_overrides: Default::default(),
            sandbox_hints: Vec::new(),
        }
    }
}

/// The planner's output, returned to callers alongside per-node results.
/// Denied requests carry an empty selection and a populated verdict so that
/// clients never need to special-case the shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Ordered; dispatch results preserve this order.
    pub selected_node_ids: Vec<String>,
    pub parallelism: usize,
    pub router_reason: String,
    pub security_verdict: SecurityVerdict,
    pub exec_profile: ExecProfile,
    /// Set when the router stage used the deterministic fallback.
    #[serde(default)]
    pub router_fallback: bool,
    #[serde(default)]
    pub security_fallback: bool,
    #[serde(default)]
    pub exec_fallback: bool,
}

impl ExecutionPlan {
    /// A plan that selects nothing, used for denials.
    pub fn denied(reason: impl Into<String>, router_reason: impl Into<String>) -> Self {
        Self {
            selected_node_ids: Vec::new(),
            parallelism: 0,
            router_reason: router_reason.into(),
            security_verdict: SecurityVerdict::Deny {
                reason: reason.into(),
            },
            exec_profile: ExecProfile::default(),
            router_fallback: false,
            security_fallback: false,
            exec_fallback: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_serializes_with_reason() {
        let verdict = SecurityVerdict::Deny {
            reason: "rm not on allow-list".to_string(),
        };
        let json = serde_json::to_string(&verdict).unwrap();
        assert!(json.contains(r#""verdict":"deny""#));
        assert!(json.contains("allow-list"));
    }

    #[test]
    fn denied_plan_is_empty_but_complete() {
        let plan = ExecutionPlan::denied("no allowed node", "no candidates");
        assert!(plan.selected_node_ids.is_empty());
        assert!(!plan.security_verdict.is_allow());
        assert_eq!(
            plan.exec_profile.timeout_seconds,
            crate::DEFAULT_COMMAND_TIMEOUT_SECS
        );
    }
}
