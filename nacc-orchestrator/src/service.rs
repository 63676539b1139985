//! `OrchestratorService` — registry + planner + dispatch + audit, wired.
//!
//! Every operation audits exactly once, including denials and failures.
//! The service owns the registry, the audit handle, and the active backend
//! reference; HTTP handlers and the CLI go through it and nothing else.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nacc_backend::manager::{BackendConfig, BackendManager, BackendStatus};
use nacc_backend::{BackendContext, ContextValue};
use nacc_protocol::{
    AuditAction, CommandResult, ExecutionPlan, ListFilesRequest, ListFilesResponse, NodeInfo,
    SyncReport, SyncStrategy, WriteFileRequest, WriteFileResponse,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLog, AuditRecord};
use crate::config::OrchestratorConfig;
use crate::dispatch::{CommandDispatch, fan_out_command};
use crate::error::OrchestratorError;
use crate::planner::{CommandSpec, Planner};
use crate::registry::{NodeRegistry, NodeSnapshot};
use crate::sync::sync_across_nodes;

// ─────────────────────────────────────────────────────────────────────────────
// API request/response bodies
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub description: String,
    pub argv: Vec<String>,
    #[serde(default)]
    pub tag_hints: Vec<String>,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

fn default_parallelism() -> usize {
    1
}

/// The caller always gets the plan, even on a deny — empty selection plus a
/// populated verdict renders partial success without special cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub plan: ExecutionPlan,
    pub results: Vec<CommandResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub source_node_id: String,
    pub source_path: String,
    pub target_node_ids: Vec<String>,
    /// Left unset, the sync agent picks one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<SyncStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub source_node_id: String,
    pub source_path: String,
    pub strategy: SyncStrategy,
    pub reports: Vec<SyncReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub message: String,
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub message: String,
    pub completion: String,
    pub backend_kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchRequest {
    pub backend: BackendConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub node_id: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

impl From<NodeSnapshot> for NodeView {
    fn from(snapshot: NodeSnapshot) -> Self {
        Self {
            node_id: snapshot.node_id,
            tags: snapshot.tags,
            description: snapshot.description,
            healthy: snapshot.healthy,
            last_error: snapshot.last_error,
            cpu_percent: snapshot.cpu_percent,
            memory_percent: snapshot.memory_percent,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────────────────

pub struct OrchestratorService {
    pub registry: Arc<NodeRegistry>,
    backends: Arc<BackendManager>,
    planner: Planner,
    audit: AuditLog,
    operator_token: Option<String>,
    shutdown: CancellationToken,
}

impl OrchestratorService {
    /// Build from configuration: open the audit log, register every node,
    /// start the health loops.
    pub async fn from_config(config: &OrchestratorConfig) -> Result<Self, OrchestratorError> {
        let audit = AuditLog::open(&config.audit.path, config.audit.max_bytes)
            .map_err(|err| OrchestratorError::Internal(format!("audit log: {err}")))?;
        let registry = Arc::new(NodeRegistry::new(audit.clone()));
        for definition in &config.nodes {
            registry.register(definition.clone()).await?;
        }
        let backends = Arc::new(BackendManager::new(
            config.backend.clone(),
            config.backends.clone(),
        ));
        let shutdown = CancellationToken::new();
        registry
            .start_health_loops(Duration::from_secs(config.health_interval_secs), shutdown.clone())
            .await;

        Ok(Self {
            registry: registry.clone(),
            backends: backends.clone(),
            planner: Planner::new(backends),
            audit,
            operator_token: config.operator_token.clone(),
            shutdown,
        })
    }

    /// Test/embedded constructor over pre-built parts; no health loops.
    pub fn with_parts(
        registry: Arc<NodeRegistry>,
        backends: Arc<BackendManager>,
        audit: AuditLog,
    ) -> Self {
        Self {
            registry,
            backends: backends.clone(),
            planner: Planner::new(backends),
            audit,
            operator_token: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn list_nodes(&self) -> Vec<NodeView> {
        self.registry
            .snapshot()
            .await
            .into_iter()
            .map(NodeView::from)
            .collect()
    }

    pub async fn node_info(
        &self,
        node_id: &str,
        cancel: &CancellationToken,
    ) -> Result<NodeInfo, OrchestratorError> {
        if !self.registry.contains(node_id).await {
            return Err(OrchestratorError::UnknownNode(node_id.to_string()));
        }
        Ok(self.registry.refresh_info(node_id, cancel).await?)
    }

    /// ListFiles on one node, or on the best node when `node_id` is "auto".
    pub async fn list_files(
        &self,
        node_id: &str,
        req: &ListFilesRequest,
        actor: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(String, ListFilesResponse), OrchestratorError> {
        let target = if node_id == "auto" {
            self.pick_node(&[]).await?
        } else {
            node_id.to_string()
        };
        let transport = self
            .registry
            .transport(&target)
            .await
            .ok_or_else(|| OrchestratorError::UnknownNode(target.clone()))?;

        let fingerprint = serde_json::to_value(req).unwrap_or_default();
        let result = transport.list_files(req, cancel).await;

        let mut record = AuditRecord::new(AuditAction::ListFiles, &target)
            .fingerprint_of(&fingerprint);
        if let Some(actor) = actor {
            record = record.actor(actor);
        }
        match &result {
            Ok(resp) => record = record.detail("count", resp.count),
            Err(err) => record = record.error(err.to_string()),
        }
        self.audit.record(record).await;

        Ok((target, result?))
    }

    /// The full pipeline: plan, dispatch, aggregate, audit.
    pub async fn execute_command(
        &self,
        req: &ExecuteRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecuteResponse, OrchestratorError> {
        if req.argv.is_empty() {
            return Err(OrchestratorError::CallerInput("argv must be non-empty".into()));
        }

        let spec = CommandSpec {
            description: req.description.clone(),
            argv: req.argv.clone(),
            tag_hints: req.tag_hints.clone(),
            parallelism: req.parallelism,
            timeout_seconds: req.timeout_seconds,
        };
        let snapshot = self.registry.snapshot().await;
        let plan = self.planner.plan_command(&spec, &snapshot).await;

        let fingerprint = serde_json::to_value(req).unwrap_or_default();
        let mut record = AuditRecord::new(AuditAction::ExecuteCommand, plan_target(&plan))
            .fingerprint_of(&fingerprint)
            .detail("router_fallback", plan.router_fallback)
            .detail("security_fallback", plan.security_fallback)
            .detail("exec_fallback", plan.exec_fallback)
            .detail(
                "selected_node_ids",
                serde_json::to_value(&plan.selected_node_ids).unwrap_or_default(),
            );
        if let Some(actor) = &req.actor {
            record = record.actor(actor.clone());
        }

        // A deny short-circuits dispatch; exactly one audit record either way.
        if let nacc_protocol::SecurityVerdict::Deny { reason } = &plan.security_verdict {
            self.audit.record(record.error(reason.clone())).await;
            return Ok(ExecuteResponse {
                plan,
                results: Vec::new(),
            });
        }

        let dispatch = CommandDispatch {
            argv: req.argv.clone(),
            cwd: req.cwd.clone(),
            env: req.env.clone(),
        };
        let results = fan_out_command(&self.registry, &plan, &dispatch, cancel).await;
        self.audit.record(record).await;

        Ok(ExecuteResponse { plan, results })
    }

    pub async fn sync_path(
        &self,
        req: &SyncRequest,
        cancel: &CancellationToken,
    ) -> Result<SyncResponse, OrchestratorError> {
        if req.target_node_ids.is_empty() {
            return Err(OrchestratorError::CallerInput(
                "at least one target node is required".into(),
            ));
        }

        let (strategy, sync_fallback) = match req.strategy {
            Some(strategy) => (strategy, false),
            None => self.planner.plan_sync_strategy(&req.source_path).await,
        };

        let fingerprint = serde_json::to_value(req).unwrap_or_default();
        let result = sync_across_nodes(
            &self.registry,
            &req.source_node_id,
            &req.source_path,
            &req.target_node_ids,
            strategy,
            cancel,
        )
        .await;

        let mut record = AuditRecord::new(AuditAction::SyncPath, &req.source_node_id)
            .fingerprint_of(&fingerprint)
            .detail("targets", serde_json::to_value(&req.target_node_ids).unwrap_or_default())
            .detail("sync_fallback", sync_fallback);
        if let Some(actor) = &req.actor {
            record = record.actor(actor.clone());
        }
        if let Err(err) = &result {
            record = record.error(err.to_string());
        }
        self.audit.record(record).await;

        let outcome = result?;
        Ok(SyncResponse {
            source_node_id: req.source_node_id.clone(),
            source_path: req.source_path.clone(),
            strategy,
            reports: outcome.reports,
        })
    }

    /// WriteFile routed to the best node for the given tag preference.
    pub async fn write_file(
        &self,
        req: &WriteFileRequest,
        tag_hints: &[String],
        actor: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(String, WriteFileResponse), OrchestratorError> {
        let target = self.pick_node(tag_hints).await?;
        let transport = self
            .registry
            .transport(&target)
            .await
            .ok_or_else(|| OrchestratorError::UnknownNode(target.clone()))?;

        // Hash the path, not the content, to keep fingerprints cheap.
        let fingerprint = serde_json::json!({"path": req.path, "overwrite": req.overwrite});
        let result = transport.write_file(req, cancel).await;

        let mut record = AuditRecord::new(AuditAction::WriteFile, &target)
            .fingerprint_of(&fingerprint);
        if let Some(actor) = actor {
            record = record.actor(actor);
        }
        if let Err(err) = &result {
            record = record.error(err.to_string());
        }
        self.audit.record(record).await;

        Ok((target, result?))
    }

    /// Forward a free-form message to the active backend.
    pub async fn probe_backend(
        &self,
        req: &ProbeRequest,
    ) -> Result<ProbeResponse, OrchestratorError> {
        let backend = self.backends.active().await;
        let mut context = BackendContext::new();
        for (key, value) in &req.context {
            let converted = match value {
                serde_json::Value::Bool(b) => ContextValue::Bool(*b),
                serde_json::Value::Number(n) => {
                    ContextValue::Number(n.as_f64().unwrap_or_default())
                }
                serde_json::Value::String(s) => ContextValue::String(s.clone()),
                other => ContextValue::String(other.to_string()),
            };
            context.insert(key.clone(), converted);
        }

        let result = backend.complete(&req.message, &context).await;
        let mut record = AuditRecord::new(AuditAction::AgentProbe, "*")
            .fingerprint_of(&serde_json::json!({"message": req.message}));
        if let Err(err) = &result {
            record = record.error(err.to_string());
        }
        self.audit.record(record).await;

        Ok(ProbeResponse {
            message: req.message.clone(),
            completion: result?,
            backend_kind: backend.kind().to_string(),
        })
    }

    /// Atomic backend swap, gated by the operator token when configured.
    pub async fn switch_backend(&self, req: &SwitchRequest) -> Result<(), OrchestratorError> {
        if let Some(expected) = &self.operator_token {
            if req.operator_token.as_deref() != Some(expected.as_str()) {
                return Err(OrchestratorError::OperatorTokenRequired);
            }
        }
        let kind = req.backend.kind.clone();
        let result = self.backends.switch(req.backend.clone()).await;
        let mut record = AuditRecord::new(AuditAction::BackendSwitch, "*")
            .detail("kind", kind);
        if let Err(err) = &result {
            record = record.error(err.to_string());
        }
        self.audit.record(record).await;
        result.map_err(OrchestratorError::from)
    }

    pub async fn backends(&self) -> Vec<BackendStatus> {
        self.backends.describe().await
    }

    pub async fn rotate_audit(&self) -> Result<(), OrchestratorError> {
        self.audit
            .rotate()
            .await
            .map_err(|err| OrchestratorError::Internal(format!("rotate: {err}")))
    }

    /// Healthy node with the best tag overlap, lowest load as tie-break.
    async fn pick_node(&self, tag_hints: &[String]) -> Result<String, OrchestratorError> {
        let snapshot = self.registry.snapshot().await;
        let mut healthy: Vec<&NodeSnapshot> =
            snapshot.iter().filter(|node| node.healthy).collect();
        if healthy.is_empty() {
            return Err(OrchestratorError::CallerInput(
                "no healthy nodes available".into(),
            ));
        }
        healthy.sort_by(|a, b| {
            let overlap = |node: &NodeSnapshot| {
                node.tags.iter().filter(|tag| tag_hints.contains(tag)).count()
            };
            overlap(b)
                .cmp(&overlap(a))
                .then(
                    ((a.cpu_percent + a.memory_percent) / 2.0)
                        .partial_cmp(&((b.cpu_percent + b.memory_percent) / 2.0))
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.node_id.cmp(&b.node_id))
        });
        Ok(healthy[0].node_id.clone())
    }
}

fn plan_target(plan: &ExecutionPlan) -> String {
    match plan.selected_node_ids.len() {
        0 => "*".to_string(),
        1 => plan.selected_node_ids[0].clone(),
        _ => "*".to_string(),
    }
}
