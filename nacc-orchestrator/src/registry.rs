//! Node registry: definitions, runtime state, transports, health loops.
//!
//! One health loop per node probes `/healthz` on the configured cadence and
//! verifies the echoed node id against the registry key. Transitions in
//! either direction produce exactly one audit event; steady-state probes
//! produce none. Planning takes a single snapshot of this state and that
//! snapshot is both what the router sees and what the dispatch filter uses.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nacc_protocol::{AuditAction, NodeInfo, ToolError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLog, AuditRecord};
use crate::config::{NodeDefinition, TransportConfig};
use crate::transport::{HttpTransport, LocalTransport, NodeTransport};

/// Registry-maintained runtime state for one node.
#[derive(Debug, Clone, Default)]
pub struct NodeRuntimeState {
    pub healthy: bool,
    pub last_probe_at: Option<Instant>,
    pub last_error: Option<String>,
    /// Last good telemetry snapshot; feeds router scoring.
    pub info: Option<NodeInfo>,
}

struct NodeEntry {
    definition: NodeDefinition,
    state: NodeRuntimeState,
    transport: Arc<dyn NodeTransport>,
}

/// Read-mostly view handed to the planner and the API.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub allowed_commands: Vec<String>,
    pub healthy: bool,
    pub last_error: Option<String>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

pub struct NodeRegistry {
    entries: RwLock<BTreeMap<String, NodeEntry>>,
    audit: AuditLog,
}

impl NodeRegistry {
    pub fn new(audit: AuditLog) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            audit,
        }
    }

    /// Register a node, constructing its transport once. Re-registration
    /// replaces the definition and resets runtime state.
    pub async fn register(&self, definition: NodeDefinition) -> Result<(), ToolError> {
        let transport: Arc<dyn NodeTransport> = match &definition.transport {
            TransportConfig::Http {
                base_url,
                bearer_token,
            } => Arc::new(HttpTransport::new(base_url.clone(), bearer_token.clone())?),
            TransportConfig::InProcess { root_dir } => {
                let ctx = nacc_node::context::RootContext::for_root(
                    definition.node_id.clone(),
                    root_dir.clone(),
                    definition.allowed_commands.clone(),
                )?
                .with_tags(definition.tags.clone());
                Arc::new(LocalTransport::new(ctx))
            }
        };
        self.register_with_transport(definition, transport).await;
        Ok(())
    }

    /// Registration with a caller-supplied transport, used by tests to
    /// inject failure modes.
    pub async fn register_with_transport(
        &self,
        definition: NodeDefinition,
        transport: Arc<dyn NodeTransport>,
    ) {
        let node_id = definition.node_id.clone();
        self.entries.write().await.insert(
            node_id.clone(),
            NodeEntry {
                definition,
                state: NodeRuntimeState::default(),
                transport,
            },
        );
        self.audit
            .record(AuditRecord::new(AuditAction::NodeRegister, node_id))
            .await;
    }

    pub async fn transport(&self, node_id: &str) -> Option<Arc<dyn NodeTransport>> {
        self.entries
            .read()
            .await
            .get(node_id)
            .map(|entry| entry.transport.clone())
    }

    pub async fn node_ids(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn contains(&self, node_id: &str) -> bool {
        self.entries.read().await.contains_key(node_id)
    }

    pub async fn is_healthy(&self, node_id: &str) -> bool {
        self.entries
            .read()
            .await
            .get(node_id)
            .map(|entry| entry.state.healthy)
            .unwrap_or(false)
    }

    /// Allow-lists as known at registration time. The node remains the
    /// ultimate authority at execution time.
    pub async fn allowed_commands(&self, node_ids: &[String]) -> BTreeMap<String, Vec<String>> {
        let entries = self.entries.read().await;
        node_ids
            .iter()
            .filter_map(|id| {
                entries
                    .get(id)
                    .map(|entry| (id.clone(), entry.definition.allowed_commands.clone()))
            })
            .collect()
    }

    /// One consistent snapshot of every node, for planning and the API.
    pub async fn snapshot(&self) -> Vec<NodeSnapshot> {
        let entries = self.entries.read().await;
        entries
            .values()
            .map(|entry| {
                let metrics = entry.state.info.as_ref().map(|info| &info.metrics);
                NodeSnapshot {
                    node_id: entry.definition.node_id.clone(),
                    tags: entry.definition.tags.clone(),
                    description: entry.definition.description.clone(),
                    allowed_commands: entry.definition.allowed_commands.clone(),
                    healthy: entry.state.healthy,
                    last_error: entry.state.last_error.clone(),
                    cpu_percent: metrics.map(|m| m.cpu_percent).unwrap_or(100.0),
                    memory_percent: metrics.map(|m| m.memory_percent).unwrap_or(100.0),
                }
            })
            .collect()
    }

    /// Fetch live telemetry from one node and cache it in the registry.
    pub async fn refresh_info(
        &self,
        node_id: &str,
        cancel: &CancellationToken,
    ) -> Result<NodeInfo, ToolError> {
        let transport = self
            .transport(node_id)
            .await
            .ok_or_else(|| ToolError::not_found(format!("unknown node: {node_id}")))?;
        let info = transport.get_node_info(cancel).await?;
        if info.node_id != node_id {
            return Err(ToolError::internal(format!(
                "node answered as '{}' but is registered as '{node_id}'",
                info.node_id
            )));
        }
        if let Some(entry) = self.entries.write().await.get_mut(node_id) {
            entry.state.info = Some(info.clone());
        }
        Ok(info)
    }

    /// One probe of one node; records health transitions.
    pub async fn probe(&self, node_id: &str) {
        let Some(transport) = self.transport(node_id).await else {
            return;
        };
        let cancel = CancellationToken::new();
        let outcome = match transport.health(&cancel).await {
            Ok(health) if health.node_id == node_id => Ok(()),
            Ok(health) => Err(format!(
                "healthz answered with node_id '{}' instead of '{node_id}'",
                health.node_id
            )),
            Err(err) => Err(err.to_string()),
        };

        let transition = {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(node_id) else {
                return;
            };
            let was_healthy = entry.state.healthy;
            entry.state.last_probe_at = Some(Instant::now());
            match &outcome {
                Ok(()) => {
                    entry.state.healthy = true;
                    entry.state.last_error = None;
                }
                Err(message) => {
                    entry.state.healthy = false;
                    entry.state.last_error = Some(message.clone());
                }
            }
            (was_healthy != entry.state.healthy).then_some(entry.state.healthy)
        };

        if let Some(now_healthy) = transition {
            tracing::info!(node_id, healthy = now_healthy, "health transition");
            let mut record = AuditRecord::new(AuditAction::HealthTransition, node_id)
                .detail("healthy", now_healthy);
            if let Err(message) = outcome {
                record = record.error(message);
            }
            self.audit.record(record).await;
        }

        // A healthy node also refreshes its cached telemetry, best-effort.
        if self.is_healthy(node_id).await {
            let _ = self.refresh_info(node_id, &cancel).await;
        }
    }

    /// Spawn one health loop per registered node. Loops exit on `shutdown`.
    pub async fn start_health_loops(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        for node_id in self.node_ids().await {
            let registry = Arc::clone(self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => registry.probe(&node_id).await,
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nacc_protocol::{
        CommandResult, ExecuteCommandRequest, HealthResponse, ListFilesRequest, ListFilesResponse,
        ReadFileRequest, ReadFileResponse, WriteFileRequest, WriteFileResponse,
    };
    use pretty_assertions::assert_eq;

    struct ScriptedTransport {
        healthy: std::sync::atomic::AtomicBool,
        node_id: String,
    }

    #[async_trait::async_trait]
    impl NodeTransport for ScriptedTransport {
        async fn health(&self, _cancel: &CancellationToken) -> Result<HealthResponse, ToolError> {
            if self.healthy.load(std::sync::atomic::Ordering::SeqCst) {
                Ok(HealthResponse::ok(self.node_id.clone()))
            } else {
                Err(ToolError::internal("connection refused"))
            }
        }

        async fn get_node_info(&self, _cancel: &CancellationToken) -> Result<NodeInfo, ToolError> {
            Err(ToolError::internal("no telemetry in this double"))
        }

        async fn list_files(
            &self,
            _req: &ListFilesRequest,
            _cancel: &CancellationToken,
        ) -> Result<ListFilesResponse, ToolError> {
            unimplemented!()
        }

        async fn read_file(
            &self,
            _req: &ReadFileRequest,
            _cancel: &CancellationToken,
        ) -> Result<ReadFileResponse, ToolError> {
            unimplemented!()
        }

        async fn write_file(
            &self,
            _req: &WriteFileRequest,
            _cancel: &CancellationToken,
        ) -> Result<WriteFileResponse, ToolError> {
            unimplemented!()
        }

        async fn execute_command(
            &self,
            _req: &ExecuteCommandRequest,
            _cancel: &CancellationToken,
        ) -> Result<CommandResult, ToolError> {
            unimplemented!()
        }
    }

    fn definition(node_id: &str) -> NodeDefinition {
        toml::from_str(&format!(
            r#"
            node_id = "{node_id}"
            transport = "http"
            base_url = "http://127.0.0.1:1"
            "#
        ))
        .unwrap()
    }

    async fn audit_log(dir: &tempfile::TempDir) -> AuditLog {
        AuditLog::open(&dir.path().join("audit.jsonl"), u64::MAX).unwrap()
    }

    #[tokio::test]
    async fn transitions_audit_once_each_way() {
        let dir = tempfile::TempDir::new().unwrap();
        let audit = audit_log(&dir).await;
        let registry = NodeRegistry::new(audit.clone());
        let transport = Arc::new(ScriptedTransport {
            healthy: std::sync::atomic::AtomicBool::new(true),
            node_id: "node-a".to_string(),
        });
        registry
            .register_with_transport(definition("node-a"), transport.clone())
            .await;

        // unhealthy -> healthy: one transition.
        registry.probe("node-a").await;
        assert!(registry.is_healthy("node-a").await);
        // Steady state: no extra transition events.
        registry.probe("node-a").await;
        registry.probe("node-a").await;
        // healthy -> unhealthy: one transition.
        transport
            .healthy
            .store(false, std::sync::atomic::Ordering::SeqCst);
        registry.probe("node-a").await;
        assert!(!registry.is_healthy("node-a").await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let raw = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
        let transitions = raw
            .lines()
            .filter(|line| line.contains("health_transition"))
            .count();
        assert_eq!(transitions, 2);
        let snapshot = &registry.snapshot().await[0];
        assert!(snapshot.last_error.is_some());
    }

    #[tokio::test]
    async fn mismatched_node_id_fails_the_probe() {
        let dir = tempfile::TempDir::new().unwrap();
        let audit = audit_log(&dir).await;
        let registry = NodeRegistry::new(audit);
        let transport = Arc::new(ScriptedTransport {
            healthy: std::sync::atomic::AtomicBool::new(true),
            node_id: "impostor".to_string(),
        });
        registry
            .register_with_transport(definition("node-a"), transport)
            .await;

        registry.probe("node-a").await;
        assert!(!registry.is_healthy("node-a").await);
    }

    #[tokio::test]
    async fn snapshot_defaults_unknown_load_to_full() {
        let dir = tempfile::TempDir::new().unwrap();
        let audit = audit_log(&dir).await;
        let registry = NodeRegistry::new(audit);
        registry
            .register_with_transport(
                definition("node-a"),
                Arc::new(ScriptedTransport {
                    healthy: std::sync::atomic::AtomicBool::new(true),
                    node_id: "node-a".to_string(),
                }),
            )
            .await;
        let snapshot = &registry.snapshot().await[0];
        assert_eq!(snapshot.cpu_percent, 100.0);
        assert_eq!(snapshot.memory_percent, 100.0);
    }
}
