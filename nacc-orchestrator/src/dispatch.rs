//! Fan-out of an allowed plan across its selected nodes.
//!
//! At most `parallelism` calls are in flight at once. Per-node failures
//! become per-node entries; they never abort the rest. The whole dispatch
//! is bounded by `exec_profile.timeout_seconds + 10`; whatever is still
//! outstanding at the deadline is cancelled and recorded as a timeout.
//! Result order always matches `selected_node_ids`, whatever the
//! completion order was.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nacc_protocol::{CommandResult, ExecuteCommandRequest, ExecutionPlan};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::registry::NodeRegistry;

/// Margin added on top of the command timeout for the whole-plan ceiling.
const PLAN_TIMEOUT_MARGIN_SECS: u64 = 10;

pub struct CommandDispatch {
    pub argv: Vec<String>,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
}

pub async fn fan_out_command(
    registry: &Arc<NodeRegistry>,
    plan: &ExecutionPlan,
    dispatch: &CommandDispatch,
    cancel: &CancellationToken,
) -> Vec<CommandResult> {
    let plan_deadline =
        Duration::from_secs(plan.exec_profile.timeout_seconds + PLAN_TIMEOUT_MARGIN_SECS);
    let semaphore = Arc::new(Semaphore::new(plan.parallelism.max(1)));
    // Children observe this token: the plan ceiling or a caller cancel
    // aborts whatever is still in flight.
    let plan_cancel = cancel.child_token();

    let mut env = plan.exec_profile.env_overrides.clone();
    env.extend(dispatch.env.clone());
    let request = ExecuteCommandRequest {
        argv: dispatch.argv.clone(),
        cwd: dispatch.cwd.clone(),
        env,
        timeout_seconds: Some(plan.exec_profile.timeout_seconds),
    };

    // One absolute deadline shared by every node task. A task that loses
    // the race drops its in-flight call, which aborts an HTTP request and
    // trips the cooperative check of an in-process one.
    let deadline = tokio::time::Instant::now() + plan_deadline;

    let mut handles = Vec::with_capacity(plan.selected_node_ids.len());
    for node_id in &plan.selected_node_ids {
        let node_id = node_id.clone();
        let registry = Arc::clone(registry);
        let semaphore = Arc::clone(&semaphore);
        let request = request.clone();
        let token = plan_cancel.clone();
        handles.push(tokio::spawn(async move {
            tokio::select! {
                result = async {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return CommandResult::synthetic(node_id.clone(), "dispatch aborted");
                    };
                    run_on_node(&registry, &node_id, &request, &token).await
                } => result,
                _ = tokio::time::sleep_until(deadline) => {
                    token.cancel();
                    CommandResult::synthetic(
                        node_id.clone(),
                        format!("plan timed out after {}s", plan_deadline.as_secs()),
                    )
                }
                _ = token.cancelled() => {
                    CommandResult::synthetic(node_id.clone(), "dispatch cancelled")
                }
            }
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (handle, node_id) in handles.into_iter().zip(&plan.selected_node_ids) {
        match handle.await {
            Ok(result) => results.push(result),
            Err(err) => {
                results.push(CommandResult::synthetic(
                    node_id.clone(),
                    format!("dispatch task failed: {err}"),
                ));
            }
        }
    }
    results
}

/// One node's slice of the dispatch. Unhealthy-at-dispatch nodes get a
/// synthetic entry without a call.
async fn run_on_node(
    registry: &NodeRegistry,
    node_id: &str,
    request: &ExecuteCommandRequest,
    cancel: &CancellationToken,
) -> CommandResult {
    if !registry.is_healthy(node_id).await {
        return CommandResult::synthetic(node_id, "node failed the pre-dispatch health filter");
    }
    let Some(transport) = registry.transport(node_id).await else {
        return CommandResult::synthetic(node_id, "node vanished from the registry");
    };
    match transport.execute_command(request, cancel).await {
        Ok(result) => result,
        Err(err) => CommandResult::synthetic(node_id, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::config::NodeDefinition;
    use crate::transport::NodeTransport;
    use async_trait::async_trait;
    use nacc_protocol::{
        ExecProfile, HealthResponse, ListFilesRequest, ListFilesResponse, NodeInfo,
        ReadFileRequest, ReadFileResponse, SecurityVerdict, ToolError, WriteFileRequest,
        WriteFileResponse,
    };
    use pretty_assertions::assert_eq;

    /// Transport whose execute either answers after a delay or hangs until
    /// cancelled.
    struct DelayTransport {
        node_id: String,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl NodeTransport for DelayTransport {
        async fn health(&self, _c: &CancellationToken) -> Result<HealthResponse, ToolError> {
            Ok(HealthResponse::ok(self.node_id.clone()))
        }

        async fn get_node_info(&self, _c: &CancellationToken) -> Result<NodeInfo, ToolError> {
            Err(ToolError::internal("not used"))
        }

        async fn list_files(
            &self,
            _r: &ListFilesRequest,
            _c: &CancellationToken,
        ) -> Result<ListFilesResponse, ToolError> {
            unimplemented!()
        }

        async fn read_file(
            &self,
            _r: &ReadFileRequest,
            _c: &CancellationToken,
        ) -> Result<ReadFileResponse, ToolError> {
            unimplemented!()
        }

        async fn write_file(
            &self,
            _r: &WriteFileRequest,
            _c: &CancellationToken,
        ) -> Result<WriteFileResponse, ToolError> {
            unimplemented!()
        }

        async fn execute_command(
            &self,
            _r: &ExecuteCommandRequest,
            cancel: &CancellationToken,
        ) -> Result<CommandResult, ToolError> {
            match self.delay {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(CommandResult {
                        node_id: self.node_id.clone(),
                        stdout: "done\n".to_string(),
                        stderr: String::new(),
                        exit_code: 0,
                        duration_seconds: delay.as_secs_f64(),
                        error: None,
                    })
                }
                None => {
                    cancel.cancelled().await;
                    Err(ToolError::new(
                        nacc_protocol::ErrorKind::Timeout,
                        "call cancelled",
                    ))
                }
            }
        }
    }

    fn definition(node_id: &str) -> NodeDefinition {
        toml::from_str(&format!(
            r#"
            node_id = "{node_id}"
            transport = "http"
            base_url = "http://127.0.0.1:1"
            allowed_commands = ["echo"]
            "#
        ))
        .unwrap()
    }

    async fn registry_with(
        dir: &tempfile::TempDir,
        transports: Vec<(&str, Arc<dyn NodeTransport>)>,
    ) -> Arc<NodeRegistry> {
        let audit = AuditLog::open(&dir.path().join("audit.jsonl"), u64::MAX).unwrap();
        let registry = Arc::new(NodeRegistry::new(audit));
        for (node_id, transport) in transports {
            registry
                .register_with_transport(definition(node_id), transport)
                .await;
            registry.probe(node_id).await;
        }
        registry
    }

    fn plan(nodes: &[&str], parallelism: usize, timeout: u64) -> ExecutionPlan {
        ExecutionPlan {
            selected_node_ids: nodes.iter().map(|s| s.to_string()).collect(),
            parallelism,
            router_reason: "test".to_string(),
            security_verdict: SecurityVerdict::Allow,
            exec_profile: ExecProfile {
                timeout_seconds: timeout,
                ..ExecProfile::default()
            },
            router_fallback: false,
            security_fallback: false,
            exec_fallback: false,
        }
    }

    fn dispatch() -> CommandDispatch {
        CommandDispatch {
            argv: vec!["echo".to_string(), "hi".to_string()],
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn results_preserve_plan_order_despite_completion_order() {
        let dir = tempfile::TempDir::new().unwrap();
        // "slow" completes after "fast" but must come first in the output.
        let registry = registry_with(
            &dir,
            vec![
                (
                    "slow",
                    Arc::new(DelayTransport {
                        node_id: "slow".to_string(),
                        delay: Some(Duration::from_millis(300)),
                    }) as Arc<dyn NodeTransport>,
                ),
                (
                    "fast",
                    Arc::new(DelayTransport {
                        node_id: "fast".to_string(),
                        delay: Some(Duration::from_millis(10)),
                    }) as Arc<dyn NodeTransport>,
                ),
            ],
        )
        .await;

        let results = fan_out_command(
            &registry,
            &plan(&["slow", "fast"], 2, 30),
            &dispatch(),
            &CancellationToken::new(),
        )
        .await;
        let order: Vec<&str> = results.iter().map(|r| r.node_id.as_str()).collect();
        assert_eq!(order, vec!["slow", "fast"]);
        assert!(results.iter().all(|r| r.exit_code == 0));
    }

    #[tokio::test]
    async fn unhealthy_node_gets_synthetic_entry_without_a_call() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = registry_with(
            &dir,
            vec![(
                "up",
                Arc::new(DelayTransport {
                    node_id: "up".to_string(),
                    delay: Some(Duration::from_millis(5)),
                }) as Arc<dyn NodeTransport>,
            )],
        )
        .await;
        // "ghost" is in the plan but was never registered as healthy.
        registry
            .register_with_transport(
                definition("ghost"),
                Arc::new(DelayTransport {
                    node_id: "ghost".to_string(),
                    delay: Some(Duration::from_millis(5)),
                }),
            )
            .await;

        let results = fan_out_command(
            &registry,
            &plan(&["up", "ghost"], 2, 30),
            &dispatch(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(results[0].exit_code, 0);
        assert_eq!(results[1].exit_code, nacc_protocol::EXIT_CODE_SENTINEL);
        assert!(
            results[1]
                .error
                .as_deref()
                .unwrap()
                .contains("health filter")
        );
    }

    #[tokio::test]
    async fn hung_node_is_cancelled_at_the_plan_ceiling() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = registry_with(
            &dir,
            vec![
                (
                    "ok",
                    Arc::new(DelayTransport {
                        node_id: "ok".to_string(),
                        delay: Some(Duration::from_millis(5)),
                    }) as Arc<dyn NodeTransport>,
                ),
                (
                    "hung",
                    Arc::new(DelayTransport {
                        node_id: "hung".to_string(),
                        delay: None,
                    }) as Arc<dyn NodeTransport>,
                ),
            ],
        )
        .await;

        let started = std::time::Instant::now();
        let results = fan_out_command(
            &registry,
            &plan(&["ok", "hung"], 2, 1),
            &dispatch(),
            &CancellationToken::new(),
        )
        .await;
        // Ceiling is timeout + 10; the aggregate returns no later than that.
        assert!(started.elapsed() < Duration::from_secs(13));
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].exit_code, nacc_protocol::EXIT_CODE_SENTINEL);
    }

    #[tokio::test]
    async fn parallelism_one_serializes_calls() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = registry_with(
            &dir,
            vec![
                (
                    "a",
                    Arc::new(DelayTransport {
                        node_id: "a".to_string(),
                        delay: Some(Duration::from_millis(100)),
                    }) as Arc<dyn NodeTransport>,
                ),
                (
                    "b",
                    Arc::new(DelayTransport {
                        node_id: "b".to_string(),
                        delay: Some(Duration::from_millis(100)),
                    }) as Arc<dyn NodeTransport>,
                ),
            ],
        )
        .await;

        let started = std::time::Instant::now();
        let results = fan_out_command(
            &registry,
            &plan(&["a", "b"], 1, 30),
            &dispatch(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(results.len(), 2);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
