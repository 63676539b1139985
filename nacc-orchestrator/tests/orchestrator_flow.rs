//! End-to-end flows over in-process nodes and the deterministic backend.

use std::path::Path;
use std::sync::Arc;

use nacc_backend::manager::{BackendConfig, BackendManager};
use nacc_orchestrator::audit::AuditLog;
use nacc_orchestrator::config::NodeDefinition;
use nacc_orchestrator::registry::NodeRegistry;
use nacc_orchestrator::service::{ExecuteRequest, OrchestratorService, SyncRequest};
use nacc_protocol::{AuditEvent, ListFilesRequest, SecurityVerdict, WriteFileRequest};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

struct Fixture {
    service: OrchestratorService,
    audit_path: std::path::PathBuf,
    _dirs: Vec<tempfile::TempDir>,
}

fn in_process_definition(node_id: &str, root: &Path, tags: &[&str]) -> NodeDefinition {
    let tags_toml = tags
        .iter()
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(", ");
    toml::from_str(&format!(
        r#"
        node_id = "{node_id}"
        transport = "in_process"
        root_dir = "{}"
        tags = [{tags_toml}]
        allowed_commands = ["echo", "sleep"]
        "#,
        root.display()
    ))
    .unwrap()
}

async fn fixture_with_backend(backend: BackendConfig) -> Fixture {
    let audit_dir = tempfile::TempDir::new().unwrap();
    let audit_path = audit_dir.path().join("audit.jsonl");
    let audit = AuditLog::open(&audit_path, u64::MAX).unwrap();

    let root_a = tempfile::TempDir::new().unwrap();
    let root_b = tempfile::TempDir::new().unwrap();
    let registry = Arc::new(NodeRegistry::new(audit.clone()));
    registry
        .register(in_process_definition("node-a", root_a.path(), &["gpu"]))
        .await
        .unwrap();
    registry
        .register(in_process_definition("node-b", root_b.path(), &[]))
        .await
        .unwrap();
    registry.probe("node-a").await;
    registry.probe("node-b").await;

    let backends = Arc::new(BackendManager::new(backend, vec![BackendConfig::heuristic()]));
    Fixture {
        service: OrchestratorService::with_parts(registry, backends, audit),
        audit_path,
        _dirs: vec![audit_dir, root_a, root_b],
    }
}

async fn fixture() -> Fixture {
    fixture_with_backend(BackendConfig::heuristic()).await
}

async fn read_audit(path: &Path) -> Vec<AuditEvent> {
    // Writer task flushes asynchronously.
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn exec_request(argv: &[&str], parallelism: usize) -> ExecuteRequest {
    ExecuteRequest {
        description: "test command".to_string(),
        argv: argv.iter().map(|s| s.to_string()).collect(),
        tag_hints: vec![],
        parallelism,
        timeout_seconds: None,
        cwd: None,
        env: Default::default(),
        actor: Some("tests".to_string()),
    }
}

#[tokio::test]
async fn two_node_fan_out_returns_both_results_in_plan_order() {
    let fixture = fixture().await;
    let cancel = CancellationToken::new();

    let first = fixture
        .service
        .execute_command(&exec_request(&["echo", "hi"], 2), &cancel)
        .await
        .unwrap();
    assert_eq!(first.plan.selected_node_ids.len(), 2);
    assert!(first.plan.security_verdict.is_allow());
    assert_eq!(first.results.len(), 2);
    for (result, node_id) in first.results.iter().zip(&first.plan.selected_node_ids) {
        assert_eq!(&result.node_id, node_id);
        assert_eq!(result.stdout, "hi\n");
        assert_eq!(result.exit_code, 0);
    }

    // Stable selection across repeats with the deterministic backend.
    let second = fixture
        .service
        .execute_command(&exec_request(&["echo", "hi"], 2), &cancel)
        .await
        .unwrap();
    assert_eq!(first.plan.selected_node_ids, second.plan.selected_node_ids);

    let events = read_audit(&fixture.audit_path).await;
    let executes = events
        .iter()
        .filter(|e| matches!(e.action, nacc_protocol::AuditAction::ExecuteCommand))
        .count();
    assert_eq!(executes, 2);
}

#[tokio::test]
async fn denied_command_returns_plan_with_empty_selection() {
    let fixture = fixture().await;
    let response = fixture
        .service
        .execute_command(&exec_request(&["rm", "-rf", "x"], 1), &CancellationToken::new())
        .await
        .unwrap();
    assert!(response.results.is_empty());
    assert!(response.plan.selected_node_ids.is_empty());
    match &response.plan.security_verdict {
        SecurityVerdict::Deny { reason } => assert!(reason.contains("rm")),
        SecurityVerdict::Allow => panic!("expected deny"),
    }

    // Exactly one audit record for a denied request.
    let events = read_audit(&fixture.audit_path).await;
    let denials: Vec<_> = events
        .iter()
        .filter(|e| matches!(e.action, nacc_protocol::AuditAction::ExecuteCommand))
        .collect();
    assert_eq!(denials.len(), 1);
    assert!(matches!(
        denials[0].outcome,
        nacc_protocol::AuditOutcome::Error { .. }
    ));
}

#[tokio::test]
async fn path_escape_write_is_rejected_and_audited() {
    let fixture = fixture().await;
    let err = fixture
        .service
        .write_file(
            &WriteFileRequest {
                path: "../etc/passwd".to_string(),
                content: "x".to_string(),
                encoding: "utf-8".to_string(),
                overwrite: true,
                create_dirs: true,
            },
            &[],
            Some("tests"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 403);

    let events = read_audit(&fixture.audit_path).await;
    let write_events: Vec<_> = events
        .iter()
        .filter(|e| matches!(e.action, nacc_protocol::AuditAction::WriteFile))
        .collect();
    assert_eq!(write_events.len(), 1);
    assert!(matches!(
        write_events[0].outcome,
        nacc_protocol::AuditOutcome::Error { .. }
    ));
}

#[tokio::test]
async fn failing_backend_falls_back_and_still_completes() {
    let failing = BackendConfig {
        kind: "http".to_string(),
        endpoint_url: Some("http://127.0.0.1:1/nowhere".to_string()),
        timeout_seconds: 1,
        ..BackendConfig::heuristic()
    };
    let fixture = fixture_with_backend(failing).await;

    let mut request = exec_request(&["echo", "fallback"], 1);
    request.tag_hints = vec!["gpu".to_string()];
    let response = fixture
        .service
        .execute_command(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert!(response.plan.router_fallback);
    assert!(response.plan.security_fallback);
    assert!(response.plan.exec_fallback);
    // Heuristic tag scoring: the gpu-tagged node wins.
    assert_eq!(response.plan.selected_node_ids, vec!["node-a"]);
    assert_eq!(response.results[0].stdout, "fallback\n");

    let events = read_audit(&fixture.audit_path).await;
    let exec_event = events
        .iter()
        .find(|e| matches!(e.action, nacc_protocol::AuditAction::ExecuteCommand))
        .unwrap();
    assert_eq!(exec_event.detail["router_fallback"], serde_json::json!(true));
    assert_eq!(exec_event.detail["security_fallback"], serde_json::json!(true));
    assert_eq!(exec_event.detail["exec_fallback"], serde_json::json!(true));
}

#[tokio::test]
async fn concurrent_list_files_keeps_audit_gap_free() {
    let fixture = fixture().await;
    let service = Arc::new(fixture.service);

    let mut handles = Vec::new();
    for _ in 0..100 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            service
                .list_files(
                    "node-a",
                    &ListFilesRequest {
                        path: String::new(),
                        recursive: false,
                        filter: None,
                        with_hash: false,
                        limit: None,
                    },
                    Some("tests"),
                    &cancel,
                )
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let events = read_audit(&fixture.audit_path).await;
    let list_events = events
        .iter()
        .filter(|e| matches!(e.action, nacc_protocol::AuditAction::ListFiles))
        .count();
    assert_eq!(list_events, 100);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as u64 + 1, "gap at {}", event.seq);
    }
    for pair in events.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[tokio::test]
async fn sync_between_nodes_mirrors_and_audits() {
    let fixture = fixture().await;
    let cancel = CancellationToken::new();

    // Seed the source node through the orchestrator's own surface.
    let transport = fixture.service.registry.transport("node-a").await.unwrap();
    transport
        .write_file(
            &WriteFileRequest {
                path: "data/report.txt".to_string(),
                content: "quarterly".to_string(),
                encoding: "utf-8".to_string(),
                overwrite: false,
                create_dirs: true,
            },
            &cancel,
        )
        .await
        .unwrap();

    let response = fixture
        .service
        .sync_path(
            &SyncRequest {
                source_node_id: "node-a".to_string(),
                source_path: "data".to_string(),
                target_node_ids: vec!["node-b".to_string()],
                strategy: None,
                actor: Some("tests".to_string()),
            },
            &cancel,
        )
        .await
        .unwrap();

    // Unspecified strategy resolves to Mirror (heuristic sync stage).
    assert_eq!(response.strategy, nacc_protocol::SyncStrategy::Mirror);
    assert_eq!(response.reports.len(), 1);
    assert_eq!(response.reports[0].files_synced, 1);

    // The file landed on node-b with identical bytes.
    let read = fixture
        .service
        .registry
        .transport("node-b")
        .await
        .unwrap()
        .read_file(
            &nacc_protocol::ReadFileRequest {
                path: "data/report.txt".to_string(),
                encoding: "utf-8".to_string(),
            },
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(read.content, "quarterly");

    let events = read_audit(&fixture.audit_path).await;
    assert!(
        events
            .iter()
            .any(|e| matches!(e.action, nacc_protocol::AuditAction::SyncPath))
    );
}

#[tokio::test]
async fn probe_forwards_to_backend_and_audits() {
    let fixture = fixture().await;
    let response = fixture
        .service
        .probe_backend(&nacc_orchestrator::service::ProbeRequest {
            message: "are you there?".to_string(),
            context: Default::default(),
        })
        .await
        .unwrap();
    assert_eq!(response.backend_kind, "heuristic");
    assert!(response.completion.contains("prompt_digest"));
}

#[tokio::test]
async fn unknown_node_is_a_404_class_error() {
    let fixture = fixture().await;
    let err = fixture
        .service
        .node_info("ghost", &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 404);
}
