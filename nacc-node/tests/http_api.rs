//! End-to-end tests against a live node server on an ephemeral port.

use std::sync::Arc;

use nacc_node::context::RootContext;
use nacc_node::server::{AppState, router};
use nacc_protocol::{ErrorEnvelope, ErrorKind};
use pretty_assertions::assert_eq;

struct TestNode {
    base_url: String,
    root: tempfile::TempDir,
    _server: tokio::task::JoinHandle<()>,
}

async fn spawn_node(bearer_token: Option<&str>) -> TestNode {
    let root = tempfile::TempDir::new().unwrap();
    let ctx = RootContext::for_root(
        "test-node",
        root.path().to_path_buf(),
        vec!["echo".to_string()],
    )
    .unwrap();
    let state = AppState {
        ctx: Arc::new(ctx),
        bearer_token: bearer_token.map(String::from),
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    TestNode {
        base_url: format!("http://{addr}"),
        root,
        _server: server,
    }
}

#[tokio::test]
async fn healthz_echoes_node_id() {
    let node = spawn_node(None).await;
    let resp: serde_json::Value = reqwest::get(format!("{}/healthz", node.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["node_id"], "test-node");
}

#[tokio::test]
async fn write_read_round_trip_over_http() {
    let node = spawn_node(None).await;
    let client = reqwest::Client::new();

    let write: serde_json::Value = client
        .post(format!("{}/tools/write-file", node.base_url))
        .json(&serde_json::json!({"path": "greeting.txt", "content": "hello"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let read: serde_json::Value = client
        .post(format!("{}/tools/read-file", node.base_url))
        .json(&serde_json::json!({"path": "greeting.txt"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(read["content"], "hello");
    assert_eq!(read["sha256"], write["sha256"]);
}

#[tokio::test]
async fn path_escape_is_403_and_leaves_disk_alone() {
    let node = spawn_node(None).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/tools/write-file", node.base_url))
        .json(&serde_json::json!({"path": "../etc/passwd", "content": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);

    let envelope: ErrorEnvelope = resp.json().await.unwrap();
    assert_eq!(envelope.error.kind, ErrorKind::PathEscape);
    assert!(!node.root.path().join("../etc/passwd").exists());
}

#[tokio::test]
async fn disallowed_command_is_403() {
    let node = spawn_node(None).await;
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/tools/execute-command", node.base_url))
        .json(&serde_json::json!({"argv": ["rm", "-rf", "/"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);
    let envelope: ErrorEnvelope = resp.json().await.unwrap();
    assert_eq!(envelope.error.kind, ErrorKind::CommandNotAllowed);
}

#[tokio::test]
async fn allowed_command_runs() {
    let node = spawn_node(None).await;
    let client = reqwest::Client::new();
    let result: serde_json::Value = client
        .post(format!("{}/tools/execute-command", node.base_url))
        .json(&serde_json::json!({"argv": ["echo", "hi"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(result["stdout"], "hi\n");
    assert_eq!(result["exit_code"], 0);
}

#[tokio::test]
async fn bearer_token_guards_tools_but_not_health() {
    let node = spawn_node(Some("open-sesame")).await;
    let client = reqwest::Client::new();

    // Health stays open.
    let health = reqwest::get(format!("{}/healthz", node.base_url)).await.unwrap();
    assert_eq!(health.status().as_u16(), 200);

    // Tools without the token are rejected.
    let denied = client
        .post(format!("{}/tools/list-files", node.base_url))
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status().as_u16(), 401);

    // With the token they work.
    let allowed = client
        .post(format!("{}/tools/list-files", node.base_url))
        .bearer_auth("open-sesame")
        .json(&serde_json::json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status().as_u16(), 200);
}

#[tokio::test]
async fn node_endpoint_reports_telemetry() {
    let node = spawn_node(None).await;
    let info: serde_json::Value = reqwest::get(format!("{}/node", node.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(info["node_id"], "test-node");
    assert!(info["metrics"]["uptime_seconds"].as_u64().is_some());
    assert_eq!(info["allowed_commands"][0], "echo");
}
