//! The orchestrator's HTTP API.
//!
//! Thin handlers over [`OrchestratorService`]. Each handler threads an
//! explicit cancellation token into the service; a client that disconnects
//! drops the handler future, which drops in-flight node calls with it.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use nacc_protocol::ListFilesRequest;
use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorError;
use crate::service::{
    ExecuteRequest, OrchestratorService, ProbeRequest, SwitchRequest, SyncRequest,
};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<OrchestratorService>,
}

pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = serde_json::json!({
            "error": { "kind": error_kind(&self.0), "message": self.0.to_string() }
        });
        (status, Json(body)).into_response()
    }
}

fn error_kind(err: &OrchestratorError) -> &'static str {
    match err {
        OrchestratorError::UnknownNode(_) => "unknown_node",
        OrchestratorError::CallerInput(_) => "caller_input",
        OrchestratorError::Node(_) => "node_error",
        OrchestratorError::Backend(_) => "backend_failure",
        OrchestratorError::OperatorTokenRequired => "operator_token_required",
        OrchestratorError::Internal(_) => "internal",
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/nodes", get(list_nodes))
        .route("/nodes/{id}", get(get_node))
        .route("/nodes/{id}/files", post(node_files))
        .route("/commands/execute", post(execute))
        .route("/sync", post(sync))
        .route("/agents/probe", post(probe))
        .route("/backends", get(backends))
        .route("/backends/switch", post(switch))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "service": "nacc-orchestrator"}))
}

async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.list_nodes().await)
}

async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let cancel = CancellationToken::new();
    let info = state.service.node_info(&id, &cancel).await?;
    Ok(Json(info))
}

async fn node_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ListFilesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cancel = CancellationToken::new();
    let (node_id, listing) = state.service.list_files(&id, &req, None, &cancel).await?;
    Ok(Json(serde_json::json!({
        "node_id": node_id,
        "count": listing.count,
        "files": listing.files,
    })))
}

async fn execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cancel = CancellationToken::new();
    let response = state.service.execute_command(&req, &cancel).await?;
    Ok(Json(response))
}

async fn sync(
    State(state): State<AppState>,
    Json(req): Json<SyncRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let cancel = CancellationToken::new();
    let response = state.service.sync_path(&req, &cancel).await?;
    Ok(Json(response))
}

async fn probe(
    State(state): State<AppState>,
    Json(req): Json<ProbeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state.service.probe_backend(&req).await?;
    Ok(Json(response))
}

async fn backends(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.backends().await)
}

async fn switch(
    State(state): State<AppState>,
    Json(req): Json<SwitchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.switch_backend(&req).await?;
    Ok(Json(serde_json::json!({"switched": true, "kind": req.backend.kind})))
}

/// Bind and serve until shutdown.
pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "nacc-orchestrator serving");
    let shutdown = state.service.shutdown_token();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
