//! HTTP surface: one POST endpoint per tool, plus `/healthz` and `/node`.
//!
//! `/healthz` answers from memory only — it is the orchestrator's liveness
//! signal and must stay fast. The optional bearer token guards `/tools/*`
//! but never the health endpoint.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use nacc_protocol::{
    ErrorEnvelope, ErrorKind, ExecuteCommandRequest, HealthResponse, ListFilesRequest,
    ReadFileRequest, SyncFilesRequest, ToolError, WriteFileRequest,
};

use crate::context::RootContext;
use crate::{exec, fsops, sync, telemetry};

/// Request bodies above this are refused outright: the 16 MiB file ceiling
/// plus base64 and JSON overhead.
const MAX_BODY_BYTES: usize = 24 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<RootContext>,
    pub bearer_token: Option<String>,
}

/// Error wrapper so `ToolError` renders as the shared envelope.
pub struct ApiError(ToolError);

impl From<ToolError> for ApiError {
    fn from(err: ToolError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.kind.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(kind = ?self.0.kind, message = %self.0.message, "tool failed");
        } else {
            tracing::debug!(kind = ?self.0.kind, message = %self.0.message, "tool rejected");
        }
        (status, Json(ErrorEnvelope::from(self.0))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/tools/list-files", post(list_files))
        .route("/tools/read-file", post(read_file))
        .route("/tools/write-file", post(write_file))
        .route("/tools/execute-command", post(execute_command))
        .route("/tools/sync-files", post(sync_files))
        .route("/tools/get-node-info", post(get_node_info))
        .route("/healthz", get(healthz))
        .route("/node", get(node))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.bearer_token else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(ToolError::new(ErrorKind::Unauthorized, "missing or invalid bearer token").into())
    }
}

async fn list_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ListFilesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let resp = fsops::list_files(&state.ctx, &req)?;
    Ok(Json(resp))
}

async fn read_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ReadFileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let resp = fsops::read_file(&state.ctx, &req)?;
    Ok(Json(resp))
}

async fn write_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<WriteFileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let resp = fsops::write_file(&state.ctx, &req)?;
    Ok(Json(resp))
}

async fn execute_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ExecuteCommandRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let resp = exec::execute_command(&state.ctx, &req).await?;
    Ok(Json(resp))
}

async fn sync_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SyncFilesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    let resp = sync::sync_files(&state.ctx, &req)?;
    Ok(Json(resp))
}

async fn get_node_info(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(telemetry::node_info(&state.ctx)))
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse::ok(state.ctx.node_id.clone()))
}

async fn node(State(state): State<AppState>) -> impl IntoResponse {
    Json(telemetry::node_info(&state.ctx))
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(
        node_id = %state.ctx.node_id,
        addr = %listener.local_addr()?,
        root = %state.ctx.root_dir.display(),
        "nacc-node serving"
    );
    axum::serve(listener, router(state)).await?;
    Ok(())
}
