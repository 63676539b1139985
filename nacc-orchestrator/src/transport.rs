//! Node transports: how the orchestrator reaches a node's tool surface.
//!
//! Two implementations share one trait: `HttpTransport` (reqwest, optional
//! bearer, cancellable requests) and `LocalTransport` (the `nacc-node`
//! handlers called in-process against a `RootContext`, with cooperative
//! cancellation checks at the I/O boundaries). Every call takes an explicit
//! cancellation handle threaded down from the top-level HTTP handler; there
//! is no implicit context lookup.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nacc_node::context::RootContext;
use nacc_protocol::{
    CommandResult, ErrorKind, ExecuteCommandRequest, HealthResponse, ListFilesRequest,
    ListFilesResponse, NodeInfo, ReadFileRequest, ReadFileResponse, ToolError, WriteFileRequest,
    WriteFileResponse,
};
use tokio_util::sync::CancellationToken;

/// Deadline for a single node tool call made by the orchestrator.
pub const NODE_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for health probes; a healthy node answers well inside this.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn health(&self, cancel: &CancellationToken) -> Result<HealthResponse, ToolError>;

    async fn get_node_info(&self, cancel: &CancellationToken) -> Result<NodeInfo, ToolError>;

    async fn list_files(
        &self,
        req: &ListFilesRequest,
        cancel: &CancellationToken,
    ) -> Result<ListFilesResponse, ToolError>;

    async fn read_file(
        &self,
        req: &ReadFileRequest,
        cancel: &CancellationToken,
    ) -> Result<ReadFileResponse, ToolError>;

    async fn write_file(
        &self,
        req: &WriteFileRequest,
        cancel: &CancellationToken,
    ) -> Result<WriteFileResponse, ToolError>;

    async fn execute_command(
        &self,
        req: &ExecuteCommandRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, ToolError>;
}

fn cancelled() -> ToolError {
    ToolError::new(ErrorKind::Timeout, "call cancelled")
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP
// ─────────────────────────────────────────────────────────────────────────────

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: String, bearer_token: Option<String>) -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .timeout(NODE_CALL_TIMEOUT)
            .build()
            .map_err(|err| ToolError::internal(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token,
        })
    }

    /// Issue one tool POST, racing the cancellation token. Dropping the
    /// reqwest future aborts the in-flight request.
    async fn post_tool<Req, Resp>(
        &self,
        tool: &str,
        req: &Req,
        cancel: &CancellationToken,
    ) -> Result<Resp, ToolError>
    where
        Req: serde::Serialize + Sync,
        Resp: serde::de::DeserializeOwned,
    {
        let mut request = self
            .client
            .post(format!("{}/tools/{tool}", self.base_url))
            .json(req);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            result = request.send() => result.map_err(map_reqwest_error)?,
        };
        decode_response(response).await
    }

    async fn get_json<Resp>(
        &self,
        path: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Resp, ToolError>
    where
        Resp: serde::de::DeserializeOwned,
    {
        let request = self
            .client
            .get(format!("{}{path}", self.base_url))
            .timeout(timeout);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            result = request.send() => result.map_err(map_reqwest_error)?,
        };
        decode_response(response).await
    }
}

fn map_reqwest_error(err: reqwest::Error) -> ToolError {
    if err.is_timeout() {
        ToolError::new(ErrorKind::Timeout, "node call timed out")
    } else {
        ToolError::internal(format!("node unreachable: {err}"))
    }
}

async fn decode_response<Resp>(response: reqwest::Response) -> Result<Resp, ToolError>
where
    Resp: serde::de::DeserializeOwned,
{
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|err| ToolError::internal(format!("node response read failed: {err}")))?;
    if status.is_success() {
        serde_json::from_slice(&body)
            .map_err(|err| ToolError::internal(format!("node response undecodable: {err}")))
    } else {
        // Prefer the node's own envelope; synthesize one otherwise.
        match serde_json::from_slice::<nacc_protocol::ErrorEnvelope>(&body) {
            Ok(envelope) => Err(envelope.into()),
            Err(_) => Err(ToolError::internal(format!(
                "node returned {status} with unreadable body"
            ))),
        }
    }
}

#[async_trait]
impl NodeTransport for HttpTransport {
    async fn health(&self, cancel: &CancellationToken) -> Result<HealthResponse, ToolError> {
        self.get_json("/healthz", HEALTH_TIMEOUT, cancel).await
    }

    async fn get_node_info(&self, cancel: &CancellationToken) -> Result<NodeInfo, ToolError> {
        self.post_tool("get-node-info", &serde_json::json!({}), cancel)
            .await
    }

    async fn list_files(
        &self,
        req: &ListFilesRequest,
        cancel: &CancellationToken,
    ) -> Result<ListFilesResponse, ToolError> {
        self.post_tool("list-files", req, cancel).await
    }

    async fn read_file(
        &self,
        req: &ReadFileRequest,
        cancel: &CancellationToken,
    ) -> Result<ReadFileResponse, ToolError> {
        self.post_tool("read-file", req, cancel).await
    }

    async fn write_file(
        &self,
        req: &WriteFileRequest,
        cancel: &CancellationToken,
    ) -> Result<WriteFileResponse, ToolError> {
        self.post_tool("write-file", req, cancel).await
    }

    async fn execute_command(
        &self,
        req: &ExecuteCommandRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, ToolError> {
        // Command runs may legitimately outlast the default client timeout.
        let timeout = Duration::from_secs(
            req.timeout_seconds
                .unwrap_or(nacc_protocol::DEFAULT_COMMAND_TIMEOUT_SECS)
                + nacc_protocol::KILL_GRACE_SECS
                + 5,
        );
        let mut request = self
            .client
            .post(format!("{}/tools/execute-command", self.base_url))
            .timeout(timeout)
            .json(req);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            result = request.send() => result.map_err(map_reqwest_error)?,
        };
        decode_response(response).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process
// ─────────────────────────────────────────────────────────────────────────────

pub struct LocalTransport {
    ctx: Arc<RootContext>,
}

impl LocalTransport {
    pub fn new(ctx: RootContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    fn check(&self, cancel: &CancellationToken) -> Result<(), ToolError> {
        if cancel.is_cancelled() {
            Err(cancelled())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NodeTransport for LocalTransport {
    async fn health(&self, cancel: &CancellationToken) -> Result<HealthResponse, ToolError> {
        self.check(cancel)?;
        Ok(HealthResponse::ok(self.ctx.node_id.clone()))
    }

    async fn get_node_info(&self, cancel: &CancellationToken) -> Result<NodeInfo, ToolError> {
        self.check(cancel)?;
        Ok(nacc_node::telemetry::node_info(&self.ctx))
    }

    async fn list_files(
        &self,
        req: &ListFilesRequest,
        cancel: &CancellationToken,
    ) -> Result<ListFilesResponse, ToolError> {
        self.check(cancel)?;
        nacc_node::fsops::list_files(&self.ctx, req)
    }

    async fn read_file(
        &self,
        req: &ReadFileRequest,
        cancel: &CancellationToken,
    ) -> Result<ReadFileResponse, ToolError> {
        self.check(cancel)?;
        nacc_node::fsops::read_file(&self.ctx, req)
    }

    async fn write_file(
        &self,
        req: &WriteFileRequest,
        cancel: &CancellationToken,
    ) -> Result<WriteFileResponse, ToolError> {
        self.check(cancel)?;
        nacc_node::fsops::write_file(&self.ctx, req)
    }

    async fn execute_command(
        &self,
        req: &ExecuteCommandRequest,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, ToolError> {
        self.check(cancel)?;
        tokio::select! {
            _ = cancel.cancelled() => Err(cancelled()),
            result = nacc_node::exec::execute_command(&self.ctx, req) => result,
        }
    }
}
