//! Orchestrator-facing error taxonomy.
//!
//! `CallerInput` surfaces as 4xx; per-node trouble becomes per-node result
//! entries and never aborts planning for the remaining nodes; backend
//! trouble falls back to the heuristic and is marked in the audit trail.

use nacc_backend::BackendError;
use nacc_protocol::ToolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("invalid request: {0}")]
    CallerInput(String),

    #[error("node call failed: {0}")]
    Node(#[from] ToolError),

    #[error("backend failure: {0}")]
    Backend(#[from] BackendError),

    #[error("operator token required for this operation")]
    OperatorTokenRequired,

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// HTTP status for the top-level handler. Per-node failures never reach
    /// this path; they ride inside the aggregated response.
    pub fn http_status(&self) -> u16 {
        match self {
            OrchestratorError::UnknownNode(_) => 404,
            OrchestratorError::CallerInput(_) => 400,
            OrchestratorError::Node(err) => err.kind.http_status(),
            OrchestratorError::Backend(_) => 502,
            OrchestratorError::OperatorTokenRequired => 401,
            OrchestratorError::Internal(_) => 500,
        }
    }
}
