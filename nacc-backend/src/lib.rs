//! `nacc-backend` — the completion-backend contract and its implementations.
//!
//! A backend turns a prompt plus a flat context map into opaque text:
//!
//! ```text
//! complete(prompt, context) -> String
//! ```
//!
//! Parsing the completion is the caller's job. Three variants ship here:
//!
//! - [`heuristic::HeuristicBackend`]: deterministic, pure function of its
//!   input; the planner's fallback and the test workhorse.
//! - [`http::HttpBackend`]: a remote inference service behind one generic
//!   JSON shape.
//! - [`subprocess::SubprocessBackend`]: a bounded pool of long-lived local
//!   model processes speaking line-delimited JSON.
//!
//! Constructors are registered in a table keyed by the config `kind`
//! discriminator; the active backend is swapped atomically by
//! [`manager::BackendManager`] after a probe call validates the replacement.

pub mod heuristic;
pub mod http;
pub mod manager;
pub mod subprocess;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scalar context value. The backend context is deliberately flat — nested
/// structures travel as pre-serialized JSON strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        ContextValue::String(value.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        ContextValue::String(value)
    }
}

impl From<f64> for ContextValue {
    fn from(value: f64) -> Self {
        ContextValue::Number(value)
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        ContextValue::Bool(value)
    }
}

/// Ordered so the heuristic digest is stable.
pub type BackendContext = BTreeMap<String, ContextValue>;

/// The four failure classes the orchestrator distinguishes. It never retries
/// on any of them; it substitutes the heuristic for the failed stage and
/// records that in the audit trail.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("backend timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend rate-limited: {0}")]
    RateLimited(String),

    #[error("backend response unparseable: {0}")]
    Malformed(String),

    #[error("invalid backend configuration: {0}")]
    Config(String),
}

/// A completion provider. Implementations declare their own timeout and
/// honor it by returning [`BackendError::Timeout`].
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// The registry discriminator this backend was built from.
    fn kind(&self) -> &'static str;

    /// One completion. The returned string is opaque text.
    async fn complete(
        &self,
        prompt: &str,
        context: &BackendContext,
    ) -> Result<String, BackendError>;

    /// Cheap liveness check used when switching backends. Default: a fixed
    /// tiny completion.
    async fn probe(&self) -> Result<(), BackendError> {
        let context = BackendContext::new();
        self.complete("probe", &context).await.map(|_| ())
    }
}
