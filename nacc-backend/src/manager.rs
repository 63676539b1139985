//! Backend configuration, the constructor registry, and the switchable
//! active-backend holder.
//!
//! Switching is construct-new-then-commit: the replacement is built, probed
//! with a fixed prompt under a 10 second deadline, and only then swapped in
//! under the lock. In-flight calls keep whatever `Arc` they captured at call
//! start.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::heuristic::HeuristicBackend;
use crate::http::HttpBackend;
use crate::subprocess::SubprocessBackend;
use crate::{BackendError, LlmBackend};

/// Probe deadline applied when validating a replacement backend.
const SWITCH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// One backend variant and its parameters. Immutable once built; switching
/// replaces the whole value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Registry discriminator: "heuristic", "http", "subprocess".
    pub kind: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    /// Literal token, or "env:VAR" to pull it from the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    /// Child command line for the subprocess variant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Extra environment for the subprocess variant.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_timeout_seconds() -> u64 {
    120
}

fn default_pool_size() -> usize {
    2
}

impl BackendConfig {
    pub fn heuristic() -> Self {
        Self {
            kind: "heuristic".to_string(),
            timeout_seconds: 5,
            endpoint_url: None,
            model_name: None,
            bearer_token: None,
            command: Vec::new(),
            environment: BTreeMap::new(),
            pool_size: 1,
        }
    }

    fn resolved_bearer(&self) -> Result<Option<String>, BackendError> {
        match &self.bearer_token {
            Some(value) => match value.strip_prefix("env:") {
                Some(var) => std::env::var(var).map(Some).map_err(|_| {
                    BackendError::Config(format!("environment variable {var} is not set"))
                }),
                None => Ok(Some(value.clone())),
            },
            None => Ok(None),
        }
    }
}

type Constructor = fn(&BackendConfig) -> Result<Arc<dyn LlmBackend>, BackendError>;

/// The constructor table keyed by the `kind` discriminator.
pub fn registry() -> &'static [(&'static str, Constructor)] {
    &[
        ("heuristic", build_heuristic),
        ("http", build_http),
        ("subprocess", build_subprocess),
    ]
}

fn build_heuristic(_config: &BackendConfig) -> Result<Arc<dyn LlmBackend>, BackendError> {
    Ok(Arc::new(HeuristicBackend))
}

fn build_http(config: &BackendConfig) -> Result<Arc<dyn LlmBackend>, BackendError> {
    let backend = HttpBackend::new(
        config.endpoint_url.clone().unwrap_or_default(),
        config.model_name.clone().unwrap_or_default(),
        config.resolved_bearer()?,
        Duration::from_secs(config.timeout_seconds),
    )?;
    Ok(Arc::new(backend))
}

fn build_subprocess(config: &BackendConfig) -> Result<Arc<dyn LlmBackend>, BackendError> {
    let backend = SubprocessBackend::new(
        config.command.clone(),
        config.environment.clone().into_iter().collect(),
        Duration::from_secs(config.timeout_seconds),
        config.pool_size,
    )?;
    Ok(Arc::new(backend))
}

pub fn build_backend(config: &BackendConfig) -> Result<Arc<dyn LlmBackend>, BackendError> {
    let constructor = registry()
        .iter()
        .find(|(kind, _)| *kind == config.kind)
        .map(|(_, constructor)| constructor)
        .ok_or_else(|| BackendError::Config(format!("unknown backend kind '{}'", config.kind)))?;
    constructor(config)
}

/// Availability and identity of one configured variant, for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendStatus {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<String>,
    pub active: bool,
}

struct Active {
    backend: Arc<dyn LlmBackend>,
    config: BackendConfig,
}

/// Process-wide holder for the active backend plus the configured variants.
pub struct BackendManager {
    active: Mutex<Active>,
    variants: Vec<BackendConfig>,
}

impl BackendManager {
    /// Build the initial active backend; falls back to the heuristic if the
    /// configured one cannot be constructed.
    pub fn new(initial: BackendConfig, variants: Vec<BackendConfig>) -> Self {
        let (backend, config) = match build_backend(&initial) {
            Ok(backend) => (backend, initial),
            Err(err) => {
                tracing::warn!(
                    kind = %initial.kind,
                    error = %err,
                    "configured backend unusable; starting on the heuristic"
                );
                let fallback = BackendConfig::heuristic();
                (build_backend(&fallback).expect("heuristic always builds"), fallback)
            }
        };
        Self {
            active: Mutex::new(Active { backend, config }),
            variants,
        }
    }

    /// Snapshot the active backend. Callers hold the `Arc`, not the lock,
    /// while completing.
    pub async fn active(&self) -> Arc<dyn LlmBackend> {
        self.active.lock().await.backend.clone()
    }

    pub async fn active_kind(&self) -> String {
        self.active.lock().await.config.kind.clone()
    }

    /// Atomically replace the active backend. The replacement must pass a
    /// probe call within ten seconds or the switch rolls back.
    pub async fn switch(&self, config: BackendConfig) -> Result<(), BackendError> {
        let replacement = build_backend(&config)?;
        match tokio::time::timeout(SWITCH_PROBE_TIMEOUT, replacement.probe()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(BackendError::Timeout(SWITCH_PROBE_TIMEOUT)),
        }
        let mut active = self.active.lock().await;
        tracing::info!(from = %active.config.kind, to = %config.kind, "backend switched");
        *active = Active {
            backend: replacement,
            config,
        };
        Ok(())
    }

    /// Status of every configured variant, active one marked.
    pub async fn describe(&self) -> Vec<BackendStatus> {
        let active_kind = self.active_kind().await;
        let mut seen_active = false;
        let mut statuses: Vec<BackendStatus> = self
            .variants
            .iter()
            .map(|config| {
                let (available, reason) = match build_backend(config) {
                    Ok(_) => (true, None),
                    Err(err) => (false, Some(err.to_string())),
                };
                let active = !seen_active && config.kind == active_kind;
                seen_active |= active;
                BackendStatus {
                    kind: config.kind.clone(),
                    model_name: config.model_name.clone(),
                    available,
                    unavailable_reason: reason,
                    active,
                }
            })
            .collect();
        if !seen_active {
            statuses.push(BackendStatus {
                kind: active_kind,
                model_name: None,
                available: true,
                unavailable_reason: None,
                active: true,
            });
        }
        statuses
    }
}
