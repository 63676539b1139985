//! Orchestrator configuration: node definitions, backend variants, audit
//! settings, health cadence.

use std::path::{Path, PathBuf};

use nacc_backend::manager::BackendConfig;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How the orchestrator reaches one node.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Remote node over HTTP, optionally bearer-authenticated.
    Http {
        base_url: String,
        #[serde(default)]
        bearer_token: Option<String>,
    },
    /// Tool handlers called directly in this process, for dev and tests.
    InProcess { root_dir: PathBuf },
}

/// Static registration record for one node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeDefinition {
    pub node_id: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Allow-list as known at registration; the node stays the authority.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    pub path: PathBuf,
    /// Retention budget in bytes; trimming is oldest-first and only happens
    /// at startup or on explicit rotate.
    #[serde(default = "default_audit_budget")]
    pub max_bytes: u64,
}

fn default_audit_budget() -> u64 {
    64 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    /// Gates POST /backends/switch when set.
    #[serde(default)]
    pub operator_token: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    /// The backend active at startup.
    pub backend: BackendConfig,
    /// Variants offered for switching; listed by GET /backends.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    pub audit: AuditConfig,
}

fn default_bind() -> String {
    "127.0.0.1:8700".to_string()
}

fn default_health_interval() -> u64 {
    5
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: OrchestratorConfig =
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::BTreeSet::new();
        for node in &self.nodes {
            if node.node_id.trim().is_empty() {
                return Err(ConfigError::Invalid("node_id must be non-empty".into()));
            }
            if !seen.insert(&node.node_id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate node_id '{}'",
                    node.node_id
                )));
            }
            if let TransportConfig::InProcess { root_dir } = &node.transport {
                if !root_dir.is_absolute() {
                    return Err(ConfigError::Invalid(format!(
                        "in-process node '{}' needs an absolute root_dir",
                        node.node_id
                    )));
                }
            }
        }
        if self.health_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "health_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
        bind = "127.0.0.1:8700"
        health_interval_secs = 5

        [[nodes]]
        node_id = "alpha"
        transport = "http"
        base_url = "http://10.0.0.5:8765"
        bearer_token = "secret"
        tags = ["gpu"]
        allowed_commands = ["echo", "ls"]

        [[nodes]]
        node_id = "local"
        transport = "in_process"
        root_dir = "/srv/nacc"

        [backend]
        kind = "heuristic"

        [[backends]]
        kind = "heuristic"

        [[backends]]
        kind = "http"
        endpoint_url = "https://inference.example/v1/complete"
        model_name = "granite-3b"
        timeout_seconds = 90

        [audit]
        path = "/var/log/nacc/audit.jsonl"
    "#;

    #[test]
    fn parses_full_config() {
        let config: OrchestratorConfig = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.nodes.len(), 2);
        assert!(matches!(
            config.nodes[0].transport,
            TransportConfig::Http { .. }
        ));
        assert!(matches!(
            config.nodes[1].transport,
            TransportConfig::InProcess { .. }
        ));
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.audit.max_bytes, default_audit_budget());
    }

    #[test]
    fn duplicate_node_ids_rejected() {
        let raw = r#"
            [[nodes]]
            node_id = "a"
            transport = "in_process"
            root_dir = "/srv/a"

            [[nodes]]
            node_id = "a"
            transport = "in_process"
            root_dir = "/srv/b"

            [backend]
            kind = "heuristic"

            [audit]
            path = "/tmp/audit.jsonl"
        "#;
        let config: OrchestratorConfig = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }
}
