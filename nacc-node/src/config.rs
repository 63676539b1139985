//! Node configuration: TOML file plus env-var indirection for secrets.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

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

    #[error("environment variable {0} named by bearer_token is not set")]
    MissingEnv(String),
}

/// On-disk node configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    /// Absolute path; every caller-supplied path resolves under it.
    pub root_dir: PathBuf,
    /// Command basenames permitted for execute-command.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// Named sync targets: subdirectory paths relative to `root_dir`.
    #[serde(default)]
    pub sync_targets: BTreeMap<String, String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Listen address, e.g. "127.0.0.1:8765".
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Literal token, or "env:VAR" to read it from the environment.
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// PATH handed to spawned commands; children see nothing else of the
    /// server's environment.
    #[serde(default = "default_path_env")]
    pub path_env: String,
    /// Read/write ceiling; may only be raised above the default.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_bind() -> String {
    "127.0.0.1:8765".to_string()
}

fn default_path_env() -> String {
    "/usr/local/bin:/usr/bin:/bin".to_string()
}

fn default_max_file_bytes() -> u64 {
    nacc_protocol::DEFAULT_MAX_FILE_BYTES
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: NodeConfig =
            toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.bearer_token = resolve_secret(config.bearer_token.take())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node_id must be non-empty".into()));
        }
        if !self.root_dir.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "root_dir must be absolute, got {}",
                self.root_dir.display()
            )));
        }
        if self.max_file_bytes < nacc_protocol::DEFAULT_MAX_FILE_BYTES {
            return Err(ConfigError::Invalid(
                "max_file_bytes may only raise the 16 MiB default".into(),
            ));
        }
        for (name, rel) in &self.sync_targets {
            if Path::new(rel).is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "sync target '{name}' must be relative to root_dir"
                )));
            }
        }
        Ok(())
    }
}

/// Resolve "env:VAR" indirection so the secret itself never sits in the file.
fn resolve_secret(token: Option<String>) -> Result<Option<String>, ConfigError> {
    match token {
        Some(value) => {
            if let Some(var) = value.strip_prefix("env:") {
                let resolved =
                    std::env::var(var).map_err(|_| ConfigError::MissingEnv(var.to_string()))?;
                Ok(Some(resolved))
            } else {
                Ok(Some(value))
            }
        }
        None => Ok(None),
    }
}
