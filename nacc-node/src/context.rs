//! `RootContext` — the single value every tool handler receives.
//!
//! Built once at startup from the validated config; no module-level mutable
//! state. Owning a context means owning the root directory.

use std::collections::BTreeMap;
use std::path::PathBuf;

use nacc_protocol::ToolError;

use crate::config::NodeConfig;

#[derive(Debug, Clone)]
pub struct RootContext {
    pub node_id: String,
    /// Canonicalized absolute root; all confinement checks compare against it.
    pub root_dir: PathBuf,
    pub allowed_commands: Vec<String>,
    /// Target name -> absolute directory under `root_dir`.
    pub sync_targets: BTreeMap<String, PathBuf>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub path_env: String,
    pub max_file_bytes: u64,
}

impl RootContext {
    /// Canonicalizes the root (it must exist) and anchors the sync targets.
    pub fn from_config(config: &NodeConfig) -> Result<Self, ToolError> {
        let root_dir = config.root_dir.canonicalize().map_err(|err| {
            ToolError::internal(format!(
                "root_dir {} is not usable: {err}",
                config.root_dir.display()
            ))
        })?;
        let sync_targets = config
            .sync_targets
            .iter()
            .map(|(name, rel)| (name.clone(), root_dir.join(rel)))
            .collect();
        Ok(Self {
            node_id: config.node_id.clone(),
            root_dir,
            allowed_commands: config.allowed_commands.clone(),
            sync_targets,
            tags: config.tags.clone(),
            description: config.description.clone(),
            path_env: config.path_env.clone(),
            max_file_bytes: config.max_file_bytes,
        })
    }

    /// Context rooted at an existing directory, used by in-process transports
    /// and tests.
    pub fn for_root(
        node_id: impl Into<String>,
        root_dir: PathBuf,
        allowed_commands: Vec<String>,
    ) -> Result<Self, ToolError> {
        let root_dir = root_dir
            .canonicalize()
            .map_err(|err| ToolError::internal(format!("root_dir not usable: {err}")))?;
        Ok(Self {
            node_id: node_id.into(),
            root_dir,
            allowed_commands,
            sync_targets: BTreeMap::new(),
            tags: Vec::new(),
            description: None,
            path_env: "/usr/local/bin:/usr/bin:/bin".to_string(),
            max_file_bytes: nacc_protocol::DEFAULT_MAX_FILE_BYTES,
        })
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_sync_target(mut self, name: impl Into<String>, rel: &str) -> Self {
        self.sync_targets.insert(name.into(), self.root_dir.join(rel));
        self
    }
}
