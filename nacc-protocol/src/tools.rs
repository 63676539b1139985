//! Request/response types for the six node tools.
//!
//! One tagged pair per tool; the generic "map of anything" shape from the
//! source never appears on the wire — only the backend `context` parameter
//! keeps a flat map, and that lives in `nacc-backend`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// list-files
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListFilesRequest {
    /// Relative to the node root; empty means the root itself.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
    /// Glob pattern applied to entry basenames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default)]
    pub with_hash: bool,
    /// Cap on returned entries, applied after sorting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// One row of a ListFiles reply. `relative_path` is POSIX-separated and is
/// always a descendant of the node root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub relative_path: String,
    pub is_dir: bool,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListFilesResponse {
    pub files: Vec<FileEntry>,
    pub count: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// read-file
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileRequest {
    pub path: String,
    /// "utf-8" (default) or "binary" (base64 content in the response).
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileResponse {
    pub path: String,
    pub size_bytes: u64,
    pub sha256: String,
    /// UTF-8 text, or base64 when the request asked for "binary".
    pub content: String,
    pub encoding: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// write-file
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileRequest {
    pub path: String,
    /// UTF-8 text, or base64 when `encoding` is "binary".
    pub content: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default)]
    pub overwrite: bool,
    /// Create missing parent directories.
    #[serde(default = "default_true")]
    pub create_dirs: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileResponse {
    pub path: String,
    pub bytes_written: u64,
    pub sha256: String,
    /// Relative path of the `.bak` file when an overwrite displaced content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// execute-command
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteCommandRequest {
    /// Ordered argv; `argv[0]` must be a bare basename on the node allow-list.
    pub argv: Vec<String>,
    /// Working directory relative to the node root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Environment overlaid on the node's minimal base env.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub env: std::collections::BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Outcome of one command on one node. Non-zero exit codes are data, not
/// errors; `exit_code = -1` is the sentinel for signals and synthetic
/// entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub node_id: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_seconds: f64,
    /// Set on synthetic entries (health filter, transport failure, timeout).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    /// Synthetic entry for a node that never ran the command.
    pub fn synthetic(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: crate::EXIT_CODE_SENTINEL,
            duration_seconds: 0.0,
            error: Some(reason.into()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// sync-files
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Replace the target tree to match the source exactly.
    Mirror,
    /// Copy only files whose relative path is absent at the target.
    Append,
    /// Compute the plan without touching the filesystem.
    DryRun,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFilesRequest {
    pub source_path: String,
    /// Named sync targets from the node configuration.
    pub targets: Vec<String>,
    #[serde(default = "default_strategy")]
    pub strategy: SyncStrategy,
}

fn default_strategy() -> SyncStrategy {
    SyncStrategy::Mirror
}

/// What happened (or would happen, under DryRun) to one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFileAction {
    pub relative_path: String,
    /// "copy", "overwrite", "delete", or "skip".
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256_before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256_after: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub target: String,
    pub files_synced: usize,
    pub bytes_copied: u64,
    pub duration_seconds: f64,
    pub actions: Vec<SyncFileAction>,
    /// True when the report describes a DryRun plan.
    #[serde(default)]
    pub dry_run: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// get-node-info / healthz
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_total_bytes: u64,
    pub disk_percent: f32,
    pub disk_total_bytes: u64,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePlatform {
    pub os: String,
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,
}

/// Snapshot returned by GetNodeInfo. Sampled at call time, never cached on
/// the node. The echoed `node_id` must match the registry key or the
/// orchestrator fails the probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub allowed_commands: Vec<String>,
    pub sync_targets: Vec<String>,
    pub metrics: NodeMetrics,
    pub platform: NodePlatform,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
}

impl HealthResponse {
    pub fn ok(node_id: impl Into<String>) -> Self {
        Self {
            status: "ok".to_string(),
            node_id: node_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn list_files_request_defaults() {
        let req: ListFilesRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.path, "");
        assert!(!req.recursive);
        assert!(req.filter.is_none());
        assert!(!req.with_hash);
        assert!(req.limit.is_none());
    }

    #[test]
    fn read_file_defaults_to_utf8() {
        let req: ReadFileRequest = serde_json::from_str(r#"{"path":"a.txt"}"#).unwrap();
        assert_eq!(req.encoding, "utf-8");
    }

    #[test]
    fn write_file_defaults() {
        let req: WriteFileRequest =
            serde_json::from_str(r#"{"path":"a.txt","content":"hi"}"#).unwrap();
        assert!(!req.overwrite);
        assert!(req.create_dirs);
    }

    #[test]
    fn sync_strategy_wire_names() {
        assert_eq!(
            serde_json::to_string(&SyncStrategy::DryRun).unwrap(),
            r#""dry_run""#
        );
        let req: SyncFilesRequest =
            serde_json::from_str(r#"{"source_path":"data","targets":["mirror-a"]}"#).unwrap();
        assert_eq!(req.strategy, SyncStrategy::Mirror);
    }

    #[test]
    fn synthetic_result_uses_sentinel() {
        let result = CommandResult::synthetic("node-b", "node unhealthy at dispatch");
        assert_eq!(result.exit_code, crate::EXIT_CODE_SENTINEL);
        assert_eq!(result.error.as_deref(), Some("node unhealthy at dispatch"));
    }
}
