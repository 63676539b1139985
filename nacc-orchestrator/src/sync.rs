//! Cross-node sync, orchestrated as ReadFile-on-source paired with
//! WriteFile-on-target per file.
//!
//! The orchestrator has no delete tool on nodes, so a cross-node Mirror
//! converges by overwriting differing files and skipping identical ones —
//! which also makes back-to-back Mirrors a no-op. Append copies only files
//! missing at the target; DryRun computes the same plan without writing.

use std::time::Instant;

use nacc_protocol::{
    ListFilesRequest, ReadFileRequest, SyncFileAction, SyncReport, SyncStrategy, ToolError,
    WriteFileRequest,
};
use tokio_util::sync::CancellationToken;

use crate::error::OrchestratorError;
use crate::registry::NodeRegistry;

#[derive(Debug)]
pub struct SyncOutcome {
    pub reports: Vec<SyncReport>,
}

pub async fn sync_across_nodes(
    registry: &NodeRegistry,
    source_node_id: &str,
    source_path: &str,
    target_node_ids: &[String],
    strategy: SyncStrategy,
    cancel: &CancellationToken,
) -> Result<SyncOutcome, OrchestratorError> {
    let source = registry
        .transport(source_node_id)
        .await
        .ok_or_else(|| OrchestratorError::UnknownNode(source_node_id.to_string()))?;

    // Everything under the source path, hashed so targets can skip
    // identical content.
    let listing = source
        .list_files(
            &ListFilesRequest {
                path: source_path.to_string(),
                recursive: true,
                filter: None,
                with_hash: true,
                limit: None,
            },
            cancel,
        )
        .await?;
    let source_files: Vec<_> = listing
        .files
        .iter()
        .filter(|entry| !entry.is_dir)
        .collect();

    let mut reports = Vec::with_capacity(target_node_ids.len());
    for target_id in target_node_ids {
        let target = registry
            .transport(target_id)
            .await
            .ok_or_else(|| OrchestratorError::UnknownNode(target_id.clone()))?;
        let started = Instant::now();

        // The target's current view of the same paths.
        let existing = target
            .list_files(
                &ListFilesRequest {
                    path: source_path.to_string(),
                    recursive: true,
                    filter: None,
                    with_hash: true,
                    limit: None,
                },
                cancel,
            )
            .await
            .map(|resp| resp.files)
            .unwrap_or_default();

        let mut actions = Vec::new();
        let mut files_synced = 0usize;
        let mut bytes_copied = 0u64;

        for entry in &source_files {
            let before = existing
                .iter()
                .find(|candidate| candidate.relative_path == entry.relative_path)
                .and_then(|candidate| candidate.sha256.clone());

            let action = match (&before, strategy) {
                (Some(_), SyncStrategy::Append) => "skip",
                (Some(hash), _) if Some(hash) == entry.sha256.as_ref() => "skip",
                (Some(_), _) => "overwrite",
                (None, _) => "copy",
            };

            if action != "skip" && strategy != SyncStrategy::DryRun {
                copy_one(&*source, &*target, &entry.relative_path, cancel).await?;
            }
            if action != "skip" {
                files_synced += 1;
                bytes_copied += entry.size_bytes;
            }
            actions.push(SyncFileAction {
                relative_path: entry.relative_path.clone(),
                action: action.to_string(),
                sha256_before: before,
                sha256_after: entry.sha256.clone(),
            });
        }

        reports.push(SyncReport {
            target: target_id.clone(),
            files_synced,
            bytes_copied,
            duration_seconds: started.elapsed().as_secs_f64(),
            actions,
            dry_run: strategy == SyncStrategy::DryRun,
        });
    }

    Ok(SyncOutcome { reports })
}

/// Binary-safe read-then-write of one file.
async fn copy_one(
    source: &dyn crate::transport::NodeTransport,
    target: &dyn crate::transport::NodeTransport,
    relative_path: &str,
    cancel: &CancellationToken,
) -> Result<(), ToolError> {
    let content = source
        .read_file(
            &ReadFileRequest {
                path: relative_path.to_string(),
                encoding: "binary".to_string(),
            },
            cancel,
        )
        .await?;
    target
        .write_file(
            &WriteFileRequest {
                path: relative_path.to_string(),
                content: content.content,
                encoding: "binary".to_string(),
                overwrite: true,
                create_dirs: true,
            },
            cancel,
        )
        .await?;
    Ok(())
}
