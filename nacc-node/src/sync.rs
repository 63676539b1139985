//! sync-files: copy a confined source path into named target directories.
//!
//! Targets are fixed subdirectories from the node configuration, so a sync
//! can never write outside the root. Mirror makes the target match the
//! source exactly (including deletions), Append copies only missing files,
//! DryRun reports the Mirror plan without touching anything.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use nacc_protocol::{
    SyncFileAction, SyncFilesRequest, SyncReport, SyncStrategy, ToolError,
};
use walkdir::WalkDir;

use crate::context::RootContext;
use crate::fsops::hash_file;
use crate::paths::{relative_display, resolve_within_root};

#[derive(Debug, serde::Serialize)]
pub struct SyncFilesResponse {
    pub source: String,
    pub reports: Vec<SyncReport>,
}

pub fn sync_files(ctx: &RootContext, req: &SyncFilesRequest) -> Result<SyncFilesResponse, ToolError> {
    if req.targets.is_empty() {
        return Err(ToolError::invalid("at least one sync target is required"));
    }
    let source = resolve_within_root(&ctx.root_dir, &req.source_path)?;
    if !source.exists() {
        return Err(ToolError::not_found(format!(
            "sync source does not exist: {}",
            req.source_path
        )));
    }

    let mut reports = Vec::with_capacity(req.targets.len());
    for target_name in &req.targets {
        let target_dir = ctx.sync_targets.get(target_name).ok_or_else(|| {
            ToolError::invalid(format!("unknown sync target: {target_name}"))
        })?;
        reports.push(sync_one(ctx, &source, target_name, target_dir, req.strategy)?);
    }

    Ok(SyncFilesResponse {
        source: relative_display(&ctx.root_dir, &source),
        reports,
    })
}

fn sync_one(
    ctx: &RootContext,
    source: &Path,
    target_name: &str,
    target_dir: &Path,
    strategy: SyncStrategy,
) -> Result<SyncReport, ToolError> {
    let started = Instant::now();
    let dry_run = strategy == SyncStrategy::DryRun;
    // Destination mirrors the source's position relative to the root.
    let dest_root = target_dir.join(source.strip_prefix(&ctx.root_dir).unwrap_or(source));

    let source_files = collect_files(source)?;
    let mut actions = Vec::new();
    let mut files_synced = 0usize;
    let mut bytes_copied = 0u64;

    for (rel, src_path) in &source_files {
        let dest_path = dest_root.join(rel);
        let src_hash = hash_file(src_path)?;
        let dest_hash = if dest_path.is_file() {
            Some(hash_file(&dest_path)?)
        } else {
            None
        };

        let action = match (&dest_hash, strategy) {
            (Some(_), SyncStrategy::Append) => "skip",
            (Some(existing), _) if *existing == src_hash => "skip",
            (Some(_), _) => "overwrite",
            (None, _) => "copy",
        };

        if action != "skip" && !dry_run {
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(src_path, &dest_path)?;
        }
        if action != "skip" {
            files_synced += 1;
            bytes_copied += fs::metadata(src_path)?.len();
        }
        actions.push(SyncFileAction {
            relative_path: rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"),
            action: action.to_string(),
            sha256_before: dest_hash,
            sha256_after: Some(src_hash),
        });
    }

    // Mirror removes files present at the destination but absent from the
    // source; Append and DryRun report them as deletions-to-be only.
    if strategy != SyncStrategy::Append && dest_root.is_dir() {
        let dest_files = collect_files(&dest_root)?;
        for (rel, dest_path) in dest_files {
            if !source_files.iter().any(|(src_rel, _)| *src_rel == rel) {
                let before = hash_file(&dest_path).ok();
                if strategy == SyncStrategy::Mirror {
                    fs::remove_file(&dest_path)?;
                }
                actions.push(SyncFileAction {
                    relative_path: rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"),
                    action: "delete".to_string(),
                    sha256_before: before,
                    sha256_after: None,
                });
                files_synced += 1;
            }
        }
    }

    tracing::debug!(
        target_name,
        files_synced,
        bytes_copied,
        ?strategy,
        "sync target finished"
    );

    Ok(SyncReport {
        target: target_name.to_string(),
        files_synced,
        bytes_copied,
        duration_seconds: started.elapsed().as_secs_f64(),
        actions,
        dry_run,
    })
}

/// All regular files under `base` (or `base` itself when it is a file),
/// keyed by path relative to `base`, sorted for determinism.
fn collect_files(base: &Path) -> Result<Vec<(PathBuf, PathBuf)>, ToolError> {
    let mut files = Vec::new();
    if base.is_file() {
        let name = base
            .file_name()
            .ok_or_else(|| ToolError::invalid("source has no file name"))?;
        files.push((PathBuf::from(name), base.to_path_buf()));
        return Ok(files);
    }
    for entry in WalkDir::new(base).follow_links(false) {
        let entry = entry.map_err(|err| ToolError::internal(format!("walk failed: {err}")))?;
        if entry.file_type().is_file() {
            let rel = entry
                .path()
                .strip_prefix(base)
                .map_err(|err| ToolError::internal(err.to_string()))?
                .to_path_buf();
            files.push((rel, entry.path().to_path_buf()));
        }
    }
    files.sort();
    Ok(files)
}
