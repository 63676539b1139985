//! Filesystem tools: list-files, read-file, write-file.
//!
//! Writes follow a fixed protocol: temp file in the target's directory,
//! fsync, rename over the target, fsync the directory. Overwrites first
//! rename the prior content to `<path>.bak` (one backup retained), after the
//! temp file is already durable — a failure at any point leaves either the
//! old bytes or the new bytes on disk, never a truncation.

use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::time::UNIX_EPOCH;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use nacc_protocol::{
    ErrorKind, FileEntry, ListFilesRequest, ListFilesResponse, ReadFileRequest, ReadFileResponse,
    ToolError, WriteFileRequest, WriteFileResponse,
};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::context::RootContext;
use crate::paths::{relative_display, resolve_within_root};

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub fn hash_file(path: &Path) -> Result<String, ToolError> {
    let data = fs::read(path)?;
    Ok(sha256_hex(&data))
}

// ─────────────────────────────────────────────────────────────────────────────
// list-files
// ─────────────────────────────────────────────────────────────────────────────

pub fn list_files(ctx: &RootContext, req: &ListFilesRequest) -> Result<ListFilesResponse, ToolError> {
    let target = resolve_within_root(&ctx.root_dir, &req.path)?;
    if !target.exists() {
        return Err(ToolError::not_found(format!(
            "path does not exist: {}",
            req.path
        )));
    }

    let filter = match &req.filter {
        Some(pattern) => Some(glob::Pattern::new(pattern).map_err(|err| {
            ToolError::invalid(format!("bad filter pattern '{pattern}': {err}"))
        })?),
        None => None,
    };

    let mut entries = Vec::new();
    let max_depth = if req.recursive { usize::MAX } else { 1 };
    // Symlinks are never followed; a link out of the root cannot widen the
    // traversal.
    for item in WalkDir::new(&target)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(false)
        .sort_by_file_name()
    {
        let item = item.map_err(|err| ToolError::internal(format!("walk failed: {err}")))?;
        let name = item.file_name().to_string_lossy();
        if let Some(pattern) = &filter {
            if !pattern.matches(&name) {
                continue;
            }
        }
        let metadata = item
            .metadata()
            .map_err(|err| ToolError::internal(format!("stat failed: {err}")))?;
        let is_dir = metadata.is_dir();
        let path = item.path();
        let sha256 = if req.with_hash && metadata.is_file() {
            Some(hash_file(path)?)
        } else {
            None
        };
        entries.push(FileEntry {
            relative_path: relative_display(&ctx.root_dir, path),
            is_dir,
            size_bytes: if is_dir { 0 } else { metadata.len() },
            sha256,
            modified: modified_time(&metadata),
        });
    }

    entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    if let Some(limit) = req.limit {
        entries.truncate(limit);
    }
    let count = entries.len();
    Ok(ListFilesResponse {
        files: entries,
        count,
    })
}

fn modified_time(metadata: &fs::Metadata) -> Option<DateTime<Utc>> {
    let modified = metadata.modified().ok()?;
    let since = modified.duration_since(UNIX_EPOCH).ok()?;
    DateTime::<Utc>::from_timestamp(since.as_secs() as i64, since.subsec_nanos())
}

// ─────────────────────────────────────────────────────────────────────────────
// read-file
// ─────────────────────────────────────────────────────────────────────────────

pub fn read_file(ctx: &RootContext, req: &ReadFileRequest) -> Result<ReadFileResponse, ToolError> {
    let target = resolve_within_root(&ctx.root_dir, &req.path)?;
    let metadata = fs::metadata(&target)
        .map_err(|_| ToolError::not_found(format!("no such file: {}", req.path)))?;
    if metadata.is_dir() {
        return Err(ToolError::new(
            ErrorKind::IsDirectory,
            format!("{} is a directory", req.path),
        ));
    }
    if metadata.len() > ctx.max_file_bytes {
        return Err(ToolError::new(
            ErrorKind::TooLarge,
            format!(
                "file is {} bytes; the node refuses reads above {}",
                metadata.len(),
                ctx.max_file_bytes
            ),
        ));
    }

    let data = fs::read(&target)?;
    let sha256 = sha256_hex(&data);
    let content = match req.encoding.as_str() {
        "utf-8" => String::from_utf8(data.clone()).map_err(|_| {
            ToolError::new(
                ErrorKind::EncodingError,
                format!("{} is not valid UTF-8; request binary encoding", req.path),
            )
        })?,
        "binary" => BASE64.encode(&data),
        other => {
            return Err(ToolError::new(
                ErrorKind::EncodingError,
                format!("unsupported encoding '{other}'"),
            ));
        }
    };

    Ok(ReadFileResponse {
        path: relative_display(&ctx.root_dir, &target),
        size_bytes: data.len() as u64,
        sha256,
        content,
        encoding: req.encoding.clone(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// write-file
// ─────────────────────────────────────────────────────────────────────────────

pub fn write_file(ctx: &RootContext, req: &WriteFileRequest) -> Result<WriteFileResponse, ToolError> {
    write_file_inner(ctx, req, None)
}

/// Failure-injection point used by tests: the closure runs after the temp
/// file is durable and before anything is renamed.
pub(crate) fn write_file_inner(
    ctx: &RootContext,
    req: &WriteFileRequest,
    fail_point: Option<&dyn Fn() -> Result<(), ToolError>>,
) -> Result<WriteFileResponse, ToolError> {
    let target = resolve_within_root(&ctx.root_dir, &req.path)?;
    if target == ctx.root_dir {
        return Err(ToolError::invalid("cannot write to the root itself"));
    }

    let data: Vec<u8> = match req.encoding.as_str() {
        "utf-8" => req.content.clone().into_bytes(),
        "binary" => BASE64.decode(req.content.as_bytes()).map_err(|err| {
            ToolError::new(ErrorKind::EncodingError, format!("bad base64 content: {err}"))
        })?,
        other => {
            return Err(ToolError::new(
                ErrorKind::EncodingError,
                format!("unsupported encoding '{other}'"),
            ));
        }
    };
    if data.len() as u64 > ctx.max_file_bytes {
        return Err(ToolError::new(
            ErrorKind::TooLarge,
            format!(
                "content is {} bytes; the node refuses writes above {}",
                data.len(),
                ctx.max_file_bytes
            ),
        ));
    }

    let exists = target.exists();
    if exists && fs::metadata(&target)?.is_dir() {
        return Err(ToolError::new(
            ErrorKind::IsDirectory,
            format!("{} is a directory", req.path),
        ));
    }
    if exists && !req.overwrite {
        return Err(ToolError::new(
            ErrorKind::AlreadyExists,
            format!("{} exists and overwrite=false", req.path),
        ));
    }

    let parent = target
        .parent()
        .ok_or_else(|| ToolError::invalid("path has no parent directory"))?;
    if !parent.exists() {
        if req.create_dirs {
            fs::create_dir_all(parent)?;
        } else {
            return Err(ToolError::not_found(format!(
                "parent directory missing for {}",
                req.path
            )));
        }
    }

    // Temp file beside the target so the final rename stays on one
    // filesystem.
    let file_name = target
        .file_name()
        .ok_or_else(|| ToolError::invalid("path has no file name"))?
        .to_string_lossy()
        .into_owned();
    let tmp_path = parent.join(format!(".{file_name}.tmp-{}", std::process::id()));
    {
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(&data)?;
        tmp.sync_all()?;
    }

    if let Some(fail) = fail_point {
        if let Err(err) = fail() {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
    }

    let backup_path = if exists {
        let backup = parent.join(format!("{file_name}.bak"));
        fs::rename(&target, &backup)?;
        Some(relative_display(&ctx.root_dir, &backup))
    } else {
        None
    };

    fs::rename(&tmp_path, &target)?;
    sync_dir(parent)?;

    Ok(WriteFileResponse {
        path: relative_display(&ctx.root_dir, &target),
        bytes_written: data.len() as u64,
        sha256: sha256_hex(&data),
        backup_path,
    })
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), ToolError> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), ToolError> {
    Ok(())
}
