//! Path confinement.
//!
//! Every caller-supplied path is interpreted relative to the root. Absolute
//! paths and any `..` component are rejected outright, before resolution —
//! even when the resolved path would land back inside the root. Symlinks are
//! checked by canonicalizing the deepest existing ancestor of the candidate;
//! a link whose target leaves the root is an escape attempt.

use std::path::{Component, Path, PathBuf};

use nacc_protocol::ToolError;

/// Resolve `requested` under `root`, enforcing confinement. Empty input
/// means the root itself.
pub fn resolve_within_root(root: &Path, requested: &str) -> Result<PathBuf, ToolError> {
    let candidate = Path::new(requested);
    if candidate.is_absolute() {
        return Err(ToolError::path_escape(format!(
            "absolute paths are not accepted: {requested}"
        )));
    }
    for component in candidate.components() {
        match component {
            Component::ParentDir => {
                return Err(ToolError::path_escape(format!(
                    "path must not contain '..': {requested}"
                )));
            }
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(ToolError::path_escape(format!(
                    "unsupported path component in: {requested}"
                )));
            }
        }
    }

    let joined = root.join(candidate);
    verify_no_symlink_escape(root, &joined)?;
    Ok(joined)
}

/// Canonicalize the deepest existing ancestor of `joined` and require it to
/// stay under `root`. Catches intermediate or final components that are
/// symlinks out of the tree.
fn verify_no_symlink_escape(root: &Path, joined: &Path) -> Result<(), ToolError> {
    let mut probe: &Path = joined;
    loop {
        if probe.exists() || probe.symlink_metadata().is_ok() {
            let resolved = probe
                .canonicalize()
                .map_err(|err| ToolError::internal(format!("cannot resolve path: {err}")))?;
            if !resolved.starts_with(root) {
                return Err(ToolError::path_escape(format!(
                    "path resolves outside the node root: {}",
                    joined.display()
                )));
            }
            return Ok(());
        }
        match probe.parent() {
            Some(parent) if parent.starts_with(root) => probe = parent,
            _ => return Ok(()),
        }
    }
}

/// Relative path of `path` under `root`, POSIX-separated.
pub fn relative_display(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let display = rel.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        display.into_owned()
    } else {
        display.replace(std::path::MAIN_SEPARATOR, "/")
    }
}
