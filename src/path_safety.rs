//! Containment checks for paths handed in by clients.
//!
//! A requested path is first checked lexically (no filesystem access at
//! all), then canonicalized and verified to still live under its base
//! directory, which catches symlinks pointing outside.

use crate::error::WorkspaceError;
use std::path::{Component, Path, PathBuf};

/// Reject anything that is not a plain relative path made of normal
/// segments. Never touches the filesystem.
pub fn check_relative(requested: &str) -> Result<&Path, WorkspaceError> {
    if requested.is_empty() || requested.contains('\0') || requested.contains('\\') {
        return Err(WorkspaceError::PermissionDenied(requested.to_string()));
    }

    let path = Path::new(requested);
    let clean = path.components().all(|c| match c {
        Component::Normal(_) | Component::CurDir => true,
        Component::ParentDir | Component::RootDir | Component::Prefix(_) => false,
    });
    if !clean || path.is_absolute() {
        return Err(WorkspaceError::PermissionDenied(requested.to_string()));
    }
    Ok(path)
}

/// Resolve `requested` under `base`, returning the canonical path.
///
/// Traversal is refused before any I/O; a missing file is `NotFound`; a
/// path whose canonical form leaves `base` is `PermissionDenied`.
pub fn resolve_within(base: &Path, requested: &str) -> Result<PathBuf, WorkspaceError> {
    let relative = check_relative(requested)?;

    let canonical_base = base.canonicalize()?;
    let canonical = match canonical_base.join(relative).canonicalize() {
        Ok(path) => path,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(WorkspaceError::NotFound(requested.to_string()));
        }
        Err(e) => return Err(e.into()),
    };

    if !canonical.starts_with(&canonical_base) {
        return Err(WorkspaceError::PermissionDenied(requested.to_string()));
    }
    Ok(canonical)
}
