//! Path containment for tenant roots.
//!
//! Every path the agent hands us is untrusted. [`resolve`] joins it onto a
//! tenant root, canonicalizes the result and only hands it back if it still
//! lives under that root. Nothing here touches the filesystem beyond
//! metadata lookups, so a rejected path never causes a mutation.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Why a path was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SandboxViolation {
    #[error("absolute paths are not allowed: {0}")]
    Absolute(String),
    #[error("parent directory references are not allowed: {0}")]
    ParentTraversal(String),
    #[error("path is outside the project directory: {0}")]
    Escapes(String),
    #[error("symbolic links are not allowed: {0}")]
    Symlink(String),
    #[error("invalid path: {0}")]
    Invalid(String),
}

/// Resolve `relative` against `root`.
///
/// An empty path (or `.`) resolves to the root itself. The returned path is
/// canonical: symlinks above the root are resolved, and any symlink at or
/// below the first segment under the root is rejected outright.
pub fn resolve(root: &Path, relative: &str) -> Result<PathBuf, SandboxViolation> {
    if relative.contains('\0') {
        return Err(SandboxViolation::Invalid(relative.escape_debug().to_string()));
    }
    if is_absolute(relative) {
        return Err(SandboxViolation::Absolute(relative.to_string()));
    }
    let segments = normalize(relative)?;

    let root = canonicalize_lenient(root)
        .map_err(|e| SandboxViolation::Invalid(format!("{}: {e}", root.display())))?;

    // Join first, then inspect what is actually on disk.
    let mut joined = root.clone();
    let mut on_disk = true;
    for segment in &segments {
        joined.push(segment);
        if !on_disk {
            continue;
        }
        match std::fs::symlink_metadata(&joined) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(SandboxViolation::Symlink(relative.to_string()));
            }
            Ok(_) => {}
            Err(_) => on_disk = false,
        }
    }

    let canonical = canonicalize_lenient(&joined)
        .map_err(|e| SandboxViolation::Invalid(format!("{relative}: {e}")))?;
    if canonical != root && !canonical.starts_with(&root) {
        return Err(SandboxViolation::Escapes(relative.to_string()));
    }
    Ok(canonical)
}

/// Absolute in either POSIX or Windows spelling. A bare `C:` prefix is only
/// rooted on Windows; elsewhere `a:b.txt` is an ordinary file name.
fn is_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    let drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    path.starts_with('/')
        || path.starts_with('\\')
        || Path::new(path).is_absolute()
        || (drive && (cfg!(windows) || matches!(bytes.get(2), Some(b'/' | b'\\'))))
}

/// Lexically normalize into plain segments. Both separators are honoured so
/// `..\x` is caught on every platform.
fn normalize(path: &str) -> Result<Vec<&str>, SandboxViolation> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(SandboxViolation::ParentTraversal(path.to_string()));
                }
            }
            other => segments.push(other),
        }
    }
    Ok(segments)
}

/// Canonicalize the longest existing ancestor of `path` and re-append the
/// part that does not exist yet.
fn canonicalize_lenient(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut existing = absolute.as_path();
    let mut tail: Vec<OsString> = Vec::new();
    loop {
        if let Ok(mut canonical) = existing.canonicalize() {
            for name in tail.iter().rev() {
                canonical.push(name);
            }
            return Ok(canonical);
        }
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(absolute),
        }
    }
}
