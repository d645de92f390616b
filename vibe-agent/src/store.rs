//! File store over one tenant root.
//!
//! All paths go through [`sandbox::resolve`] before any I/O. Blocking
//! filesystem work is pushed onto tokio's blocking pool so a slow disk never
//! stalls unrelated streams.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::sandbox::{self, SandboxViolation};

/// The document whose presence marks a tenant as servable.
pub const ENTRY_DOCUMENT: &str = "index.html";

/// Suffix of in-flight write files. Never listed.
const TEMP_SUFFIX: &str = ".vibe-tmp";

/// Where a tenant is in its life, derived purely from what is on disk.
///
/// The tenant router keys off this: `Absent` answers every path with the
/// building placeholder, and `Building` answers `/` with it until
/// [`ENTRY_DOCUMENT`] is written. Only the entry document's presence moves a
/// tenant to `Ready`, so other files written first stay reachable by path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// No root directory yet.
    Absent,
    /// Root exists but there is no entry document.
    Building,
    /// Entry document present.
    Ready,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Sandbox(#[from] SandboxViolation),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("filesystem task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    fn io(path: &str, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_string(),
            source,
        }
    }
}

/// Read/write/list/delete confined to one tenant root.
#[derive(Debug, Clone)]
pub struct ProjectFileStore {
    root: PathBuf,
}

impl ProjectFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store for `project_id` under the shared apps directory.
    pub fn for_project(apps_dir: &Path, project_id: &str) -> Self {
        Self::new(apps_dir.join(project_id))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Sandbox a relative path against this store's root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, SandboxViolation> {
        sandbox::resolve(&self.root, path)
    }

    /// Create the root directory if it does not exist yet.
    pub async fn ensure_root(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io("/", e))
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || lifecycle_of(&root))
            .await
            .unwrap_or(Lifecycle::Absent)
    }

    /// Replace `path` with `content` in one step.
    ///
    /// The content lands in a temp sibling first and is renamed over the
    /// target, so readers see either the old file or the new one.
    pub async fn write(&self, path: &str, content: &str) -> Result<(), StoreError> {
        let target = self.resolve(path)?;
        if target == self.resolve("")? {
            return Err(StoreError::NotAFile(path.to_string()));
        }
        let rel = path.to_string();
        let content = content.to_string();
        tokio::task::spawn_blocking(move || write_atomic(&target, content.as_bytes()))
            .await?
            .map_err(|e| StoreError::io(&rel, e))
    }

    pub async fn read(&self, path: &str) -> Result<String, StoreError> {
        let target = self.resolve(path)?;
        let rel = path.to_string();
        tokio::task::spawn_blocking(move || {
            match std::fs::metadata(&target) {
                Ok(meta) if meta.is_dir() => return Err(StoreError::NotAFile(rel)),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StoreError::NotFound(rel));
                }
                Err(e) => return Err(StoreError::io(&rel, e)),
            }
            std::fs::read_to_string(&target).map_err(|e| StoreError::io(&rel, e))
        })
        .await?
    }

    /// Every file under `directory` (the root when `None`), depth-first.
    ///
    /// Entries are visited in name order so one listing is stable; paths are
    /// relative to `directory` and always use `/`.
    pub async fn list(&self, directory: Option<&str>) -> Result<Vec<String>, StoreError> {
        let rel = directory.unwrap_or("").to_string();
        let target = self.resolve(&rel)?;
        tokio::task::spawn_blocking(move || {
            if !target.is_dir() {
                let shown = if rel.is_empty() { "/".to_string() } else { rel };
                return Err(StoreError::NotFound(shown));
            }
            let mut files = Vec::new();
            walk(&target, "", &mut files).map_err(|e| StoreError::io(&rel, e))?;
            Ok(files)
        })
        .await?
    }

    pub async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let target = self.resolve(path)?;
        let rel = path.to_string();
        tokio::task::spawn_blocking(move || {
            match std::fs::symlink_metadata(&target) {
                Ok(meta) if meta.is_dir() => return Err(StoreError::NotAFile(rel)),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StoreError::NotFound(rel));
                }
                Err(e) => return Err(StoreError::io(&rel, e)),
            }
            std::fs::remove_file(&target).map_err(|e| StoreError::io(&rel, e))
        })
        .await?
    }
}

/// Lifecycle of the tenant rooted at `root`.
pub fn lifecycle_of(root: &Path) -> Lifecycle {
    match std::fs::metadata(root) {
        Ok(meta) if meta.is_dir() => {
            if root.join(ENTRY_DOCUMENT).is_file() {
                Lifecycle::Ready
            } else {
                Lifecycle::Building
            }
        }
        _ => Lifecycle::Absent,
    }
}

fn write_atomic(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent directory"))?;
    std::fs::create_dir_all(parent)?;

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = parent.join(format!(".{name}.{:016x}{TEMP_SUFFIX}", rand::random::<u64>()));

    let result = write_new(&temp, bytes).and_then(|()| std::fs::rename(&temp, target));
    if result.is_err() {
        let _ = std::fs::remove_file(&temp);
    }
    result
}

fn write_new(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn walk(dir: &Path, prefix: &str, files: &mut Vec<String>) -> std::io::Result<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(&entry.path(), &rel, files)?;
        } else if file_type.is_file() && !name.ends_with(TEMP_SUFFIX) {
            files.push(rel);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ProjectFileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProjectFileStore::for_project(dir.path(), "abc123");
        (dir, store)
    }

    #[tokio::test]
    async fn write_then_read_returns_content() {
        let (_dir, store) = store();
        let content = "<!doctype html>\n<h1>héllo</h1>\n";
        store.write("index.html", content).await.unwrap();
        assert_eq!(store.read("index.html").await.unwrap(), content);

        store.write("index.html", "v2").await.unwrap();
        assert_eq!(store.read("index.html").await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn write_creates_parent_directories() {
        let (_dir, store) = store();
        store.write("assets/js/app.js", "console.log(1)").await.unwrap();
        assert!(store.root().join("assets/js/app.js").is_file());
    }

    #[tokio::test]
    async fn list_is_recursive_and_files_only() {
        let (_dir, store) = store();
        store.write("css/b.css", "b{}").await.unwrap();
        store.write("a.txt", "a").await.unwrap();
        store.write("js/lib/x.js", "x").await.unwrap();
        tokio::fs::create_dir_all(store.root().join("empty")).await.unwrap();

        let files = store.list(None).await.unwrap();
        assert_eq!(files, vec!["a.txt", "css/b.css", "js/lib/x.js"]);

        let js = store.list(Some("js")).await.unwrap();
        assert_eq!(js, vec!["lib/x.js"]);
    }

    #[tokio::test]
    async fn list_missing_directory_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(store.list(None).await, Err(StoreError::NotFound(_))));
        store.ensure_root().await.unwrap();
        assert!(store.list(None).await.unwrap().is_empty());
        assert!(matches!(store.list(Some("nope")).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn read_and_delete_missing_are_not_found() {
        let (_dir, store) = store();
        store.ensure_root().await.unwrap();
        assert!(matches!(store.read("ghost.html").await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete("ghost.html").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_removes_file_but_not_directories() {
        let (_dir, store) = store();
        store.write("css/site.css", "body{}").await.unwrap();
        assert!(matches!(store.delete("css").await, Err(StoreError::NotAFile(_))));
        store.delete("css/site.css").await.unwrap();
        assert!(matches!(store.read("css/site.css").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn violations_never_reach_disk() {
        let (dir, store) = store();
        for p in ["../x", "/x", ".."] {
            assert!(matches!(store.write(p, "pwned").await, Err(StoreError::Sandbox(_))));
            assert!(matches!(store.delete(p).await, Err(StoreError::Sandbox(_))));
        }
        assert!(!store.root().exists());
        assert!(!dir.path().join("x").exists());
    }

    #[tokio::test]
    async fn writing_the_root_itself_is_refused() {
        let (_dir, store) = store();
        store.ensure_root().await.unwrap();
        assert!(matches!(store.write("", "x").await, Err(StoreError::NotAFile(_))));
        assert!(matches!(store.write(".", "x").await, Err(StoreError::NotAFile(_))));
    }

    #[tokio::test]
    async fn concurrent_writers_never_leave_partial_files() {
        let (_dir, store) = store();
        let a = "a".repeat(256 * 1024);
        let b = "b".repeat(256 * 1024);
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let body = if i % 2 == 0 { a.clone() } else { b.clone() };
            tasks.push(tokio::spawn(async move { store.write("big.txt", &body).await }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        let content = store.read("big.txt").await.unwrap();
        assert!(content == a || content == b);
        assert_eq!(store.list(None).await.unwrap(), vec!["big.txt"]);
    }

    #[tokio::test]
    async fn lifecycle_follows_disk() {
        let (_dir, store) = store();
        assert_eq!(store.lifecycle().await, Lifecycle::Absent);
        store.ensure_root().await.unwrap();
        assert_eq!(store.lifecycle().await, Lifecycle::Building);
        store.write("style.css", "").await.unwrap();
        assert_eq!(store.lifecycle().await, Lifecycle::Building);
        store.write(ENTRY_DOCUMENT, "<html></html>").await.unwrap();
        assert_eq!(store.lifecycle().await, Lifecycle::Ready);
    }
}
