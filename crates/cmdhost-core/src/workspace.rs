//! Ephemeral per-request workspaces
//!
//! A [`Workspace`] is a uniquely named directory created under the configured
//! workspace root. It is never shared between requests and removes itself
//! exactly once, either through [`Workspace::destroy`] or on drop.

use crate::{CmdhostError, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;

/// Prefix of every workspace directory name
const WORKSPACE_PREFIX: &str = "cmdhost-";

#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    root: PathBuf,
}

impl Workspace {
    /// Allocate a fresh, empty workspace under `parent`
    pub fn create(parent: &Path) -> Result<Self> {
        fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir_in(parent)?;
        let root = dir.path().to_path_buf();

        tracing::debug!(workspace = ?root, "workspace created");

        Ok(Self {
            dir: Some(dir),
            root,
        })
    }

    /// Absolute path of the workspace root
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve a caller-supplied relative file path inside the workspace
    pub fn resolve(&self, relative_path: &str) -> Result<PathBuf> {
        let relative = normalize(relative_path)?;
        if relative.as_os_str().is_empty() {
            return Err(CmdhostError::InvalidPath(format!(
                "{relative_path:?} does not name a file"
            )));
        }
        Ok(self.root.join(relative))
    }

    /// Resolve a relative directory; an empty path or `.` is the root itself
    pub fn resolve_dir(&self, relative_path: &str) -> Result<PathBuf> {
        Ok(self.root.join(normalize(relative_path)?))
    }

    /// Write `content` to `relative_path`, creating parent directories.
    ///
    /// Each path can be written once; a second write is rejected.
    pub fn write(&self, relative_path: &str, content: &[u8]) -> Result<PathBuf> {
        let path = self.resolve(relative_path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| match e.kind() {
                ErrorKind::NotADirectory | ErrorKind::AlreadyExists => {
                    CmdhostError::InvalidRequest(format!(
                        "input file {relative_path:?} is nested under another input file"
                    ))
                }
                _ => CmdhostError::Io(e),
            })?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => CmdhostError::InvalidRequest(format!(
                    "input file {relative_path:?} written more than once"
                )),
                _ => CmdhostError::Io(e),
            })?;
        file.write_all(content)?;

        tracing::trace!(path = relative_path, bytes = content.len(), "input file written");
        Ok(path)
    }

    /// Create (if needed) and return a directory inside the workspace
    pub fn create_dir(&self, relative_path: &str) -> Result<PathBuf> {
        let path = self.resolve_dir(relative_path)?;
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Whether `path`, after following symlinks, lies inside the workspace
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        match (fs::canonicalize(&self.root), fs::canonicalize(path)) {
            (Ok(root), Ok(target)) => target.starts_with(root),
            _ => false,
        }
    }

    /// Whether the directory has already been removed
    #[must_use]
    pub const fn is_destroyed(&self) -> bool {
        self.dir.is_none()
    }

    /// Recursively remove the workspace. Idempotent; failures are only logged.
    pub fn destroy(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };

        match dir.close() {
            Ok(()) => tracing::debug!(workspace = ?self.root, "workspace destroyed"),
            Err(e) => tracing::warn!(
                workspace = ?self.root,
                error = %e,
                "failed to remove workspace"
            ),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Validate a caller-supplied relative path and strip `.` components.
///
/// Absolute paths, `..` segments and control characters are rejected.
pub fn normalize(relative_path: &str) -> Result<PathBuf> {
    if relative_path.chars().any(char::is_control) {
        return Err(CmdhostError::InvalidPath(format!(
            "{relative_path:?} contains control characters"
        )));
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(relative_path).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(CmdhostError::InvalidPath(format!(
                    "{relative_path:?} escapes the workspace"
                )));
            }
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_rejects_escapes() {
        assert!(normalize("../etc/passwd").is_err());
        assert!(normalize("a/../../b").is_err());
        assert!(normalize("a/../b").is_err());
        assert!(normalize("/etc/passwd").is_err());
        assert!(normalize("a\0b").is_err());
        assert!(normalize("a\r\nContent-Type: x").is_err());
        assert_eq!(normalize("./a/./b.txt").unwrap(), PathBuf::from("a/b.txt"));
        assert_eq!(normalize(".").unwrap(), PathBuf::new());
    }

    #[test]
    fn write_creates_parents_and_rejects_duplicates() {
        let parent = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(parent.path()).unwrap();

        let path = workspace.write("nested/deeper/a.txt", b"x").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"x");
        assert!(path.starts_with(workspace.path()));

        let err = workspace.write("nested/deeper/a.txt", b"y").unwrap_err();
        assert!(matches!(err, CmdhostError::InvalidRequest(_)));

        let err = workspace.write("nested/deeper/a.txt/c", b"y").unwrap_err();
        assert!(matches!(err, CmdhostError::InvalidRequest(_)));

        let err = workspace.write("nested/deeper", b"y").unwrap_err();
        assert!(matches!(err, CmdhostError::InvalidRequest(_)));

        let err = workspace.write("../outside.txt", b"y").unwrap_err();
        assert!(matches!(err, CmdhostError::InvalidPath(_)));
        assert!(!parent.path().join("outside.txt").exists());
    }

    #[test]
    fn workspaces_are_unique_and_start_empty() {
        let parent = tempfile::tempdir().unwrap();
        let a = Workspace::create(parent.path()).unwrap();
        let b = Workspace::create(parent.path()).unwrap();

        assert_ne!(a.path(), b.path());
        assert_eq!(fs::read_dir(a.path()).unwrap().count(), 0);
    }

    #[test]
    fn destroy_is_idempotent_and_runs_on_drop() {
        let parent = tempfile::tempdir().unwrap();
        let mut workspace = Workspace::create(parent.path()).unwrap();
        workspace.write("f", b"data").unwrap();
        let root = workspace.path().to_path_buf();

        workspace.destroy();
        assert!(workspace.is_destroyed());
        assert!(!root.exists());
        workspace.destroy();

        let dropped = Workspace::create(parent.path()).unwrap();
        let dropped_root = dropped.path().to_path_buf();
        drop(dropped);
        assert!(!dropped_root.exists());
    }

    #[test]
    fn contains_follows_symlinks() {
        let parent = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(parent.path()).unwrap();
        let inside = workspace.write("in.txt", b"ok").unwrap();
        let outside = parent.path().join("secret.txt");
        fs::write(&outside, b"secret").unwrap();

        let link = workspace.path().join("link");
        std::os::unix::fs::symlink(&outside, &link).unwrap();

        assert!(workspace.contains(&inside));
        assert!(!workspace.contains(&link));
        assert!(!workspace.contains(&workspace.path().join("missing")));
    }
}
