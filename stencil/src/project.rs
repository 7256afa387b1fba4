//! Project tree writes
//!
//! All writes are scoped to a project root. Destination paths are checked
//! lexically before any I/O: a target that escapes the root via traversal
//! is rejected outright. Directory creation is recursive; permission bits
//! of an existing file survive a rewrite.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("project root {0} does not exist")]
    RootMissing(PathBuf),

    #[error("target {target} escapes the project root")]
    PathEscape { target: String },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A handle on the directory tree files are materialized into.
#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
}

impl Project {
    /// Open an existing directory as the project root.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ProjectError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ProjectError::RootMissing(root));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a target path against the root, rejecting any traversal
    /// that would land outside it. Purely lexical, so the check holds
    /// before the destination exists.
    pub fn resolve_rel(&self, target: &str) -> Result<PathBuf, ProjectError> {
        let escape = || ProjectError::PathEscape {
            target: target.to_string(),
        };

        let mut depth: i64 = 0;
        for component in Path::new(target).components() {
            match component {
                Component::Normal(_) => depth += 1,
                Component::CurDir => {}
                Component::ParentDir => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(escape());
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(escape()),
            }
        }

        Ok(self.root.join(target))
    }

    /// Current contents of the file at `target`, or `None` if it does not
    /// exist yet.
    pub fn read_existing(&self, target: &str) -> Result<Option<Vec<u8>>, ProjectError> {
        let path = self.resolve_rel(target)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProjectError::Read { path, source: e }),
        }
    }

    /// Write `contents` to `target`, creating parent directories as needed
    /// and preserving an existing file's permission bits.
    pub fn write_file(&self, target: &str, contents: &[u8]) -> Result<(), ProjectError> {
        let path = self.resolve_rel(target)?;

        let write_err = |e| ProjectError::Write {
            path: path.clone(),
            source: e,
        };

        let existing_perms = fs::metadata(&path).map(|m| m.permissions()).ok();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        fs::write(&path, contents).map_err(write_err)?;

        if let Some(perms) = existing_perms {
            fs::set_permissions(&path, perms).map_err(write_err)?;
        }

        Ok(())
    }
}
