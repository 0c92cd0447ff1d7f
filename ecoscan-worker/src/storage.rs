//! Blob storage port for uploaded analysis binaries.
//!
//! Stored readers are stream-only in the fleet's object store, while the
//! analyzer needs random access; callers therefore fetch objects to local
//! files before analysis.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists object names under `prefix`, sorted, prefix included.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Copies an object to a local file, returning the byte count.
    async fn fetch(&self, name: &str, dest: &Path) -> Result<u64, StorageError>;
}

/// Directory-backed object store. Object names map to relative paths under
/// the root.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        for dirent in std::fs::read_dir(dir)? {
            let path = dirent?.path();
            if path.is_dir() {
                Self::walk(&path, root, out)?;
            } else if let Ok(rel) = path.strip_prefix(root) {
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let names = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<String>> {
            let mut names = Vec::new();
            if root.is_dir() {
                Self::walk(&root, &root, &mut names)?;
            }
            names.retain(|n| n.starts_with(&prefix));
            names.sort_unstable();
            Ok(names)
        })
        .await
        .map_err(|err| StorageError::Io(std::io::Error::other(err)))??;
        Ok(names)
    }

    async fn fetch(&self, name: &str, dest: &Path) -> Result<u64, StorageError> {
        let src = self.root.join(name);
        if !src.is_file() {
            return Err(StorageError::NotFound(name.to_string()));
        }
        Ok(tokio::fs::copy(&src, dest).await?)
    }
}
