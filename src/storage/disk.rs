//! Filesystem object storage.
//!
//! Objects live under a root directory at a path derived from a fresh UUID,
//! split on `-` into nested directories to keep directory sizes small.
//! Paths handed out are relative to the root.
//!
//! Edit ops are applied with the diff engine's own semantics (char offsets,
//! clamped ranges) and written back through a temp file and a rename, so a
//! crash mid-write never leaves a half-edited object.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::{ObjectStorage, StorageError, StorageResult};
use crate::sync::diff::{apply_diff, EditOp};

/// [`ObjectStorage`] rooted at a local directory
#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root directory if needed
    pub async fn init(&self) -> StorageResult<()> {
        fs::create_dir_all(&self.root).await.map_err(|e| {
            StorageError::InitFailed(format!(
                "Failed to create {}: {}",
                self.root.display(),
                e
            ))
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative object path, refusing anything that escapes the root.
    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(StorageError::NotFound(format!("invalid object path: {}", path)));
        }
        Ok(self.root.join(relative))
    }

    async fn write_atomic(&self, target: &Path, content: &[u8]) -> StorageResult<()> {
        let tmp = target.with_extension("tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, target).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for DiskStorage {
    async fn persist_chunk(&self, path: &str, op: &EditOp) -> StorageResult<()> {
        let target = self.resolve(path)?;

        let current = match fs::read(&target).await {
            Ok(bytes) => String::from_utf8(bytes)
                .map_err(|_| StorageError::Corruption(format!("{} is not UTF-8 text", path)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).await?;
                }
                String::new()
            }
            Err(e) => return Err(e.into()),
        };

        let updated = apply_diff(&current, op);
        self.write_atomic(&target, updated.as_bytes()).await?;

        debug!(path, position = op.position, len = op.len, "Persisted chunk");
        Ok(())
    }

    async fn read_object(&self, path: &str) -> StorageResult<Vec<u8>> {
        let target = self.resolve(path)?;
        match fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(format!("object {}", path)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_object(&self, content: &[u8]) -> StorageResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let relative: PathBuf = id.split('-').collect();
        let target = self.root.join(&relative);

        if fs::try_exists(&target).await? {
            return Err(StorageError::AlreadyExists(relative.display().to_string()));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        self.write_atomic(&target, content).await?;

        Ok(relative.to_string_lossy().into_owned())
    }

    async fn delete_object(&self, path: &str) -> StorageResult<()> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
