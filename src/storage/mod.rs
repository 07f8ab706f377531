//! Durable storage collaborators.
//!
//! Two narrow interfaces sit behind the hub:
//! - [`Repository`]: file and workspace metadata, backed by sled
//! - [`ObjectStorage`]: the text objects themselves, backed by the filesystem
//!
//! The hub only ever talks to the trait objects, so tests swap in the
//! in-memory doubles from [`memory`].

mod disk;
#[cfg(test)]
pub mod memory;
mod sled_store;

pub use disk::DiskStorage;
pub use sled_store::SledRepository;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::diff::EditOp;
use crate::sync::{FileId, WorkspaceId};

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Metadata of a tracked file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    /// Object path relative to the storage root
    pub disk_path: String,
    /// Path of the file inside its workspace, as the client sees it
    pub workspace_path: String,
    pub mime_type: String,
    /// Hex SHA-256 of the content at creation
    pub hash: String,
    /// Unix timestamp of creation
    pub created_at: i64,
    /// Unix timestamp of the last persisted edit
    pub updated_at: i64,
    /// Number of persisted edits
    pub version: u64,
    pub workspace_id: WorkspaceId,
}

/// Parameters for registering a new file
#[derive(Debug, Clone)]
pub struct NewFile {
    pub disk_path: String,
    pub workspace_path: String,
    pub mime_type: String,
    pub hash: String,
    pub workspace_id: WorkspaceId,
}

/// A workspace and its login credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    /// Hex salt mixed into the password hash
    pub salt: String,
    /// Hex SHA-256 of salt and password
    pub password_hash: String,
    pub created_at: i64,
}

/// File and workspace metadata store
#[async_trait]
pub trait Repository: Send + Sync {
    async fn fetch_file(&self, id: FileId) -> StorageResult<Option<FileRecord>>;

    async fn fetch_files(&self, workspace_id: WorkspaceId) -> StorageResult<Vec<FileRecord>>;

    /// Every file of every workspace, used once at startup
    async fn list_all_files(&self) -> StorageResult<Vec<FileRecord>>;

    async fn add_file(&self, file: NewFile) -> StorageResult<FileRecord>;

    async fn delete_file(&self, id: FileId) -> StorageResult<()>;

    /// Bump `updated_at` and `version` after a persisted edit
    async fn mark_updated(&self, id: FileId) -> StorageResult<()>;

    async fn fetch_workspace(&self, name: &str) -> StorageResult<Option<Workspace>>;

    async fn add_workspace(
        &self,
        name: &str,
        salt: &str,
        password_hash: &str,
    ) -> StorageResult<Workspace>;
}

/// Byte-level object store for file contents
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Apply one edit op to the stored object at `path`
    async fn persist_chunk(&self, path: &str, op: &EditOp) -> StorageResult<()>;

    async fn read_object(&self, path: &str) -> StorageResult<Vec<u8>>;

    /// Store `content` as a new object and return its path
    async fn create_object(&self, content: &[u8]) -> StorageResult<String>;

    async fn delete_object(&self, path: &str) -> StorageResult<()>;
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the sled database directory
    pub database_path: String,
    /// Root directory of stored objects
    pub objects_dir: String,
    /// Cache size in bytes (default: 64MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only on explicit flush)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "./data/metadata.sled".to_string(),
            objects_dir: "./data".to_string(),
            cache_size: 64 * 1024 * 1024,
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(database_path: impl Into<String>, objects_dir: impl Into<String>) -> Self {
        Self {
            database_path: database_path.into(),
            objects_dir: objects_dir.into(),
            ..Default::default()
        }
    }
}

/// Hex SHA-256 of `content`
pub fn content_hash(content: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(content))
}
