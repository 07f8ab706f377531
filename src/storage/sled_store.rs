//! Sled-based metadata repository.
//!
//! Files and workspaces are stored as bincode records keyed by their
//! big-endian id, so iteration order equals id order. A secondary tree maps
//! workspace names to ids for login lookups. Ids come from sled's monotonic
//! generator, shifted by one so they are always positive.

use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;

use super::{
    FileRecord, NewFile, Repository, StorageConfig, StorageError, StorageResult, Workspace,
};
use crate::sync::{FileId, WorkspaceId};

/// Tree names for different data types
const TREE_FILES: &str = "files";
const TREE_WORKSPACES: &str = "workspaces";
const TREE_WORKSPACE_NAMES: &str = "workspace_names";

/// Sled-backed [`Repository`]
#[derive(Clone)]
pub struct SledRepository {
    db: Arc<Db>,
    files: Tree,
    workspaces: Tree,
    workspace_names: Tree,
}

impl SledRepository {
    /// Open or create a repository at the configured database path
    pub fn open(config: &StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.database_path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.database_path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let files = db.open_tree(TREE_FILES)?;
        let workspaces = db.open_tree(TREE_WORKSPACES)?;
        let workspace_names = db.open_tree(TREE_WORKSPACE_NAMES)?;

        Ok(Self {
            db: Arc::new(db),
            files,
            workspaces,
            workspace_names,
        })
    }

    fn next_id(&self) -> StorageResult<i64> {
        Ok(self.db.generate_id()? as i64 + 1)
    }

    fn get_file(&self, id: FileId) -> StorageResult<Option<FileRecord>> {
        match self.files.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_file(&self, file: &FileRecord) -> StorageResult<()> {
        let bytes = bincode::serialize(file)?;
        self.files.insert(file.id.to_be_bytes(), bytes)?;
        Ok(())
    }

    fn scan_files(&self) -> impl Iterator<Item = StorageResult<FileRecord>> + '_ {
        self.files.iter().map(|item| {
            let (_, value) = item?;
            Ok(bincode::deserialize(&value)?)
        })
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[async_trait]
impl Repository for SledRepository {
    async fn fetch_file(&self, id: FileId) -> StorageResult<Option<FileRecord>> {
        self.get_file(id)
    }

    async fn fetch_files(&self, workspace_id: WorkspaceId) -> StorageResult<Vec<FileRecord>> {
        self.scan_files()
            .filter(|file| match file {
                Ok(file) => file.workspace_id == workspace_id,
                Err(_) => true,
            })
            .collect()
    }

    async fn list_all_files(&self) -> StorageResult<Vec<FileRecord>> {
        self.scan_files().collect()
    }

    async fn add_file(&self, file: NewFile) -> StorageResult<FileRecord> {
        let now = chrono::Utc::now().timestamp();
        let record = FileRecord {
            id: self.next_id()?,
            disk_path: file.disk_path,
            workspace_path: file.workspace_path,
            mime_type: file.mime_type,
            hash: file.hash,
            created_at: now,
            updated_at: now,
            version: 0,
            workspace_id: file.workspace_id,
        };
        self.put_file(&record)?;
        Ok(record)
    }

    async fn delete_file(&self, id: FileId) -> StorageResult<()> {
        self.files.remove(id.to_be_bytes())?;
        Ok(())
    }

    async fn mark_updated(&self, id: FileId) -> StorageResult<()> {
        let mut file = self
            .get_file(id)?
            .ok_or_else(|| StorageError::NotFound(format!("file {}", id)))?;
        file.updated_at = chrono::Utc::now().timestamp();
        file.version += 1;
        self.put_file(&file)
    }

    async fn fetch_workspace(&self, name: &str) -> StorageResult<Option<Workspace>> {
        let Some(id) = self.workspace_names.get(name.as_bytes())? else {
            return Ok(None);
        };
        match self.workspaces.get(&id)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Err(StorageError::Corruption(format!(
                "workspace name {} points to a missing record",
                name
            ))),
        }
    }

    async fn add_workspace(
        &self,
        name: &str,
        salt: &str,
        password_hash: &str,
    ) -> StorageResult<Workspace> {
        let workspace = Workspace {
            id: self.next_id()?,
            name: name.to_string(),
            salt: salt.to_string(),
            password_hash: password_hash.to_string(),
            created_at: chrono::Utc::now().timestamp(),
        };
        let key = workspace.id.to_be_bytes();

        let claimed = self.workspace_names.compare_and_swap(
            name.as_bytes(),
            None as Option<&[u8]>,
            Some(&key[..]),
        )?;
        if claimed.is_err() {
            return Err(StorageError::AlreadyExists(format!("workspace {}", name)));
        }

        self.workspaces
            .insert(key, bincode::serialize(&workspace)?)?;
        Ok(workspace)
    }
}

impl Drop for SledRepository {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}
