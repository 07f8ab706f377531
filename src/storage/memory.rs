//! In-memory collaborators for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use super::{
    FileRecord, NewFile, ObjectStorage, Repository, StorageError, StorageResult, Workspace,
};
use crate::sync::diff::{apply_diff, EditOp};
use crate::sync::{FileId, WorkspaceId};

#[derive(Default)]
pub struct MemoryRepository {
    next_id: AtomicI64,
    files: Mutex<BTreeMap<FileId, FileRecord>>,
    workspaces: Mutex<HashMap<String, Workspace>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a file whose object lives at `disk_path`
    pub fn insert(&self, id: FileId, disk_path: &str, workspace_id: WorkspaceId) -> FileRecord {
        let record = FileRecord {
            id,
            disk_path: disk_path.to_string(),
            workspace_path: format!("{}.md", id),
            mime_type: "text/plain; charset=utf-8".to_string(),
            hash: String::new(),
            created_at: 0,
            updated_at: 0,
            version: 0,
            workspace_id,
        };
        self.next_id.fetch_max(id, Ordering::SeqCst);
        self.files.lock().insert(id, record.clone());
        record
    }

    pub fn version(&self, id: FileId) -> Option<u64> {
        self.files.lock().get(&id).map(|f| f.version)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn fetch_file(&self, id: FileId) -> StorageResult<Option<FileRecord>> {
        Ok(self.files.lock().get(&id).cloned())
    }

    async fn fetch_files(&self, workspace_id: WorkspaceId) -> StorageResult<Vec<FileRecord>> {
        Ok(self
            .files
            .lock()
            .values()
            .filter(|f| f.workspace_id == workspace_id)
            .cloned()
            .collect())
    }

    async fn list_all_files(&self) -> StorageResult<Vec<FileRecord>> {
        Ok(self.files.lock().values().cloned().collect())
    }

    async fn add_file(&self, file: NewFile) -> StorageResult<FileRecord> {
        let record = FileRecord {
            id: self.next_id(),
            disk_path: file.disk_path,
            workspace_path: file.workspace_path,
            mime_type: file.mime_type,
            hash: file.hash,
            created_at: 0,
            updated_at: 0,
            version: 0,
            workspace_id: file.workspace_id,
        };
        self.files.lock().insert(record.id, record.clone());
        Ok(record)
    }

    async fn delete_file(&self, id: FileId) -> StorageResult<()> {
        self.files.lock().remove(&id);
        Ok(())
    }

    async fn mark_updated(&self, id: FileId) -> StorageResult<()> {
        let mut files = self.files.lock();
        let file = files
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("file {}", id)))?;
        file.version += 1;
        Ok(())
    }

    async fn fetch_workspace(&self, name: &str) -> StorageResult<Option<Workspace>> {
        Ok(self.workspaces.lock().get(name).cloned())
    }

    async fn add_workspace(
        &self,
        name: &str,
        salt: &str,
        password_hash: &str,
    ) -> StorageResult<Workspace> {
        let mut workspaces = self.workspaces.lock();
        if workspaces.contains_key(name) {
            return Err(StorageError::AlreadyExists(name.to_string()));
        }
        let workspace = Workspace {
            id: self.next_id(),
            name: name.to_string(),
            salt: salt.to_string(),
            password_hash: password_hash.to_string(),
            created_at: 0,
        };
        workspaces.insert(name.to_string(), workspace.clone());
        Ok(workspace)
    }
}

/// Object store keeping text objects in a map
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, content: &str) {
        self.objects
            .lock()
            .insert(path.to_string(), content.to_string());
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.objects.lock().get(path).cloned()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn persist_chunk(&self, path: &str, op: &EditOp) -> StorageResult<()> {
        let mut objects = self.objects.lock();
        let current = objects.entry(path.to_string()).or_default();
        *current = apply_diff(current, op);
        Ok(())
    }

    async fn read_object(&self, path: &str) -> StorageResult<Vec<u8>> {
        self.get(path)
            .map(String::into_bytes)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn create_object(&self, content: &[u8]) -> StorageResult<String> {
        let path = uuid::Uuid::new_v4().to_string();
        self.put(&path, &String::from_utf8_lossy(content));
        Ok(path)
    }

    async fn delete_object(&self, path: &str) -> StorageResult<()> {
        self.objects.lock().remove(path);
        Ok(())
    }
}

/// Object store whose writes always fail
#[derive(Default)]
pub struct FailingStorage;

#[async_trait]
impl ObjectStorage for FailingStorage {
    async fn persist_chunk(&self, path: &str, _op: &EditOp) -> StorageResult<()> {
        Err(StorageError::Io(std::io::Error::other(format!(
            "disk full writing {}",
            path
        ))))
    }

    async fn read_object(&self, path: &str) -> StorageResult<Vec<u8>> {
        Err(StorageError::Io(std::io::Error::other(format!(
            "disk unavailable reading {}",
            path
        ))))
    }

    async fn create_object(&self, _content: &[u8]) -> StorageResult<String> {
        Err(StorageError::Io(std::io::Error::other("disk full")))
    }

    async fn delete_object(&self, _path: &str) -> StorageResult<()> {
        Ok(())
    }
}
