//! Background worker writing confirmed edits to durable storage.
//!
//! A single task consumes the hub's persistence queue in order. Failures are
//! logged and the affected op is dropped; live collaboration never waits on
//! the outcome.

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::diff::EditScript;
use super::{FileId, SyncResult};
use crate::storage::{ObjectStorage, Repository, StorageError};

/// A canonical diff waiting to be persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistRequest {
    pub file_id: FileId,
    pub ops: EditScript,
}

/// Consumer of the persistence queue
pub struct PersistenceDrain {
    repo: Arc<dyn Repository>,
    storage: Arc<dyn ObjectStorage>,
    rx: mpsc::Receiver<PersistRequest>,
}

impl PersistenceDrain {
    pub fn new(
        repo: Arc<dyn Repository>,
        storage: Arc<dyn ObjectStorage>,
        rx: mpsc::Receiver<PersistRequest>,
    ) -> Self {
        Self { repo, storage, rx }
    }

    /// Run the drain on its own task
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Process requests until the queue closes or shutdown is signalled.
    ///
    /// On shutdown, requests already queued are still written.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Persistence drain started");

        loop {
            tokio::select! {
                request = self.rx.recv() => match request {
                    Some(request) => self.persist(request).await,
                    None => break,
                },
                _ = shutdown.recv() => {
                    self.rx.close();
                    while let Some(request) = self.rx.recv().await {
                        self.persist(request).await;
                    }
                    break;
                }
            }
        }

        info!("Persistence drain stopped");
    }

    async fn persist(&self, request: PersistRequest) {
        let file_id = request.file_id;
        if let Err(e) = self.try_persist(request).await {
            error!(file_id, "Failed to persist chunk: {}", e);
        }
    }

    async fn try_persist(&self, request: PersistRequest) -> SyncResult<()> {
        let file = self
            .repo
            .fetch_file(request.file_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("file {}", request.file_id)))?;

        let mut written = 0;
        for op in &request.ops {
            match self.storage.persist_chunk(&file.disk_path, op).await {
                Ok(()) => written += 1,
                Err(e) => error!(
                    file_id = file.id,
                    position = op.position,
                    "Dropping chunk: {}",
                    e
                ),
            }
        }

        if written > 0 {
            self.repo.mark_updated(file.id).await?;
        }
        debug!(file_id = file.id, written, "Persisted edit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{FailingStorage, MemoryRepository, MemoryStorage};
    use crate::sync::connection::ConnectionHandle;
    use crate::sync::diff::{apply_script, EditOp};
    use crate::sync::hub::{Hub, HubConfig};
    use crate::sync::protocol::Payload;
    use std::time::Duration;

    #[tokio::test]
    async fn test_persists_in_order_and_marks_updated() {
        let repo = Arc::new(MemoryRepository::new());
        let storage = Arc::new(MemoryStorage::new());
        repo.insert(1, "objects/1", 1);
        storage.put("objects/1", "hello!");

        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, _) = broadcast::channel(1);
        let drain = PersistenceDrain::new(repo.clone(), storage.clone(), rx);
        let task = drain.spawn(shutdown_tx.subscribe());

        tx.send(PersistRequest {
            file_id: 1,
            ops: vec![EditOp::insert(5, " world")],
        })
        .await
        .unwrap();
        tx.send(PersistRequest {
            file_id: 1,
            ops: vec![EditOp::delete(0, "h"), EditOp::insert(0, "H")],
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(storage.get("objects/1").as_deref(), Some("Hello world!"));
        assert_eq!(repo.version(1), Some(2));
    }

    #[tokio::test]
    async fn test_unknown_file_is_dropped() {
        let repo = Arc::new(MemoryRepository::new());
        let storage = Arc::new(MemoryStorage::new());
        repo.insert(2, "objects/2", 1);

        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, _) = broadcast::channel(1);
        let task = PersistenceDrain::new(repo.clone(), storage.clone(), rx)
            .spawn(shutdown_tx.subscribe());

        tx.send(PersistRequest {
            file_id: 99,
            ops: vec![EditOp::insert(0, "lost")],
        })
        .await
        .unwrap();
        tx.send(PersistRequest {
            file_id: 2,
            ops: vec![EditOp::insert(0, "kept")],
        })
        .await
        .unwrap();
        drop(tx);
        task.await.unwrap();

        // The drain kept going after the failure
        assert_eq!(storage.get("objects/2").as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queued_requests() {
        let repo = Arc::new(MemoryRepository::new());
        let storage = Arc::new(MemoryStorage::new());
        repo.insert(1, "objects/1", 1);

        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, _) = broadcast::channel(1);
        let drain = PersistenceDrain::new(repo.clone(), storage.clone(), rx);

        tx.send(PersistRequest {
            file_id: 1,
            ops: vec![EditOp::insert(0, "queued")],
        })
        .await
        .unwrap();

        let shutdown = shutdown_tx.subscribe();
        shutdown_tx.send(()).unwrap();
        drain.run(shutdown).await;

        assert_eq!(storage.get("objects/1").as_deref(), Some("queued"));
        // Sender is still alive, but the drain has stopped
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_storage_failure_does_not_block_broadcast() {
        let repo = Arc::new(MemoryRepository::new());
        repo.insert(1, "objects/1", 1);
        let storage: Arc<dyn ObjectStorage> = Arc::new(FailingStorage);

        let config = HubConfig {
            broadcast_interval: Duration::from_millis(1),
            broadcast_burst: 64,
            ..Default::default()
        };
        let (hub, persist_rx) = Hub::new(repo.clone(), storage.clone(), config);
        let _task = PersistenceDrain::new(repo.clone(), storage, persist_rx)
            .spawn(hub.shutdown_receiver());

        hub.track_file(1, String::new()).await;
        let (x, _x_rx) = ConnectionHandle::new(Some(1), 8);
        let (y, mut y_rx) = ConnectionHandle::new(Some(1), 8);
        hub.register_connection(x.clone());
        hub.register_connection(y);

        let mut replica = String::new();
        for text in ["Hello", "!"] {
            let position = replica.chars().count();
            hub.process_chunk(x.client_id(), 1, vec![EditOp::insert(position, text)])
                .await
                .unwrap();

            let msg = y_rx.recv().await.unwrap();
            let Payload::Chunk(ops) = &msg.payload else {
                panic!("expected chunk");
            };
            replica = apply_script(&replica, ops);
        }

        assert_eq!(replica, "Hello!");
        assert_eq!(hub.file_content(1).await.as_deref(), Some("Hello!"));
        assert_eq!(repo.version(1), Some(0));
    }
}
