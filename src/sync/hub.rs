//! The synchronization hub.
//!
//! The hub owns the authoritative text of every known file, the registry of
//! live connections and the broadcast rate limiter:
//! - The file map sits behind one async mutex, held for the whole
//!   read-modify-write of an edit including its persistence enqueue and
//!   broadcast, so edits never interleave and every client sees canonical
//!   diffs in the order they were applied
//! - The registry is a DashMap of [`ConnectionHandle`]s; broadcasting only
//!   ever does non-blocking enqueues on them
//! - Confirmed diffs go to the persistence drain over a bounded channel

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use super::connection::{ConnectionHandle, Delivery};
use super::diff::{apply_script, compute_diff, EditScript};
use super::drain::PersistRequest;
use super::limiter::RateLimiter;
use super::protocol::{Envelope, FileEvent, Payload};
use super::{ClientId, FileId, SyncError, SyncResult};
use crate::storage::{ObjectStorage, Repository, StorageError};

/// Configuration for the Hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each connection's outbound queue
    pub outbound_queue: usize,
    /// Capacity of the persistence queue
    pub persist_queue: usize,
    /// Broadcast token refill interval
    pub broadcast_interval: Duration,
    /// Broadcast token bucket capacity
    pub broadcast_burst: u32,
    /// Deadline for a single socket write
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 8,
            persist_queue: 1024,
            broadcast_interval: Duration::from_millis(100),
            broadcast_burst: 8,
            write_timeout: Duration::from_secs(1),
        }
    }
}

/// Snapshot of hub counters
#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub files: usize,
    pub uptime_secs: u64,
}

/// The synchronization hub
pub struct Hub {
    config: HubConfig,
    /// Authoritative content per file
    files: Mutex<HashMap<FileId, String>>,
    connections: DashMap<ClientId, ConnectionHandle>,
    limiter: RateLimiter,
    persist_tx: mpsc::Sender<PersistRequest>,
    repo: Arc<dyn Repository>,
    storage: Arc<dyn ObjectStorage>,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl Hub {
    /// Create a hub and the receiving end of its persistence queue.
    pub fn new(
        repo: Arc<dyn Repository>,
        storage: Arc<dyn ObjectStorage>,
        config: HubConfig,
    ) -> (Self, mpsc::Receiver<PersistRequest>) {
        let (persist_tx, persist_rx) = mpsc::channel(config.persist_queue.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);
        let limiter = RateLimiter::new(config.broadcast_interval, config.broadcast_burst);

        let hub = Self {
            config,
            files: Mutex::new(HashMap::new()),
            connections: DashMap::new(),
            limiter,
            persist_tx,
            repo,
            storage,
            started_at: Instant::now(),
            shutdown_tx,
        };
        (hub, persist_rx)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Load every file the repository knows about.
    ///
    /// Any collaborator failure is returned; the caller treats it as fatal.
    pub async fn hydrate(&self) -> SyncResult<usize> {
        let records = self.repo.list_all_files().await?;
        let mut files = self.files.lock().await;

        for record in records {
            let bytes = self.storage.read_object(&record.disk_path).await?;
            files.insert(record.id, decode_content(record.id, bytes));
        }

        info!("Hydrated {} files", files.len());
        Ok(files.len())
    }

    /// Register a new connection
    pub fn register_connection(&self, handle: ConnectionHandle) {
        let client_id = handle.client_id().to_string();
        info!(
            client_id = %client_id,
            workspace_id = ?handle.workspace_id(),
            "Connection registered"
        );
        self.connections.insert(client_id, handle);
    }

    /// Remove a connection and close it
    pub fn unregister_connection(&self, client_id: &str) {
        if let Some((_, handle)) = self.connections.remove(client_id) {
            handle.close();
            info!(client_id, "Connection unregistered");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Dispatch a decoded message from `sender`.
    pub async fn handle_envelope(&self, sender: &str, envelope: Envelope) -> SyncResult<()> {
        match envelope.payload {
            Payload::Chunk(script) => {
                self.process_chunk(sender, envelope.file_id, script).await?;
            }
            Payload::Event(event) => {
                self.process_event(Some(sender), envelope.file_id, event)
                    .await;
            }
        }
        Ok(())
    }

    /// Apply a client's edit script and fan out the canonical diff.
    ///
    /// Returns the canonical diff, which is empty for a no-op edit.
    pub async fn process_chunk(
        &self,
        sender: &str,
        file_id: FileId,
        script: EditScript,
    ) -> SyncResult<EditScript> {
        let mut files = self.files.lock().await;

        if !files.contains_key(&file_id) {
            let content = self.materialize(file_id).await?;
            files.insert(file_id, content);
        }
        let Some(content) = files.get_mut(&file_id) else {
            return Err(StorageError::NotFound(format!("file {}", file_id)).into());
        };

        let updated = apply_script(content, &script);
        let canonical = compute_diff(content, &updated);

        if canonical.is_empty() {
            debug!(client_id = sender, file_id, "No-op edit");
            return Ok(canonical);
        }

        // Every suspension point comes before the commit, so a caller
        // dropped while waiting here leaves no partial edit behind.
        let permit = self.persist_tx.reserve().await;
        self.acquire_broadcast_token().await;

        *content = updated;
        match permit {
            Ok(permit) => permit.send(PersistRequest {
                file_id,
                ops: canonical.clone(),
            }),
            Err(_) => warn!(file_id, "{}", SyncError::QueueClosed),
        }
        self.fan_out(Some(sender), Envelope::chunk(file_id, canonical.clone()));

        Ok(canonical)
    }

    /// Relay a lifecycle event. File state is left alone.
    pub async fn process_event(&self, sender: Option<&str>, file_id: FileId, event: FileEvent) {
        debug!(file_id, ?event, "Lifecycle event");
        self.broadcast(sender, Envelope::event(file_id, event)).await;
    }

    /// Offer `msg` to every open connection except `sender`.
    ///
    /// Takes one rate-limiter token for the whole fan-out. Connections whose
    /// queue is full are evicted. Returns the number of connections the
    /// message was queued for.
    pub async fn broadcast(&self, sender: Option<&str>, msg: Envelope) -> usize {
        self.acquire_broadcast_token().await;
        self.fan_out(sender, msg)
    }

    async fn acquire_broadcast_token(&self) {
        if !self.limiter.try_acquire() {
            debug!(burst = self.limiter.burst(), "Broadcast rate limited");
            self.limiter.acquire().await;
        }
    }

    /// Enqueue `msg` on every connection except `sender` without waiting.
    fn fan_out(&self, sender: Option<&str>, msg: Envelope) -> usize {
        let msg = Arc::new(msg);
        let mut delivered = 0;

        for entry in self.connections.iter() {
            if sender == Some(entry.key().as_str()) {
                continue;
            }
            match entry.value().enqueue_outbound(msg.clone()) {
                Delivery::Queued => delivered += 1,
                Delivery::Evicted => {
                    warn!(client_id = %entry.key(), "{}", SyncError::BackpressureEviction(entry.key().clone()));
                }
                Delivery::Closed => {}
            }
        }

        delivered
    }

    /// Current authoritative content of a tracked file
    pub async fn file_content(&self, file_id: FileId) -> Option<String> {
        self.files.lock().await.get(&file_id).cloned()
    }

    /// Start tracking a newly created file
    pub async fn track_file(&self, file_id: FileId, content: String) {
        self.files.lock().await.insert(file_id, content);
    }

    /// Stop tracking a file. Returns whether it was tracked.
    pub async fn forget_file(&self, file_id: FileId) -> bool {
        self.files.lock().await.remove(&file_id).is_some()
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            connections: self.connection_count(),
            files: self.files.lock().await.len(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        info!("Hub shutting down");
        let _ = self.shutdown_tx.send(());
        for entry in self.connections.iter() {
            entry.value().close();
        }
    }

    /// Load a file the hub has not seen yet.
    async fn materialize(&self, file_id: FileId) -> SyncResult<String> {
        let Some(record) = self.repo.fetch_file(file_id).await? else {
            debug!(file_id, "Unknown file, starting from empty content");
            return Ok(String::new());
        };

        let content = match self.storage.read_object(&record.disk_path).await {
            Ok(bytes) => decode_content(file_id, bytes),
            Err(StorageError::NotFound(_)) => String::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(file_id, "Materialized file");
        Ok(content)
    }
}

fn decode_content(file_id: FileId, bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(content) => content,
        Err(e) => {
            warn!(file_id, "File is not valid UTF-8, decoding lossily");
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    }
}
