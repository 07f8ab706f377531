//! Real-time synchronization core.
//!
//! This module implements the live side of the server:
//! - Character-level diff engine shared by the hub and the storage layer
//! - JSON envelope protocol with typed, validated decoding
//! - Per-client connections with bounded outbound queues
//! - The hub owning the authoritative text of every file
//! - A background drain forwarding confirmed edits to durable storage

pub mod connection;
pub mod diff;
pub mod drain;
pub mod hub;
pub mod limiter;
pub mod protocol;

pub use connection::{Connection, ConnectionHandle, HandshakeError};
pub use drain::PersistenceDrain;
pub use hub::{Hub, HubConfig};

use std::time::Duration;

use crate::storage::StorageError;
use protocol::ProtocolError;

/// Identifier of a tracked file (always positive)
pub type FileId = i64;

/// Identifier of a workspace, as carried by access tokens
pub type WorkspaceId = i64;

/// Opaque per-connection identifier, generated at accept time
pub type ClientId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The WebSocket handshake was refused; no connection exists
    #[error("Handshake rejected: {0}")]
    Handshake(#[from] HandshakeError),

    /// A single frame could not be decoded; the connection stays up
    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] ProtocolError),

    /// Peer closed the socket or the stream ended
    #[error("Client {0} disconnected")]
    ClientDisconnected(ClientId),

    /// A write did not complete within its deadline
    #[error("Write to client {client_id} timed out after {timeout:?}")]
    WriteTimeout {
        client_id: ClientId,
        timeout: Duration,
    },

    /// Transport-level failure on an open socket
    #[error("Transport error: {0}")]
    Transport(String),

    /// A storage collaborator failed
    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),

    /// The client's outbound queue was full and it was scheduled for closing
    #[error("Client {0} evicted: outbound queue full")]
    BackpressureEviction(ClientId),

    /// The persistence queue has no consumer anymore
    #[error("Persistence queue closed")]
    QueueClosed,
}

impl From<axum::Error> for SyncError {
    fn from(err: axum::Error) -> Self {
        SyncError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::ClientDisconnected("client-123".to_string());
        assert_eq!(err.to_string(), "Client client-123 disconnected");

        let err = SyncError::from(ProtocolError::InvalidFileId(0));
        assert_eq!(err.to_string(), "Malformed message: Invalid file id: 0");
    }

    #[test]
    fn test_write_timeout_display() {
        let err = SyncError::WriteTimeout {
            client_id: "c".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(err.to_string(), "Write to client c timed out after 1s");
    }
}
