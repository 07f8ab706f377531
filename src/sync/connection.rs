//! One client's WebSocket, split into a reader and a writer half.
//!
//! The hub never touches sockets. It holds a [`ConnectionHandle`] per client:
//! a bounded outbound queue plus an open flag and a wake-up used to force the
//! writer to close. Enqueueing never blocks; a full queue marks the client for
//! eviction and the writer closes the socket with a policy-violation code.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, warn};

use super::protocol::Envelope;
use super::{ClientId, SyncError, SyncResult, WorkspaceId};

/// Close reason sent to evicted clients
const SLOW_CLIENT_REASON: &str = "connection too slow to keep up with messages";

/// How long a close frame may take before the socket is just dropped
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a WebSocket handshake was refused
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("Origin {0} is not allowed")]
    ForbiddenOrigin(String),

    #[error("WebSocket upgrade failed: {0}")]
    Upgrade(String),
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        let status = match self {
            HandshakeError::ForbiddenOrigin(_) => StatusCode::FORBIDDEN,
            HandshakeError::Upgrade(_) => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

/// Origins allowed to open a WebSocket.
///
/// Requests without an `Origin` header (non-browser clients) and requests
/// whose origin matches their own `Host` are always allowed. Patterns match
/// the origin's host exactly, or any subdomain when written as `*.domain`;
/// a lone `*` allows everything.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    patterns: Vec<String>,
}

impl OriginPolicy {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.into().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn check(&self, headers: &HeaderMap) -> Result<(), HandshakeError> {
        let Some(origin) = headers.get(header::ORIGIN) else {
            return Ok(());
        };
        let origin = origin
            .to_str()
            .map_err(|_| HandshakeError::ForbiddenOrigin("<non-ascii>".to_string()))?;
        let host = origin_host(origin);

        let same_host = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(strip_port)
            .is_some_and(|h| h.eq_ignore_ascii_case(&host));

        if same_host || self.patterns.iter().any(|p| pattern_matches(p, &host)) {
            Ok(())
        } else {
            Err(HandshakeError::ForbiddenOrigin(origin.to_string()))
        }
    }
}

fn origin_host(origin: &str) -> String {
    let rest = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or_default();
    strip_port(authority).to_ascii_lowercase()
}

fn strip_port(authority: &str) -> &str {
    authority.rsplit_once(':').map_or(authority, |(host, _)| host)
}

fn pattern_matches(pattern: &str, host: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_prefix("*.") {
        Some(domain) => host
            .strip_suffix(domain)
            .is_some_and(|sub| sub.ends_with('.')),
        None => pattern == host,
    }
}

/// Validate a WebSocket handshake before upgrading.
pub fn accept(
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    headers: &HeaderMap,
    origins: &OriginPolicy,
) -> Result<WebSocketUpgrade, HandshakeError> {
    let upgrade = upgrade.map_err(|e| HandshakeError::Upgrade(e.body_text()))?;
    origins.check(headers)?;
    Ok(upgrade)
}

/// Outcome of offering a message to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Queue was full; the connection is being force-closed
    Evicted,
    /// Connection was already closed
    Closed,
}

struct HandleInner {
    client_id: ClientId,
    workspace_id: Option<WorkspaceId>,
    tx: mpsc::Sender<Arc<Envelope>>,
    open: AtomicBool,
    evicted: AtomicBool,
    wake: Notify,
}

/// The hub's view of a connection
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("client_id", &self.inner.client_id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ConnectionHandle {
    /// Create a handle with a fresh client id and its outbound queue.
    pub fn new(
        workspace_id: Option<WorkspaceId>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<Envelope>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            inner: Arc::new(HandleInner {
                client_id: uuid::Uuid::new_v4().to_string(),
                workspace_id,
                tx,
                open: AtomicBool::new(true),
                evicted: AtomicBool::new(false),
                wake: Notify::new(),
            }),
        };
        (handle, rx)
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn workspace_id(&self) -> Option<WorkspaceId> {
        self.inner.workspace_id
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    pub fn was_evicted(&self) -> bool {
        self.inner.evicted.load(Ordering::Acquire)
    }

    /// Offer a message without waiting.
    pub fn enqueue_outbound(&self, msg: Arc<Envelope>) -> Delivery {
        if !self.is_open() {
            return Delivery::Closed;
        }
        match self.inner.tx.try_send(msg) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.evict();
                Delivery::Evicted
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                Delivery::Closed
            }
        }
    }

    /// Schedule a policy-violation close. Returns immediately.
    pub fn evict(&self) {
        if self.inner.open.swap(false, Ordering::AcqRel) {
            self.inner.evicted.store(true, Ordering::Release);
            self.inner.wake.notify_one();
        }
    }

    /// Mark closed and wake the writer so it releases the socket. Idempotent.
    pub fn close(&self) {
        if self.inner.open.swap(false, Ordering::AcqRel) {
            self.inner.wake.notify_one();
        }
    }

    async fn closed(&self) {
        self.inner.wake.notified().await
    }
}

/// A freshly accepted WebSocket and its handle
pub struct Connection {
    handle: ConnectionHandle,
    socket: WebSocket,
    outbound: mpsc::Receiver<Arc<Envelope>>,
}

impl Connection {
    pub fn new(socket: WebSocket, workspace_id: Option<WorkspaceId>, queue_capacity: usize) -> Self {
        let (handle, outbound) = ConnectionHandle::new(workspace_id, queue_capacity);
        Self {
            handle,
            socket,
            outbound,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn split(self) -> (ConnectionReader, ConnectionWriter) {
        let (sink, stream) = self.socket.split();
        (
            ConnectionReader {
                handle: self.handle.clone(),
                stream,
            },
            ConnectionWriter {
                handle: self.handle,
                sink,
                outbound: self.outbound,
            },
        )
    }
}

/// Inbound half: frames in, envelopes out
pub struct ConnectionReader {
    handle: ConnectionHandle,
    stream: SplitStream<WebSocket>,
}

impl ConnectionReader {
    /// Wait for the next complete message.
    ///
    /// Fails with `ClientDisconnected` once the peer is gone (the handle is
    /// closed as a side effect) and with `MalformedMessage` for a frame that
    /// does not decode, in which case the connection is still usable.
    pub async fn read_message(&mut self) -> SyncResult<Envelope> {
        loop {
            let frame = match self.stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!(client_id = %self.handle.client_id(), "Read error: {}", e);
                    return Err(self.disconnected());
                }
                None => return Err(self.disconnected()),
            };

            match frame {
                Message::Text(text) => return Ok(Envelope::decode(&text)?),
                Message::Binary(data) => {
                    let text = std::str::from_utf8(&data).map_err(|_| {
                        super::protocol::ProtocolError::UnsupportedFrame("non UTF-8 binary frame")
                    })?;
                    return Ok(Envelope::decode(text)?);
                }
                Message::Close(_) => return Err(self.disconnected()),
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }

    fn disconnected(&self) -> SyncError {
        self.handle.close();
        SyncError::ClientDisconnected(self.handle.client_id().to_string())
    }
}

enum WriterEvent {
    Outbound(Option<Arc<Envelope>>),
    Wake,
    Shutdown,
}

/// Outbound half: drains the queue into the socket
pub struct ConnectionWriter<S = SplitSink<WebSocket, Message>> {
    handle: ConnectionHandle,
    sink: S,
    outbound: mpsc::Receiver<Arc<Envelope>>,
}

impl<S> ConnectionWriter<S>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    /// Write one message, failing if it takes longer than `timeout`.
    pub async fn write_message(&mut self, msg: &Envelope, timeout: Duration) -> SyncResult<()> {
        let text = msg.encode()?;
        match tokio::time::timeout(timeout, self.sink.send(Message::Text(text))).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::WriteTimeout {
                client_id: self.handle.client_id().to_string(),
                timeout,
            }),
        }
    }

    /// Forward queued messages until the connection is closed, evicted or the
    /// server shuts down.
    pub async fn run(
        mut self,
        mut shutdown: broadcast::Receiver<()>,
        write_timeout: Duration,
    ) -> SyncResult<()> {
        let handle = self.handle.clone();
        loop {
            if !handle.is_open() {
                return self.finish().await;
            }

            let event = tokio::select! {
                biased;
                _ = shutdown.recv() => WriterEvent::Shutdown,
                _ = handle.closed() => WriterEvent::Wake,
                msg = self.outbound.recv() => WriterEvent::Outbound(msg),
            };

            match event {
                WriterEvent::Outbound(Some(msg)) => {
                    match self.write_message(&msg, write_timeout).await {
                        Ok(()) => {}
                        Err(e @ SyncError::WriteTimeout { .. }) => {
                            warn!(client_id = %handle.client_id(), "Error writing message to client: {}", e);
                        }
                        Err(e) => {
                            handle.close();
                            return Err(e);
                        }
                    }
                }
                WriterEvent::Outbound(None) | WriterEvent::Wake => return self.finish().await,
                WriterEvent::Shutdown => {
                    handle.close();
                    self.close(close_code::AWAY, "server shutting down").await;
                    return Ok(());
                }
            }
        }
    }

    async fn finish(&mut self) -> SyncResult<()> {
        if self.handle.was_evicted() {
            self.close(close_code::POLICY, SLOW_CLIENT_REASON).await;
            Err(SyncError::BackpressureEviction(
                self.handle.client_id().to_string(),
            ))
        } else {
            self.close(close_code::NORMAL, "").await;
            Ok(())
        }
    }

    /// Send a close frame and release the socket. Idempotent.
    pub async fn close(&mut self, code: u16, reason: &'static str) {
        self.handle.close();
        let frame = Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        }));
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
            let _ = self.sink.send(frame).await;
            let _ = self.sink.close().await;
        })
        .await;
    }
}
