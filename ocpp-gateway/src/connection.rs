//! Live connection handles.
//!
//! A [`Connection`] is the write side of one accepted socket plus its
//! connection-scoped metadata. The read side is owned by the session task,
//! which watches [`Connection::closed`] to learn about eviction or shutdown.
//!
//! # Close semantics
//!
//! ```text
//! close(reason) ──► record reason (first caller wins)
//!               └─► cancel token ──► session loop sends Close frame, exits
//!                                 └─► on_closed: unregister, notify observers
//! ```
//!
//! Once closed, [`Connection::send_frame`] fails with
//! [`TransportError::Closed`] without touching the socket.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::envelope::Frame;
use crate::error::TransportError;
use crate::types::{ConnectionId, NetworkingMode, NodeId};

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection registered the same node id.
    Superseded,
    /// A write failed and the connection was presumed dead.
    WriteFailed,
    /// The peer closed the socket.
    PeerClosed,
    /// Reading from the socket failed.
    ReadFailed,
    /// The peer stopped answering pings.
    Unresponsive,
    /// An operator disconnected the node.
    Disconnected,
    /// The gateway is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Whether this close removed a live connection on the endpoint's
    /// initiative.
    pub fn is_eviction(&self) -> bool {
        matches!(
            self,
            CloseReason::Superseded | CloseReason::WriteFailed | CloseReason::Disconnected
        )
    }

    fn close_code(&self) -> CloseCode {
        match self {
            CloseReason::Shutdown => CloseCode::Away,
            CloseReason::Superseded | CloseReason::Disconnected => CloseCode::Policy,
            _ => CloseCode::Normal,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::Superseded => "superseded by a newer connection",
            CloseReason::WriteFailed => "write failed",
            CloseReason::PeerClosed => "closed by peer",
            CloseReason::ReadFailed => "read failed",
            CloseReason::Unresponsive => "peer unresponsive",
            CloseReason::Disconnected => "disconnected by operator",
            CloseReason::Shutdown => "gateway shutdown",
        };
        f.write_str(text)
    }
}

/// Write half of a socket.
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    /// Write one data frame.
    async fn send_frame(&self, frame: Frame) -> Result<(), TransportError>;

    /// Write a ping control frame.
    async fn send_ping(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Send a close frame and shut the write half down.
    async fn close(&self, reason: CloseReason) -> Result<(), TransportError>;
}

/// Snapshot of a connection's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection id.
    pub connection_id: ConnectionId,
    /// Bound node identity.
    pub node_id: NodeId,
    /// Peer address, if known.
    pub remote_addr: Option<SocketAddr>,
    /// Negotiated WebSocket subprotocol.
    pub subprotocol: String,
    /// Framing last seen on inbound requests.
    pub networking_mode: NetworkingMode,
    /// Time the connection was accepted, per the gateway's time provider.
    pub connected_at: Duration,
    /// Time of the last inbound frame, per the gateway's time provider.
    pub last_seen: Duration,
}

/// Handle to one live socket.
pub struct Connection {
    id: ConnectionId,
    node_id: NodeId,
    remote_addr: Option<SocketAddr>,
    subprotocol: String,
    networking_mode: AtomicU8,
    connected_at: Duration,
    last_seen_ms: AtomicU64,
    sink: Arc<dyn FrameSink>,
    shutdown: CancellationToken,
    close_reason: OnceLock<CloseReason>,
}

impl Connection {
    /// Create a connection bound to `node_id`.
    pub fn new(
        node_id: NodeId,
        remote_addr: Option<SocketAddr>,
        subprotocol: impl Into<String>,
        sink: Arc<dyn FrameSink>,
        now: Duration,
    ) -> Self {
        Self {
            id: ConnectionId::next(),
            node_id,
            remote_addr,
            subprotocol: subprotocol.into(),
            networking_mode: AtomicU8::new(NetworkingMode::Standard.as_u8()),
            connected_at: now,
            last_seen_ms: AtomicU64::new(millis(now)),
            sink,
            shutdown: CancellationToken::new(),
            close_reason: OnceLock::new(),
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Node identity bound at upgrade.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Negotiated subprotocol.
    pub fn subprotocol(&self) -> &str {
        &self.subprotocol
    }

    /// Framing last seen on this connection.
    pub fn networking_mode(&self) -> NetworkingMode {
        NetworkingMode::from_u8(self.networking_mode.load(Ordering::Relaxed)).unwrap_or_default()
    }

    /// Record the framing used by an inbound request.
    pub fn observe_mode(&self, mode: NetworkingMode) {
        self.networking_mode.store(mode.as_u8(), Ordering::Relaxed);
    }

    /// Update the last-seen timestamp.
    pub fn touch(&self, now: Duration) {
        self.last_seen_ms.fetch_max(millis(now), Ordering::Relaxed);
    }

    /// Time of the last inbound frame.
    pub fn last_seen(&self) -> Duration {
        Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed))
    }

    /// Metadata snapshot.
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.id,
            node_id: self.node_id.clone(),
            remote_addr: self.remote_addr,
            subprotocol: self.subprotocol.clone(),
            networking_mode: self.networking_mode(),
            connected_at: self.connected_at,
            last_seen: self.last_seen(),
        }
    }

    /// Write a data frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the connection is closed, or the
    /// sink's error if the write fails.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.sink.send_frame(frame).await
    }

    /// Write a ping.
    pub(crate) async fn send_ping(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.sink.send_ping(payload).await
    }

    /// Mark the connection closed.
    ///
    /// Returns `true` if this call closed it; later calls keep the first
    /// reason and return `false`.
    pub fn close(&self, reason: CloseReason) -> bool {
        let first = self.close_reason.set(reason).is_ok();
        self.shutdown.cancel();
        first
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Reason passed to the first [`close`](Self::close) call.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Resolves once the connection is closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Flush a close frame to the peer. Called by the session task after the
    /// connection has been closed.
    pub(crate) async fn shutdown_socket(&self) {
        let reason = self.close_reason().unwrap_or(CloseReason::PeerClosed);
        if let Err(e) = self.sink.close(reason).await {
            tracing::debug!(connection_id = %self.id, error = %e, "error closing socket");
        }
    }
}

fn millis(at: Duration) -> u64 {
    u64::try_from(at.as_millis()).unwrap_or(u64::MAX)
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("node_id", &self.node_id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// [`FrameSink`] over the write half of a tokio-tungstenite stream.
pub struct WsFrameSink<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    write_timeout: Duration,
}

impl<S> WsFrameSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a write half. Writes longer than `write_timeout` fail.
    pub fn new(sink: SplitSink<WebSocketStream<S>, Message>, write_timeout: Duration) -> Self {
        Self {
            sink: Mutex::new(sink),
            write_timeout,
        }
    }

    async fn write(&self, message: Message) -> Result<(), TransportError> {
        let write = async {
            let mut sink = self.sink.lock().await;
            sink.send(message).await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => result.map_err(TransportError::from),
            Err(_) => Err(TransportError::WriteTimeout),
        }
    }
}

#[async_trait]
impl<S> FrameSink for WsFrameSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(bytes) => Message::Binary(bytes),
        };
        self.write(message).await
    }

    async fn send_ping(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.write(Message::Ping(payload)).await
    }

    async fn close(&self, reason: CloseReason) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: reason.close_code(),
            reason: reason.to_string().into(),
        };
        let close = async {
            let mut sink = self.sink.lock().await;
            // Already closed by the peer is fine.
            let _ = sink.send(Message::Close(Some(frame))).await;
            sink.close().await
        };
        match tokio::time::timeout(self.write_timeout, close).await {
            Ok(result) => result.map_err(TransportError::from),
            Err(_) => Err(TransportError::WriteTimeout),
        }
    }
}
