//! Client connection handles.
//!
//! A [`Connection`] is the write side of one client socket. Once registered
//! it is owned by the registry, which is the only party that closes it.

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use chrono::Utc;
use futures::stream::SplitSink;
use futures::SinkExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// Unique connection identifier (process-local).
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh connection id.
pub fn next_connection_id() -> ConnectionId {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Duplex handle for one client socket.
///
/// Implementations must serialize their own writes: the registry may hand the
/// same connection to several dispatch workers over time.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Connection identifier for logging.
    fn id(&self) -> ConnectionId;

    /// Write one payload to the client.
    async fn send(&self, payload: &Bytes) -> Result<()>;

    /// Close the connection. Safe to call more than once.
    async fn close(&self);

    /// False once the connection is closed or its peer is gone.
    fn is_open(&self) -> bool;
}

/// WebSocket write half shared with the registry.
pub struct WsConnection {
    id: ConnectionId,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    /// Set once the peer is gone or the socket has been closed.
    closed: AtomicBool,
    /// Timestamp (ms) when the socket was registered.
    connected_at: i64,
}

impl WsConnection {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            id: next_connection_id(),
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
            connected_at: Utc::now().timestamp_millis(),
        }
    }

    /// Record that the read half observed the peer going away.
    ///
    /// The socket is not closed here; the next broadcast fails the write and
    /// the registry drops it.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Milliseconds since the socket was registered.
    pub fn age_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.connected_at
    }
}

/// Text frame for UTF-8 payloads, binary frame otherwise.
fn to_message(payload: &Bytes) -> Message {
    match std::str::from_utf8(payload) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(payload.clone()),
    }
}

#[async_trait]
impl Connection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send(&self, payload: &Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(GatewayError::ConnectionClosed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(to_message(payload)).await?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!("Closing connection {} failed: {}", self.id, e);
        }
        debug!("Connection {} closed after {}ms", self.id, self.age_ms());
    }

    fn is_open(&self) -> bool {
        !self.is_closed()
    }
}
