use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::registry::SessionPayload;

/// Default capacity of a connection's outbound queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// The connection's outbound queue was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

struct ConnectionInner {
    id: String,
    outbound: mpsc::Sender<String>,
    closed: CancellationToken,
}

/// Handle to one live transport connection.
///
/// Outbound frames go through a bounded queue drained by a single writer task
/// owned by the transport, so concurrent senders never interleave frames on
/// the socket. Closing the handle cancels its token; the writer task and the
/// read loop both watch that token and wind down.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its outbound queue.
    pub fn new(id: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            inner: Arc::new(ConnectionInner {
                id: id.into(),
                outbound,
                closed: CancellationToken::new(),
            }),
        };
        (handle, rx)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Queue a text frame for the writer task.
    ///
    /// Waits for queue capacity, but gives up as soon as the connection is
    /// closed.
    pub async fn send(&self, frame: String) -> Result<(), ConnectionClosed> {
        if self.is_closed() {
            return Err(ConnectionClosed);
        }
        tokio::select! {
            biased;
            _ = self.inner.closed.cancelled() => Err(ConnectionClosed),
            sent = self.inner.outbound.send(frame) => sent.map_err(|_| ConnectionClosed),
        }
    }

    /// Queue a frame without waiting. Fails if the queue is full or closed.
    pub fn try_send(&self, frame: String) -> Result<(), ConnectionClosed> {
        if self.is_closed() {
            return Err(ConnectionClosed);
        }
        self.inner.outbound.try_send(frame).map_err(|_| ConnectionClosed)
    }

    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled() || self.inner.outbound.is_closed()
    }

    /// Token cancelled when this connection is closed.
    pub fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// True if both handles refer to the same underlying connection.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl SessionPayload for ConnectionHandle {
    fn close(&self) {
        ConnectionHandle::close(self);
    }
}
