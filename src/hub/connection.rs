//! A single upgraded client connection
//!
//! Holds the write half of the socket behind a FIFO mutex so concurrent
//! broadcasts never interleave bytes on the same stream.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Stable identifier for a connection
pub type ConnectionId = Uuid;

/// Write half of a connection's transport
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors that can occur while writing to a connection
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for connection operations
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Role a connection plays in the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Upgraded but not yet registered
    Unclassified,
    /// Chat participant
    Chat,
    /// Monitoring dashboard
    Observer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Unclassified => "unclassified",
            Role::Chat => "chat",
            Role::Observer => "observer",
        };
        f.write_str(name)
    }
}

/// An upgraded WebSocket connection
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    writer: Mutex<BoxedWriter>,
    closed: AtomicBool,
}

impl Connection {
    /// Wrap the write half of an accepted stream
    pub fn new<W>(peer_addr: SocketAddr, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            peer_addr,
            writer: Mutex::new(Box::new(writer)),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the connection ID
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether a write has failed or the connection was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write raw bytes (handshake response or a pre-encoded frame)
    ///
    /// A failed write marks the connection closed; later sends fail fast
    /// without touching the socket.
    pub async fn send_raw(&self, bytes: &[u8]) -> ConnectionResult<()> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            self.closed.store(true, Ordering::Release);
            return Err(e.into());
        }
        Ok(())
    }

    /// Encode `text` as a server frame and send it
    #[cfg(test)]
    pub async fn send_text(&self, text: &str) -> ConnectionResult<()> {
        self.send_raw(&crate::codec::create_frame(text)).await
    }

    /// Mark the connection closed and shut down the write half
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
