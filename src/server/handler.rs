//! WebSocket connection handler
//!
//! Drives a single connection through handshake, receive loop and cleanup.
//! Errors are logged here and never reach the accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::router::MessageRouter;
use crate::codec::{handshake_response, parse_frame};
use crate::hub::{Connection, ConnectionRegistry};

/// Read size for the initial HTTP upgrade request
pub const HANDSHAKE_BUFFER_SIZE: usize = 1024;

/// Upgrade requests are cut off at this size
pub const MAX_HANDSHAKE_SIZE: usize = 8 * 1024;

/// Default buffer size for each frame read
pub const DEFAULT_READ_BUFFER_SIZE: usize = 2048;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, nothing read yet
    Connecting,
    /// Reading and validating the upgrade request
    Handshaking,
    /// Upgraded; reading and routing frames
    Active,
    /// Unregistered and closed
    Closed,
}

/// Handles a single WebSocket connection
pub struct ConnectionHandler {
    conn: Arc<Connection>,
    state: ConnectionState,
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    read_buffer_size: usize,
}

impl ConnectionHandler {
    /// Create a handler around the write half of an accepted stream
    pub fn new<W>(
        peer_addr: SocketAddr,
        writer: W,
        registry: Arc<ConnectionRegistry>,
        router: Arc<MessageRouter>,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            conn: Arc::new(Connection::new(peer_addr, writer)),
            state: ConnectionState::Connecting,
            registry,
            router,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    /// Set the size of the per-read frame buffer
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    /// Current lifecycle state
    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The connection this handler owns
    #[cfg(test)]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Run the connection to completion
    ///
    /// Returns once the peer disconnects, a read fails, the handshake is
    /// rejected, or the server shuts down. The connection is always
    /// unregistered and closed before returning.
    pub async fn run<R>(&mut self, mut reader: R, mut shutdown_rx: broadcast::Receiver<()>)
    where
        R: AsyncRead + Unpin,
    {
        let peer_addr = self.conn.peer_addr();
        info!("New connection from {}", peer_addr);

        if let Err(e) = self.serve(&mut reader, &mut shutdown_rx).await {
            warn!("Connection error from {}: {}", peer_addr, e);
        }

        self.close().await;
    }

    async fn serve<R>(
        &mut self,
        reader: &mut R,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let peer_addr = self.conn.peer_addr();

        self.transition(ConnectionState::Handshaking);
        let pipelined = tokio::select! {
            result = self.handshake(reader) => match result? {
                Some(rest) => rest,
                None => return Ok(()),
            },
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received during handshake with {}", peer_addr);
                return Ok(());
            }
        };
        self.transition(ConnectionState::Active);

        // A client may send its first frame in the same segment as the upgrade.
        if !pipelined.is_empty() {
            self.handle_frame(&pipelined).await;
        }

        let mut buf = vec![0u8; self.read_buffer_size];

        loop {
            tokio::select! {
                read = reader.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        info!("Connection closed by {}", peer_addr);
                        break;
                    }
                    self.handle_frame(&buf[..n]).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection to {}", peer_addr);
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_frame(&self, bytes: &[u8]) {
        let peer_addr = self.conn.peer_addr();
        match parse_frame(bytes) {
            Ok(text) => {
                let outcome = self.router.route(&self.conn, &text).await;
                debug!("Message from {}: {:?}", peer_addr, outcome);
            }
            Err(e) => {
                debug!("Dropping undecodable frame from {}: {}", peer_addr, e);
            }
        }
    }

    /// Read the upgrade request and answer it
    ///
    /// Returns the bytes that followed the request headers, or `None` when
    /// the request is not a WebSocket upgrade; nothing is written in that
    /// case.
    async fn handshake<R>(&mut self, reader: &mut R) -> anyhow::Result<Option<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        let mut request = Vec::with_capacity(HANDSHAKE_BUFFER_SIZE);
        let mut buf = [0u8; HANDSHAKE_BUFFER_SIZE];
        let header_end = loop {
            let n = reader.read(&mut buf).await?;
            request.extend_from_slice(&buf[..n]);
            if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            if n == 0 || request.len() >= MAX_HANDSHAKE_SIZE {
                break request.len();
            }
        };
        let rest = request.split_off(header_end);

        match handshake_response(&request) {
            Ok(response) => {
                self.conn.send_raw(response.as_bytes()).await?;
                debug!("Handshake completed with {}", self.conn.peer_addr());
                Ok(Some(rest))
            }
            Err(e) => {
                warn!(
                    "Rejecting non-WebSocket request from {}: {}",
                    self.conn.peer_addr(),
                    e
                );
                Ok(None)
            }
        }
    }

    async fn close(&mut self) {
        self.transition(ConnectionState::Closed);
        self.registry.unregister(self.conn.id()).await;
        self.conn.close().await;
        info!("Disconnected {}", self.conn.peer_addr());
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!(
            "Connection {} {:?} -> {:?}",
            self.conn.peer_addr(),
            self.state,
            next
        );
        self.state = next;
    }
}
