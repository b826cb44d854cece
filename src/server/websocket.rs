//! WebSocket relay server
//!
//! Listens on a configurable address and runs one task per accepted
//! connection. All tasks share a single connection registry and router.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{error, info};

use super::handler::{ConnectionHandler, DEFAULT_READ_BUFFER_SIZE};
use super::router::MessageRouter;
use crate::codec::DEFAULT_CIPHER_KEY;
use crate::hub::{ConnectionRegistry, Role};

/// Default bind address
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Default listen port
pub const DEFAULT_PORT: u16 = 8080;

/// Configuration for the relay server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Key used to decode chat payloads for observers
    pub cipher_key: String,
    /// Size of the per-read frame buffer
    pub read_buffer_size: usize,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            cipher_key: DEFAULT_CIPHER_KEY.to_string(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    /// Set the payload cipher key
    pub fn with_cipher_key(mut self, key: impl Into<String>) -> Self {
        self.cipher_key = key.into();
        self
    }

    /// Set the per-read frame buffer size
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BIND.to_string(), DEFAULT_PORT)
    }
}

/// WebSocket relay between chat participants and observers
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    active: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a new relay server
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            config.cipher_key.clone(),
        ));
        Self {
            config,
            registry,
            router,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Shared connection registry
    #[cfg(test)]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Number of connections currently being handled
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Relay server listening on ws://{}", addr);
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                // Accept new connections
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            self.spawn_handler(stream, peer_addr);
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Handle shutdown signal
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let active = self.active_connections();
        if active > 0 {
            info!("Closing {} active connection(s)...", active);
        }
        info!(
            "Registered at shutdown: {} chat, {} observer(s)",
            self.registry.count(Role::Chat).await,
            self.registry.count(Role::Observer).await
        );

        Ok(())
    }

    fn spawn_handler(&self, stream: TcpStream, peer_addr: std::net::SocketAddr) {
        let (reader, writer) = stream.into_split();
        let mut handler = ConnectionHandler::new(
            peer_addr,
            writer,
            Arc::clone(&self.registry),
            Arc::clone(&self.router),
        )
        .with_read_buffer_size(self.config.read_buffer_size);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let active = Arc::clone(&self.active);

        let count = active.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Active connections: {}", count);

        tokio::spawn(async move {
            handler.run(reader, shutdown_rx).await;
            let count = active.fetch_sub(1, Ordering::SeqCst) - 1;
            info!("Active connections: {}", count);
        });
    }
}
