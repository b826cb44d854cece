//! XOR Relay Server
//!
//! Minimal WebSocket relay. Chat participants exchange XOR-obfuscated messages
//! while monitoring dashboards receive a decoded log of every message.

mod codec;
mod hub;
mod server;

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use codec::DEFAULT_CIPHER_KEY;
use server::{RelayServer, ServerConfig, DEFAULT_BIND, DEFAULT_PORT, DEFAULT_READ_BUFFER_SIZE};

/// XOR Relay Server
///
/// WebSocket chat relay with a decoded log for monitoring dashboards
#[derive(Parser, Debug)]
#[command(name = "xor-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Bind address
    #[arg(long, default_value = DEFAULT_BIND)]
    bind: String,

    /// Key shared with chat clients for payload obfuscation
    #[arg(long, default_value = DEFAULT_CIPHER_KEY)]
    cipher_key: String,

    /// Bytes read per frame
    #[arg(long, default_value_t = DEFAULT_READ_BUFFER_SIZE)]
    read_buffer: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("XOR Relay v{}", env!("CARGO_PKG_VERSION"));

    if args.cipher_key.is_empty() {
        anyhow::bail!("--cipher-key must not be empty");
    }

    let config = ServerConfig::new(args.bind, args.port)
        .with_cipher_key(args.cipher_key)
        .with_read_buffer_size(args.read_buffer);

    let server = Arc::new(RelayServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
