//! WebSocket upgrade handshake
//!
//! Validates the client's HTTP upgrade request and builds the fixed
//! `101 Switching Protocols` response.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// GUID appended to the client key before hashing (RFC 6455 section 1.3)
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Header carrying the client nonce
pub const SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";

/// Errors that reject an upgrade request
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("request is not valid UTF-8")]
    InvalidEncoding,

    #[error("missing {SEC_WEBSOCKET_KEY} header")]
    MissingKey,
}

/// Result type for handshake operations
pub type HandshakeResult<T> = Result<T, HandshakeError>;

/// Parse `Name: Value` header lines following the request line
///
/// Names are lowercased so lookups are case-insensitive. Lines without a
/// `": "` separator are skipped.
pub fn parse_headers(request: &str) -> HashMap<String, String> {
    request
        .split("\r\n")
        .skip(1)
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(": "))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect()
}

/// Compute the `Sec-WebSocket-Accept` value for a client key
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Build the `101 Switching Protocols` response for a raw upgrade request
pub fn handshake_response(request: &[u8]) -> HandshakeResult<String> {
    let request = std::str::from_utf8(request).map_err(|_| HandshakeError::InvalidEncoding)?;
    let headers = parse_headers(request);
    let key = headers
        .get(&SEC_WEBSOCKET_KEY.to_ascii_lowercase())
        .ok_or(HandshakeError::MissingKey)?;

    Ok(format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    ))
}
