//! Message routing
//!
//! Classifies decoded client text by its `type` and dispatches registration,
//! join announcements and chat relay.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::protocol::{
    ClientEnvelope, ClientMessage, ProtocolResult, ServerMessage, JOIN_ANNOUNCEMENT,
};
use crate::codec::xor_cipher;
use crate::hub::{Connection, ConnectionRegistry, Role};

/// What the router did with a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Not JSON, not an object, or not a recognized message
    Ignored,
    /// Connection registered as an observer
    RegisteredObserver,
    /// Connection joined the chat and the announcement was broadcast
    JoinedChat { delivered: usize },
    /// Chat message relayed; `observers` is zero when the payload could not be
    /// decoded
    Relayed { observers: usize, chat: usize },
}

/// Routes client messages to registry updates and broadcasts
pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    cipher_key: String,
}

impl MessageRouter {
    /// Create a router over `registry` using `cipher_key` to decode payloads
    pub fn new(registry: Arc<ConnectionRegistry>, cipher_key: impl Into<String>) -> Self {
        Self {
            registry,
            cipher_key: cipher_key.into(),
        }
    }

    /// Handle one decoded text message from `conn`
    ///
    /// Text that does not parse as a known client message is dropped without
    /// a reply or a log line.
    pub async fn route(&self, conn: &Arc<Connection>, text: &str) -> RouteOutcome {
        let Ok(envelope) = ClientEnvelope::from_json(text) else {
            return RouteOutcome::Ignored;
        };

        match self.dispatch(conn, text, envelope).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Failed to handle message from {}: {}", conn.peer_addr(), e);
                RouteOutcome::Ignored
            }
        }
    }

    async fn dispatch(
        &self,
        conn: &Arc<Connection>,
        raw: &str,
        mut envelope: ClientEnvelope,
    ) -> ProtocolResult<RouteOutcome> {
        match envelope.message().clone() {
            ClientMessage::RegisterDash => {
                if !self.registry.register(conn, Role::Observer).await {
                    return Ok(RouteOutcome::Ignored);
                }
                info!("Dashboard registered: {}", conn.peer_addr());
                Ok(RouteOutcome::RegisteredObserver)
            }

            ClientMessage::RegisterChat { user } => {
                if !self.registry.register(conn, Role::Chat).await {
                    return Ok(RouteOutcome::Ignored);
                }
                info!(
                    "Chat participant {} joined from {}",
                    display_user(user.as_ref()),
                    conn.peer_addr()
                );

                envelope.set_text(JOIN_ANNOUNCEMENT);
                let announcement = envelope.to_json()?;
                let report = self.registry.broadcast(Role::Chat, &announcement).await;
                Ok(RouteOutcome::JoinedChat {
                    delivered: report.delivered,
                })
            }

            ClientMessage::Message { user, payload } => {
                let observers = match xor_cipher(&payload, &self.cipher_key) {
                    Ok(decrypted) => {
                        info!(
                            "Chat message from {}: received {:?}, decrypted {:?}",
                            display_user(user.as_ref()),
                            payload,
                            decrypted
                        );
                        let log = ServerMessage::log(payload, decrypted, user).to_json()?;
                        self.registry.broadcast(Role::Observer, &log).await.delivered
                    }
                    Err(e) => {
                        warn!(
                            "Could not decode payload from {}: {}",
                            conn.peer_addr(),
                            e
                        );
                        0
                    }
                };

                // Chat participants always get the envelope exactly as it was sent.
                let chat = self.registry.broadcast(Role::Chat, raw).await.delivered;
                debug!(
                    "Relayed message from {} to {} observer(s) and {} chat member(s)",
                    conn.peer_addr(),
                    observers,
                    chat
                );
                Ok(RouteOutcome::Relayed { observers, chat })
            }
        }
    }
}

fn display_user(user: Option<&Value>) -> String {
    match user {
        Some(Value::String(name)) => name.clone(),
        Some(Value::Null) | None => "<anonymous>".to_string(),
        Some(other) => other.to_string(),
    }
}
