//! Protocol message definitions
//!
//! Defines the JSON messages exchanged between browser clients and the relay.
//! Client envelopes keep every field they arrived with so they can be
//! re-broadcast without losing data the server does not understand.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Text attached to a `register_chat` envelope before it is announced
pub const JOIN_ANNOUNCEMENT: &str = "Entrou na sala.";

/// Field carrying the join announcement
pub const TEXT_FIELD: &str = "text";

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from browser clients to the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register as a monitoring dashboard
    RegisterDash,

    /// Join the chat room
    RegisterChat {
        /// Display name of the participant, passed through as sent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<Value>,
    },

    /// Chat message with an obfuscated payload
    Message {
        /// Display name of the sender, passed through as sent
        #[serde(default)]
        user: Option<Value>,
        /// XOR-obfuscated text
        payload: String,
    },
}

/// A parsed client message together with its original JSON fields
#[derive(Debug, Clone)]
pub struct ClientEnvelope {
    fields: Map<String, Value>,
    message: ClientMessage,
}

impl ClientEnvelope {
    /// Parse a client envelope from JSON
    ///
    /// Fails for invalid JSON, non-object values, a missing or unknown `type`,
    /// and messages missing required fields.
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let fields = match serde_json::from_str::<Value>(json)? {
            Value::Object(fields) => fields,
            other => {
                return Err(ProtocolError::InvalidMessage(format!(
                    "expected a JSON object, got {}",
                    json_kind(&other)
                )))
            }
        };
        let message = serde_json::from_value(Value::Object(fields.clone()))?;
        Ok(Self { fields, message })
    }

    /// The typed view of this envelope
    pub fn message(&self) -> &ClientMessage {
        &self.message
    }

    /// Set the `text` field, keeping every other field in place
    pub fn set_text(&mut self, text: impl Into<String>) {
        self.fields
            .insert(TEXT_FIELD.to_string(), Value::String(text.into()));
    }

    /// Serialize the envelope with all of its fields
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(&self.fields)?)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages originated by the relay
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Decoded view of a chat message, sent to observers only
    Log {
        /// Payload as received
        encrypted: String,
        /// Payload after server-side decoding
        decrypted: String,
        /// Sender's display name
        user: Option<Value>,
    },
}

impl ServerMessage {
    /// Create a Log message
    pub fn log(
        encrypted: impl Into<String>,
        decrypted: impl Into<String>,
        user: Option<Value>,
    ) -> Self {
        ServerMessage::Log {
            encrypted: encrypted.into(),
            decrypted: decrypted.into(),
            user,
        }
    }

    /// Serialize the message to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_dash() {
        let envelope = ClientEnvelope::from_json(r#"{"type":"register_dash"}"#).unwrap();
        assert_eq!(envelope.message(), &ClientMessage::RegisterDash);
    }

    #[test]
    fn test_register_dash_with_extra_fields() {
        let envelope =
            ClientEnvelope::from_json(r#"{"type":"register_dash","theme":"dark"}"#).unwrap();
        assert_eq!(envelope.message(), &ClientMessage::RegisterDash);
    }

    #[test]
    fn test_register_chat_join_text_preserves_fields() {
        let mut envelope =
            ClientEnvelope::from_json(r#"{"type":"register_chat","user":"alice","color":"red"}"#)
                .unwrap();
        assert_eq!(
            envelope.message(),
            &ClientMessage::RegisterChat {
                user: Some(Value::from("alice"))
            }
        );

        envelope.set_text(JOIN_ANNOUNCEMENT);
        assert_eq!(
            envelope.to_json().unwrap(),
            r#"{"type":"register_chat","user":"alice","color":"red","text":"Entrou na sala."}"#
        );
    }

    #[test]
    fn test_set_text_overwrites_existing() {
        let mut envelope =
            ClientEnvelope::from_json(r#"{"type":"register_chat","text":"hi","user":"a"}"#)
                .unwrap();
        envelope.set_text(JOIN_ANNOUNCEMENT);
        assert_eq!(
            envelope.to_json().unwrap(),
            r#"{"type":"register_chat","text":"Entrou na sala.","user":"a"}"#
        );
    }

    #[test]
    fn test_chat_message() {
        let envelope =
            ClientEnvelope::from_json(r#"{"type":"message","user":"bob","payload":";,"}"#)
                .unwrap();
        assert_eq!(
            envelope.message(),
            &ClientMessage::Message {
                user: Some(Value::from("bob")),
                payload: ";,".to_string()
            }
        );
    }

    #[test]
    fn test_non_string_user_passes_through() {
        let mut envelope =
            ClientEnvelope::from_json(r#"{"type":"register_chat","user":42}"#).unwrap();
        assert_eq!(
            envelope.message(),
            &ClientMessage::RegisterChat {
                user: Some(Value::from(42))
            }
        );
        envelope.set_text(JOIN_ANNOUNCEMENT);
        assert_eq!(
            envelope.to_json().unwrap(),
            r#"{"type":"register_chat","user":42,"text":"Entrou na sala."}"#
        );

        let envelope = ClientEnvelope::from_json(
            r#"{"type":"message","user":{"nick":"bob"},"payload":"x"}"#,
        )
        .unwrap();
        let ClientMessage::Message { user, .. } = envelope.message() else {
            panic!("expected a chat message");
        };
        let log = ServerMessage::log("x", "y", user.clone()).to_json().unwrap();
        assert!(log.ends_with(r#""user":{"nick":"bob"}}"#));
    }

    #[test]
    fn test_chat_message_without_payload_rejected() {
        let result = ClientEnvelope::from_json(r#"{"type":"message","user":"bob"}"#);
        assert!(matches!(result, Err(ProtocolError::SerializationError(_))));
    }

    #[test]
    fn test_unknown_or_missing_type_rejected() {
        assert!(ClientEnvelope::from_json(r#"{"type":"shout"}"#).is_err());
        assert!(ClientEnvelope::from_json(r#"{"user":"alice"}"#).is_err());
    }

    #[test]
    fn test_non_object_rejected() {
        let result = ClientEnvelope::from_json("[1, 2, 3]");
        assert!(matches!(result, Err(ProtocolError::InvalidMessage(_))));
        assert!(ClientEnvelope::from_json("not json").is_err());
    }

    #[test]
    fn test_log_serialization() {
        let log = ServerMessage::log(";,", "hi", Some(Value::from("bob")));
        assert_eq!(
            log.to_json().unwrap(),
            r#"{"type":"log","encrypted":";,","decrypted":"hi","user":"bob"}"#
        );
    }

    #[test]
    fn test_log_without_user() {
        let json = ServerMessage::log("x", "y", None).to_json().unwrap();
        assert!(json.contains("\"user\":null"));
    }
}
