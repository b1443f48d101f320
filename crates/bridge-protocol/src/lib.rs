//! Home Assistant WebSocket message types
//!
//! The subset of the WebSocket API the bridge speaks: the auth
//! handshake, event subscription, keepalive pings, and `state_changed`
//! event payloads. Inbound messages form a closed tagged union; frames
//! with an unrecognized `type` parse to [`ServerMessage::Unknown`] so
//! the caller can log and discard them without failing the connection.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Event type the bridge subscribes to
pub const STATE_CHANGED: &str = "state_changed";

// =============================================================================
// Incoming Messages
// =============================================================================

/// Message pushed by the server
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every connection; the client must reply with auth
    AuthRequired {
        ha_version: String,
    },
    AuthOk {
        ha_version: String,
    },
    AuthInvalid {
        message: String,
    },
    /// Acknowledgement of a command we sent
    Result {
        id: u64,
        success: bool,
        #[serde(default)]
        error: Option<ErrorInfo>,
    },
    /// Subscribed event notification
    Event {
        id: u64,
        event: EventEnvelope,
    },
    Pong {
        id: u64,
    },
    /// Any other message type; logged and ignored
    #[serde(other)]
    Unknown,
}

/// Server-supplied error detail on a failed command
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

/// Envelope around a pushed event
#[derive(Debug, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EventEnvelope {
    /// Parse the payload of a `state_changed` event
    ///
    /// Returns `None` for other event types or payloads that do not
    /// have the expected shape.
    pub fn state_changed(&self) -> Option<StateChanged> {
        if self.event_type != STATE_CHANGED {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }
}

/// Payload of a `state_changed` event
///
/// Either snapshot is absent when the entity was just created or
/// removed; such events carry no transition.
#[derive(Debug, Clone, Deserialize)]
pub struct StateChanged {
    pub entity_id: String,
    #[serde(default)]
    pub old_state: Option<StateSnapshot>,
    #[serde(default)]
    pub new_state: Option<StateSnapshot>,
}

/// An entity state as reported by the server
#[derive(Debug, Clone, Deserialize)]
pub struct StateSnapshot {
    pub state: String,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl StateSnapshot {
    /// The `friendly_name` attribute, when present and a string
    pub fn friendly_name(&self) -> Option<&str> {
        self.attributes.get("friendly_name").and_then(|v| v.as_str())
    }
}

// =============================================================================
// Outgoing Messages
// =============================================================================

/// Message sent by the client
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        access_token: String,
    },
    SubscribeEvents {
        id: u64,
        event_type: String,
    },
    Ping {
        id: u64,
    },
}

impl ClientMessage {
    /// Auth reply carrying the configured token
    pub fn auth(access_token: impl Into<String>) -> Self {
        Self::Auth {
            access_token: access_token.into(),
        }
    }

    /// Subscription request for `state_changed` events
    pub fn subscribe_state_changed(id: u64) -> Self {
        Self::SubscribeEvents {
            id,
            event_type: STATE_CHANGED.to_string(),
        }
    }
}
