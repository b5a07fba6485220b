//! WebSocket frames exchanged between a litebus client and a hub.
//!
//! Every frame is a JSON text message tagged by `type`. Request frames sent
//! by the client carry an `id` which the hub echoes back in the matching
//! `ack`, `subscription_succeeded` or `error` frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{OutboundEvent, RemotePayload};

// ============================================================================
// Protocol: Client -> Hub
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start receiving events published on a channel
    Subscribe { id: String, channel: String },

    /// Stop receiving events for a channel (no acknowledgement)
    Unsubscribe { channel: String },

    /// Broadcast a single event
    Trigger {
        id: String,
        #[serde(flatten)]
        event: OutboundEvent,
    },

    /// Broadcast several events in one request
    TriggerBatch {
        id: String,
        events: Vec<OutboundEvent>,
    },

    /// Pong response
    Pong,
}

impl ClientFrame {
    /// Request id for frames that expect a reply.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClientFrame::Subscribe { id, .. }
            | ClientFrame::Trigger { id, .. }
            | ClientFrame::TriggerBatch { id, .. } => Some(id),
            ClientFrame::Unsubscribe { .. } | ClientFrame::Pong => None,
        }
    }
}

// ============================================================================
// Protocol: Hub -> Client
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake completed
    ConnectionEstablished { socket_id: String },

    /// Subscribe request accepted
    SubscriptionSucceeded { id: String, channel: String },

    /// Trigger or batch request accepted
    Ack { id: String },

    /// Request rejected, or a connection-level error when `id` is absent
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },

    /// Event published on a subscribed channel
    Event {
        channel: String,
        event: String,
        data: Value,
    },

    /// Heartbeat ping
    Ping,
}

impl ServerFrame {
    /// Event data as a transport payload.
    ///
    /// Hubs may forward `data` as a JSON-encoded string instead of a document.
    pub fn payload(data: Value) -> RemotePayload {
        match data {
            Value::String(raw) => RemotePayload::Raw(raw),
            other => RemotePayload::Structured(other),
        }
    }
}
