//! Shared protocol definitions for the litebus message bus and its transports.

pub mod frames;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use frames::{ClientFrame, ServerFrame};

// ============================================================================
// Channel identity
// ============================================================================

/// Identity of a logical message channel: the (channel name, event name) pair.
///
/// Comparison is exact and case-sensitive on both fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    pub channel_name: String,
    pub event_name: String,
}

impl ChannelKey {
    pub fn new(channel_name: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            channel_name: channel_name.into(),
            event_name: event_name.into(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_name, self.event_name)
    }
}

// ============================================================================
// Message envelope
// ============================================================================

/// Payload wrapper carried on every channel.
///
/// `available == false` marks a deletion (tombstone). Consumers only treat an
/// envelope as a message when it is available and carries a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub available: bool,
}

impl<T> MessageEnvelope<T> {
    /// A live message.
    pub fn live(data: T) -> Self {
        Self {
            data: Some(data),
            available: true,
        }
    }

    /// A deletion marker.
    pub fn tombstone() -> Self {
        Self {
            data: None,
            available: false,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        !self.available
    }
}

impl MessageEnvelope<Value> {
    /// Payload of a live envelope, `None` for tombstones and null payloads.
    pub fn into_live(self) -> Option<Value> {
        if !self.available {
            return None;
        }
        self.data.filter(|data| !data.is_null())
    }
}

// ============================================================================
// Channel lifecycle
// ============================================================================

/// Notification published once when a channel binding comes into existence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCreated {
    pub channel_name: String,
    pub event_name: String,
    pub created_at: DateTime<Utc>,
}

impl ChannelCreated {
    pub fn now(key: &ChannelKey) -> Self {
        Self {
            channel_name: key.channel_name.clone(),
            event_name: key.event_name.clone(),
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.channel_name.clone(), self.event_name.clone())
    }
}

// ============================================================================
// Transport payloads
// ============================================================================

/// A single event addressed to the remote broadcaster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub channel: String,
    pub event: String,
    pub data: Value,
}

impl OutboundEvent {
    pub fn new(channel: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            event: event.into(),
            data,
        }
    }
}

/// Inbound event payload as handed over by a transport.
///
/// Hosted services deliver event data either as an already-parsed JSON
/// document or as a JSON-encoded string.
#[derive(Debug, Clone, PartialEq)]
pub enum RemotePayload {
    Structured(Value),
    Raw(String),
}

impl RemotePayload {
    /// Decode the payload into an envelope of generic JSON values.
    pub fn decode(self) -> Result<MessageEnvelope<Value>, serde_json::Error> {
        match self {
            RemotePayload::Structured(Value::String(raw)) | RemotePayload::Raw(raw) => {
                serde_json::from_str(&raw)
            }
            RemotePayload::Structured(value) => serde_json::from_value(value),
        }
    }
}

impl From<Value> for RemotePayload {
    fn from(value: Value) -> Self {
        RemotePayload::Structured(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_key_is_case_sensitive() {
        assert_eq!(ChannelKey::new("ui", "msg"), ChannelKey::new("ui", "msg"));
        assert_ne!(ChannelKey::new("ui", "msg"), ChannelKey::new("UI", "msg"));
        assert_ne!(ChannelKey::new("ui", "msg"), ChannelKey::new("ui", "Msg"));
        assert_eq!(ChannelKey::new("ui", "msg").to_string(), "ui:msg");
    }

    #[test]
    fn test_envelope_wire_shape() {
        let live = serde_json::to_value(MessageEnvelope::live(json!({"id": 1}))).unwrap();
        assert_eq!(live, json!({"data": {"id": 1}, "available": true}));

        let tombstone = serde_json::to_value(MessageEnvelope::<Value>::tombstone()).unwrap();
        assert_eq!(tombstone, json!({"data": null, "available": false}));
    }

    #[test]
    fn test_into_live_skips_tombstones_and_null_payloads() {
        assert_eq!(
            MessageEnvelope::live(json!("x")).into_live(),
            Some(json!("x"))
        );
        assert_eq!(MessageEnvelope::<Value>::tombstone().into_live(), None);

        let null_payload = MessageEnvelope {
            data: Some(Value::Null),
            available: true,
        };
        assert_eq!(null_payload.into_live(), None);
    }

    #[test]
    fn test_decode_accepts_structured_and_raw_payloads() {
        let structured = RemotePayload::Structured(json!({"data": 7, "available": true}));
        let raw = RemotePayload::Raw(r#"{"data": 7, "available": true}"#.to_string());
        let quoted = RemotePayload::Structured(json!(r#"{"data": 7, "available": true}"#));

        let expected = MessageEnvelope::live(json!(7));
        assert_eq!(structured.decode().unwrap(), expected);
        assert_eq!(raw.decode().unwrap(), expected);
        assert_eq!(quoted.decode().unwrap(), expected);
    }

    #[test]
    fn test_decode_defaults_missing_fields() {
        let envelope = RemotePayload::Raw("{}".to_string()).decode().unwrap();
        assert_eq!(envelope, MessageEnvelope::tombstone());
    }

    #[test]
    fn test_decode_rejects_malformed_payload() {
        assert!(RemotePayload::Raw("not json".to_string()).decode().is_err());
        assert!(RemotePayload::Structured(json!(42)).decode().is_err());
    }
}
