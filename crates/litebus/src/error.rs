use litebus_protocol::ChannelKey;
use thiserror::Error;

/// Errors raised by a remote transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("connection closed")]
    Closed,

    #[error("request rejected by remote: {0}")]
    Rejected(String),

    #[error("invalid transport url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("frame serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("event name is required")]
    EmptyEventName,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("malformed envelope on {key}: {source}")]
    MalformedEnvelope {
        key: ChannelKey,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot decode message on {key}: {source}")]
    Decode {
        key: ChannelKey,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot encode message for {key}: {source}")]
    Encode {
        key: ChannelKey,
        #[source]
        source: serde_json::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, BusError>;
