//! Remote transport seam.
//!
//! The bus never talks to a hosted pub/sub service directly. It goes through
//! [`RemoteTransport`], which owns the connection, hands out per-channel
//! subscription handles and broadcasts outbound events.

mod loopback;
mod request_tracker;
mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use litebus_protocol::{OutboundEvent, RemotePayload};

use crate::error::{BusError, TransportError};

pub use loopback::LoopbackTransport;
pub use request_tracker::RequestTracker;
pub use ws::WsTransport;

/// Connectivity reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        }
    }
}

/// Callback for inbound events on a bound channel/event pair.
///
/// Errors are reported back to the transport, which logs them.
pub type EventHandler = Arc<dyn Fn(RemotePayload) -> Result<(), BusError> + Send + Sync>;

/// Callback for connectivity changes.
pub type ConnectionListener = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Client side of a hosted pub/sub service.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Open the connection; resolves once the remote accepted it.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Subscribe to a channel; resolves once the subscription is active.
    ///
    /// Every call returns a distinct handle, even for the same channel name.
    async fn subscribe(&self, channel_name: &str) -> Result<Arc<dyn RemoteChannel>, TransportError>;

    /// Broadcast one event; resolves once the remote acknowledged it.
    async fn trigger(&self, event: OutboundEvent) -> Result<(), TransportError>;

    /// Broadcast several events in a single request.
    async fn trigger_batch(&self, events: Vec<OutboundEvent>) -> Result<(), TransportError>;

    /// Register a listener for connectivity changes.
    fn on_connection_change(&self, listener: ConnectionListener);
}

/// Handle to one subscription on a remote channel.
pub trait RemoteChannel: Send + Sync {
    /// Remote channel name.
    fn name(&self) -> &str;

    /// Route events named `event_name` on this channel to `handler`.
    fn bind(&self, event_name: &str, handler: EventHandler);

    /// Release this handle and every handler bound through it.
    fn unsubscribe(&self);
}
