use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::TransportError;
use crate::transport::{ConnectionListener, ConnectionStatus, RemoteTransport};

const DISCONNECTED: u8 = 0;
const CONNECTING: u8 = 1;
const CONNECTED: u8 = 2;

fn encode(status: ConnectionStatus) -> u8 {
    match status {
        ConnectionStatus::Disconnected => DISCONNECTED,
        ConnectionStatus::Connecting => CONNECTING,
        ConnectionStatus::Connected => CONNECTED,
    }
}

fn decode(raw: u8) -> ConnectionStatus {
    match raw {
        CONNECTING => ConnectionStatus::Connecting,
        CONNECTED => ConnectionStatus::Connected,
        _ => ConnectionStatus::Disconnected,
    }
}

/// Connectivity of the receiving side of a transport.
///
/// Transitions: disconnected -> connecting -> connected -> disconnected.
/// Transport callbacks write it, `ensure_connected` reads it to decide
/// whether a connect round-trip is needed.
pub struct ConnectionState {
    status: AtomicU8,
    /// Serializes connect attempts so only the first caller pays for them
    gate: Mutex<()>,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(DISCONNECTED),
            gate: Mutex::new(()),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        decode(self.status.load(Ordering::Acquire))
    }

    pub fn set(&self, status: ConnectionStatus) {
        let previous = decode(self.status.swap(encode(status), Ordering::AcqRel));
        if previous != status {
            debug!(from = previous.as_str(), to = status.as_str(), "connection state changed");
        }
    }

    /// Listener that mirrors transport notifications into this state.
    pub fn listener(self: &Arc<Self>) -> ConnectionListener {
        let state = Arc::downgrade(self);
        Arc::new(move |status| {
            if let Some(state) = state.upgrade() {
                state.set(status);
            }
        })
    }

    /// Connect `transport` unless already connected.
    pub async fn ensure_connected(&self, transport: &dyn RemoteTransport) -> Result<(), TransportError> {
        if self.status() == ConnectionStatus::Connected {
            return Ok(());
        }

        let _gate = self.gate.lock().await;
        if self.status() == ConnectionStatus::Connected {
            return Ok(());
        }

        self.set(ConnectionStatus::Connecting);
        match transport.connect().await {
            Ok(()) => {
                self.set(ConnectionStatus::Connected);
                info!("transport connected");
                Ok(())
            }
            Err(e) => {
                self.set(ConnectionStatus::Disconnected);
                Err(e)
            }
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}
