use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use litebus_protocol::{OutboundEvent, RemotePayload};
use tracing::{debug, warn};

use super::{ConnectionListener, ConnectionStatus, EventHandler, RemoteChannel, RemoteTransport};
use crate::error::TransportError;

/// Call counters, for diagnostics and tests
#[derive(Debug, Default)]
pub struct LoopbackStats {
    pub connects: AtomicUsize,
    pub subscribes: AtomicUsize,
    pub unsubscribes: AtomicUsize,
    pub triggers: AtomicUsize,
    pub batches: AtomicUsize,
}

struct Subscription {
    channel: String,
    bindings: Vec<(String, EventHandler)>,
}

#[derive(Default)]
struct LoopbackState {
    connected: bool,
    subscriptions: HashMap<u64, Subscription>,
    trigger_failure: Option<String>,
    connect_failure: Option<String>,
}

struct Shared {
    state: Mutex<LoopbackState>,
    listeners: Mutex<Vec<ConnectionListener>>,
    next_handle: AtomicU64,
    stats: LoopbackStats,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, status: ConnectionStatus) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(status);
        }
    }

    fn handlers_for(&self, channel: &str, event: &str) -> Vec<EventHandler> {
        self.state()
            .subscriptions
            .values()
            .filter(|sub| sub.channel == channel)
            .flat_map(|sub| sub.bindings.iter())
            .filter(|(bound, _)| bound == event)
            .map(|(_, handler)| handler.clone())
            .collect()
    }
}

/// In-process stand-in for a hosted pub/sub service.
///
/// Triggered events are delivered back to every handler bound on the same
/// channel and event while the transport is connected, encoded as a JSON
/// string the way hosted services forward event data.
#[derive(Clone)]
pub struct LoopbackTransport {
    shared: Arc<Shared>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LoopbackState::default()),
                listeners: Mutex::new(Vec::new()),
                next_handle: AtomicU64::new(1),
                stats: LoopbackStats::default(),
            }),
        }
    }

    pub fn stats(&self) -> &LoopbackStats {
        &self.shared.stats
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state().connected
    }

    /// Number of live subscription handles on `channel`.
    pub fn subscription_count(&self, channel: &str) -> usize {
        self.shared
            .state()
            .subscriptions
            .values()
            .filter(|sub| sub.channel == channel)
            .count()
    }

    /// Make every following trigger fail with `message` (or succeed again on `None`).
    pub fn fail_triggers(&self, message: Option<&str>) {
        self.shared.state().trigger_failure = message.map(str::to_string);
    }

    /// Make every following connect fail with `message` (or succeed again on `None`).
    pub fn fail_connects(&self, message: Option<&str>) {
        self.shared.state().connect_failure = message.map(str::to_string);
    }

    /// Simulate the remote dropping the connection.
    pub fn disconnect(&self) {
        let was_connected = std::mem::replace(&mut self.shared.state().connected, false);
        if was_connected {
            debug!("loopback transport disconnected");
            self.shared.notify(ConnectionStatus::Disconnected);
        }
    }

    /// Deliver a payload as if another publisher had sent it.
    ///
    /// Returns the number of handlers that accepted it.
    pub fn deliver(&self, channel: &str, event: &str, payload: RemotePayload) -> usize {
        let handlers = self.shared.handlers_for(channel, event);
        let mut accepted = 0;
        for handler in handlers {
            match handler(payload.clone()) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    warn!(channel = %channel, event = %event, error = %e, "event handler failed")
                }
            }
        }
        accepted
    }

    fn broadcast(&self, event: &OutboundEvent) -> Result<(), TransportError> {
        let connected = {
            let state = self.shared.state();
            if let Some(message) = &state.trigger_failure {
                return Err(TransportError::Rejected(message.clone()));
            }
            state.connected
        };

        if connected {
            let raw = serde_json::to_string(&event.data)?;
            self.deliver(&event.channel, &event.event, RemotePayload::Raw(raw));
        } else {
            debug!(channel = %event.channel, event = %event.event, "no connected recipients");
        }
        Ok(())
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteTransport for LoopbackTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.shared.stats.connects.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.shared.state();
            if let Some(message) = &state.connect_failure {
                return Err(TransportError::Connect(message.clone()));
            }
            if state.connected {
                return Ok(());
            }
            state.connected = true;
        }
        debug!("loopback transport connected");
        self.shared.notify(ConnectionStatus::Connected);
        Ok(())
    }

    async fn subscribe(&self, channel_name: &str) -> Result<Arc<dyn RemoteChannel>, TransportError> {
        self.shared.stats.subscribes.fetch_add(1, Ordering::SeqCst);
        let handle = self.shared.next_handle.fetch_add(1, Ordering::SeqCst);
        self.shared.state().subscriptions.insert(
            handle,
            Subscription {
                channel: channel_name.to_string(),
                bindings: Vec::new(),
            },
        );

        Ok(Arc::new(LoopbackChannel {
            name: channel_name.to_string(),
            handle,
            shared: self.shared.clone(),
        }))
    }

    async fn trigger(&self, event: OutboundEvent) -> Result<(), TransportError> {
        self.shared.stats.triggers.fetch_add(1, Ordering::SeqCst);
        self.broadcast(&event)
    }

    async fn trigger_batch(&self, events: Vec<OutboundEvent>) -> Result<(), TransportError> {
        self.shared.stats.batches.fetch_add(1, Ordering::SeqCst);
        for event in &events {
            self.broadcast(event)?;
        }
        Ok(())
    }

    fn on_connection_change(&self, listener: ConnectionListener) {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }
}

struct LoopbackChannel {
    name: String,
    handle: u64,
    shared: Arc<Shared>,
}

impl RemoteChannel for LoopbackChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind(&self, event_name: &str, handler: EventHandler) {
        if let Some(sub) = self.shared.state().subscriptions.get_mut(&self.handle) {
            sub.bindings.push((event_name.to_string(), handler));
        }
    }

    fn unsubscribe(&self) {
        if self.shared.state().subscriptions.remove(&self.handle).is_some() {
            self.shared.stats.unsubscribes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
