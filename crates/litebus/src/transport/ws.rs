//! WebSocket client transport.
//!
//! Speaks the JSON frame protocol from [`litebus_protocol::frames`] over a
//! single socket: subscriptions, triggers and batch triggers are requests
//! acknowledged by the hub, events are pushed by the hub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use litebus_protocol::{ClientFrame, OutboundEvent, ServerFrame};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use super::request_tracker::RequestTracker;
use super::{ConnectionListener, ConnectionStatus, EventHandler, RemoteChannel, RemoteTransport};
use crate::config::TransportSettings;
use crate::error::TransportError;

/// Outcome of a subscribe request, shared with every handle waiting on it
type SubscribeOutcome = Option<Result<(), Arc<TransportError>>>;

/// Hub side of one channel subscription
#[derive(Default)]
enum HubState {
    /// Not subscribed on the hub; sent on the next connect
    #[default]
    Idle,
    /// Subscribe request in flight
    Pending(watch::Receiver<SubscribeOutcome>),
    Active,
}

impl HubState {
    /// Pending with a live requester. A dropped requester leaves a stale
    /// pending state behind, which counts as idle.
    fn in_flight(&self) -> bool {
        matches!(self, HubState::Pending(outcome) if outcome.has_changed().is_ok())
    }
}

/// Handlers bound through each live subscription handle on one channel
#[derive(Default)]
struct ChannelEntry {
    handles: HashMap<u64, Vec<(String, EventHandler)>>,
    hub: HubState,
}

/// What a new handle has to do to get an active hub subscription
enum SubscribeRole {
    Ready,
    Lead(watch::Sender<SubscribeOutcome>),
    Follow(watch::Receiver<SubscribeOutcome>),
}

struct WsShared {
    settings: TransportSettings,
    tracker: RequestTracker,
    /// Frame queue of the current socket, `None` while disconnected
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    socket_id: Mutex<Option<String>>,
    channels: Mutex<HashMap<String, ChannelEntry>>,
    listeners: Mutex<Vec<ConnectionListener>>,
    connect_gate: tokio::sync::Mutex<()>,
    next_handle: AtomicU64,
    /// Bumped on every opened socket
    generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Copy of a request failure for handles that shared the request.
fn share_error(error: &TransportError) -> TransportError {
    match error {
        TransportError::NotConnected => TransportError::NotConnected,
        TransportError::HandshakeTimeout => TransportError::HandshakeTimeout,
        TransportError::Closed => TransportError::Closed,
        TransportError::Rejected(message) => TransportError::Rejected(message.clone()),
        other => TransportError::Connect(other.to_string()),
    }
}

impl WsShared {
    fn is_connected(&self) -> bool {
        lock(&self.outbound).is_some()
    }

    fn notify(&self, status: ConnectionStatus) {
        let listeners = lock(&self.listeners).clone();
        for listener in listeners {
            listener(status);
        }
    }

    fn connection_url(&self) -> Result<Url, TransportError> {
        let raw = self
            .settings
            .url
            .as_deref()
            .ok_or_else(|| TransportError::Connect("hub url not configured".to_string()))?;

        let mut url = Url::parse(raw)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("app_key", &self.settings.app_key);
            if let Some(token) = &self.settings.token {
                query.append_pair("token", token);
            }
        }
        Ok(url)
    }

    fn send_frame(&self, frame: ClientFrame) -> Result<(), TransportError> {
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| TransportError::Closed),
            None => Err(TransportError::NotConnected),
        }
    }

    /// Record the result of a subscribe request for `channel`.
    fn settle(&self, channel: &str, active: bool) {
        if let Some(entry) = lock(&self.channels).get_mut(channel) {
            entry.hub = if active {
                HubState::Active
            } else {
                HubState::Idle
            };
        }
    }

    /// Send a request frame and wait for the hub's verdict.
    ///
    /// Frames without a request id are sent without waiting.
    async fn request(&self, frame: ClientFrame) -> Result<(), TransportError> {
        let Some(request_id) = frame.request_id().map(str::to_string) else {
            return self.send_frame(frame);
        };
        let rx = self.tracker.track_request(request_id.clone()).await;

        if let Err(e) = self.send_frame(frame) {
            self.tracker.cancel_request(&request_id).await;
            return Err(e);
        }

        debug!(request_id = %request_id, "awaiting hub acknowledgement");
        rx.await.unwrap_or(Err(TransportError::Closed))
    }

    fn handlers_for(&self, channel: &str, event: &str) -> Vec<EventHandler> {
        lock(&self.channels)
            .get(channel)
            .map(|entry| {
                entry
                    .handles
                    .values()
                    .flatten()
                    .filter(|(bound, _)| bound == event)
                    .map(|(_, handler)| handler.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn dispatch(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::SubscriptionSucceeded { id, channel } => {
                debug!(channel = %channel, "subscription succeeded");
                self.tracker.complete_request(&id, Ok(())).await;
            }
            ServerFrame::Ack { id } => {
                self.tracker.complete_request(&id, Ok(())).await;
            }
            ServerFrame::Error {
                id: Some(id),
                message,
            } => {
                self.tracker
                    .complete_request(&id, Err(TransportError::Rejected(message)))
                    .await;
            }
            ServerFrame::Error { id: None, message } => {
                warn!(error = %message, "hub reported an error");
            }
            ServerFrame::Event {
                channel,
                event,
                data,
            } => {
                let handlers = self.handlers_for(&channel, &event);
                if handlers.is_empty() {
                    debug!(channel = %channel, event = %event, "event without bound handlers");
                }
                for handler in handlers {
                    if let Err(e) = handler(ServerFrame::payload(data.clone())) {
                        warn!(channel = %channel, event = %event, error = %e, "event handler failed");
                    }
                }
            }
            ServerFrame::Ping => {
                let _ = self.send_frame(ClientFrame::Pong);
            }
            ServerFrame::ConnectionEstablished { socket_id } => {
                debug!(socket_id = %socket_id, "unexpected handshake frame");
            }
        }
    }

    async fn read_loop<S>(self: Arc<Self>, generation: u64, mut read: S)
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => self.dispatch(frame).await,
                    Err(e) => warn!(error = %e, "failed to parse hub frame"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "websocket read failed");
                    break;
                }
            }
        }

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "stale socket closed");
            return;
        }

        lock(&self.outbound).take();
        lock(&self.socket_id).take();
        let failed = self.tracker.fail_all().await;
        info!(failed_requests = failed, "disconnected from hub");
        self.notify(ConnectionStatus::Disconnected);
    }

    async fn open(self: &Arc<Self>) -> Result<(), TransportError> {
        let url = self.connection_url()?;
        info!(host = ?url.host_str(), "connecting to hub");

        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let socket_id = tokio::time::timeout(
            self.settings.handshake_timeout(),
            await_handshake(&mut ws_read),
        )
        .await
        .map_err(|_| TransportError::HandshakeTimeout)??;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientFrame>();
        *lock(&self.outbound) = Some(tx);
        *lock(&self.socket_id) = Some(socket_id.clone());

        // Forwarder: frame queue -> socket
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        error!(error = %e, "failed to serialize frame");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    warn!("websocket send failed, stopping forwarder");
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        tokio::spawn(self.clone().read_loop(generation, ws_read));

        // Restore subscriptions held across a reconnect. Queued under the
        // channels lock so they stay ordered with unsubscribes.
        {
            let mut channels = lock(&self.channels);
            for (channel, entry) in channels.iter_mut() {
                if entry.hub.in_flight() {
                    continue;
                }
                entry.hub = HubState::Active;
                let _ = self.send_frame(ClientFrame::Subscribe {
                    id: new_request_id(),
                    channel: channel.clone(),
                });
            }
        }

        info!(socket_id = %socket_id, "connected to hub");
        Ok(())
    }
}

async fn await_handshake<S>(read: &mut S) -> Result<String, TransportError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                Ok(ServerFrame::ConnectionEstablished { socket_id }) => return Ok(socket_id),
                Ok(ServerFrame::Error { message, .. }) => {
                    return Err(TransportError::Connect(message));
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "ignoring malformed handshake frame"),
            },
            Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// WebSocket client for a litebus hub.
#[derive(Clone)]
pub struct WsTransport {
    shared: Arc<WsShared>,
}

impl WsTransport {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            shared: Arc::new(WsShared {
                settings,
                tracker: RequestTracker::new(),
                outbound: Mutex::new(None),
                socket_id: Mutex::new(None),
                channels: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                connect_gate: tokio::sync::Mutex::new(()),
                next_handle: AtomicU64::new(1),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Socket id assigned by the hub for the current connection.
    pub fn socket_id(&self) -> Option<String> {
        lock(&self.shared.socket_id).clone()
    }

    /// Close the current connection, if any.
    pub fn disconnect(&self) {
        // Dropping the queue ends the forwarder, which closes the socket.
        lock(&self.shared.outbound).take();
    }
}

#[async_trait]
impl RemoteTransport for WsTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let _gate = self.shared.connect_gate.lock().await;
        if self.shared.is_connected() {
            return Ok(());
        }

        self.shared.notify(ConnectionStatus::Connecting);
        match self.shared.open().await {
            Ok(()) => {
                self.shared.notify(ConnectionStatus::Connected);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "failed to connect to hub");
                self.shared.notify(ConnectionStatus::Disconnected);
                Err(e)
            }
        }
    }

    async fn subscribe(&self, channel_name: &str) -> Result<Arc<dyn RemoteChannel>, TransportError> {
        let handle = self.shared.next_handle.fetch_add(1, Ordering::SeqCst);
        let connected = self.shared.is_connected();

        let role = {
            let mut channels = lock(&self.shared.channels);
            let entry = channels.entry(channel_name.to_string()).or_default();
            entry.handles.insert(handle, Vec::new());

            let in_flight = match &entry.hub {
                HubState::Pending(outcome) if entry.hub.in_flight() => Some(outcome.clone()),
                _ => None,
            };

            if matches!(entry.hub, HubState::Active) {
                SubscribeRole::Ready
            } else if let Some(outcome) = in_flight {
                SubscribeRole::Follow(outcome)
            } else if connected {
                let (tx, rx) = watch::channel(None);
                entry.hub = HubState::Pending(rx);
                SubscribeRole::Lead(tx)
            } else {
                // Offline subscriptions are sent when the connection opens.
                entry.hub = HubState::Idle;
                SubscribeRole::Ready
            }
        };

        let channel = Arc::new(WsChannel {
            name: channel_name.to_string(),
            handle,
            shared: self.shared.clone(),
        });

        let outcome = match role {
            SubscribeRole::Ready => Ok(()),
            SubscribeRole::Lead(tx) => {
                let outcome = self
                    .shared
                    .request(ClientFrame::Subscribe {
                        id: new_request_id(),
                        channel: channel_name.to_string(),
                    })
                    .await
                    .map_err(Arc::new);

                self.shared.settle(channel_name, outcome.is_ok());
                let _ = tx.send(Some(outcome.clone()));
                outcome
            }
            SubscribeRole::Follow(mut rx) => {
                let shared = rx
                    .wait_for(Option::is_some)
                    .await
                    .map(|outcome| outcome.clone());
                match shared {
                    Ok(Some(outcome)) => outcome,
                    _ => Err(Arc::new(TransportError::Closed)),
                }
            }
        };

        if let Err(e) = outcome {
            debug!(channel = %channel_name, error = %e, "subscribe failed");
            channel.unsubscribe();
            return Err(share_error(&e));
        }

        Ok(channel)
    }

    async fn trigger(&self, event: OutboundEvent) -> Result<(), TransportError> {
        if !self.shared.is_connected() {
            self.connect().await?;
        }
        self.shared
            .request(ClientFrame::Trigger {
                id: new_request_id(),
                event,
            })
            .await
    }

    async fn trigger_batch(&self, events: Vec<OutboundEvent>) -> Result<(), TransportError> {
        if !self.shared.is_connected() {
            self.connect().await?;
        }
        self.shared
            .request(ClientFrame::TriggerBatch {
                id: new_request_id(),
                events,
            })
            .await
    }

    fn on_connection_change(&self, listener: ConnectionListener) {
        lock(&self.shared.listeners).push(listener);
    }
}

struct WsChannel {
    name: String,
    handle: u64,
    shared: Arc<WsShared>,
}

impl RemoteChannel for WsChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind(&self, event_name: &str, handler: EventHandler) {
        let mut channels = lock(&self.shared.channels);
        if let Some(bindings) = channels
            .get_mut(&self.name)
            .and_then(|entry| entry.handles.get_mut(&self.handle))
        {
            bindings.push((event_name.to_string(), handler));
        }
    }

    fn unsubscribe(&self) {
        let mut channels = lock(&self.shared.channels);
        let Some(entry) = channels.get_mut(&self.name) else {
            return;
        };
        if entry.handles.remove(&self.handle).is_none() || !entry.handles.is_empty() {
            return;
        }

        let active = matches!(entry.hub, HubState::Active);
        channels.remove(&self.name);

        // Queued before the lock is released, so a later subscribe for the
        // same channel reaches the hub after this frame.
        if active && self.shared.is_connected() {
            debug!(channel = %self.name, "releasing remote subscription");
            let _ = self.shared.send_frame(ClientFrame::Unsubscribe {
                channel: self.name.clone(),
            });
        }
    }
}
