use std::sync::Arc;

use litebus_protocol::{ChannelCreated, ChannelKey};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::config::BusSettings;
use crate::connection::ConnectionState;
use crate::error::Result;
use crate::registry::ChannelRegistry;
use crate::replay::ReplayStream;
use crate::subscription::MessageStream;
use crate::transport::{ConnectionStatus, RemoteTransport};

/// Channel/event message bus over a remote pub/sub transport.
///
/// Cheap to clone; clones share the same channels and connection.
#[derive(Clone)]
pub struct MessageBus {
    transport: Arc<dyn RemoteTransport>,
    registry: Arc<ChannelRegistry>,
    connection: Arc<ConnectionState>,
}

impl MessageBus {
    pub fn new(transport: Arc<dyn RemoteTransport>) -> Self {
        Self::from_settings(transport, &BusSettings::default())
    }

    pub fn from_settings(transport: Arc<dyn RemoteTransport>, settings: &BusSettings) -> Self {
        let connection = Arc::new(ConnectionState::new());
        transport.on_connection_change(connection.listener());

        Self {
            registry: Arc::new(ChannelRegistry::new(
                transport.clone(),
                settings.message_history,
            )),
            transport,
            connection,
        }
    }

    /// Make sure a channel exists, creating its remote subscription if needed.
    pub async fn add_channel(&self, channel_name: &str, event_name: &str) -> Result<()> {
        let key = ChannelKey::new(channel_name, event_name);
        self.registry.load(&key, true).await?;
        Ok(())
    }

    /// Typed stream of messages published on a channel.
    ///
    /// Connects the transport on first use. The channel does not have to
    /// exist yet: the stream attaches as soon as it is created.
    pub async fn hook<T>(&self, channel_name: &str, event_name: &str) -> Result<MessageStream<T>>
    where
        T: DeserializeOwned,
    {
        self.connection
            .ensure_connected(self.transport.as_ref())
            .await?;

        let key = ChannelKey::new(channel_name, event_name);
        debug!(channel = %key, "hooking channel");
        Ok(MessageStream::new(key, self.registry.clone()))
    }

    /// Publish `data` on a channel, creating the channel if needed.
    pub async fn send<T>(&self, channel_name: &str, event_name: &str, data: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let key = ChannelKey::new(channel_name, event_name);
        if let Some(binding) = self.registry.load(&key, true).await? {
            binding.send(data).await?;
        }
        Ok(())
    }

    /// Hide the current message of a channel from local subscribers.
    ///
    /// Unknown channels are left alone.
    pub async fn delete_message(&self, channel_name: &str, event_name: &str) -> Result<()> {
        let key = ChannelKey::new(channel_name, event_name);
        if let Some(binding) = self.registry.load(&key, false).await? {
            binding.delete_local();
        }
        Ok(())
    }

    /// Delete the current message of every known channel.
    ///
    /// Sends one batch of remote tombstones, then clears every channel
    /// locally whether or not the batch went through. A batch failure is
    /// returned after local clearing. With no known channels there is
    /// nothing to tombstone, so no batch is sent at all.
    pub async fn delete_messages(&self) -> Result<()> {
        let bindings = self.registry.snapshot();
        if bindings.is_empty() {
            return Ok(());
        }

        let events = bindings.iter().map(|b| b.tombstone_event()).collect();
        let outcome = self.transport.trigger_batch(events).await;
        if let Err(e) = &outcome {
            warn!(error = %e, channels = bindings.len(), "remote delete failed, clearing locally");
        }

        for binding in &bindings {
            binding.delete_local();
        }
        info!(channels = bindings.len(), "cleared all channels");

        outcome.map_err(Into::into)
    }

    /// Replaying stream of creation notifications for a channel.
    pub fn channel_created(
        &self,
        channel_name: &str,
        event_name: &str,
    ) -> ReplayStream<ChannelCreated> {
        self.registry
            .hook_created(&ChannelKey::new(channel_name, event_name))
    }

    /// Channels created so far.
    pub fn channels(&self) -> Vec<ChannelKey> {
        self.registry.keys()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Release every remote subscription and forget all channels.
    ///
    /// Open message streams stay alive and re-attach if a channel is created
    /// again. Returns the number of channels released.
    pub fn shutdown(&self) -> usize {
        let bindings = self.registry.drain();
        for binding in &bindings {
            binding.release();
        }
        info!(channels = bindings.len(), "message bus shut down");
        bindings.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusError;
    use crate::transport::LoopbackTransport;
    use futures_util::{Stream, StreamExt};
    use litebus_protocol::RemotePayload;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: u32,
        name: String,
    }

    fn bus() -> (LoopbackTransport, MessageBus) {
        let transport = LoopbackTransport::new();
        let bus = MessageBus::new(Arc::new(transport.clone()));
        (transport, bus)
    }

    async fn next_item<S, T>(stream: &mut S) -> T
    where
        S: Stream<Item = T> + Unpin,
    {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
    }

    async fn assert_quiet<S: Stream + Unpin>(stream: &mut S) {
        let next = timeout(Duration::from_millis(50), stream.next()).await;
        assert!(next.is_err(), "unexpected item on stream");
    }

    #[tokio::test]
    async fn test_hook_connects_once() {
        let (transport, bus) = bus();
        assert_eq!(bus.connection_status(), ConnectionStatus::Disconnected);

        let _a = bus.hook::<Item>("ui", "a").await.unwrap();
        let _b = bus.hook::<Item>("ui", "b").await.unwrap();

        assert_eq!(bus.connection_status(), ConnectionStatus::Connected);
        assert_eq!(transport.stats().connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hook_before_channel_exists_attaches_on_creation() {
        let (transport, bus) = bus();
        let mut stream = bus.hook::<Item>("ui", "msg").await.unwrap();
        assert_eq!(transport.stats().subscribes.load(Ordering::SeqCst), 0);

        bus.add_channel("ui", "msg").await.unwrap();
        let item = Item {
            id: 1,
            name: "X".to_string(),
        };
        bus.send("ui", "msg", &item).await.unwrap();

        assert_eq!(next_item(&mut stream).await.unwrap(), item);
        assert!(stream.is_attached());
    }

    #[tokio::test]
    async fn test_hook_skips_unavailable_envelopes() {
        let (transport, bus) = bus();
        bus.add_channel("ui", "msg").await.unwrap();
        let mut stream = bus.hook::<String>("ui", "msg").await.unwrap();

        transport.deliver(
            "ui",
            "msg",
            RemotePayload::Structured(json!({"data": "X", "available": true})),
        );
        transport.deliver(
            "ui",
            "msg",
            RemotePayload::Structured(json!({"data": null, "available": false})),
        );
        transport.deliver(
            "ui",
            "msg",
            RemotePayload::Structured(json!({"data": null, "available": true})),
        );

        assert_eq!(next_item(&mut stream).await.unwrap(), "X");
        assert_quiet(&mut stream).await;
    }

    #[tokio::test]
    async fn test_decode_failure_is_tagged() {
        let (transport, bus) = bus();
        bus.add_channel("ui", "msg").await.unwrap();
        let mut stream = bus.hook::<Item>("ui", "msg").await.unwrap();

        transport.deliver(
            "ui",
            "msg",
            RemotePayload::Structured(json!({"data": {"unexpected": true}, "available": true})),
        );

        let outcome = next_item(&mut stream).await;
        assert!(matches!(outcome, Err(BusError::Decode { key, .. }) if key == ChannelKey::new("ui", "msg")));
    }

    #[tokio::test]
    async fn test_send_auto_creates_channel() {
        let (transport, bus) = bus();

        bus.send("ui", "msg", &json!({"id": 3})).await.unwrap();

        assert_eq!(transport.stats().subscribes.load(Ordering::SeqCst), 1);
        assert_eq!(transport.stats().triggers.load(Ordering::SeqCst), 1);
        assert_eq!(bus.channels(), vec![ChannelKey::new("ui", "msg")]);
    }

    #[tokio::test]
    async fn test_delete_message_on_unknown_channel_is_noop() {
        let (transport, bus) = bus();

        bus.delete_message("ui", "missing").await.unwrap();

        assert!(bus.channels().is_empty());
        assert_eq!(transport.stats().subscribes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delete_message_hides_current_message_locally() {
        let (transport, bus) = bus();
        bus.add_channel("ui", "msg").await.unwrap();
        let binding = bus.registry.get(&ChannelKey::new("ui", "msg")).unwrap();

        bus.delete_message("ui", "msg").await.unwrap();

        assert_eq!(binding.retained(), 1);
        assert_eq!(transport.stats().triggers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delete_messages_batches_remote_and_clears_local() {
        let (transport, bus) = bus();
        bus.add_channel("ui", "a").await.unwrap();
        bus.add_channel("ui", "b").await.unwrap();
        bus.add_channel("log", "a").await.unwrap();

        bus.delete_messages().await.unwrap();

        assert_eq!(transport.stats().batches.load(Ordering::SeqCst), 1);
        assert_eq!(transport.stats().triggers.load(Ordering::SeqCst), 0);
        for binding in bus.registry.snapshot() {
            assert_eq!(binding.retained(), 1, "one local tombstone per channel");
        }
    }

    #[tokio::test]
    async fn test_delete_messages_clears_local_when_remote_fails() {
        let (transport, bus) = bus();
        bus.add_channel("ui", "a").await.unwrap();
        bus.add_channel("ui", "b").await.unwrap();
        transport.fail_triggers(Some("service unavailable"));

        let result = bus.delete_messages().await;

        assert!(matches!(result, Err(BusError::Transport(_))));
        assert_eq!(transport.stats().batches.load(Ordering::SeqCst), 1);
        for binding in bus.registry.snapshot() {
            assert_eq!(binding.retained(), 1);
        }
    }

    #[tokio::test]
    async fn test_dropping_one_stream_leaves_others_running() {
        let (_transport, bus) = bus();
        bus.add_channel("ui", "msg").await.unwrap();
        let first = bus.hook::<u32>("ui", "msg").await.unwrap();
        let mut second = bus.hook::<u32>("ui", "msg").await.unwrap();

        drop(first);
        bus.send("ui", "msg", &5u32).await.unwrap();

        assert_eq!(next_item(&mut second).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_shutdown_releases_subscriptions_and_streams_reattach() {
        let (transport, bus) = bus();
        bus.add_channel("ui", "msg").await.unwrap();
        let mut stream = bus.hook::<u32>("ui", "msg").await.unwrap();

        assert_eq!(bus.shutdown(), 1);
        assert_eq!(transport.subscription_count("ui"), 0);
        assert!(bus.channels().is_empty());

        bus.send("ui", "msg", &9u32).await.unwrap();
        assert_eq!(next_item(&mut stream).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_message_history_bound() {
        let transport = LoopbackTransport::new();
        let bus = MessageBus::from_settings(
            Arc::new(transport.clone()),
            &BusSettings {
                message_history: Some(1),
            },
        );
        bus.add_channel("ui", "msg").await.unwrap();
        let _live = bus.hook::<u32>("ui", "msg").await.unwrap();

        bus.send("ui", "msg", &1u32).await.unwrap();
        bus.send("ui", "msg", &2u32).await.unwrap();

        let mut late = bus.hook::<u32>("ui", "msg").await.unwrap();
        assert_eq!(next_item(&mut late).await.unwrap(), 2);
        assert_quiet(&mut late).await;
    }

    #[tokio::test]
    async fn test_connect_failure_propagates_from_hook() {
        let (transport, bus) = bus();
        transport.fail_connects(Some("bad credentials"));

        let result = bus.hook::<u32>("ui", "msg").await;

        assert!(matches!(result, Err(BusError::Transport(_))));
        assert_eq!(bus.connection_status(), ConnectionStatus::Disconnected);
    }
}
