use std::sync::Arc;

use litebus_protocol::{ChannelKey, MessageEnvelope, OutboundEvent, RemotePayload};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{BusError, Result};
use crate::replay::{ReplayStream, ReplaySubject};
use crate::transport::{RemoteChannel, RemoteTransport};

/// Live association between one channel key, its remote subscription and
/// the local replaying stream of envelopes.
pub struct ChannelBinding {
    key: ChannelKey,
    remote: Arc<dyn RemoteChannel>,
    transport: Arc<dyn RemoteTransport>,
    messages: ReplaySubject<MessageEnvelope<Value>>,
}

impl ChannelBinding {
    /// Create a binding and route the remote event to it.
    ///
    /// `history` bounds how many envelopes are replayed to late subscribers.
    pub fn new(
        key: ChannelKey,
        remote: Arc<dyn RemoteChannel>,
        transport: Arc<dyn RemoteTransport>,
        history: Option<usize>,
    ) -> Result<Arc<Self>> {
        if key.event_name.is_empty() {
            return Err(BusError::EmptyEventName);
        }

        let binding = Arc::new(Self {
            key,
            remote,
            transport,
            messages: ReplaySubject::with_capacity(history),
        });

        let weak = Arc::downgrade(&binding);
        binding.remote.bind(
            &binding.key.event_name,
            Arc::new(move |payload| match weak.upgrade() {
                Some(binding) => binding.on_remote_event(payload),
                None => Ok(()),
            }),
        );

        Ok(binding)
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    pub fn remote_channel(&self) -> &str {
        self.remote.name()
    }

    /// Publish `data` to the remote broadcaster as a live message.
    pub async fn send<T>(&self, data: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let envelope =
            serde_json::to_value(MessageEnvelope::live(data)).map_err(|source| BusError::Encode {
                key: self.key.clone(),
                source,
            })?;

        self.transport
            .trigger(OutboundEvent::new(
                self.remote.name(),
                self.key.event_name.clone(),
                envelope,
            ))
            .await?;

        debug!(channel = %self.key, "message sent");
        Ok(())
    }

    /// Suppress the current message for local subscribers only.
    pub fn delete_local(&self) {
        self.messages.push(MessageEnvelope::tombstone());
    }

    /// Decode an inbound remote payload and push it to local subscribers.
    pub fn on_remote_event(&self, payload: RemotePayload) -> Result<()> {
        let envelope = payload
            .decode()
            .map_err(|source| BusError::MalformedEnvelope {
                key: self.key.clone(),
                source,
            })?;

        let receivers = self.messages.push(envelope);
        debug!(channel = %self.key, receivers, "remote event received");
        Ok(())
    }

    /// Remote tombstone for this channel, as sent by a bulk delete.
    pub fn tombstone_event(&self) -> OutboundEvent {
        OutboundEvent::new(
            self.remote.name(),
            self.key.event_name.clone(),
            serde_json::json!({"data": Value::Null, "available": false}),
        )
    }

    /// Independent replaying cursor over this channel's envelopes.
    pub fn stream(&self) -> ReplayStream<MessageEnvelope<Value>> {
        self.messages.subscribe()
    }

    /// Number of envelopes retained for replay.
    pub fn retained(&self) -> usize {
        self.messages.history_len()
    }

    /// Release the remote subscription held by this binding.
    pub fn release(&self) {
        self.remote.unsubscribe();
    }
}

impl std::fmt::Debug for ChannelBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBinding")
            .field("key", &self.key)
            .field("remote", &self.remote.name())
            .field("retained", &self.messages.history_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn binding(
        transport: &LoopbackTransport,
        channel: &str,
        event: &str,
    ) -> Result<Arc<ChannelBinding>> {
        let remote = transport.subscribe(channel).await?;
        ChannelBinding::new(
            ChannelKey::new(channel, event),
            remote,
            Arc::new(transport.clone()),
            None,
        )
    }

    async fn next(
        stream: &mut ReplayStream<MessageEnvelope<Value>>,
    ) -> MessageEnvelope<Value> {
        timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_empty_event_name_is_rejected() {
        let transport = LoopbackTransport::new();
        let result = binding(&transport, "ui", "").await;
        assert!(matches!(result, Err(BusError::EmptyEventName)));
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_history_in_push_order() {
        let transport = LoopbackTransport::new();
        let binding = binding(&transport, "ui", "msg").await.unwrap();

        binding
            .on_remote_event(RemotePayload::Structured(
                json!({"data": "A", "available": true}),
            ))
            .unwrap();
        binding.delete_local();

        let mut stream = binding.stream();
        assert_eq!(next(&mut stream).await, MessageEnvelope::live(json!("A")));
        assert_eq!(next(&mut stream).await, MessageEnvelope::tombstone());
    }

    #[tokio::test]
    async fn test_remote_events_accept_raw_strings() {
        let transport = LoopbackTransport::new();
        let binding = binding(&transport, "ui", "msg").await.unwrap();

        binding
            .on_remote_event(RemotePayload::Raw(
                r#"{"data":{"id":1},"available":true}"#.to_string(),
            ))
            .unwrap();

        let mut stream = binding.stream();
        assert_eq!(
            next(&mut stream).await,
            MessageEnvelope::live(json!({"id": 1}))
        );
    }

    #[tokio::test]
    async fn test_malformed_remote_event_is_reported() {
        let transport = LoopbackTransport::new();
        let binding = binding(&transport, "ui", "msg").await.unwrap();

        let result = binding.on_remote_event(RemotePayload::Raw("{oops".to_string()));
        assert!(matches!(result, Err(BusError::MalformedEnvelope { .. })));
        assert_eq!(binding.retained(), 0);
    }

    #[tokio::test]
    async fn test_delete_local_does_not_contact_remote() {
        let transport = LoopbackTransport::new();
        let binding = binding(&transport, "ui", "msg").await.unwrap();

        binding.delete_local();

        assert_eq!(transport.stats().triggers.load(Ordering::SeqCst), 0);
        assert_eq!(transport.stats().batches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_round_trips_through_transport() {
        let transport = LoopbackTransport::new();
        transport.connect().await.unwrap();
        let binding = binding(&transport, "ui", "msg").await.unwrap();

        binding.send(&json!({"id": 7})).await.unwrap();

        let mut stream = binding.stream();
        assert_eq!(
            next(&mut stream).await,
            MessageEnvelope::live(json!({"id": 7}))
        );
        assert_eq!(transport.stats().triggers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_failure_propagates() {
        let transport = LoopbackTransport::new();
        let binding = binding(&transport, "ui", "msg").await.unwrap();
        transport.fail_triggers(Some("unauthorized"));

        let result = binding.send("hello").await;
        assert!(matches!(result, Err(BusError::Transport(_))));
    }
}
