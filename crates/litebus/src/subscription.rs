use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use litebus_protocol::{ChannelCreated, ChannelKey, MessageEnvelope};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{BusError, Result};
use crate::registry::ChannelRegistry;
use crate::replay::ReplayStream;

/// Typed stream of live messages on one channel.
///
/// Waits for the channel to be created, then follows the binding's stream.
/// Every creation notification switches to the stream of the binding that
/// is current at that moment, dropping the previous one. Tombstones and
/// empty payloads are skipped; payloads that do not decode as `T` are
/// yielded as [`BusError::Decode`].
///
/// The stream never ends on its own. Drop it to unsubscribe.
pub struct MessageStream<T> {
    key: ChannelKey,
    registry: Arc<ChannelRegistry>,
    created: ReplayStream<ChannelCreated>,
    current: Option<ReplayStream<MessageEnvelope<Value>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> MessageStream<T> {
    pub(crate) fn new(key: ChannelKey, registry: Arc<ChannelRegistry>) -> Self {
        let created = registry.hook_created(&key);
        Self {
            key,
            registry,
            created,
            current: None,
            _marker: PhantomData,
        }
    }

    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Whether the stream is attached to a binding yet.
    pub fn is_attached(&self) -> bool {
        self.current.is_some()
    }
}

fn decode<T: DeserializeOwned>(key: &ChannelKey, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|source| BusError::Decode {
        key: key.clone(),
        source,
    })
}

impl<T: DeserializeOwned> Stream for MessageStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        while let Poll::Ready(Some(_)) = this.created.poll_next_unpin(cx) {
            if let Some(binding) = this.registry.get(&this.key) {
                debug!(channel = %this.key, "attached to channel stream");
                this.current = Some(binding.stream());
            }
        }

        let Some(current) = this.current.as_mut() else {
            return Poll::Pending;
        };

        loop {
            match current.poll_next_unpin(cx) {
                Poll::Ready(Some(envelope)) => {
                    if let Some(data) = envelope.into_live() {
                        return Poll::Ready(Some(decode(&this.key, data)));
                    }
                }
                Poll::Ready(None) => {
                    // Binding was dropped; wait for the next creation.
                    this.current = None;
                    return Poll::Pending;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
