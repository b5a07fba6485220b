use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use litebus_protocol::{ChannelCreated, ChannelKey};
use tracing::{debug, info};

use crate::binding::ChannelBinding;
use crate::error::Result;
use crate::replay::{ReplayStream, ReplaySubject};
use crate::transport::RemoteTransport;

/// Memoizing cache of channel bindings.
///
/// Alongside the bindings it keeps one replaying notification subject per
/// key, so callers that hook a channel before it exists still learn when it
/// is created.
pub struct ChannelRegistry {
    transport: Arc<dyn RemoteTransport>,
    /// Channel key -> binding
    bindings: DashMap<ChannelKey, Arc<ChannelBinding>>,
    /// Channel key -> creation notifications
    created: DashMap<ChannelKey, ReplaySubject<ChannelCreated>>,
    /// Replay bound for binding streams
    history: Option<usize>,
}

impl ChannelRegistry {
    pub fn new(transport: Arc<dyn RemoteTransport>, history: Option<usize>) -> Self {
        Self {
            transport,
            bindings: DashMap::new(),
            created: DashMap::new(),
            history,
        }
    }

    /// Binding for `key`, without creating it.
    pub fn get(&self, key: &ChannelKey) -> Option<Arc<ChannelBinding>> {
        self.bindings.get(key).map(|binding| binding.value().clone())
    }

    /// Load the binding for `key`, creating it when `auto_create` is set.
    ///
    /// Creation subscribes on the remote transport. When several callers
    /// race on the same key exactly one binding is published and notified;
    /// the others release their remote subscription and share the winner.
    pub async fn load(
        &self,
        key: &ChannelKey,
        auto_create: bool,
    ) -> Result<Option<Arc<ChannelBinding>>> {
        if let Some(binding) = self.get(key) {
            debug!(channel = %key, "binding cache hit");
            return Ok(Some(binding));
        }

        let created = self.created_subject(key);

        if !auto_create {
            return Ok(None);
        }

        let remote = self.transport.subscribe(&key.channel_name).await?;
        let binding = match ChannelBinding::new(
            key.clone(),
            remote.clone(),
            self.transport.clone(),
            self.history,
        ) {
            Ok(binding) => binding,
            Err(e) => {
                remote.unsubscribe();
                return Err(e);
            }
        };

        let existing = match self.bindings.entry(key.clone()) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(binding.clone());
                None
            }
        };

        match existing {
            None => {
                created.push(ChannelCreated::now(key));
                info!(channel = %key, "channel created");
                Ok(Some(binding))
            }
            Some(existing) => {
                binding.release();
                debug!(channel = %key, "channel created concurrently, released duplicate subscription");
                Ok(Some(existing))
            }
        }
    }

    /// Replaying stream of creation notifications for `key`.
    pub fn hook_created(&self, key: &ChannelKey) -> ReplayStream<ChannelCreated> {
        self.created_subject(key).subscribe()
    }

    /// Known channel keys, sorted.
    pub fn keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<ChannelKey> = self.bindings.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Current bindings.
    pub fn snapshot(&self) -> Vec<Arc<ChannelBinding>> {
        self.bindings.iter().map(|e| e.value().clone()).collect()
    }

    /// Remove every binding and hand them back to the caller.
    ///
    /// Notification subjects survive, so a key created again later notifies
    /// its existing hooks once more.
    pub fn drain(&self) -> Vec<Arc<ChannelBinding>> {
        self.keys()
            .into_iter()
            .filter_map(|key| self.bindings.remove(&key).map(|(_, binding)| binding))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    fn created_subject(&self, key: &ChannelKey) -> ReplaySubject<ChannelCreated> {
        self.created
            .entry(key.clone())
            .or_insert_with(|| ReplaySubject::with_capacity(Some(1)))
            .value()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusError;
    use crate::transport::LoopbackTransport;
    use futures_util::StreamExt;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::time::timeout;

    fn registry() -> (LoopbackTransport, Arc<ChannelRegistry>) {
        let transport = LoopbackTransport::new();
        let registry = Arc::new(ChannelRegistry::new(Arc::new(transport.clone()), None));
        (transport, registry)
    }

    #[tokio::test]
    async fn test_load_without_auto_create_makes_no_remote_calls() {
        let (transport, registry) = registry();
        let key = ChannelKey::new("ui", "msg");

        assert!(registry.load(&key, false).await.unwrap().is_none());
        assert!(registry.load(&key, false).await.unwrap().is_none());

        assert_eq!(transport.stats().subscribes.load(Ordering::SeqCst), 0);
        assert_eq!(transport.stats().connects.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_auto_create_is_memoized() {
        let (transport, registry) = registry();
        let key = ChannelKey::new("ui", "msg");

        let first = registry.load(&key, true).await.unwrap().unwrap();
        let second = registry.load(&key, true).await.unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.stats().subscribes.load(Ordering::SeqCst), 1);
        assert_eq!(registry.keys(), vec![key]);
    }

    #[tokio::test]
    async fn test_creation_notification_replays_to_early_and_late_hooks() {
        let (_transport, registry) = registry();
        let key = ChannelKey::new("ui", "msg");

        let mut early = registry.hook_created(&key);
        registry.load(&key, true).await.unwrap();
        let mut late = registry.hook_created(&key);

        for stream in [&mut early, &mut late] {
            let created = timeout(Duration::from_secs(1), stream.next())
                .await
                .expect("no creation notification")
                .unwrap();
            assert_eq!(created.key(), key);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_converges_on_one_binding() {
        let (transport, registry) = registry();
        let key = ChannelKey::new("ui", "msg");
        let mut notifications = registry.hook_created(&key);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let key = key.clone();
                tokio::spawn(async move { registry.load(&key, true).await })
            })
            .collect();

        let mut bindings = Vec::new();
        for task in tasks {
            bindings.push(task.await.unwrap().unwrap().unwrap());
        }

        let winner = registry.get(&key).unwrap();
        assert!(bindings.iter().all(|b| Arc::ptr_eq(b, &winner)));
        assert_eq!(transport.subscription_count("ui"), 1);

        let subscribes = transport.stats().subscribes.load(Ordering::SeqCst);
        let unsubscribes = transport.stats().unsubscribes.load(Ordering::SeqCst);
        assert_eq!(subscribes - unsubscribes, 1);

        assert!(notifications.next().await.is_some());
        let extra = timeout(Duration::from_millis(50), notifications.next()).await;
        assert!(extra.is_err(), "creation must be notified exactly once");
    }

    #[tokio::test]
    async fn test_empty_event_name_releases_remote_subscription() {
        let (transport, registry) = registry();
        let key = ChannelKey::new("ui", "");

        let result = registry.load(&key, true).await;
        assert!(matches!(result, Err(BusError::EmptyEventName)));
        assert_eq!(transport.subscription_count("ui"), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_drain_keeps_notification_subjects() {
        let (_transport, registry) = registry();
        let key = ChannelKey::new("ui", "msg");
        registry.load(&key, true).await.unwrap();

        let drained = registry.drain();
        assert_eq!(drained.len(), 1);
        assert!(registry.get(&key).is_none());

        let mut hook = registry.hook_created(&key);
        assert!(hook.next().await.is_some());
    }
}
