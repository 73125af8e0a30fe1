// Fan-out router for one pub/sub destination. The subscription set is
// mutated rarely and read on every publish, so the publish hot path reads
// a lock-free snapshot and subscribe/unsubscribe rebuild it.
use arc_swap::ArcSwap;
use courier_common::ids::{ChannelId, TopicId};
use courier_message::Message;
use parking_lot::Mutex;
use slab::Slab;
use smallvec::SmallVec;
use std::sync::Arc;

use crate::subscription::Subscription;

pub struct Topic {
    id: TopicId,
    name: String,
    // Snapshot used by the publish hot path: lock-free read.
    snapshot: ArcSwap<Vec<Arc<Subscription>>>,
    // Inner registry mutated only on subscribe/unsubscribe paths.
    registry: Mutex<Slab<Arc<Subscription>>>,
}

impl Topic {
    pub(crate) fn new(id: TopicId, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            registry: Mutex::new(Slab::new()),
        })
    }

    pub fn id(&self) -> TopicId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn add(&self, subscription: Arc<Subscription>) {
        let mut registry = self.registry.lock();
        registry.insert(subscription);
        self.rebuild_snapshot(&registry);
    }

    /// Detach the subscription whose channel is `channel`, if present.
    pub(crate) fn remove(&self, channel: ChannelId) -> Option<Arc<Subscription>> {
        let mut registry = self.registry.lock();
        let key = registry
            .iter()
            .find(|(_, sub)| sub.channel().id() == channel)
            .map(|(key, _)| key)?;
        let removed = registry.remove(key);
        self.rebuild_snapshot(&registry);
        Some(removed)
    }

    fn rebuild_snapshot(&self, registry: &Slab<Arc<Subscription>>) {
        let mut snapshot = Vec::with_capacity(registry.len());
        for (_, subscription) in registry.iter() {
            snapshot.push(Arc::clone(subscription));
        }
        self.snapshot.store(Arc::new(snapshot));
    }

    pub(crate) fn subscriptions(&self) -> Arc<Vec<Arc<Subscription>>> {
        self.snapshot.load_full()
    }

    /// Subscriptions whose filters accept this message. Evaluation order
    /// across subscriptions carries no delivery-order guarantee.
    pub(crate) fn matching(&self, message: &Message) -> SmallVec<[Arc<Subscription>; 4]> {
        let snapshot = self.snapshot.load();
        let mut matched = SmallVec::new();
        for subscription in snapshot.iter() {
            if subscription.matches(message) {
                matched.push(Arc::clone(subscription));
            }
        }
        matched
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.lock().len()
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use bytes::Bytes;
    use courier_common::ids::{ConnectionId, MessageId};
    use courier_message::{MessageBuilder, Selector};
    use courier_storage::MessageStore;

    fn subscription(channel_id: u64, selector: Option<&str>) -> Arc<Subscription> {
        let store = Arc::new(MessageStore::new(16));
        let channel = Channel::new(ChannelId::from_raw(channel_id), false, store);
        Subscription::new(
            channel,
            TopicId::from_raw(1),
            selector.map(|s| Selector::parse(s).expect("selector")),
            false,
            ConnectionId::from_raw(0),
            false,
        )
    }

    fn message(priority: u8) -> Message {
        MessageBuilder::new(Bytes::new())
            .priority(priority)
            .finish(MessageId::from_raw(1), 0)
    }

    #[test]
    fn matching_honors_each_subscriptions_selector() {
        let topic = Topic::new(TopicId::from_raw(1), "events");
        topic.add(subscription(1, None));
        topic.add(subscription(2, Some("priority > 5")));
        assert_eq!(topic.subscription_count(), 2);

        let low = topic.matching(&message(3));
        assert_eq!(low.len(), 1);
        let high = topic.matching(&message(8));
        assert_eq!(high.len(), 2);
    }

    #[test]
    fn remove_detaches_by_channel_id() {
        let topic = Topic::new(TopicId::from_raw(1), "events");
        topic.add(subscription(1, None));
        topic.add(subscription(2, None));

        let removed = topic.remove(ChannelId::from_raw(1)).expect("remove");
        assert_eq!(removed.channel().id().as_u64(), 1);
        assert_eq!(topic.subscription_count(), 1);
        assert_eq!(topic.matching(&message(0)).len(), 1);

        // Removing again reports the subscription as already gone.
        assert!(topic.remove(ChannelId::from_raw(1)).is_none());
    }
}
