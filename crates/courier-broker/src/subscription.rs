// One consumer's view of a topic: a channel plus the filters deciding
// which published messages reach it.
use courier_common::ids::{ConnectionId, TopicId};
use courier_message::{Message, Selector};
use std::sync::Arc;

use crate::channel::Channel;

/// A channel bound to a topic with filter predicates. The topic holds a
/// non-owning back-reference; the subscription owns its channel.
pub struct Subscription {
    channel: Arc<Channel>,
    topic: TopicId,
    selector: Option<Selector>,
    no_local: bool,
    connection: ConnectionId,
    durable: bool,
}

impl Subscription {
    pub(crate) fn new(
        channel: Arc<Channel>,
        topic: TopicId,
        selector: Option<Selector>,
        no_local: bool,
        connection: ConnectionId,
        durable: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            topic,
            selector,
            no_local,
            connection,
            durable,
        })
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn topic(&self) -> TopicId {
        self.topic
    }

    pub fn selector(&self) -> Option<&Selector> {
        self.selector.as_ref()
    }

    pub fn no_local(&self) -> bool {
        self.no_local
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    /// No-local first, then the selector; both must pass for delivery.
    pub(crate) fn matches(&self, message: &Message) -> bool {
        if self.no_local && message.origin() == self.connection {
            return false;
        }
        match &self.selector {
            Some(selector) => selector.eval(message),
            None => true,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel.id())
            .field("topic", &self.topic)
            .field("no_local", &self.no_local)
            .field("durable", &self.durable)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use courier_common::ids::{ChannelId, MessageId};
    use courier_message::{MessageBuilder, PropertyValue};
    use courier_storage::MessageStore;

    fn subscription(
        selector: Option<&str>,
        no_local: bool,
        connection: u64,
    ) -> Arc<Subscription> {
        let store = Arc::new(MessageStore::new(16));
        let channel = Channel::new(ChannelId::from_raw(1), false, store);
        Subscription::new(
            channel,
            TopicId::from_raw(1),
            selector.map(|s| Selector::parse(s).expect("selector")),
            no_local,
            ConnectionId::from_raw(connection),
            false,
        )
    }

    fn message(origin: u64, priority: u8) -> Message {
        MessageBuilder::new(Bytes::new())
            .origin(ConnectionId::from_raw(origin))
            .priority(priority)
            .property("color", PropertyValue::Str("red".into()))
            .finish(MessageId::from_raw(1), 0)
    }

    #[test]
    fn no_local_suppresses_own_connection() {
        let sub = subscription(None, true, 7);
        assert!(!sub.matches(&message(7, 4)));
        assert!(sub.matches(&message(8, 4)));
    }

    #[test]
    fn selector_filters_after_no_local() {
        let sub = subscription(Some("priority > 5"), true, 7);
        assert!(sub.matches(&message(8, 6)));
        assert!(!sub.matches(&message(8, 5)));
        // Matching selector still loses to no-local.
        assert!(!sub.matches(&message(7, 6)));
    }

    #[test]
    fn no_filters_matches_everything() {
        let sub = subscription(None, false, 7);
        assert!(sub.matches(&message(7, 0)));
    }
}
