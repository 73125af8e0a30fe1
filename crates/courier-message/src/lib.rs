// Message model shared by the broker core: immutable message identity,
// typed properties, selector predicates, and the binary codec used by the
// transaction journal.
use bytes::Bytes;
use courier_common::ids::{ConnectionId, MessageId};

pub mod codec;
pub mod properties;
pub mod selector;

pub use properties::{PropertyStore, PropertyValue};
pub use selector::Selector;

pub type Result<T> = std::result::Result<T, MessageError>;

/// Highest priority a message may carry; larger values are clamped.
pub const MAX_PRIORITY: u8 = 9;

#[derive(thiserror::Error, Debug)]
pub enum MessageError {
    #[error("cannot read {stored} property \"{name}\" as {requested}")]
    TypeConversion {
        name: String,
        stored: &'static str,
        requested: &'static str,
    },
    #[error("incomplete encoded message")]
    Incomplete,
    #[error("unknown property tag {0}")]
    UnknownTag(u8),
    #[error("invalid utf-8 in encoded string")]
    InvalidUtf8,
    #[error("selector error at byte {pos}: {reason}")]
    Selector { pos: usize, reason: String },
}

/// An immutable broker message.
///
/// Identity is assigned by the broker at send time; after that the message
/// body is owned by the message store and every channel holds a reference,
/// never a copy.
///
/// ```
/// use bytes::Bytes;
/// use courier_common::ids::MessageId;
/// use courier_message::MessageBuilder;
///
/// let message = MessageBuilder::new(Bytes::from_static(b"hello"))
///     .durable(true)
///     .priority(4)
///     .finish(MessageId::from_raw(1), 1_700_000_000_000);
/// assert_eq!(message.priority(), 4);
/// assert!(message.durable());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: MessageId,
    durable: bool,
    priority: u8,
    // Unix millis; None means the message never expires.
    expiration: Option<u64>,
    timestamp: u64,
    // Publisher connection identity, used by no-local filtering.
    origin: ConnectionId,
    body: Bytes,
    properties: PropertyStore,
}

impl Message {
    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn expiration(&self) -> Option<u64> {
        self.expiration
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn origin(&self) -> ConnectionId {
        self.origin
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn properties(&self) -> &PropertyStore {
        &self.properties
    }

    /// True once `now` has passed the expiration instant, if any.
    pub fn expired(&self, now: u64) -> bool {
        match self.expiration {
            Some(at) => now >= at,
            None => false,
        }
    }
}

/// Everything a producer chooses about a message; the broker supplies the
/// identity and timestamp when the message is accepted.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    durable: bool,
    priority: u8,
    expiration: Option<u64>,
    origin: ConnectionId,
    body: Bytes,
    properties: PropertyStore,
}

impl MessageBuilder {
    pub fn new(body: Bytes) -> Self {
        Self {
            durable: false,
            priority: 4,
            expiration: None,
            origin: ConnectionId::from_raw(0),
            body,
            properties: PropertyStore::new(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        // Out-of-range priorities are clamped rather than rejected.
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    pub fn expiration(mut self, at_millis: u64) -> Self {
        self.expiration = Some(at_millis);
        self
    }

    pub fn origin(mut self, origin: ConnectionId) -> Self {
        self.origin = origin;
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.put(name, value);
        self
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Seal the draft with broker-assigned identity.
    pub fn finish(self, id: MessageId, timestamp: u64) -> Message {
        Message {
            id,
            durable: self.durable,
            priority: self.priority,
            expiration: self.expiration,
            timestamp,
            origin: self.origin,
            body: self.body,
            properties: self.properties,
        }
    }
}
