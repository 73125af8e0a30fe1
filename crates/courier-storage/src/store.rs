// Arena of message bodies shared across channels. Every channel that
// accepts a message holds one reference; the body is freed exactly when
// the last reference is released. Release is an explicit, mandatory call
// on every exit path from channel code, including error paths.
use courier_message::Message;
use parking_lot::Mutex;
use slab::Slab;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::{Result, StorageError};

/// Opaque handle addressing one stored body. The generation tag keeps a
/// recycled slab slot from being confused with a stale handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    index: u32,
    generation: u32,
}

impl MessageHandle {
    pub fn as_raw(&self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }
}

struct Entry {
    message: Arc<Message>,
    refs: AtomicU32,
    generation: u32,
}

/// Reference-counted owner of message bodies.
///
/// ```
/// use bytes::Bytes;
/// use courier_common::ids::MessageId;
/// use courier_message::MessageBuilder;
/// use courier_storage::MessageStore;
///
/// let store = MessageStore::new(1024);
/// let message = MessageBuilder::new(Bytes::from_static(b"hello"))
///     .finish(MessageId::from_raw(1), 0);
/// let handle = store.put(message).expect("store");
/// assert_eq!(store.reference(handle).expect("reference"), 2);
/// assert!(!store.release(handle).expect("release"));
/// assert!(store.release(handle).expect("release freed"));
/// ```
pub struct MessageStore {
    entries: Mutex<Slab<Entry>>,
    next_generation: AtomicU32,
    live: AtomicUsize,
    max_messages: usize,
}

impl MessageStore {
    pub fn new(max_messages: usize) -> Self {
        Self {
            entries: Mutex::new(Slab::new()),
            next_generation: AtomicU32::new(1),
            live: AtomicUsize::new(0),
            max_messages,
        }
    }

    /// Take ownership of a message body with an initial refcount of one.
    /// Rejected with `Exhausted` at capacity, leaving no partial state.
    pub fn put(&self, message: Message) -> Result<MessageHandle> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_messages {
            metrics::counter!("courier_store_exhausted_total").increment(1);
            return Err(StorageError::Exhausted);
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let index = entries.insert(Entry {
            message: Arc::new(message),
            refs: AtomicU32::new(1),
            generation,
        });
        let live = self.live.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("courier_store_live_bodies").set(live as f64);
        Ok(MessageHandle {
            index: index as u32,
            generation,
        })
    }

    /// Add one reference for another channel sharing the same body.
    pub fn reference(&self, handle: MessageHandle) -> Result<u32> {
        let entries = self.entries.lock();
        let entry = Self::entry_for(&entries, handle)?;
        Ok(entry.refs.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Drop one reference; returns true when this call freed the body.
    pub fn release(&self, handle: MessageHandle) -> Result<bool> {
        let mut entries = self.entries.lock();
        let entry = Self::entry_for(&entries, handle)?;
        let previous = entry.refs.fetch_sub(1, Ordering::Relaxed);
        if previous > 1 {
            return Ok(false);
        }
        entries.remove(handle.index as usize);
        let live = self.live.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::gauge!("courier_store_live_bodies").set(live as f64);
        Ok(true)
    }

    pub fn load(&self, handle: MessageHandle) -> Result<Arc<Message>> {
        let entries = self.entries.lock();
        let entry = Self::entry_for(&entries, handle)?;
        Ok(Arc::clone(&entry.message))
    }

    /// Current reference count; used by teardown checks and tests.
    pub fn refcount(&self, handle: MessageHandle) -> Result<u32> {
        let entries = self.entries.lock();
        let entry = Self::entry_for(&entries, handle)?;
        Ok(entry.refs.load(Ordering::Relaxed))
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry_for<'a>(entries: &'a Slab<Entry>, handle: MessageHandle) -> Result<&'a Entry> {
        match entries.get(handle.index as usize) {
            Some(entry) if entry.generation == handle.generation => Ok(entry),
            _ => {
                // A stale handle is a programming error in channel code.
                debug_assert!(false, "stale message handle {handle:?}");
                tracing::error!(handle = handle.as_raw(), "stale message handle");
                Err(StorageError::NotFound)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use courier_common::ids::MessageId;
    use courier_message::MessageBuilder;

    fn message(id: u64) -> Message {
        MessageBuilder::new(Bytes::from_static(b"body")).finish(MessageId::from_raw(id), 0)
    }

    #[test]
    fn body_is_freed_exactly_at_zero() {
        let store = MessageStore::new(16);
        let handle = store.put(message(1)).expect("put");
        store.reference(handle).expect("reference");
        store.reference(handle).expect("reference");
        assert_eq!(store.refcount(handle).expect("refcount"), 3);

        assert!(!store.release(handle).expect("release"));
        assert!(!store.release(handle).expect("release"));
        assert_eq!(store.len(), 1);
        assert!(store.release(handle).expect("release"));
        assert_eq!(store.len(), 0);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn stale_handles_are_not_found() {
        let store = MessageStore::new(16);
        let handle = store.put(message(1)).expect("put");
        assert!(store.release(handle).expect("release"));
        assert!(matches!(
            store.load(handle),
            Err(StorageError::NotFound)
        ));
    }

    #[test]
    fn recycled_slots_do_not_alias_old_handles() {
        let store = MessageStore::new(16);
        let first = store.put(message(1)).expect("put");
        store.release(first).expect("release");
        let second = store.put(message(2)).expect("put");
        // Slab reuses the slot, but the generation differs.
        assert_ne!(first, second);
        assert_eq!(store.load(second).expect("load").id().as_u64(), 2);
    }

    #[test]
    fn capacity_backpressures_put() {
        let store = MessageStore::new(1);
        let handle = store.put(message(1)).expect("put");
        assert!(matches!(store.put(message(2)), Err(StorageError::Exhausted)));
        // Rejected put must not disturb existing state.
        assert_eq!(store.refcount(handle).expect("refcount"), 1);
        store.release(handle).expect("release");
        store.put(message(3)).expect("put after free");
    }

    #[test]
    fn load_shares_the_same_body() {
        let store = MessageStore::new(16);
        let handle = store.put(message(7)).expect("put");
        let a = store.load(handle).expect("load");
        let b = store.load(handle).expect("load");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
