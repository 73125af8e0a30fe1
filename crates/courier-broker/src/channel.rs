// Queue delivery state machine. A channel is an ordered buffer of message
// references bound to one logical consumer side; references move
// Pending -> Delivering -> Acknowledged, or back to Pending on cancel and
// recover. Priority picks the ring, the insertion sequence is the
// tie-break, so FIFO order survives cancel/recover round trips.
use courier_common::ids::{ChannelId, ConsumerId, MessageId};
use courier_message::Message;
use courier_storage::{MessageHandle, MessageStore};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

pub(crate) const PRIORITY_LEVELS: usize = 10;

/// One message handed to a consumer. Identifies the underlying reference
/// for acknowledge/cancel and reports how often it has been delivered.
#[derive(Debug, Clone)]
pub struct Delivery {
    channel: ChannelId,
    ref_seq: u64,
    message: Arc<Message>,
    delivery_count: u32,
}

impl Delivery {
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }

    pub(crate) fn ref_seq(&self) -> u64 {
        self.ref_seq
    }
}

/// Per-channel envelope around a stored message body.
#[derive(Debug, Clone)]
pub(crate) struct MessageRef {
    pub(crate) handle: MessageHandle,
    pub(crate) message_id: MessageId,
    pub(crate) durable: bool,
    pub(crate) priority: u8,
    pub(crate) expiration: Option<u64>,
    pub(crate) seq: u64,
    pub(crate) delivery_count: u32,
}

#[derive(Default)]
pub(crate) struct ChannelState {
    // One FIFO ring per priority; delivery scans from 9 down to 0.
    pending: [VecDeque<MessageRef>; PRIORITY_LEVELS],
    // References currently out with a consumer, keyed by sequence.
    delivering: HashMap<u64, (ConsumerId, MessageRef)>,
    next_seq: u64,
    pending_count: usize,
}

impl ChannelState {
    /// Append a fresh reference for a newly visible message.
    pub(crate) fn push(&mut self, handle: MessageHandle, message: &Message) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.checked_add(1).expect("reference seq overflow");
        let reference = MessageRef {
            handle,
            message_id: message.id(),
            durable: message.durable(),
            priority: message.priority(),
            expiration: message.expiration(),
            seq,
            delivery_count: 0,
        };
        self.pending[reference.priority as usize].push_back(reference);
        self.pending_count += 1;
        seq
    }

    /// Put a previously issued reference back, keeping seq order within
    /// its priority ring.
    pub(crate) fn reinstate(&mut self, reference: MessageRef) {
        let ring = &mut self.pending[reference.priority as usize];
        let at = ring.partition_point(|r| r.seq < reference.seq);
        ring.insert(at, reference);
        self.pending_count += 1;
    }

    fn pop_next(&mut self) -> Option<MessageRef> {
        for ring in self.pending.iter_mut().rev() {
            if let Some(reference) = ring.pop_front() {
                self.pending_count -= 1;
                return Some(reference);
            }
        }
        None
    }

    /// Remove a Delivering reference on acknowledge.
    pub(crate) fn ack(&mut self, ref_seq: u64) -> Option<MessageRef> {
        self.delivering.remove(&ref_seq).map(|(_, r)| r)
    }

    pub(crate) fn delivering_ref(&self, ref_seq: u64) -> Option<&MessageRef> {
        self.delivering.get(&ref_seq).map(|(_, r)| r)
    }

    fn cancel(&mut self, ref_seq: u64) -> bool {
        match self.delivering.remove(&ref_seq) {
            Some((_, reference)) => {
                // delivery_count is retained so poison-message policies can
                // be layered on top of redelivery.
                self.reinstate(reference);
                true
            }
            None => false,
        }
    }

    fn recover(&mut self, consumer: ConsumerId) -> usize {
        let mut taken: Vec<MessageRef> = Vec::new();
        self.delivering.retain(|_, (owner, reference)| {
            if *owner == consumer {
                taken.push(reference.clone());
                false
            } else {
                true
            }
        });
        // Reinstate in seq order to preserve the original relative order.
        taken.sort_by_key(|r| r.seq);
        let count = taken.len();
        for reference in taken {
            self.reinstate(reference);
        }
        count
    }

    fn drain(&mut self) -> Vec<MessageRef> {
        let mut all: Vec<MessageRef> = Vec::with_capacity(self.pending_count);
        for ring in self.pending.iter_mut() {
            all.extend(ring.drain(..));
        }
        self.pending_count = 0;
        all.extend(self.delivering.drain().map(|(_, (_, r))| r));
        all
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending_count
    }

    pub(crate) fn in_flight_count(&self) -> usize {
        self.delivering.len()
    }
}

/// Ordered buffer of message references for one consumer binding.
///
/// Every state transition on one channel is serialized behind its mutex;
/// different channels proceed independently.
pub struct Channel {
    id: ChannelId,
    durable: bool,
    store: Arc<MessageStore>,
    state: Mutex<ChannelState>,
    notify: Notify,
    closed: AtomicBool,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, durable: bool, store: Arc<MessageStore>) -> Arc<Self> {
        Arc::new(Self {
            id,
            durable,
            store,
            state: Mutex::new(ChannelState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn durable(&self) -> bool {
        self.durable
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock()
    }

    /// Wake at most one blocked receiver.
    pub(crate) fn notify_one(&self) {
        self.notify.notify_one();
    }

    /// Make a stored message immediately visible on this channel.
    pub(crate) fn enqueue(&self, handle: MessageHandle, message: &Message) {
        if self.closed.load(Ordering::Acquire) {
            // A commit can race destination teardown; drop the reference
            // instead of stranding the refcount.
            tracing::warn!(channel = %self.id, "enqueue on closed channel");
            let _ = self.store.release(handle);
            return;
        }
        self.lock().push(handle, message);
        metrics::counter!("courier_enqueued_total").increment(1);
        self.notify_one();
    }

    /// Hand the oldest pending reference to `consumer`, skipping and
    /// freeing anything that expired while queued.
    pub(crate) fn deliver(&self, consumer: ConsumerId) -> Option<Delivery> {
        let now = super::now_millis();
        let mut state = self.lock();
        loop {
            let mut reference = state.pop_next()?;
            if reference.expiration.is_some_and(|at| now >= at) {
                metrics::counter!("courier_expired_total").increment(1);
                tracing::debug!(
                    channel = %self.id,
                    message = %reference.message_id,
                    "dropping expired reference"
                );
                let _ = self.store.release(reference.handle);
                continue;
            }
            let message = match self.store.load(reference.handle) {
                Ok(message) => message,
                Err(err) => {
                    // Only reachable via a refcount bug; keep delivering.
                    tracing::error!(channel = %self.id, %err, "reference without body");
                    continue;
                }
            };
            reference.delivery_count += 1;
            let delivery = Delivery {
                channel: self.id,
                ref_seq: reference.seq,
                message,
                delivery_count: reference.delivery_count,
            };
            state.delivering.insert(reference.seq, (consumer, reference));
            metrics::counter!("courier_delivered_total").increment(1);
            return Some(delivery);
        }
    }

    /// Condition-wait variant of `deliver`: blocks up to `timeout` for an
    /// enqueue notification instead of busy-polling.
    pub(crate) async fn receive(
        &self,
        consumer: ConsumerId,
        timeout: Duration,
    ) -> Option<Delivery> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.deliver(consumer) {
                return Some(delivery);
            }
            let notified = self.notify.notified();
            match tokio::time::timeout_at(deadline, notified).await {
                Ok(()) => continue,
                // One final poll covers an enqueue that raced the deadline.
                Err(_) => return self.deliver(consumer),
            }
        }
    }

    /// Snapshot of a Delivering reference, used before journaling an ack.
    pub(crate) fn delivering_ref(&self, ref_seq: u64) -> Option<MessageRef> {
        self.lock().delivering_ref(ref_seq).cloned()
    }

    /// Complete an acknowledge: drop the reference and its store count.
    pub(crate) fn finish_ack(&self, ref_seq: u64) -> Option<MessageRef> {
        let reference = self.lock().ack(ref_seq)?;
        let _ = self.store.release(reference.handle);
        metrics::counter!("courier_acked_total").increment(1);
        Some(reference)
    }

    /// Pull a Delivering reference out with its owner, without releasing
    /// the body. Durable acks journal between take and release so a
    /// journal failure can put the reference back untouched.
    pub(crate) fn take_delivering(&self, ref_seq: u64) -> Option<(ConsumerId, MessageRef)> {
        self.lock().delivering.remove(&ref_seq)
    }

    /// Undo `take_delivering` after a failed journal append.
    pub(crate) fn restore_delivering(&self, owner: ConsumerId, reference: MessageRef) {
        self.lock()
            .delivering
            .insert(reference.seq, (owner, reference));
    }

    /// Release the store reference of a taken-out acknowledged message.
    pub(crate) fn release_ref(&self, reference: MessageRef) {
        let _ = self.store.release(reference.handle);
        metrics::counter!("courier_acked_total").increment(1);
    }

    /// Return a Delivering reference to Pending for redelivery.
    pub(crate) fn cancel(&self, ref_seq: u64) -> bool {
        let cancelled = self.lock().cancel(ref_seq);
        if cancelled {
            self.notify_one();
        }
        cancelled
    }

    /// Put a detached reference back onto the channel (prepared-ack
    /// rollback paths).
    pub(crate) fn reinstate(&self, reference: MessageRef) {
        self.lock().reinstate(reference);
        self.notify_one();
    }

    /// Pull the pending reference for `message_id` off the channel without
    /// releasing it. Recovery holds prepared-ack references aside this way
    /// so they cannot be redelivered before the transaction resolves.
    pub(crate) fn detach_pending(&self, message_id: MessageId) -> Option<MessageRef> {
        let mut state = self.lock();
        for priority in 0..PRIORITY_LEVELS {
            if let Some(at) = state.pending[priority]
                .iter()
                .position(|r| r.message_id == message_id)
            {
                let reference = state.pending[priority]
                    .remove(at)
                    .expect("position is in bounds");
                state.pending_count -= 1;
                return Some(reference);
            }
        }
        None
    }

    /// Return all of a consumer's Delivering references to Pending,
    /// preserving their relative order.
    pub(crate) fn recover(&self, consumer: ConsumerId) -> usize {
        let recovered = self.lock().recover(consumer);
        for _ in 0..recovered {
            self.notify_one();
        }
        recovered
    }

    /// Tear down the channel, releasing every held store reference.
    pub(crate) fn drain(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let references = self.lock().drain();
        let count = references.len();
        for reference in references {
            let _ = self.store.release(reference.handle);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending_count()
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight_count()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("durable", &self.durable)
            .finish_non_exhaustive()
    }
}
