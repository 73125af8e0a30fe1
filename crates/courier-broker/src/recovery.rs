// Startup recovery: turn the replayed journal record stream back into
// channel contents, store refcounts, and prepared transactions. Committed
// operations are applied in log order; a Prepare with no terminal record
// is reconstructed and held for external resolution, never auto-resolved;
// operation runs with no terminal record at all are discarded.
use courier_common::ids::{ChannelId, ConnectionId, MessageId, TopicId, TxnId};
use courier_message::Message;
use courier_storage::{JournalOp, MessageHandle, MessageStore};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::Result;

/// Durable queue metadata handed back by the catalog at startup.
#[derive(Debug, Clone)]
pub struct QueueRecord {
    pub name: String,
    pub channel: ChannelId,
    pub durable: bool,
}

#[derive(Debug, Clone)]
pub struct TopicRecord {
    pub name: String,
    pub id: TopicId,
}

/// Durable subscription metadata: which topic, which channel, and the
/// filter settings to rebuild it with.
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub topic: String,
    pub channel: ChannelId,
    pub selector: Option<String>,
    pub no_local: bool,
    pub connection: ConnectionId,
    pub durable: bool,
}

/// External collaborator that persists destination and durable
/// subscription metadata between runs. The broker only reads it at
/// startup; keeping it current is the embedder's job.
pub trait DestinationCatalog: Send + Sync {
    fn queues(&self) -> Vec<QueueRecord>;
    fn topics(&self) -> Vec<TopicRecord>;
    fn subscriptions(&self) -> Vec<SubscriptionRecord>;
}

/// In-memory catalog for tests and embedders without external storage.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    inner: Mutex<MemoryCatalogState>,
}

#[derive(Debug, Default)]
struct MemoryCatalogState {
    queues: Vec<QueueRecord>,
    topics: Vec<TopicRecord>,
    subscriptions: Vec<SubscriptionRecord>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_queue(&self, record: QueueRecord) {
        self.inner.lock().queues.push(record);
    }

    pub fn add_topic(&self, record: TopicRecord) {
        self.inner.lock().topics.push(record);
    }

    pub fn add_subscription(&self, record: SubscriptionRecord) {
        self.inner.lock().subscriptions.push(record);
    }
}

impl DestinationCatalog for MemoryCatalog {
    fn queues(&self) -> Vec<QueueRecord> {
        self.inner.lock().queues.clone()
    }

    fn topics(&self) -> Vec<TopicRecord> {
        self.inner.lock().topics.clone()
    }

    fn subscriptions(&self) -> Vec<SubscriptionRecord> {
        self.inner.lock().subscriptions.clone()
    }
}

/// Prepared-transaction operation reconstructed from the journal. Enqueues
/// carry their staged body; removes are matched against channel contents
/// once the channels exist.
#[derive(Debug)]
pub(crate) enum PreparedOp {
    Add {
        channel: ChannelId,
        handle: MessageHandle,
        message: Arc<Message>,
    },
    Remove {
        channel: ChannelId,
        message_id: MessageId,
    },
}

#[derive(Debug, Default)]
pub(crate) struct ReplayOutcome {
    // Per-channel visible contents, in journal (= original enqueue) order.
    pub channels: HashMap<ChannelId, Vec<(MessageHandle, Arc<Message>)>>,
    // Prepared transactions awaiting external resolution.
    pub prepared: Vec<(TxnId, Vec<PreparedOp>)>,
    pub max_message_id: u64,
    pub max_txn_id: u64,
    pub max_channel_id: u64,
}

// Outcome of each transaction id found in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnOutcome {
    Committed,
    Prepared,
    Discarded,
}

/// Rebuild store and channel state from the journal record stream.
pub(crate) fn rebuild(ops: Vec<JournalOp>, store: &MessageStore) -> Result<ReplayOutcome> {
    let mut outcome = ReplayOutcome::default();

    // First pass: resolve every transaction id to its final outcome.
    let mut outcomes: HashMap<TxnId, TxnOutcome> = HashMap::new();
    for op in &ops {
        let txn = op.txn();
        outcome.max_txn_id = outcome.max_txn_id.max(txn.as_u64());
        match op {
            JournalOp::AddMessage { .. } | JournalOp::RemoveMessage { .. } => {
                outcomes.entry(txn).or_insert(TxnOutcome::Discarded);
            }
            JournalOp::Prepare { .. } => {
                outcomes.insert(txn, TxnOutcome::Prepared);
            }
            JournalOp::Commit { .. } => {
                outcomes.insert(txn, TxnOutcome::Committed);
            }
            JournalOp::Rollback { .. } => {
                outcomes.insert(txn, TxnOutcome::Discarded);
            }
        }
    }

    // Second pass: apply committed operations in log order and stage
    // prepared ones. One body per message id, however many channels
    // reference it.
    let mut bodies: HashMap<MessageId, (MessageHandle, Arc<Message>)> = HashMap::new();
    let mut prepared_ops: HashMap<TxnId, Vec<PreparedOp>> = HashMap::new();
    let mut prepared_order: Vec<TxnId> = Vec::new();
    let mut discarded = 0usize;
    let mut seen_prepared: HashSet<TxnId> = HashSet::new();

    for op in ops {
        match op {
            JournalOp::AddMessage {
                txn,
                channel,
                message,
            } => {
                outcome.max_message_id = outcome.max_message_id.max(message.id().as_u64());
                outcome.max_channel_id = outcome.max_channel_id.max(channel.as_u64());
                match outcomes.get(&txn) {
                    Some(TxnOutcome::Committed) => {
                        let (handle, message) = intern_body(&mut bodies, message, store)?;
                        outcome.channels.entry(channel).or_default().push((handle, message));
                    }
                    Some(TxnOutcome::Prepared) => {
                        let (handle, message) = intern_body(&mut bodies, message, store)?;
                        prepared_ops.entry(txn).or_default().push(PreparedOp::Add {
                            channel,
                            handle,
                            message,
                        });
                        if seen_prepared.insert(txn) {
                            prepared_order.push(txn);
                        }
                    }
                    _ => discarded += 1,
                }
            }
            JournalOp::RemoveMessage {
                txn,
                channel,
                message_id,
            } => {
                outcome.max_channel_id = outcome.max_channel_id.max(channel.as_u64());
                match outcomes.get(&txn) {
                    Some(TxnOutcome::Committed) => {
                        remove_reference(&mut outcome, store, channel, message_id);
                    }
                    Some(TxnOutcome::Prepared) => {
                        prepared_ops
                            .entry(txn)
                            .or_default()
                            .push(PreparedOp::Remove {
                                channel,
                                message_id,
                            });
                        if seen_prepared.insert(txn) {
                            prepared_order.push(txn);
                        }
                    }
                    _ => discarded += 1,
                }
            }
            JournalOp::Prepare { txn } => {
                // A prepared transaction with no operations still needs an
                // entry so it shows up for external resolution.
                if outcomes.get(&txn) == Some(&TxnOutcome::Prepared)
                    && seen_prepared.insert(txn)
                {
                    prepared_order.push(txn);
                    prepared_ops.entry(txn).or_default();
                }
            }
            JournalOp::Commit { .. } | JournalOp::Rollback { .. } => {}
        }
    }

    if discarded > 0 {
        tracing::warn!(discarded, "discarding unterminated journal operations");
    }

    for txn in prepared_order {
        let ops = prepared_ops.remove(&txn).unwrap_or_default();
        outcome.prepared.push((txn, ops));
    }

    tracing::debug!(
        channels = outcome.channels.len(),
        prepared = outcome.prepared.len(),
        bodies = store.len(),
        "journal replay complete"
    );
    Ok(outcome)
}

fn intern_body(
    bodies: &mut HashMap<MessageId, (MessageHandle, Arc<Message>)>,
    message: Message,
    store: &MessageStore,
) -> Result<(MessageHandle, Arc<Message>)> {
    if let Some((handle, shared)) = bodies.get(&message.id()) {
        // Another channel's add record for the same body: share it.
        store.reference(*handle)?;
        return Ok((*handle, Arc::clone(shared)));
    }
    let id = message.id();
    let handle = store.put(message)?;
    let shared = store.load(handle)?;
    bodies.insert(id, (handle, Arc::clone(&shared)));
    Ok((handle, shared))
}

fn remove_reference(
    outcome: &mut ReplayOutcome,
    store: &MessageStore,
    channel: ChannelId,
    message_id: MessageId,
) {
    let Some(contents) = outcome.channels.get_mut(&channel) else {
        tracing::warn!(%channel, %message_id, "ack record for unknown channel");
        return;
    };
    match contents.iter().position(|(_, m)| m.id() == message_id) {
        Some(at) => {
            let (handle, _) = contents.remove(at);
            let _ = store.release(handle);
        }
        None => {
            tracing::warn!(%channel, %message_id, "ack record without a matching add");
        }
    }
}
