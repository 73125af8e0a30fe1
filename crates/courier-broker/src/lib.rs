// Transactional message-broker core: point-to-point queues, pub/sub
// topics with selector filtering, a reference-counted message store, and
// a journal-backed two-phase commit protocol that survives restart.
use ahash::RandomState;
use courier_common::BrokerConfig;
use courier_common::ids::{ChannelId, ConnectionId, ConsumerId, MessageId, TopicId, TxnId};
use courier_message::{MessageBuilder, Selector};
use courier_storage::{FsyncMode, Journal, JournalOp, MessageStore, StorageError};
use hashbrown::HashMap;
use parking_lot::MutexGuard;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

mod channel;
mod recovery;
mod subscription;
mod topic;
mod transaction;

pub use channel::{Channel, Delivery};
pub use recovery::{
    DestinationCatalog, MemoryCatalog, QueueRecord, SubscriptionRecord, TopicRecord,
};
pub use subscription::Subscription;
pub use topic::Topic;
pub use transaction::TxnState;

use channel::ChannelState;
use recovery::PreparedOp;
use transaction::{Transaction, TransactionRepository, TxOp};

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("destination not found: {0}")]
    NotFound(String),
    #[error("destination already exists: {0}")]
    AlreadyExists(String),
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    #[error("unknown delivery {ref_seq} on channel {channel}")]
    UnknownDelivery { channel: ChannelId, ref_seq: u64 },
    #[error("unknown transaction {0}")]
    UnknownTransaction(TxnId),
    #[error("transaction {txn} is {state:?}, expected {expected}")]
    TransactionState {
        txn: TxnId,
        state: TxnState,
        expected: &'static str,
    },
    #[error("message store exhausted")]
    StoreExhausted,
    #[error("message of {size} bytes exceeds limit {max}")]
    MessageTooLarge { size: usize, max: usize },
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    #[error("unauthorized {action} on {subject}")]
    Unauthorized {
        action: &'static str,
        subject: String,
    },
    #[error("recovery failed: {0}")]
    RecoveryCorruption(StorageError),
    #[error("storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for BrokerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Exhausted => BrokerError::StoreExhausted,
            StorageError::Corruption { .. } => BrokerError::RecoveryCorruption(err),
            other => BrokerError::Storage(other),
        }
    }
}

/// Pluggable authorization check invoked before enqueue and dequeue.
pub trait Authorizer: Send + Sync {
    fn allow_send(&self, destination: &str, origin: ConnectionId) -> bool;
    fn allow_receive(&self, channel: ChannelId, consumer: ConsumerId) -> bool;
}

/// Default policy: everything is permitted.
#[derive(Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn allow_send(&self, _destination: &str, _origin: ConnectionId) -> bool {
        true
    }

    fn allow_receive(&self, _channel: ChannelId, _consumer: ConsumerId) -> bool {
        true
    }
}

/// Options for binding a new subscription to a topic.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub selector: Option<String>,
    pub no_local: bool,
    pub durable: bool,
    pub connection: ConnectionId,
}

/// How an external transaction manager resolves a prepared transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Commit,
    Rollback,
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// The broker core.
///
/// ```
/// use bytes::Bytes;
/// use courier_broker::{Broker, MemoryCatalog};
/// use courier_common::BrokerConfig;
/// use courier_common::ids::ConsumerId;
/// use courier_message::MessageBuilder;
/// use std::time::Duration;
///
/// let dir = tempfile::tempdir().expect("dir");
/// let broker = Broker::open(BrokerConfig::new(dir.path()), &MemoryCatalog::new())
///     .expect("open");
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let queue = broker.create_queue("orders", true).await.expect("queue");
///     broker
///         .send("orders", MessageBuilder::new(Bytes::from_static(b"hello")), None)
///         .await
///         .expect("send");
///     let delivery = broker
///         .receive(queue, ConsumerId::from_raw(1), Duration::from_millis(100))
///         .await
///         .expect("receive")
///         .expect("delivery");
///     assert_eq!(delivery.message().body().as_ref(), b"hello");
///     broker.acknowledge(&delivery, None).await.expect("ack");
/// });
/// ```
pub struct Broker {
    config: BrokerConfig,
    store: Arc<MessageStore>,
    journal: Journal,
    // Destination registries; names resolve to channels or topics.
    queues: RwLock<HashMap<String, Arc<Channel>, RandomState>>,
    topics: RwLock<HashMap<String, Arc<Topic>, RandomState>>,
    // Every live channel (queues and subscriptions) by id.
    channels: RwLock<HashMap<ChannelId, Arc<Channel>, RandomState>>,
    transactions: TransactionRepository,
    authorizer: Box<dyn Authorizer>,
    next_message_id: AtomicU64,
    next_channel_id: AtomicU64,
    next_topic_id: AtomicU64,
}

impl Broker {
    /// Open the journal, replay it, and rebuild destinations from the
    /// catalog. Corruption before the journal's clean tail aborts startup.
    pub fn open(config: BrokerConfig, catalog: &dyn DestinationCatalog) -> Result<Self> {
        let store = Arc::new(MessageStore::new(config.limits.max_store_messages));
        let (journal, recovered) = Journal::open(&config.data_dir, FsyncMode::default())?;
        let mut outcome = recovery::rebuild(recovered.ops, &store)?;

        let mut queues = HashMap::with_hasher(RandomState::new());
        let mut topics = HashMap::with_hasher(RandomState::new());
        let mut channels: HashMap<ChannelId, Arc<Channel>, RandomState> =
            HashMap::with_hasher(RandomState::new());
        let mut max_channel_id = outcome.max_channel_id;
        let mut max_topic_id = 0u64;

        for record in catalog.queues() {
            let channel = Channel::new(record.channel, record.durable, Arc::clone(&store));
            if let Some(contents) = outcome.channels.remove(&record.channel) {
                for (handle, message) in contents {
                    channel.enqueue(handle, &message);
                }
            }
            max_channel_id = max_channel_id.max(record.channel.as_u64());
            queues.insert(record.name, Arc::clone(&channel));
            channels.insert(record.channel, channel);
        }

        for record in catalog.topics() {
            max_topic_id = max_topic_id.max(record.id.as_u64());
            topics.insert(record.name.clone(), Topic::new(record.id, record.name));
        }

        for record in catalog.subscriptions() {
            let Some(topic) = topics.get(record.topic.as_str()) else {
                tracing::warn!(topic = %record.topic, "durable subscription for unknown topic");
                if let Some(contents) = outcome.channels.remove(&record.channel) {
                    for (handle, _) in contents {
                        let _ = store.release(handle);
                    }
                }
                continue;
            };
            let selector = record
                .selector
                .as_deref()
                .map(Selector::parse)
                .transpose()
                .map_err(|err| BrokerError::InvalidSelector(err.to_string()))?;
            let channel = Channel::new(record.channel, record.durable, Arc::clone(&store));
            if let Some(contents) = outcome.channels.remove(&record.channel) {
                for (handle, message) in contents {
                    channel.enqueue(handle, &message);
                }
            }
            max_channel_id = max_channel_id.max(record.channel.as_u64());
            let subscription = Subscription::new(
                Arc::clone(&channel),
                topic.id(),
                selector,
                record.no_local,
                record.connection,
                record.durable,
            );
            topic.add(subscription);
            channels.insert(record.channel, channel);
        }

        // Journal contents for channels the catalog no longer lists would
        // otherwise leak their refcounts.
        for (channel_id, contents) in outcome.channels.drain() {
            tracing::warn!(
                %channel_id,
                count = contents.len(),
                "releasing references for a channel missing from the catalog"
            );
            for (handle, _) in contents {
                let _ = store.release(handle);
            }
        }

        // Prepared transactions stay pending until the transaction manager
        // resolves them; their acknowledged references are held aside so
        // they cannot be redelivered in the meantime.
        let transactions = TransactionRepository::new(outcome.max_txn_id + 1);
        for (txn, prepared_ops) in outcome.prepared.drain(..) {
            let mut ops = Vec::with_capacity(prepared_ops.len());
            for op in prepared_ops {
                match op {
                    PreparedOp::Add {
                        channel,
                        handle,
                        message,
                    } => ops.push(TxOp::Enqueue {
                        channel,
                        handle,
                        message,
                    }),
                    PreparedOp::Remove {
                        channel,
                        message_id,
                    } => match channels
                        .get(&channel)
                        .and_then(|ch| ch.detach_pending(message_id))
                    {
                        Some(reference) => ops.push(TxOp::RecoveredAck { channel, reference }),
                        None => tracing::warn!(
                            %txn,
                            %channel,
                            %message_id,
                            "prepared ack without a matching reference"
                        ),
                    },
                }
            }
            transactions.insert_recovered(Transaction {
                id: txn,
                state: TxnState::Prepared,
                ops,
            });
        }

        tracing::info!(
            queues = queues.len(),
            topics = topics.len(),
            prepared = transactions.prepared_ids().len(),
            bodies = store.len(),
            "broker recovery complete"
        );

        Ok(Self {
            next_message_id: AtomicU64::new(outcome.max_message_id + 1),
            next_channel_id: AtomicU64::new(max_channel_id + 1),
            next_topic_id: AtomicU64::new(max_topic_id + 1),
            config,
            store,
            journal,
            queues: RwLock::new(queues),
            topics: RwLock::new(topics),
            channels: RwLock::new(channels),
            transactions,
            authorizer: Box::new(AllowAll),
        })
    }

    pub fn with_authorizer(mut self, authorizer: Box<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    // ---- destination lifecycle --------------------------------------

    pub async fn create_queue(&self, name: &str, durable: bool) -> Result<ChannelId> {
        let mut queues = self.queues.write().await;
        if queues.contains_key(name) {
            return Err(BrokerError::AlreadyExists(name.to_string()));
        }
        let id = ChannelId::from_raw(self.next_channel_id.fetch_add(1, Ordering::Relaxed));
        let channel = Channel::new(id, durable, Arc::clone(&self.store));
        queues.insert(name.to_string(), Arc::clone(&channel));
        self.channels.write().await.insert(id, channel);
        Ok(id)
    }

    pub async fn create_topic(&self, name: &str) -> Result<TopicId> {
        let mut topics = self.topics.write().await;
        if topics.contains_key(name) {
            return Err(BrokerError::AlreadyExists(name.to_string()));
        }
        let id = TopicId::from_raw(self.next_topic_id.fetch_add(1, Ordering::Relaxed));
        topics.insert(name.to_string(), Topic::new(id, name));
        Ok(id)
    }

    /// Tear down a queue, releasing every reference it still holds.
    /// Returns false when the queue is already gone (idempotent teardown).
    pub async fn destroy_queue(&self, name: &str) -> Result<bool> {
        let Some(channel) = self.queues.write().await.remove(name) else {
            return Ok(false);
        };
        self.channels.write().await.remove(&channel.id());
        let released = channel.drain();
        tracing::debug!(queue = name, released, "queue destroyed");
        Ok(true)
    }

    pub async fn destroy_topic(&self, name: &str) -> Result<bool> {
        let Some(topic) = self.topics.write().await.remove(name) else {
            return Ok(false);
        };
        let mut channels = self.channels.write().await;
        for subscription in topic.subscriptions().iter() {
            let channel = subscription.channel();
            channels.remove(&channel.id());
            channel.drain();
        }
        tracing::debug!(topic = name, "topic destroyed");
        Ok(true)
    }

    // ---- pub/sub bindings -------------------------------------------

    pub async fn subscribe(&self, topic: &str, options: SubscribeOptions) -> Result<ChannelId> {
        let topic = self
            .topics
            .read()
            .await
            .get(topic)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(topic.to_string()))?;
        let selector = options
            .selector
            .as_deref()
            .map(Selector::parse)
            .transpose()
            .map_err(|err| BrokerError::InvalidSelector(err.to_string()))?;
        let id = ChannelId::from_raw(self.next_channel_id.fetch_add(1, Ordering::Relaxed));
        let channel = Channel::new(id, options.durable, Arc::clone(&self.store));
        let subscription = Subscription::new(
            Arc::clone(&channel),
            topic.id(),
            selector,
            options.no_local,
            options.connection,
            options.durable,
        );
        self.channels.write().await.insert(id, channel);
        topic.add(subscription);
        Ok(id)
    }

    /// Detach a subscription and release every reference it still holds.
    /// Returns false when it is already gone (idempotent teardown).
    pub async fn unsubscribe(&self, topic: &str, channel: ChannelId) -> Result<bool> {
        let Some(topic) = self.topics.read().await.get(topic).cloned() else {
            return Ok(false);
        };
        let Some(subscription) = topic.remove(channel) else {
            return Ok(false);
        };
        self.channels.write().await.remove(&channel);
        let released = subscription.channel().drain();
        tracing::debug!(%channel, released, "subscription removed");
        Ok(true)
    }

    // ---- session operations -----------------------------------------

    /// Send to a queue or publish to a topic. With `txn`, the operation is
    /// buffered and invisible until the transaction commits.
    pub async fn send(
        &self,
        destination: &str,
        draft: MessageBuilder,
        txn: Option<TxnId>,
    ) -> Result<MessageId> {
        if draft.body_len() > self.config.limits.max_message_bytes {
            return Err(BrokerError::MessageTooLarge {
                size: draft.body_len(),
                max: self.config.limits.max_message_bytes,
            });
        }
        let message = draft.finish(
            MessageId::from_raw(self.next_message_id.fetch_add(1, Ordering::Relaxed)),
            now_millis(),
        );
        if !self.authorizer.allow_send(destination, message.origin()) {
            return Err(BrokerError::Unauthorized {
                action: "send",
                subject: destination.to_string(),
            });
        }
        if let Some(channel) = self.queues.read().await.get(destination).cloned() {
            return self.send_to_queue(channel, message, txn).await;
        }
        if let Some(topic) = self.topics.read().await.get(destination).cloned() {
            return self.publish_to_topic(topic, message, txn).await;
        }
        Err(BrokerError::NotFound(destination.to_string()))
    }

    async fn send_to_queue(
        &self,
        channel: Arc<Channel>,
        message: courier_message::Message,
        txn: Option<TxnId>,
    ) -> Result<MessageId> {
        let id = message.id();
        let durable = channel.durable() && message.durable();
        let handle = self.store.put(message)?;
        let message = self.store.load(handle)?;
        match txn {
            Some(txn) => {
                let op = TxOp::Enqueue {
                    channel: channel.id(),
                    handle,
                    message,
                };
                if let Err(err) = self.transactions.record(txn, op) {
                    let _ = self.store.release(handle);
                    return Err(err);
                }
            }
            None => {
                if durable {
                    let auto = self.transactions.allocate_id();
                    let records = [
                        JournalOp::AddMessage {
                            txn: auto,
                            channel: channel.id(),
                            message: (*message).clone(),
                        },
                        JournalOp::Commit { txn: auto },
                    ];
                    if let Err(err) = self.journal.append(&records, self.config.sync_on_commit) {
                        let _ = self.store.release(handle);
                        return Err(err.into());
                    }
                }
                channel.enqueue(handle, &message);
            }
        }
        Ok(id)
    }

    async fn publish_to_topic(
        &self,
        topic: Arc<Topic>,
        message: courier_message::Message,
        txn: Option<TxnId>,
    ) -> Result<MessageId> {
        let id = message.id();
        let matched = topic.matching(&message);
        metrics::counter!("courier_fanout_matched_total").increment(matched.len() as u64);
        if matched.is_empty() {
            // No interested subscription: the message is simply dropped.
            return Ok(id);
        }
        // One stored body, one reference per matching subscription.
        let handle = self.store.put(message)?;
        let message = self.store.load(handle)?;
        for _ in 1..matched.len() {
            self.store.reference(handle)?;
        }

        match txn {
            Some(txn) => {
                let ops = matched
                    .iter()
                    .map(|sub| TxOp::Enqueue {
                        channel: sub.channel().id(),
                        handle,
                        message: Arc::clone(&message),
                    })
                    .collect();
                if let Err(err) = self.transactions.record_all(txn, ops) {
                    for _ in 0..matched.len() {
                        let _ = self.store.release(handle);
                    }
                    return Err(err);
                }
            }
            None => {
                if message.durable() {
                    let auto = self.transactions.allocate_id();
                    let mut records: Vec<JournalOp> = matched
                        .iter()
                        .filter(|sub| sub.channel().durable())
                        .map(|sub| JournalOp::AddMessage {
                            txn: auto,
                            channel: sub.channel().id(),
                            message: (*message).clone(),
                        })
                        .collect();
                    if !records.is_empty() {
                        records.push(JournalOp::Commit { txn: auto });
                        if let Err(err) =
                            self.journal.append(&records, self.config.sync_on_commit)
                        {
                            for _ in 0..matched.len() {
                                let _ = self.store.release(handle);
                            }
                            return Err(err.into());
                        }
                    }
                }
                for sub in &matched {
                    sub.channel().enqueue(handle, &message);
                }
            }
        }
        Ok(id)
    }

    /// Non-blocking poll for the oldest pending message.
    pub async fn poll(&self, channel: ChannelId, consumer: ConsumerId) -> Result<Option<Delivery>> {
        let channel_arc = self.channel_arc(channel).await?;
        self.check_receive(channel, consumer)?;
        Ok(channel_arc.deliver(consumer))
    }

    /// Wait up to `timeout` for a message; an enqueue wakes at most one
    /// blocked receiver per message.
    pub async fn receive(
        &self,
        channel: ChannelId,
        consumer: ConsumerId,
        timeout: Duration,
    ) -> Result<Option<Delivery>> {
        let channel_arc = self.channel_arc(channel).await?;
        self.check_receive(channel, consumer)?;
        Ok(channel_arc.receive(consumer, timeout).await)
    }

    /// `receive` with the configured default timeout.
    pub async fn receive_default(
        &self,
        channel: ChannelId,
        consumer: ConsumerId,
    ) -> Result<Option<Delivery>> {
        let timeout = Duration::from_millis(self.config.default_receive_timeout_ms);
        self.receive(channel, consumer, timeout).await
    }

    /// Acknowledge a delivery. With `txn`, the reference stays Delivering
    /// until the transaction commits; rollback returns it for redelivery.
    pub async fn acknowledge(&self, delivery: &Delivery, txn: Option<TxnId>) -> Result<()> {
        let channel = self.channel_arc(delivery.channel()).await?;
        let reference = channel.delivering_ref(delivery.ref_seq()).ok_or(
            BrokerError::UnknownDelivery {
                channel: delivery.channel(),
                ref_seq: delivery.ref_seq(),
            },
        )?;
        match txn {
            Some(txn) => self.transactions.record(
                txn,
                TxOp::Acknowledge {
                    channel: channel.id(),
                    ref_seq: delivery.ref_seq(),
                    message_id: reference.message_id,
                    durable: reference.durable,
                },
            ),
            None if reference.durable && channel.durable() => {
                // Take the reference out before journaling so a failed
                // append can put it back exactly as it was.
                let Some((owner, taken)) = channel.take_delivering(delivery.ref_seq()) else {
                    return Err(BrokerError::UnknownDelivery {
                        channel: delivery.channel(),
                        ref_seq: delivery.ref_seq(),
                    });
                };
                let auto = self.transactions.allocate_id();
                let records = [
                    JournalOp::RemoveMessage {
                        txn: auto,
                        channel: channel.id(),
                        message_id: taken.message_id,
                    },
                    JournalOp::Commit { txn: auto },
                ];
                if let Err(err) = self.journal.append(&records, self.config.sync_on_commit) {
                    channel.restore_delivering(owner, taken);
                    return Err(err.into());
                }
                channel.release_ref(taken);
                Ok(())
            }
            None => channel
                .finish_ack(delivery.ref_seq())
                .map(|_| ())
                .ok_or(BrokerError::UnknownDelivery {
                    channel: delivery.channel(),
                    ref_seq: delivery.ref_seq(),
                }),
        }
    }

    /// Return a delivery to Pending for redelivery (consumer failure or
    /// close without ack). The delivery count is retained.
    pub async fn cancel(&self, delivery: &Delivery) -> Result<()> {
        let channel = self.channel_arc(delivery.channel()).await?;
        if channel.cancel(delivery.ref_seq()) {
            Ok(())
        } else {
            Err(BrokerError::UnknownDelivery {
                channel: delivery.channel(),
                ref_seq: delivery.ref_seq(),
            })
        }
    }

    /// Return all of a consumer's Delivering references to Pending; called
    /// before the consumer detaches so nothing is stranded mid-delivery.
    pub async fn recover_consumer(
        &self,
        channel: ChannelId,
        consumer: ConsumerId,
    ) -> Result<usize> {
        let channel = self.channel_arc(channel).await?;
        Ok(channel.recover(consumer))
    }

    // ---- transactions -----------------------------------------------

    pub fn begin_transaction(&self) -> TxnId {
        self.transactions.begin()
    }

    /// Durably stage the transaction's operations (first phase). After a
    /// crash, a prepared transaction is reconstructed and waits for
    /// `resolve_prepared`.
    pub async fn prepare(&self, txn: TxnId) -> Result<()> {
        let involved = self.transactions.involved_channels(txn)?;
        let channels = self.channel_arcs(&involved).await;
        self.transactions.prepare_with(txn, |ops| {
            let mut records = durable_records(txn, ops, &channels);
            records.push(JournalOp::Prepare { txn });
            self.journal.append(&records, true).map_err(Into::into)
        })
    }

    /// Apply the transaction's operations in one indivisible step.
    pub async fn commit(&self, txn: TxnId) -> Result<()> {
        let involved = self.transactions.involved_channels(txn)?;
        let channels = self.channel_arcs(&involved).await;
        let ops = self.transactions.commit_with(txn, |state, ops| {
            let mut records = match state {
                // Active transactions journal their ops alongside the
                // commit; prepared ones already journaled them.
                TxnState::Active => durable_records(txn, ops, &channels),
                _ => Vec::new(),
            };
            if records.is_empty() && state != TxnState::Prepared {
                // Nothing durable to make permanent.
                return Ok(());
            }
            records.push(JournalOp::Commit { txn });
            self.journal
                .append(&records, self.config.sync_on_commit)
                .map_err(Into::into)
        })?;
        self.apply_committed(&ops, &channels);
        Ok(())
    }

    /// Discard the transaction's operations: staged enqueues release their
    /// bodies, staged acknowledges go back to Pending for redelivery.
    pub async fn rollback(&self, txn: TxnId) -> Result<()> {
        let involved = self.transactions.involved_channels(txn)?;
        let channels = self.channel_arcs(&involved).await;
        let ops = self.transactions.rollback_with(txn, |state, _ops| {
            if state == TxnState::Prepared {
                self.journal
                    .append(&[JournalOp::Rollback { txn }], true)
                    .map_err(Into::into)
            } else {
                Ok(())
            }
        })?;
        for op in ops {
            match op {
                TxOp::Enqueue { handle, .. } => {
                    let _ = self.store.release(handle);
                }
                TxOp::Acknowledge {
                    channel, ref_seq, ..
                } => {
                    if let Some(channel) = channels.get(&channel) {
                        channel.cancel(ref_seq);
                    }
                }
                TxOp::RecoveredAck { channel, reference } => match channels.get(&channel) {
                    Some(channel) => channel.reinstate(reference),
                    None => {
                        let _ = self.store.release(reference.handle);
                    }
                },
            }
        }
        Ok(())
    }

    /// Prepared transactions awaiting external resolution, oldest first.
    pub fn list_prepared_transactions(&self) -> Vec<TxnId> {
        self.transactions.prepared_ids()
    }

    /// Resolve a prepared transaction on behalf of a transaction manager.
    /// Resolving an already-resolved (unknown) transaction succeeds.
    pub async fn resolve_prepared(&self, txn: TxnId, outcome: TxnOutcome) -> Result<()> {
        match self.transactions.state(txn) {
            None => Ok(()),
            Some(TxnState::Prepared) => match outcome {
                TxnOutcome::Commit => self.commit(txn).await,
                TxnOutcome::Rollback => self.rollback(txn).await,
            },
            Some(state) => Err(BrokerError::TransactionState {
                txn,
                state,
                expected: "a prepared transaction",
            }),
        }
    }

    // ---- introspection ----------------------------------------------

    pub async fn pending_count(&self, channel: ChannelId) -> Result<usize> {
        Ok(self.channel_arc(channel).await?.pending_count())
    }

    pub async fn in_flight_count(&self, channel: ChannelId) -> Result<usize> {
        Ok(self.channel_arc(channel).await?.in_flight_count())
    }

    pub fn store_len(&self) -> usize {
        self.store.len()
    }

    // ---- internals --------------------------------------------------

    fn check_receive(&self, channel: ChannelId, consumer: ConsumerId) -> Result<()> {
        if self.authorizer.allow_receive(channel, consumer) {
            Ok(())
        } else {
            Err(BrokerError::Unauthorized {
                action: "receive",
                subject: channel.to_string(),
            })
        }
    }

    async fn channel_arc(&self, id: ChannelId) -> Result<Arc<Channel>> {
        self.channels
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(BrokerError::UnknownChannel(id))
    }

    async fn channel_arcs(
        &self,
        ids: &[ChannelId],
    ) -> HashMap<ChannelId, Arc<Channel>, RandomState> {
        let guard = self.channels.read().await;
        let mut map = HashMap::with_hasher(RandomState::new());
        for id in ids {
            if let Some(channel) = guard.get(id) {
                map.insert(*id, Arc::clone(channel));
            }
        }
        map
    }

    /// Apply a committed transaction's operations while holding every
    /// involved channel's lock, in ascending channel-id order, so the
    /// whole batch becomes visible at once.
    fn apply_committed(
        &self,
        ops: &[TxOp],
        channels: &HashMap<ChannelId, Arc<Channel>, RandomState>,
    ) {
        let mut grouped: BTreeMap<ChannelId, Vec<&TxOp>> = BTreeMap::new();
        for op in ops {
            grouped.entry(op.channel()).or_default().push(op);
        }

        let mut releases = Vec::new();
        let mut notifies: Vec<(Arc<Channel>, usize)> = Vec::new();
        {
            let mut locked: Vec<(&Arc<Channel>, &Vec<&TxOp>, MutexGuard<'_, ChannelState>)> =
                Vec::with_capacity(grouped.len());
            for (channel_id, channel_ops) in &grouped {
                match channels.get(channel_id) {
                    Some(channel) => locked.push((channel, channel_ops, channel.lock())),
                    None => {
                        // Destination torn down mid-transaction: drop the
                        // staged references instead of stranding them.
                        tracing::warn!(%channel_id, "commit against a destroyed channel");
                        for op in channel_ops {
                            match op {
                                TxOp::Enqueue { handle, .. } => releases.push(*handle),
                                TxOp::RecoveredAck { reference, .. } => {
                                    releases.push(reference.handle)
                                }
                                TxOp::Acknowledge { .. } => {}
                            }
                        }
                    }
                }
            }
            for (channel, channel_ops, state) in locked.iter_mut() {
                let mut enqueued = 0usize;
                for op in channel_ops.iter() {
                    match op {
                        TxOp::Enqueue {
                            handle, message, ..
                        } => {
                            state.push(*handle, message);
                            enqueued += 1;
                        }
                        TxOp::Acknowledge { ref_seq, .. } => match state.ack(*ref_seq) {
                            Some(reference) => releases.push(reference.handle),
                            None => tracing::warn!(
                                channel = %channel.id(),
                                ref_seq,
                                "committed ack without a delivering reference"
                            ),
                        },
                        TxOp::RecoveredAck { reference, .. } => releases.push(reference.handle),
                    }
                }
                if enqueued > 0 {
                    notifies.push((Arc::clone(*channel), enqueued));
                }
            }
        }
        for handle in releases {
            let _ = self.store.release(handle);
        }
        for (channel, enqueued) in notifies {
            for _ in 0..enqueued {
                channel.notify_one();
            }
        }
    }
}

/// Journal records for the durable subset of a transaction's operations.
fn durable_records(
    txn: TxnId,
    ops: &[TxOp],
    channels: &HashMap<ChannelId, Arc<Channel>, RandomState>,
) -> Vec<JournalOp> {
    let mut records = Vec::new();
    for op in ops {
        let channel_durable = channels
            .get(&op.channel())
            .map(|channel| channel.durable())
            .unwrap_or(false);
        if !channel_durable {
            continue;
        }
        match op {
            TxOp::Enqueue {
                channel, message, ..
            } if message.durable() => {
                records.push(JournalOp::AddMessage {
                    txn,
                    channel: *channel,
                    message: (**message).clone(),
                });
            }
            TxOp::Acknowledge {
                channel,
                message_id,
                durable: true,
                ..
            } => {
                records.push(JournalOp::RemoveMessage {
                    txn,
                    channel: *channel,
                    message_id: *message_id,
                });
            }
            _ => {}
        }
    }
    records
}
