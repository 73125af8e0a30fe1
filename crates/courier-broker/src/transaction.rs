// Transaction bookkeeping for the two-phase commit protocol. Operations
// accumulate here while a transaction is Active; nothing touches a channel
// until commit applies the whole batch at once. Prepared transactions stay
// in the repository — across restarts via the journal — until an explicit
// commit or rollback resolves them.
use courier_common::ids::{ChannelId, MessageId, TxnId};
use courier_message::Message;
use courier_storage::MessageHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::channel::MessageRef;
use crate::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Prepared,
    Committed,
    RolledBack,
}

/// One buffered operation awaiting commit.
#[derive(Debug, Clone)]
pub(crate) enum TxOp {
    Enqueue {
        channel: ChannelId,
        handle: MessageHandle,
        message: Arc<Message>,
    },
    Acknowledge {
        channel: ChannelId,
        ref_seq: u64,
        message_id: MessageId,
        durable: bool,
    },
    // An acknowledged-under-prepare reference reconstructed at recovery;
    // it is held off the channel until the transaction resolves.
    RecoveredAck {
        channel: ChannelId,
        reference: MessageRef,
    },
}

impl TxOp {
    pub(crate) fn channel(&self) -> ChannelId {
        match self {
            TxOp::Enqueue { channel, .. }
            | TxOp::Acknowledge { channel, .. }
            | TxOp::RecoveredAck { channel, .. } => *channel,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Transaction {
    pub id: TxnId,
    pub state: TxnState,
    pub ops: Vec<TxOp>,
}

fn state_error(txn: &Transaction, expected: &'static str) -> BrokerError {
    BrokerError::TransactionState {
        txn: txn.id,
        state: txn.state,
        expected,
    }
}

/// Tracks live and prepared transactions and drives their state machine.
/// Journal writes happen inside the repository lock so the journal's
/// record order matches the order effects become visible.
pub(crate) struct TransactionRepository {
    inner: Mutex<HashMap<TxnId, Transaction>>,
    next_txn: AtomicU64,
}

impl TransactionRepository {
    pub(crate) fn new(next_txn: u64) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            next_txn: AtomicU64::new(next_txn.max(1)),
        }
    }

    pub(crate) fn begin(&self) -> TxnId {
        let id = TxnId::from_raw(self.next_txn.fetch_add(1, Ordering::Relaxed));
        self.inner.lock().insert(
            id,
            Transaction {
                id,
                state: TxnState::Active,
                ops: Vec::new(),
            },
        );
        metrics::counter!("courier_txn_begun_total").increment(1);
        id
    }

    /// Fresh id for journaling an auto-commit operation; no entry is kept.
    pub(crate) fn allocate_id(&self) -> TxnId {
        TxnId::from_raw(self.next_txn.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn record(&self, txn: TxnId, op: TxOp) -> Result<()> {
        self.record_all(txn, vec![op])
    }

    /// Buffer a batch of operations atomically: either the transaction is
    /// Active and takes all of them, or none are recorded.
    pub(crate) fn record_all(&self, txn: TxnId, ops: Vec<TxOp>) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .get_mut(&txn)
            .ok_or(BrokerError::UnknownTransaction(txn))?;
        if entry.state != TxnState::Active {
            return Err(state_error(entry, "an active transaction"));
        }
        entry.ops.extend(ops);
        Ok(())
    }

    pub(crate) fn state(&self, txn: TxnId) -> Option<TxnState> {
        self.inner.lock().get(&txn).map(|entry| entry.state)
    }

    /// Channels a commit/rollback would touch, for prefetching handles.
    pub(crate) fn involved_channels(&self, txn: TxnId) -> Result<Vec<ChannelId>> {
        let inner = self.inner.lock();
        let entry = inner
            .get(&txn)
            .ok_or(BrokerError::UnknownTransaction(txn))?;
        let mut channels: Vec<ChannelId> = entry.ops.iter().map(TxOp::channel).collect();
        channels.sort_unstable();
        channels.dedup();
        Ok(channels)
    }

    /// Move Active -> Prepared, running `journal` (the durable append)
    /// while the transaction is locked. Failure leaves the transaction
    /// Active and untouched.
    pub(crate) fn prepare_with(
        &self,
        txn: TxnId,
        journal: impl FnOnce(&[TxOp]) -> Result<()>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .get_mut(&txn)
            .ok_or(BrokerError::UnknownTransaction(txn))?;
        if entry.state != TxnState::Active {
            return Err(state_error(entry, "an active transaction"));
        }
        journal(&entry.ops)?;
        entry.state = TxnState::Prepared;
        metrics::counter!("courier_txn_prepared_total").increment(1);
        Ok(())
    }

    /// Resolve to Committed: validate, run `journal`, then hand the ops to
    /// the caller for application and drop the transaction.
    pub(crate) fn commit_with(
        &self,
        txn: TxnId,
        journal: impl FnOnce(TxnState, &[TxOp]) -> Result<()>,
    ) -> Result<Vec<TxOp>> {
        let mut inner = self.inner.lock();
        let entry = inner
            .get_mut(&txn)
            .ok_or(BrokerError::UnknownTransaction(txn))?;
        if !matches!(entry.state, TxnState::Active | TxnState::Prepared) {
            return Err(state_error(entry, "an active or prepared transaction"));
        }
        journal(entry.state, &entry.ops)?;
        entry.state = TxnState::Committed;
        let ops = std::mem::take(&mut entry.ops);
        inner.remove(&txn);
        metrics::counter!("courier_txn_committed_total").increment(1);
        Ok(ops)
    }

    /// Resolve to RolledBack: the ops are handed back so the caller can
    /// release staged references; they are never applied.
    pub(crate) fn rollback_with(
        &self,
        txn: TxnId,
        journal: impl FnOnce(TxnState, &[TxOp]) -> Result<()>,
    ) -> Result<Vec<TxOp>> {
        let mut inner = self.inner.lock();
        let entry = inner
            .get_mut(&txn)
            .ok_or(BrokerError::UnknownTransaction(txn))?;
        if !matches!(entry.state, TxnState::Active | TxnState::Prepared) {
            return Err(state_error(entry, "an active or prepared transaction"));
        }
        journal(entry.state, &entry.ops)?;
        entry.state = TxnState::RolledBack;
        let ops = std::mem::take(&mut entry.ops);
        inner.remove(&txn);
        metrics::counter!("courier_txn_rolledback_total").increment(1);
        Ok(ops)
    }

    /// Reattach a transaction reconstructed from the journal.
    pub(crate) fn insert_recovered(&self, transaction: Transaction) {
        debug_assert_eq!(transaction.state, TxnState::Prepared);
        self.inner.lock().insert(transaction.id, transaction);
    }

    pub(crate) fn prepared_ids(&self) -> Vec<TxnId> {
        let inner = self.inner.lock();
        let mut ids: Vec<TxnId> = inner
            .values()
            .filter(|entry| entry.state == TxnState::Prepared)
            .map(|entry| entry.id)
            .collect();
        ids.sort_unstable();
        ids
    }
}
