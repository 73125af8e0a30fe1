// Append-only transaction journal. One file per broker instance holds the
// full record stream; startup replays it in write order to rebuild channel
// contents, store refcounts, and prepared transactions.
//
// On-disk layout, all integers little-endian:
//
//   [8-byte file header: magic u32, version u16, reserved u16]
//   repeated records: [len: u32][crc32: u32][payload: len bytes]
//
// The CRC covers the payload only. A short or checksum-failing record at
// the very tail is a torn append: it is logged, truncated away, and replay
// succeeds. Anything unreadable before the tail aborts recovery.
//
// TODO: compact terminally-resolved transactions out of the journal once
// the file crosses a size threshold.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use courier_common::ids::{ChannelId, MessageId, TxnId};
use courier_message::Message;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{Result, StorageError};

const JOURNAL_MAGIC: u32 = 0x434A_4E4C; // "CJNL"
const JOURNAL_VERSION: u16 = 1;
const HEADER_LEN: u64 = 8;
const RECORD_PREFIX_LEN: u64 = 8;
// Upper bound on a single record; larger lengths are treated as damage.
const MAX_RECORD_BYTES: u32 = 64 * 1024 * 1024;

const KIND_ADD: u8 = 1;
const KIND_REMOVE: u8 = 2;
const KIND_PREPARE: u8 = 3;
const KIND_COMMIT: u8 = 4;
const KIND_ROLLBACK: u8 = 5;

/// When appends reach the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncMode {
    /// Fsync every append.
    Always,
    /// Fsync only appends the caller marks as a transaction boundary.
    #[default]
    OnBoundary,
}

/// One journal record. Operation records carry the owning transaction and
/// target channel; control records carry only the transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalOp {
    AddMessage {
        txn: TxnId,
        channel: ChannelId,
        message: Message,
    },
    RemoveMessage {
        txn: TxnId,
        channel: ChannelId,
        message_id: MessageId,
    },
    Prepare { txn: TxnId },
    Commit { txn: TxnId },
    Rollback { txn: TxnId },
}

impl JournalOp {
    pub fn txn(&self) -> TxnId {
        match self {
            JournalOp::AddMessage { txn, .. }
            | JournalOp::RemoveMessage { txn, .. }
            | JournalOp::Prepare { txn }
            | JournalOp::Commit { txn }
            | JournalOp::Rollback { txn } => *txn,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            JournalOp::AddMessage {
                txn,
                channel,
                message,
            } => {
                buf.put_u8(KIND_ADD);
                buf.put_u64_le(txn.as_u64());
                buf.put_u64_le(channel.as_u64());
                buf.put_slice(&message.encode());
            }
            JournalOp::RemoveMessage {
                txn,
                channel,
                message_id,
            } => {
                buf.put_u8(KIND_REMOVE);
                buf.put_u64_le(txn.as_u64());
                buf.put_u64_le(channel.as_u64());
                buf.put_u64_le(message_id.as_u64());
            }
            JournalOp::Prepare { txn } => {
                buf.put_u8(KIND_PREPARE);
                buf.put_u64_le(txn.as_u64());
            }
            JournalOp::Commit { txn } => {
                buf.put_u8(KIND_COMMIT);
                buf.put_u64_le(txn.as_u64());
            }
            JournalOp::Rollback { txn } => {
                buf.put_u8(KIND_ROLLBACK);
                buf.put_u64_le(txn.as_u64());
            }
        }
    }

    fn decode(payload: Bytes, offset: u64) -> Result<Self> {
        let corrupt = || StorageError::Corruption { offset };
        let mut buf = payload;
        if buf.remaining() < 9 {
            return Err(corrupt());
        }
        let kind = buf.get_u8();
        let txn = TxnId::from_raw(buf.get_u64_le());
        match kind {
            KIND_ADD => {
                if buf.remaining() < 8 {
                    return Err(corrupt());
                }
                let channel = ChannelId::from_raw(buf.get_u64_le());
                let message = Message::decode(&mut buf).map_err(|_| corrupt())?;
                Ok(JournalOp::AddMessage {
                    txn,
                    channel,
                    message,
                })
            }
            KIND_REMOVE => {
                if buf.remaining() < 16 {
                    return Err(corrupt());
                }
                let channel = ChannelId::from_raw(buf.get_u64_le());
                let message_id = MessageId::from_raw(buf.get_u64_le());
                Ok(JournalOp::RemoveMessage {
                    txn,
                    channel,
                    message_id,
                })
            }
            KIND_PREPARE => Ok(JournalOp::Prepare { txn }),
            KIND_COMMIT => Ok(JournalOp::Commit { txn }),
            KIND_ROLLBACK => Ok(JournalOp::Rollback { txn }),
            _ => Err(corrupt()),
        }
    }
}

/// Result of replaying the journal at open time.
#[derive(Debug)]
pub struct Recovery {
    /// Every decoded record, in write order.
    pub ops: Vec<JournalOp>,
    /// Offset of a discarded torn tail, if one was found.
    pub truncated_at: Option<u64>,
}

#[derive(Debug)]
struct JournalInner {
    file: File,
}

/// Append-only journal writer bound to `journal.dat` in the data dir.
#[derive(Debug)]
pub struct Journal {
    inner: Mutex<JournalInner>,
    fsync: FsyncMode,
    path: PathBuf,
}

impl Journal {
    /// Open (or create) the journal and replay the record stream. A torn
    /// trailing record is truncated away before the writer is positioned.
    pub fn open(dir: &Path, fsync: FsyncMode) -> Result<(Self, Recovery)> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("journal.dat");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        let recovery = if file_len == 0 {
            let mut header = BytesMut::with_capacity(HEADER_LEN as usize);
            header.put_u32_le(JOURNAL_MAGIC);
            header.put_u16_le(JOURNAL_VERSION);
            header.put_u16_le(0);
            file.write_all(&header)?;
            file.sync_data()?;
            Recovery {
                ops: Vec::new(),
                truncated_at: None,
            }
        } else {
            let recovery = replay(&mut file, file_len)?;
            if let Some(offset) = recovery.truncated_at {
                tracing::warn!(offset, "discarding torn journal tail");
                file.set_len(offset)?;
                file.sync_data()?;
            }
            recovery
        };

        file.seek(SeekFrom::End(0))?;
        Ok((
            Self {
                inner: Mutex::new(JournalInner { file }),
                fsync,
                path,
            },
            recovery,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a batch of records as one contiguous write. `boundary` marks
    /// prepare/commit appends that must reach the disk before returning.
    pub fn append(&self, ops: &[JournalOp], boundary: bool) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut batch = BytesMut::new();
        for op in ops {
            let mut payload = BytesMut::new();
            op.encode(&mut payload);
            batch.put_u32_le(payload.len() as u32);
            batch.put_u32_le(crc32fast::hash(&payload));
            batch.put_slice(&payload);
        }

        let mut inner = self.inner.lock();
        inner.file.write_all(&batch)?;
        if boundary || self.fsync == FsyncMode::Always {
            inner.file.sync_data()?;
        }
        metrics::counter!("courier_journal_records_total").increment(ops.len() as u64);
        Ok(())
    }
}

fn replay(file: &mut File, file_len: u64) -> Result<Recovery> {
    let mut raw = Vec::with_capacity(file_len as usize);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut raw)?;

    if raw.len() < HEADER_LEN as usize {
        // Too short to even hold the header; treat as damage, not a tail.
        return Err(StorageError::Corruption { offset: 0 });
    }
    let mut header = Bytes::copy_from_slice(&raw[..HEADER_LEN as usize]);
    if header.get_u32_le() != JOURNAL_MAGIC {
        return Err(StorageError::Corruption { offset: 0 });
    }
    if header.get_u16_le() != JOURNAL_VERSION {
        return Err(StorageError::Corruption { offset: 4 });
    }

    let mut ops = Vec::new();
    let mut pos = HEADER_LEN;
    let mut truncated_at = None;
    while pos < file_len {
        // A record prefix that doesn't fully fit is a torn append.
        if pos + RECORD_PREFIX_LEN > file_len {
            truncated_at = Some(pos);
            break;
        }
        let prefix = &raw[pos as usize..(pos + RECORD_PREFIX_LEN) as usize];
        let len = u32::from_le_bytes(prefix[0..4].try_into().expect("prefix slice"));
        let crc = u32::from_le_bytes(prefix[4..8].try_into().expect("prefix slice"));
        if len == 0 || len > MAX_RECORD_BYTES {
            // Garbage length: only recoverable when nothing follows it.
            truncated_at = Some(pos);
            break;
        }
        let end = pos + RECORD_PREFIX_LEN + u64::from(len);
        if end > file_len {
            truncated_at = Some(pos);
            break;
        }
        let payload = &raw[(pos + RECORD_PREFIX_LEN) as usize..end as usize];
        if crc32fast::hash(payload) != crc {
            if end == file_len {
                // Checksum failure on the very last record: torn append.
                truncated_at = Some(pos);
                break;
            }
            return Err(StorageError::Corruption { offset: pos });
        }
        ops.push(JournalOp::decode(Bytes::copy_from_slice(payload), pos)?);
        pos = end;
    }

    Ok(Recovery { ops, truncated_at })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use courier_message::MessageBuilder;
    use tempfile::TempDir;

    fn message(id: u64) -> Message {
        MessageBuilder::new(Bytes::from_static(b"payload"))
            .durable(true)
            .finish(MessageId::from_raw(id), 100)
    }

    fn sample_ops() -> Vec<JournalOp> {
        vec![
            JournalOp::AddMessage {
                txn: TxnId::from_raw(1),
                channel: ChannelId::from_raw(10),
                message: message(5),
            },
            JournalOp::Prepare {
                txn: TxnId::from_raw(1),
            },
            JournalOp::Commit {
                txn: TxnId::from_raw(1),
            },
            JournalOp::RemoveMessage {
                txn: TxnId::from_raw(2),
                channel: ChannelId::from_raw(10),
                message_id: MessageId::from_raw(5),
            },
            JournalOp::Rollback {
                txn: TxnId::from_raw(2),
            },
        ]
    }

    #[test]
    fn append_then_reopen_replays_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let ops = sample_ops();
        {
            let (journal, recovery) = Journal::open(dir.path(), FsyncMode::default())
                .expect("open");
            assert!(recovery.ops.is_empty());
            journal.append(&ops, true).expect("append");
        }
        let (_journal, recovery) = Journal::open(dir.path(), FsyncMode::default())
            .expect("reopen");
        assert_eq!(recovery.ops, ops);
        assert_eq!(recovery.truncated_at, None);
    }

    #[test]
    fn torn_tail_is_discarded_not_fatal() {
        let dir = TempDir::new().expect("tempdir");
        let ops = sample_ops();
        let full_len;
        {
            let (journal, _) = Journal::open(dir.path(), FsyncMode::default()).expect("open");
            journal.append(&ops, true).expect("append");
            full_len = std::fs::metadata(journal.path()).expect("meta").len();
        }
        // Chop the last few bytes to simulate a crash mid-append.
        let path = dir.path().join("journal.dat");
        let file = OpenOptions::new().write(true).open(&path).expect("open raw");
        file.set_len(full_len - 3).expect("truncate");

        let (_journal, recovery) = Journal::open(dir.path(), FsyncMode::default())
            .expect("reopen");
        assert_eq!(recovery.ops.len(), ops.len() - 1);
        assert!(recovery.truncated_at.is_some());
        // The torn record is gone from disk as well.
        let after = std::fs::metadata(&path).expect("meta").len();
        assert_eq!(Some(after), recovery.truncated_at);
    }

    #[test]
    fn mid_stream_corruption_is_fatal() {
        let dir = TempDir::new().expect("tempdir");
        {
            let (journal, _) = Journal::open(dir.path(), FsyncMode::default()).expect("open");
            journal.append(&sample_ops(), true).expect("append");
        }
        // Flip a byte inside the first record's payload.
        let path = dir.path().join("journal.dat");
        let mut raw = std::fs::read(&path).expect("read");
        raw[HEADER_LEN as usize + RECORD_PREFIX_LEN as usize + 2] ^= 0xFF;
        std::fs::write(&path, raw).expect("write");

        let err = Journal::open(dir.path(), FsyncMode::default()).expect_err("corrupt");
        assert!(matches!(err, StorageError::Corruption { .. }));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(dir.path().join("journal.dat"), b"not a journal").expect("write");
        let err = Journal::open(dir.path(), FsyncMode::default()).expect_err("magic");
        assert!(matches!(err, StorageError::Corruption { offset: 0 }));
    }

    #[test]
    fn message_bodies_survive_the_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let original = message(9);
        {
            let (journal, _) = Journal::open(dir.path(), FsyncMode::Always).expect("open");
            journal
                .append(
                    &[JournalOp::AddMessage {
                        txn: TxnId::from_raw(3),
                        channel: ChannelId::from_raw(1),
                        message: original.clone(),
                    }],
                    false,
                )
                .expect("append");
        }
        let (_journal, recovery) = Journal::open(dir.path(), FsyncMode::default())
            .expect("reopen");
        match &recovery.ops[0] {
            JournalOp::AddMessage { message, .. } => assert_eq!(*message, original),
            other => panic!("unexpected record {other:?}"),
        }
    }
}
