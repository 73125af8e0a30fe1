// Durable state for the broker core: the reference-counted message store
// and the append-only transaction journal it pairs with. The journal, not
// the store, is the durability authority; the store is rebuilt from the
// journal at startup.
use std::fmt;

pub mod journal;
pub mod store;

pub use journal::{FsyncMode, Journal, JournalOp, Recovery};
pub use store::{MessageHandle, MessageStore};

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug)]
pub enum StorageError {
    // Handle released or loaded after the body was already freed.
    NotFound,
    // Store capacity reached; producers must back off.
    Exhausted,
    // Unreadable journal record before the clean tail.
    Corruption { offset: u64 },
    Io(std::io::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound => write!(f, "message handle not found"),
            StorageError::Exhausted => write!(f, "message store exhausted"),
            StorageError::Corruption { offset } => {
                write!(f, "journal corruption at byte {offset}")
            }
            StorageError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}
