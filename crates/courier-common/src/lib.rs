// Shared data types and small helpers used across crates.
use serde::{Deserialize, Serialize};

pub mod config;

pub use config::{BrokerConfig, Limits};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("config error: {0}")]
    Config(String),
}

pub mod ids {
    // Strongly typed IDs to avoid mixing id spaces at compile time.
    // Ids are plain u64s so they journal compactly and sort cheaply;
    // allocation is the broker's job, these are just the wrappers.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;

    macro_rules! id_type {
        ($name:ident) => {
            #[derive(
                Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
            )]
            pub struct $name(u64);

            impl $name {
                // Wrap a raw value when decoding from the journal.
                pub const fn from_raw(raw: u64) -> Self {
                    Self(raw)
                }

                // Expose the underlying value for encoding and display.
                pub const fn as_u64(&self) -> u64 {
                    self.0
                }
            }

            impl Default for $name {
                // Zero is the reserved "anonymous" value for every id space.
                fn default() -> Self {
                    Self(0)
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl From<u64> for $name {
                fn from(raw: u64) -> Self {
                    Self(raw)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    // Preserve the original input for clearer error messages.
                    let raw = input
                        .parse::<u64>()
                        .map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(raw))
                }
            }
        };
    }

    id_type!(MessageId);
    id_type!(ChannelId);
    id_type!(TopicId);
    id_type!(TxnId);
    id_type!(ConsumerId);
    id_type!(ConnectionId);
}
