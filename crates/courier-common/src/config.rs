use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

// Broker configuration sourced from environment variables.

const DEFAULT_DATA_DIR: &str = "./courier-data";
const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;
const DEFAULT_MAX_STORE_MESSAGES: usize = 100_000;
const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    // Largest accepted message body.
    pub max_message_bytes: usize,
    // Store capacity in message bodies; producers are backpressured past this.
    pub max_store_messages: usize,
}

impl Default for Limits {
    fn default() -> Self {
        // Defaults are conservative for local/dev usage.
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_store_messages: DEFAULT_MAX_STORE_MESSAGES,
        }
    }
}

/// Broker instance configuration shared across components.
///
/// ```
/// use courier_common::BrokerConfig;
///
/// let config = BrokerConfig::new("/tmp/courier");
/// assert_eq!(config.data_dir.to_str(), Some("/tmp/courier"));
/// ```
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub node_id: Uuid,
    // Directory holding the transaction journal.
    pub data_dir: PathBuf,
    // If true, commit records are fsynced as well as prepares.
    pub sync_on_commit: bool,
    // Default wait used when a receive timeout is not supplied.
    pub default_receive_timeout_ms: u64,
    pub limits: Limits,
}

impl BrokerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        // Use a fresh node ID so multiple brokers can run on one machine.
        Self {
            node_id: Uuid::new_v4(),
            data_dir: data_dir.into(),
            sync_on_commit: true,
            default_receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            limits: Limits::default(),
        }
    }

    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let data_dir = std::env::var("COURIER_DATA_DIR")
            .unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
        let sync_on_commit = std::env::var("COURIER_SYNC_ON_COMMIT")
            .ok()
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(true);
        let default_receive_timeout_ms = std::env::var("COURIER_RECEIVE_TIMEOUT_MS")
            .ok()
            .map(|value| {
                value
                    .parse::<u64>()
                    .with_context(|| "parse COURIER_RECEIVE_TIMEOUT_MS")
            })
            .transpose()?
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_RECEIVE_TIMEOUT_MS);
        let max_message_bytes = std::env::var("COURIER_MAX_MESSAGE_BYTES")
            .ok()
            .map(|value| {
                value
                    .parse::<usize>()
                    .with_context(|| "parse COURIER_MAX_MESSAGE_BYTES")
            })
            .transpose()?
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);
        let max_store_messages = std::env::var("COURIER_MAX_STORE_MESSAGES")
            .ok()
            .map(|value| {
                value
                    .parse::<usize>()
                    .with_context(|| "parse COURIER_MAX_STORE_MESSAGES")
            })
            .transpose()?
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_STORE_MESSAGES);

        Ok(Self {
            node_id: Uuid::new_v4(),
            data_dir: PathBuf::from(data_dir),
            sync_on_commit,
            default_receive_timeout_ms,
            limits: Limits {
                max_message_bytes,
                max_store_messages,
            },
        })
    }
}
