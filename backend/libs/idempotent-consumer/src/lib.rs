//! # Idempotent Kafka Consumer Library
//!
//! Turns Kafka's at-least-once delivery into effectively-once application by
//! keeping a durable ledger of every `(topic, partition, offset)` that has
//! already been applied. The ledger lives inside the analytics sink itself
//! (ClickHouse), so a restarted consumer sees prior progress without a
//! separate coordination service.
//!
//! ## Architecture
//!
//! ```text
//! Kafka → Consumer → IdempotencyGuard::is_processed → transform + insert
//!                         ↓                                   ↓
//!                    LedgerStore  ←── IdempotencyGuard::mark_processed
//!                         ↓
//!                    ClickHouse
//!         (processed_messages, ReplacingMergeTree)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use idempotent_consumer::{ClickHouseLedger, IdempotencyGuard, MessageKey};
//!
//! # async fn example(client: clickhouse::Client) -> Result<(), Box<dyn std::error::Error>> {
//! let guard = IdempotencyGuard::new(ClickHouseLedger::new(client).with_retention_days(30));
//! guard.initialize().await?;
//!
//! let key = MessageKey::new("postgres.public.orders", 0, 42);
//! if !guard.is_processed(&key).await? {
//!     insert_row().await?;
//!     guard.mark_processed(&key).await?;
//! }
//! # Ok(())
//! # }
//! # async fn insert_row() -> Result<(), Box<dyn std::error::Error>> { Ok(()) }
//! ```
//!
//! ## Ordering contract
//!
//! `mark_processed` must only be called after the data write for the same
//! message has returned successfully. A crash between the two leaves the
//! message un-ledgered, so it is re-applied after redelivery; the reverse
//! order could lose the row.
//!
//! ## Duplicates
//!
//! The ClickHouse table uses `ReplacingMergeTree` keyed by
//! `(topic, partition, offset)`: marking the same key twice is harmless and
//! collapses to one live entry on merge (last write wins).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::Row;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

mod ch_store;
mod error;
mod memory;

pub use ch_store::ClickHouseLedger;
pub use error::{IdempotencyError, IdempotencyResult};
pub use memory::InMemoryLedger;

/// Longest topic name Kafka accepts
const MAX_TOPIC_LEN: usize = 249;

/// Broker address of one message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl MessageKey {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// One row of the processed-messages ledger
///
/// Uses u32 unix seconds for `processed_at` to match the ClickHouse
/// `DateTime` column without extra serde adapters.
#[derive(Debug, Clone, PartialEq, Eq, Row, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub processed_at: u32,
}

impl LedgerEntry {
    /// Build the entry for an already validated key
    pub fn for_key(key: &MessageKey, processed_at: DateTime<Utc>) -> Self {
        Self {
            topic: key.topic.clone(),
            partition: key.partition.max(0) as u32,
            offset: key.offset.max(0) as u64,
            processed_at: processed_at.timestamp().clamp(0, u32::MAX as i64) as u32,
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.topic.clone(), self.partition as i32, self.offset as i64)
    }

    pub fn processed_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.processed_at as i64, 0).unwrap_or_default()
    }
}

/// Durable storage behind the ledger
///
/// Implementations must treat `append` of an existing key as a no-op or a
/// last-write-wins overwrite, never as an error.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create the ledger table if it does not exist yet
    async fn ensure_schema(&self) -> IdempotencyResult<()>;

    /// Whether an entry for `key` exists
    async fn contains(&self, key: &MessageKey) -> IdempotencyResult<bool>;

    /// Append one entry
    async fn append(&self, entry: &LedgerEntry) -> IdempotencyResult<()>;
}

#[async_trait]
impl<S: LedgerStore + ?Sized> LedgerStore for Arc<S> {
    async fn ensure_schema(&self) -> IdempotencyResult<()> {
        (**self).ensure_schema().await
    }

    async fn contains(&self, key: &MessageKey) -> IdempotencyResult<bool> {
        (**self).contains(key).await
    }

    async fn append(&self, entry: &LedgerEntry) -> IdempotencyResult<()> {
        (**self).append(entry).await
    }
}

/// Idempotency guard for Kafka message processing
///
/// Validates keys and logs ledger traffic; storage is delegated to a
/// [`LedgerStore`]. The consumer loop is the only caller, so no internal
/// locking is needed.
pub struct IdempotencyGuard<S> {
    store: S,
}

impl<S: LedgerStore> IdempotencyGuard<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Bootstrap the ledger table (idempotent, safe on every start)
    pub async fn initialize(&self) -> IdempotencyResult<()> {
        self.store.ensure_schema().await
    }

    /// Check if a message has already been applied
    ///
    /// # Returns
    ///
    /// - `Ok(true)` if an entry exists for the key
    /// - `Ok(false)` if the message has not been applied yet
    /// - `Err` on storage errors; callers must not treat that as "new"
    pub async fn is_processed(&self, key: &MessageKey) -> IdempotencyResult<bool> {
        Self::validate_key(key)?;

        let exists = self.store.contains(key).await?;
        if exists {
            debug!(
                topic = %key.topic,
                partition = key.partition,
                offset = key.offset,
                "Message already processed"
            );
        }

        Ok(exists)
    }

    /// Record that a message has been applied
    ///
    /// Must be called after the data write for the same message succeeded.
    pub async fn mark_processed(&self, key: &MessageKey) -> IdempotencyResult<()> {
        Self::validate_key(key)?;

        let entry = LedgerEntry::for_key(key, Utc::now());
        self.store.append(&entry).await?;

        debug!(
            topic = %key.topic,
            partition = key.partition,
            offset = key.offset,
            "Message marked as processed"
        );

        Ok(())
    }

    fn validate_key(key: &MessageKey) -> IdempotencyResult<()> {
        if key.topic.is_empty() {
            return Err(IdempotencyError::InvalidKey(
                "Topic cannot be empty".to_string(),
            ));
        }

        if key.topic.len() > MAX_TOPIC_LEN {
            return Err(IdempotencyError::InvalidKey(format!(
                "Topic too long: {} characters (max {})",
                key.topic.len(),
                MAX_TOPIC_LEN
            )));
        }

        if key.partition < 0 {
            return Err(IdempotencyError::InvalidKey(format!(
                "Negative partition: {}",
                key.partition
            )));
        }

        if key.offset < 0 {
            return Err(IdempotencyError::InvalidKey(format!(
                "Negative offset: {}",
                key.offset
            )));
        }

        Ok(())
    }
}

/// ClickHouse identifiers that are safe to interpolate into DDL/DML
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
