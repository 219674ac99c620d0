use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{IdempotencyError, IdempotencyResult};
use crate::{LedgerEntry, LedgerStore, MessageKey};

/// Process-local ledger for tests and local runs without ClickHouse
///
/// Same last-write-wins semantics as the ReplacingMergeTree table. Clones
/// share the same entries.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedger {
    entries: Arc<Mutex<BTreeMap<MessageKey, LedgerEntry>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all live entries, ordered by key
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.lock()
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> IdempotencyResult<MutexGuard<'_, BTreeMap<MessageKey, LedgerEntry>>> {
        self.entries
            .lock()
            .map_err(|e| IdempotencyError::Storage(format!("ledger lock poisoned: {}", e)))
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn ensure_schema(&self) -> IdempotencyResult<()> {
        Ok(())
    }

    async fn contains(&self, key: &MessageKey) -> IdempotencyResult<bool> {
        Ok(self.lock()?.contains_key(key))
    }

    async fn append(&self, entry: &LedgerEntry) -> IdempotencyResult<()> {
        self.lock()?.insert(entry.key(), entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_duplicate_append_keeps_one_entry() {
        let ledger = InMemoryLedger::new();
        let key = MessageKey::new("postgres.public.users", 1, 9);

        ledger
            .append(&LedgerEntry::for_key(&key, Utc::now()))
            .await
            .unwrap();
        ledger
            .append(&LedgerEntry::for_key(&key, Utc::now()))
            .await
            .unwrap();

        assert_eq!(ledger.len(), 1);
        assert!(ledger.contains(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_clones_share_entries() {
        let ledger = InMemoryLedger::new();
        let clone = ledger.clone();
        let key = MessageKey::new("postgres.public.users", 0, 1);

        clone
            .append(&LedgerEntry::for_key(&key, Utc::now()))
            .await
            .unwrap();

        assert!(ledger.contains(&key).await.unwrap());
        assert_eq!(ledger.entries()[0].key(), key);
    }
}
