use async_trait::async_trait;
use clickhouse::{Client, Row};
use serde::Deserialize;
use tracing::{error, info};

use crate::error::{IdempotencyError, IdempotencyResult};
use crate::{is_valid_identifier, LedgerEntry, LedgerStore, MessageKey};

/// ClickHouse-backed ledger
///
/// Schema:
/// ```sql
/// CREATE TABLE IF NOT EXISTS processed_messages (
///     topic String,
///     partition UInt32,
///     offset UInt64,
///     processed_at DateTime DEFAULT now()
/// ) ENGINE = ReplacingMergeTree(processed_at)
/// ORDER BY (topic, partition, offset)
/// ```
#[derive(Clone)]
pub struct ClickHouseLedger {
    client: Client,
    table: String,
    retention_days: u32,
}

#[derive(Debug, Row, Deserialize)]
struct LedgerHits {
    hits: u64,
}

impl ClickHouseLedger {
    pub const DEFAULT_TABLE: &'static str = "processed_messages";

    pub fn new(client: Client) -> Self {
        Self {
            client,
            table: Self::DEFAULT_TABLE.to_string(),
            retention_days: 0,
        }
    }

    /// Use a different ledger table name
    pub fn with_table(mut self, table: impl Into<String>) -> IdempotencyResult<Self> {
        let table = table.into();
        if !is_valid_identifier(&table) {
            return Err(IdempotencyError::Config(format!(
                "Invalid ledger table name: {}",
                table
            )));
        }
        self.table = table;
        Ok(self)
    }

    /// Expire ledger rows after `days` (0 keeps them forever)
    ///
    /// Only applied when the table is created; an existing table keeps its TTL.
    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn create_table_sql(&self) -> String {
        let mut sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                topic String,
                `partition` UInt32,
                `offset` UInt64,
                processed_at DateTime DEFAULT now()
            ) ENGINE = ReplacingMergeTree(processed_at)
            ORDER BY (topic, `partition`, `offset`)
            "#,
            self.table
        );

        if self.retention_days > 0 {
            sql.push_str(&format!(
                "TTL processed_at + INTERVAL {} DAY\n",
                self.retention_days
            ));
        }

        sql
    }
}

#[async_trait]
impl LedgerStore for ClickHouseLedger {
    async fn ensure_schema(&self) -> IdempotencyResult<()> {
        info!(table = %self.table, "Initializing processed-messages ledger");

        self.client
            .query(&self.create_table_sql())
            .execute()
            .await
            .map_err(|e| {
                error!("Failed to create {} table: {}", self.table, e);
                IdempotencyError::ClickHouse(e)
            })?;

        info!(table = %self.table, "Ledger table ready");
        Ok(())
    }

    async fn contains(&self, key: &MessageKey) -> IdempotencyResult<bool> {
        let sql = format!(
            "SELECT count() AS hits FROM {} WHERE topic = ? AND `partition` = ? AND `offset` = ?",
            self.table
        );

        let row = self
            .client
            .query(&sql)
            .bind(key.topic.as_str())
            .bind(key.partition as u32)
            .bind(key.offset as u64)
            .fetch_one::<LedgerHits>()
            .await
            .map_err(|e| {
                error!("Failed to check ledger for {}: {}", key, e);
                IdempotencyError::ClickHouse(e)
            })?;

        Ok(row.hits > 0)
    }

    async fn append(&self, entry: &LedgerEntry) -> IdempotencyResult<()> {
        let mut insert = self.client.insert(&self.table).map_err(|e| {
            error!("Ledger insert preparation error: {}", e);
            IdempotencyError::ClickHouse(e)
        })?;

        insert.write(entry).await.map_err(|e| {
            error!("Ledger row write error: {}", e);
            IdempotencyError::ClickHouse(e)
        })?;

        insert.end().await.map_err(|e| {
            error!("Ledger insert error: {}", e);
            IdempotencyError::ClickHouse(e)
        })?;

        Ok(())
    }
}
