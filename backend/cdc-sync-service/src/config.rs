//! Configuration for the CDC sync service, loaded from environment variables
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{CdcError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct CdcConfig {
    /// Kafka broker addresses (comma-separated)
    #[serde(default = "default_kafka_brokers")]
    pub kafka_brokers: String,

    #[serde(default = "default_kafka_group_id")]
    pub kafka_group_id: String,

    #[serde(default = "default_kafka_client_id")]
    pub kafka_client_id: String,

    /// Topic prefix in front of every source table, e.g. `postgres.public`
    #[serde(default = "default_topic_prefix")]
    pub cdc_topic_prefix: String,

    /// Source tables to sync (comma-separated); all mapped tables when unset
    #[serde(default)]
    pub cdc_tables: Option<String>,

    /// Maximum messages pulled per poll
    #[serde(default = "default_batch_size")]
    pub cdc_batch_size: usize,

    #[serde(default = "default_poll_timeout_ms")]
    pub cdc_poll_timeout_ms: u64,

    /// Seconds between topic metadata refreshes
    #[serde(default = "default_discovery_interval_secs")]
    pub cdc_discovery_interval_secs: u64,

    /// Non-transient failures tolerated per message before dead-lettering
    #[serde(default = "default_max_apply_attempts")]
    pub cdc_max_apply_attempts: u32,

    /// Empty string disables dead-lettering
    #[serde(default = "default_dead_letter_topic")]
    pub cdc_dead_letter_topic: String,

    /// JSON file replacing the built-in table mappings
    #[serde(default)]
    pub cdc_mappings_path: Option<PathBuf>,

    /// Ledger TTL in days, 0 keeps entries forever
    #[serde(default = "default_ledger_retention_days")]
    pub cdc_ledger_retention_days: u32,

    #[serde(default = "default_clickhouse_url")]
    pub clickhouse_url: String,

    #[serde(default = "default_clickhouse_db")]
    pub clickhouse_db: String,

    #[serde(default = "default_clickhouse_user")]
    pub clickhouse_user: String,

    #[serde(default)]
    pub clickhouse_password: String,

    /// Port for /health, /ready and /metrics
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_kafka_brokers() -> String {
    "kafka:9092".to_string()
}

fn default_kafka_group_id() -> String {
    "clickhouse_etl_group".to_string()
}

fn default_kafka_client_id() -> String {
    "etl_processor".to_string()
}

fn default_topic_prefix() -> String {
    "postgres.public".to_string()
}

fn default_batch_size() -> usize {
    500
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_discovery_interval_secs() -> u64 {
    10
}

fn default_max_apply_attempts() -> u32 {
    5
}

fn default_dead_letter_topic() -> String {
    "cdc.dead_letter".to_string()
}

fn default_ledger_retention_days() -> u32 {
    30
}

fn default_clickhouse_url() -> String {
    "http://clickhouse:8123".to_string()
}

fn default_clickhouse_db() -> String {
    "online_store".to_string()
}

fn default_clickhouse_user() -> String {
    "default".to_string()
}

fn default_http_port() -> u16 {
    8080
}

impl CdcConfig {
    /// Load `.env` (if present) and the process environment
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()
            .map_err(|e| CdcError::Config(format!("Invalid environment: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build from explicit key/value pairs (upper-case env names)
    pub fn from_pairs<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::from_iter(pairs)
            .map_err(|e| CdcError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka_brokers.trim().is_empty() {
            return Err(CdcError::Config("KAFKA_BROKERS must not be empty".into()));
        }
        if self.cdc_batch_size == 0 {
            return Err(CdcError::Config("CDC_BATCH_SIZE must be at least 1".into()));
        }
        if self.cdc_poll_timeout_ms == 0 {
            return Err(CdcError::Config(
                "CDC_POLL_TIMEOUT_MS must be at least 1".into(),
            ));
        }
        if self.cdc_max_apply_attempts == 0 {
            return Err(CdcError::Config(
                "CDC_MAX_APPLY_ATTEMPTS must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Tables named in `CDC_TABLES`, or `None` for every mapped table
    pub fn selected_tables(&self) -> Option<Vec<String>> {
        self.cdc_tables.as_deref().map(|tables| {
            tables
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect()
        })
    }

    pub fn dead_letter_topic(&self) -> Option<&str> {
        let topic = self.cdc_dead_letter_topic.trim();
        (!topic.is_empty()).then_some(topic)
    }

    pub fn ingestion(&self) -> IngestionSettings {
        IngestionSettings {
            batch_size: self.cdc_batch_size,
            poll_timeout: Duration::from_millis(self.cdc_poll_timeout_ms),
            discovery_interval: Duration::from_secs(self.cdc_discovery_interval_secs),
            max_apply_attempts: self.cdc_max_apply_attempts,
        }
    }
}

/// Knobs of the batch ingestion loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionSettings {
    pub batch_size: usize,
    pub poll_timeout: Duration,
    pub discovery_interval: Duration,
    pub max_apply_attempts: u32,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_timeout: Duration::from_millis(default_poll_timeout_ms()),
            discovery_interval: Duration::from_secs(default_discovery_interval_secs()),
            max_apply_attempts: default_max_apply_attempts(),
        }
    }
}
