//! CDC sync service
//!
//! Streams Debezium change events from Kafka into ClickHouse with
//! effectively-once application: every applied message is recorded in a
//! `(topic, partition, offset)` ledger next to the data, and broker offsets
//! are committed only after the rows of a batch are durable.

pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod metrics;
pub mod services;

pub use config::{CdcConfig, IngestionSettings};
pub use error::{CdcError, Result};
pub use metrics::CdcMetrics;
