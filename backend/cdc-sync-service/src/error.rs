use idempotent_consumer::IdempotencyError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CdcError>;

#[derive(Debug, Error)]
pub enum CdcError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] IdempotencyError),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Mapping error: {0}")]
    Mapping(String),

    #[error("Dead-letter publish failed: {0}")]
    DeadLetter(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CdcError {
    /// Failures that may succeed unchanged on a later attempt
    ///
    /// Transient failures are retried forever and never dead-lettered.
    pub fn is_transient(&self) -> bool {
        match self {
            CdcError::Kafka(_) | CdcError::DeadLetter(_) => true,
            CdcError::ClickHouse(e) => matches!(
                e,
                clickhouse::error::Error::Network(_) | clickhouse::error::Error::TimedOut
            ),
            CdcError::Ledger(e) => e.is_transient(),
            CdcError::Config(_)
            | CdcError::Decode(_)
            | CdcError::Mapping(_)
            | CdcError::Internal(_) => false,
        }
    }
}

impl From<serde_json::Error> for CdcError {
    fn from(err: serde_json::Error) -> Self {
        CdcError::Decode(err.to_string())
    }
}
