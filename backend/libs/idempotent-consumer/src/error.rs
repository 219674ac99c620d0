//! Error types for the offset ledger

use thiserror::Error;

/// Result type for ledger operations
pub type IdempotencyResult<T> = Result<T, IdempotencyError>;

/// Errors that can occur while reading or writing the processed-messages ledger
#[derive(Error, Debug)]
pub enum IdempotencyError {
    /// ClickHouse query or insert failed
    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    /// Message key validation failed (empty topic, negative partition/offset)
    #[error("Invalid message key: {0}")]
    InvalidKey(String),

    /// Ledger configuration is unusable (bad table name, etc.)
    #[error("Invalid ledger configuration: {0}")]
    Config(String),

    /// Storage backend failure that is not tied to ClickHouse
    #[error("Ledger storage error: {0}")]
    Storage(String),
}

impl IdempotencyError {
    /// Check if error is transient (should retry)
    ///
    /// Connection drops and timeouts clear up on their own; server-side
    /// rejections and validation failures do not.
    pub fn is_transient(&self) -> bool {
        match self {
            IdempotencyError::ClickHouse(ch_err) => matches!(
                ch_err,
                clickhouse::error::Error::Network(_) | clickhouse::error::Error::TimedOut
            ),
            IdempotencyError::Storage(_) => true,
            IdempotencyError::InvalidKey(_) | IdempotencyError::Config(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(IdempotencyError::ClickHouse(clickhouse::error::Error::TimedOut).is_transient());
        assert!(IdempotencyError::Storage("lock poisoned".to_string()).is_transient());
        assert!(!IdempotencyError::InvalidKey("empty topic".to_string()).is_transient());
        assert!(
            !IdempotencyError::ClickHouse(clickhouse::error::Error::BadResponse(
                "Code: 60. Table does not exist".to_string()
            ))
            .is_transient()
        );
    }
}
