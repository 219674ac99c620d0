use idempotent_consumer::MessageKey;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{CdcError, Result};

/// Owned copy of one broker message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// `None` for a Kafka tombstone
    pub payload: Option<Vec<u8>>,
}

impl RawMessage {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        payload: Option<Vec<u8>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            payload,
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.topic.clone(), self.partition, self.offset)
    }
}

/// CDC operation types from Debezium
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdcOperation {
    /// Insert operation (c = create)
    Insert,
    /// Update operation (u = update)
    Update,
    /// Delete operation (d = delete)
    Delete,
    /// Read operation (r = read, initial snapshot)
    Read,
    /// Any other marker, carried verbatim for logging
    Unknown(String),
}

impl CdcOperation {
    pub fn from_marker(op: &str) -> Self {
        match op {
            "c" => Self::Insert,
            "u" => Self::Update,
            "d" => Self::Delete,
            "r" => Self::Read,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Operations whose "after" image is written to the sink
    pub fn is_upsert(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Read)
    }
}

impl fmt::Display for CdcOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => f.write_str("create"),
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
            Self::Read => f.write_str("read"),
            Self::Unknown(op) => write!(f, "unknown({})", op),
        }
    }
}

/// CDC message structure from Debezium
///
/// When `value.converter.schemas.enable = false`, Debezium sends the payload
/// directly without a wrapper object. Both formats are accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum CdcMessage {
    /// Format with schema wrapper (value.converter.schemas.enable = true)
    WithSchema { payload: CdcPayload },
    /// Format without schema wrapper (value.converter.schemas.enable = false)
    WithoutSchema(CdcPayload),
}

impl CdcMessage {
    fn into_payload(self) -> CdcPayload {
        match self {
            CdcMessage::WithSchema { payload } => payload,
            CdcMessage::WithoutSchema(payload) => payload,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CdcPayload {
    /// State after the change (null for Delete)
    #[serde(default)]
    after: Option<Value>,

    /// Operation marker (c/u/d/r)
    #[serde(default)]
    op: Option<String>,

    /// Transaction timestamp in milliseconds since epoch
    #[serde(default)]
    ts_ms: Option<i64>,
}

/// Decoded change event
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub operation: CdcOperation,
    /// Row image after the change; `None` when absent or null
    pub after: Option<Map<String, Value>>,
    pub ts_ms: Option<i64>,
}

/// Decode one broker message
///
/// Returns `Ok(None)` for a tombstone (null payload). Fails on malformed
/// JSON, a missing `op`, or an `after` image that is not an object.
pub fn decode(raw: &RawMessage) -> Result<Option<ChangeEvent>> {
    let Some(bytes) = raw.payload.as_deref() else {
        return Ok(None);
    };

    let message: CdcMessage = serde_json::from_slice(bytes)?;
    let payload = message.into_payload();

    let op = payload
        .op
        .ok_or_else(|| CdcError::Decode("CDC message has no 'op' field".to_string()))?;

    let after = match payload.after {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        Some(other) => {
            return Err(CdcError::Decode(format!(
                "CDC 'after' must be an object, got {}",
                json_kind(&other)
            )))
        }
    };

    Ok(Some(ChangeEvent {
        topic: raw.topic.clone(),
        partition: raw.partition,
        offset: raw.offset,
        operation: CdcOperation::from_marker(&op),
        after,
        ts_ms: payload.ts_ms,
    }))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
