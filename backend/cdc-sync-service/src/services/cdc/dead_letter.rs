use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tracing::{error, warn};

use super::models::RawMessage;
use crate::config::CdcConfig;
use crate::error::{CdcError, Result};

/// Destination for messages that keep failing with non-transient errors
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, message: &RawMessage, reason: &str, attempts: u32) -> Result<()>;
}

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Publishes the original payload to a dead-letter topic
///
/// Origin coordinates travel as headers so the message can be replayed.
pub struct KafkaDeadLetterPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDeadLetterPublisher {
    pub fn new(config: &CdcConfig, topic: impl Into<String>) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.kafka_brokers)
            .set("client.id", format!("{}-dlq", config.kafka_client_id))
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("message.timeout.ms", "30000")
            .create()?;

        Ok(Self {
            producer,
            topic: topic.into(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterPublisher {
    async fn publish(&self, message: &RawMessage, reason: &str, attempts: u32) -> Result<()> {
        let partition = message.partition.to_string();
        let offset = message.offset.to_string();
        let attempts = attempts.to_string();
        let failed_at = chrono::Utc::now().to_rfc3339();

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "cdc_origin_topic",
                value: Some(message.topic.as_bytes()),
            })
            .insert(Header {
                key: "cdc_origin_partition",
                value: Some(partition.as_bytes()),
            })
            .insert(Header {
                key: "cdc_origin_offset",
                value: Some(offset.as_bytes()),
            })
            .insert(Header {
                key: "cdc_error",
                value: Some(reason.as_bytes()),
            })
            .insert(Header {
                key: "cdc_attempts",
                value: Some(attempts.as_bytes()),
            })
            .insert(Header {
                key: "cdc_failed_at",
                value: Some(failed_at.as_bytes()),
            });

        // Keyed by origin so one source partition stays ordered in the DLQ
        let key = format!("{}-{}", message.topic, message.partition);
        let payload: &[u8] = message.payload.as_deref().unwrap_or_default();
        let record = FutureRecord::to(&self.topic)
            .key(&key)
            .payload(payload)
            .headers(headers);

        match self.producer.send(record, SEND_TIMEOUT).await {
            Ok(_) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    dead_letter_topic = %self.topic,
                    "Message dead-lettered"
                );
                Ok(())
            }
            Err((e, _)) => {
                error!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "Failed to publish to dead-letter topic: {}",
                    e
                );
                Err(CdcError::DeadLetter(e.to_string()))
            }
        }
    }
}
