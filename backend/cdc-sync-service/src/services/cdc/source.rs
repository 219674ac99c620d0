use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::models::RawMessage;
use crate::config::CdcConfig;
use crate::error::{CdcError, Result};

/// Next offset to read for one partition
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CommitOffset {
    pub topic: String,
    pub partition: i32,
    /// Offset of the last handled message plus one
    pub next_offset: i64,
}

/// Broker side of the ingestion loop
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Names of all topics currently on the cluster
    async fn fetch_topic_names(&self) -> Result<HashSet<String>>;

    /// Replace the subscription with `topics`
    async fn subscribe(&self, topics: &BTreeSet<String>) -> Result<()>;

    /// Up to `max` messages, waiting at most `timeout` in total
    async fn poll_batch(&self, max: usize, timeout: Duration) -> Result<Vec<RawMessage>>;

    /// Synchronously commit consumer-group offsets
    async fn commit(&self, offsets: &[CommitOffset]) -> Result<()>;

    /// Make the next poll of `partition` start again at `offset`
    async fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;

    /// Leave the consumer group
    async fn close(&self) -> Result<()>;
}

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka consumer with manual offset commits
pub struct KafkaChangeSource {
    consumer: Arc<StreamConsumer>,
}

impl KafkaChangeSource {
    pub fn new(config: &CdcConfig) -> Result<Self> {
        info!(
            brokers = %config.kafka_brokers,
            group_id = %config.kafka_group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.kafka_group_id)
            .set("client.id", &config.kafka_client_id)
            .set("bootstrap.servers", &config.kafka_brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .set("enable.partition.eof", "false")
            .set("reconnect.backoff.ms", "1000")
            .set("reconnect.backoff.max.ms", "5000")
            .create()
            .map_err(|e| {
                error!("Failed to create Kafka consumer: {}", e);
                e
            })?;

        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }

    /// Run a blocking librdkafka call off the async runtime
    async fn blocking<T, F>(&self, call: F) -> Result<T>
    where
        F: FnOnce(&StreamConsumer) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || call(&consumer))
            .await
            .map_err(|e| CdcError::Internal(format!("Kafka blocking task failed: {}", e)))?
    }
}

#[async_trait]
impl ChangeSource for KafkaChangeSource {
    async fn fetch_topic_names(&self) -> Result<HashSet<String>> {
        self.blocking(|consumer| {
            let metadata = consumer.fetch_metadata(None, METADATA_TIMEOUT)?;
            Ok(metadata
                .topics()
                .iter()
                .map(|topic| topic.name().to_string())
                .collect())
        })
        .await
    }

    async fn subscribe(&self, topics: &BTreeSet<String>) -> Result<()> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)?;
        info!(topics = ?topics, "Kafka subscription updated");
        Ok(())
    }

    async fn poll_batch(&self, max: usize, timeout: Duration) -> Result<Vec<RawMessage>> {
        let deadline = Instant::now() + timeout;
        let mut batch = Vec::with_capacity(max);

        while batch.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(msg)) => batch.push(RawMessage::new(
                    msg.topic(),
                    msg.partition(),
                    msg.offset(),
                    msg.payload().map(|p| p.to_vec()),
                )),
                // Return what was already pulled; the error resurfaces on the next poll
                Ok(Err(e)) if !batch.is_empty() => {
                    debug!("Kafka error after {} messages, ending batch: {}", batch.len(), e);
                    break;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break,
            }
        }

        Ok(batch)
    }

    async fn commit(&self, offsets: &[CommitOffset]) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for offset in offsets {
            tpl.add_partition_offset(
                &offset.topic,
                offset.partition,
                Offset::Offset(offset.next_offset),
            )?;
        }

        self.blocking(move |consumer| {
            consumer.commit(&tpl, CommitMode::Sync)?;
            Ok(())
        })
        .await
    }

    async fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let topic = topic.to_string();
        self.blocking(move |consumer| {
            consumer.seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.consumer.unsubscribe();
        info!("Kafka consumer unsubscribed");
        Ok(())
    }
}
