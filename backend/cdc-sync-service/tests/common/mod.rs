//! In-memory stand-ins for Kafka, ClickHouse and the dead-letter topic
#![allow(dead_code)]

use async_trait::async_trait;
use cdc_sync_service::services::cdc::{
    AnalyticsSink, CdcConsumer, ChangeSource, CommitOffset, DeadLetterSink, MappingRegistry,
    RawMessage, SinkRow, SinkValue,
};
use cdc_sync_service::{CdcError, CdcMetrics, IngestionSettings, Result};
use idempotent_consumer::InMemoryLedger;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PREFIX: &str = "postgres.public";

pub fn topic(table: &str) -> String {
    format!("{}.{}", PREFIX, table)
}

type PartitionKey = (String, i32);

#[derive(Default)]
struct BrokerState {
    existing: BTreeSet<String>,
    log: BTreeMap<PartitionKey, Vec<RawMessage>>,
    positions: HashMap<PartitionKey, i64>,
    committed: HashMap<PartitionKey, i64>,
    subscription: BTreeSet<String>,
    subscribe_calls: usize,
    commit_calls: usize,
    fail_commits: bool,
    fail_metadata: bool,
    fail_rewind: bool,
    closed: bool,
}

/// Single-consumer broker: per-partition logs, positions and committed offsets
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn create_topic(&self, name: &str) {
        self.state().existing.insert(name.to_string());
    }

    /// Append a JSON event and return its offset (creates the topic)
    pub fn produce(&self, topic: &str, partition: i32, body: Value) -> i64 {
        self.produce_raw(topic, partition, Some(serde_json::to_vec(&body).unwrap()))
    }

    pub fn produce_raw(&self, topic: &str, partition: i32, payload: Option<Vec<u8>>) -> i64 {
        let mut state = self.state();
        state.existing.insert(topic.to_string());
        let log = state
            .log
            .entry((topic.to_string(), partition))
            .or_default();
        let offset = log.len() as i64;
        log.push(RawMessage::new(topic, partition, offset, payload));
        offset
    }

    /// Forget uncommitted progress, as a restarted consumer would
    pub fn restart(&self) {
        let mut state = self.state();
        state.positions = state.committed.clone();
    }

    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .committed
            .get(&(topic.to_string(), partition))
            .copied()
    }

    pub fn subscription(&self) -> BTreeSet<String> {
        self.state().subscription.clone()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }

    pub fn commit_calls(&self) -> usize {
        self.state().commit_calls
    }

    pub fn set_fail_commits(&self, fail: bool) {
        self.state().fail_commits = fail;
    }

    pub fn set_fail_metadata(&self, fail: bool) {
        self.state().fail_metadata = fail;
    }

    pub fn set_fail_rewind(&self, fail: bool) {
        self.state().fail_rewind = fail;
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

fn broker_error() -> CdcError {
    CdcError::Kafka(rdkafka::error::KafkaError::MetadataFetch(
        rdkafka::types::RDKafkaErrorCode::BrokerTransportFailure,
    ))
}

impl FakeBroker {
    fn take_batch(&self, max: usize) -> Vec<RawMessage> {
        let mut state = self.state();
        let mut batch = Vec::new();

        let partitions: Vec<PartitionKey> = state
            .log
            .keys()
            .filter(|(topic, _)| state.subscription.contains(topic))
            .cloned()
            .collect();

        for key in partitions {
            let start = state
                .positions
                .get(&key)
                .or_else(|| state.committed.get(&key))
                .copied()
                .unwrap_or(0);
            let log = &state.log[&key];
            let take: Vec<RawMessage> = log
                .iter()
                .skip(start as usize)
                .take(max - batch.len())
                .cloned()
                .collect();
            let next = start + take.len() as i64;
            batch.extend(take);
            state.positions.insert(key, next);
            if batch.len() >= max {
                break;
            }
        }

        batch
    }
}

#[async_trait]
impl ChangeSource for FakeBroker {
    async fn fetch_topic_names(&self) -> Result<HashSet<String>> {
        let state = self.state();
        if state.fail_metadata {
            return Err(broker_error());
        }
        Ok(state.existing.iter().cloned().collect())
    }

    async fn subscribe(&self, topics: &BTreeSet<String>) -> Result<()> {
        let mut state = self.state();
        state.subscription = topics.clone();
        state.subscribe_calls += 1;
        Ok(())
    }

    async fn poll_batch(&self, max: usize, timeout: Duration) -> Result<Vec<RawMessage>> {
        let batch = self.take_batch(max);
        if batch.is_empty() {
            // An idle broker makes the consumer wait out its poll timeout
            tokio::time::sleep(timeout).await;
        }
        Ok(batch)
    }

    async fn commit(&self, offsets: &[CommitOffset]) -> Result<()> {
        let mut state = self.state();
        if state.fail_commits {
            return Err(broker_error());
        }
        state.commit_calls += 1;
        for offset in offsets {
            state
                .committed
                .insert((offset.topic.clone(), offset.partition), offset.next_offset);
        }
        Ok(())
    }

    async fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut state = self.state();
        if state.fail_rewind {
            return Err(broker_error());
        }
        state.positions.insert((topic.to_string(), partition), offset);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state().closed = true;
        Ok(())
    }
}

struct FailureRule {
    column: String,
    value: SinkValue,
    remaining: usize,
    transient: bool,
}

/// Row store with ReplacingMergeTree-style reads (last insert wins)
#[derive(Clone, Default)]
pub struct FakeSink {
    rows: Arc<Mutex<Vec<SinkRow>>>,
    rules: Arc<Mutex<Vec<FailureRule>>>,
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail inserts of rows whose `column` equals `value`, `times` times
    pub fn fail_rows(&self, column: &str, value: SinkValue, times: usize, transient: bool) {
        self.rules.lock().unwrap().push(FailureRule {
            column: column.to_string(),
            value,
            remaining: times,
            transient,
        });
    }

    pub fn rows(&self) -> Vec<SinkRow> {
        self.rows.lock().unwrap().clone()
    }

    pub fn rows_in(&self, table: &str) -> Vec<SinkRow> {
        self.rows()
            .into_iter()
            .filter(|row| row.table == table)
            .collect()
    }

    /// Latest row of `table` whose `key_column` equals `key`
    pub fn latest(&self, table: &str, key_column: &str, key: &SinkValue) -> Option<SinkRow> {
        self.rows_in(table)
            .into_iter()
            .rev()
            .find(|row| row.get(key_column) == Some(key))
    }
}

#[async_trait]
impl AnalyticsSink for FakeSink {
    async fn insert_row(&self, row: &SinkRow) -> Result<()> {
        {
            let mut rules = self.rules.lock().unwrap();
            if let Some(rule) = rules
                .iter_mut()
                .find(|rule| rule.remaining > 0 && row.get(&rule.column) == Some(&rule.value))
            {
                rule.remaining -= 1;
                return Err(if rule.transient {
                    CdcError::ClickHouse(clickhouse::error::Error::TimedOut)
                } else {
                    CdcError::ClickHouse(clickhouse::error::Error::BadResponse(
                        "Code: 53. DB::Exception: Type mismatch".to_string(),
                    ))
                });
            }
        }

        self.rows.lock().unwrap().push(row.clone());
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct FakeDeadLetter {
    published: Arc<Mutex<Vec<(RawMessage, String, u32)>>>,
}

impl FakeDeadLetter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<(RawMessage, String, u32)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for FakeDeadLetter {
    async fn publish(&self, message: &RawMessage, reason: &str, attempts: u32) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((message.clone(), reason.to_string(), attempts));
        Ok(())
    }
}

pub fn test_settings() -> IngestionSettings {
    IngestionSettings {
        batch_size: 100,
        poll_timeout: Duration::from_millis(10),
        discovery_interval: Duration::ZERO,
        max_apply_attempts: 3,
    }
}

pub type TestConsumer = CdcConsumer<FakeBroker, FakeSink, InMemoryLedger>;

pub struct Harness {
    pub broker: FakeBroker,
    pub sink: FakeSink,
    pub ledger: InMemoryLedger,
    pub dead_letter: FakeDeadLetter,
    pub consumer: TestConsumer,
}

impl Harness {
    /// Consumer expecting every built-in table
    pub fn new() -> Self {
        let registry = MappingRegistry::builtin(PREFIX).unwrap();
        let expected = registry.expected_topics(None).unwrap();
        Self::with_expected(expected)
    }

    pub fn with_expected(expected: BTreeSet<String>) -> Self {
        let broker = FakeBroker::new();
        let sink = FakeSink::new();
        let ledger = InMemoryLedger::new();
        let dead_letter = FakeDeadLetter::new();
        let registry = Arc::new(MappingRegistry::builtin(PREFIX).unwrap());

        let consumer = CdcConsumer::new(
            broker.clone(),
            sink.clone(),
            ledger.clone(),
            registry,
            expected,
            test_settings(),
            CdcMetrics::new().unwrap(),
        )
        .with_dead_letter(Arc::new(dead_letter.clone()));

        Self {
            broker,
            sink,
            ledger,
            dead_letter,
            consumer,
        }
    }
}
