use chrono::Utc;
use idempotent_consumer::{IdempotencyGuard, LedgerStore, MessageKey};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::dead_letter::DeadLetterSink;
use super::discovery::{discover_new_topics, DiscoverySchedule};
use super::mapping::MappingRegistry;
use super::models::{decode, CdcOperation, RawMessage};
use super::sink::AnalyticsSink;
use super::source::{ChangeSource, CommitOffset};
use crate::config::IngestionSettings;
use crate::error::{CdcError, Result};
use crate::metrics::CdcMetrics;

/// Threshold for consecutive failing batches before marking consumer as unhealthy
const UNHEALTHY_ERROR_THRESHOLD: u32 = 5;

/// Threshold for consecutive failing batches before emitting critical warning
const CRITICAL_ERROR_THRESHOLD: u32 = 10;

/// Error handling state for the CDC consumer
///
/// Shared with the HTTP readiness probe.
pub struct ConsumerErrorState {
    /// Number of consecutive failing batches
    consecutive_count: AtomicU32,
    /// Timestamp of last clean batch (Unix millis)
    last_success_ms: AtomicU64,
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl ConsumerErrorState {
    pub fn new() -> Self {
        Self {
            consecutive_count: AtomicU32::new(0),
            last_success_ms: AtomicU64::new(now_millis()),
        }
    }

    /// Record a clean batch, resetting error count
    pub fn record_success(&self) {
        self.consecutive_count.store(0, Ordering::SeqCst);
        self.last_success_ms.store(now_millis(), Ordering::SeqCst);
    }

    /// Record a failing batch, incrementing consecutive count
    pub fn record_error(&self) -> u32 {
        self.consecutive_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_count.load(Ordering::SeqCst)
    }

    pub fn time_since_success(&self) -> Duration {
        let last = self.last_success_ms.load(Ordering::SeqCst);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    /// Exponential backoff with cap: 1s, 2s, 4s, ... 60s
    pub fn calculate_backoff(&self) -> Duration {
        const MIN_BACKOFF_SECS: u64 = 1;
        const MAX_BACKOFF_SECS: u64 = 60;

        let errors = self.consecutive_errors();
        if errors == 0 {
            return Duration::from_secs(MIN_BACKOFF_SECS);
        }

        let backoff_secs = 2u64
            .saturating_pow(errors.saturating_sub(1))
            .min(MAX_BACKOFF_SECS);
        Duration::from_secs(backoff_secs)
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_errors() < UNHEALTHY_ERROR_THRESHOLD
    }
}

impl Default for ConsumerErrorState {
    fn default() -> Self {
        Self::new()
    }
}

/// What happened to one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Row inserted and ledgered
    Applied,
    /// Already in the ledger
    Duplicate,
    /// Handled without a write
    Skipped(SkipReason),
    /// Given up on and published to the dead-letter topic
    DeadLettered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Tombstone,
    Undecodable,
    Delete,
    UnknownOperation,
    MissingAfter,
    UnmappedTopic,
}

/// Summary of one poll/apply/commit cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub polled: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub dead_lettered: usize,
    pub failed: usize,
    /// Offsets committed at the end of the batch
    pub committed: Vec<CommitOffset>,
    /// Partitions rewound to their first failed offset
    pub rewound: Vec<CommitOffset>,
    /// Messages dropped unhandled because their partition still awaits a rewind
    pub held_back: usize,
    /// Broker errors while polling or committing
    pub broker_errors: usize,
}

impl BatchReport {
    /// No message left pending and no broker error
    pub fn is_clean(&self) -> bool {
        self.rewound.is_empty() && self.broker_errors == 0
    }

    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Applied => self.applied += 1,
            MessageOutcome::Duplicate => self.duplicates += 1,
            MessageOutcome::Skipped(_) => self.skipped += 1,
            MessageOutcome::DeadLettered => self.dead_lettered += 1,
        }
    }
}

/// Batch ingestion loop
///
/// Owns the broker client, the subscription set, the sink and the ledger.
/// Each cycle: refresh subscription (rate limited), poll a batch, apply its
/// messages in delivery order, commit the handled prefix of every partition.
pub struct CdcConsumer<S, K, L> {
    source: S,
    sink: K,
    ledger: IdempotencyGuard<L>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    registry: Arc<MappingRegistry>,
    expected_topics: BTreeSet<String>,
    subscribed: BTreeSet<String>,
    discovery: DiscoverySchedule,
    settings: IngestionSettings,
    /// Non-transient failures per message, cleared once the message is handled
    /// or its partition is committed past it
    attempts: HashMap<MessageKey, u32>,
    /// Partitions whose seek back to a failed offset has not succeeded yet
    pending_rewinds: HashMap<(String, i32), i64>,
    error_state: Arc<ConsumerErrorState>,
    metrics: CdcMetrics,
}

impl<S, K, L> CdcConsumer<S, K, L>
where
    S: ChangeSource,
    K: AnalyticsSink,
    L: LedgerStore,
{
    pub fn new(
        source: S,
        sink: K,
        ledger: L,
        registry: Arc<MappingRegistry>,
        expected_topics: BTreeSet<String>,
        settings: IngestionSettings,
        metrics: CdcMetrics,
    ) -> Self {
        Self {
            source,
            sink,
            ledger: IdempotencyGuard::new(ledger),
            dead_letter: None,
            registry,
            expected_topics,
            subscribed: BTreeSet::new(),
            discovery: DiscoverySchedule::new(settings.discovery_interval),
            settings,
            attempts: HashMap::new(),
            pending_rewinds: HashMap::new(),
            error_state: Arc::new(ConsumerErrorState::new()),
            metrics,
        }
    }

    pub fn with_dead_letter(mut self, dead_letter: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    pub fn error_state(&self) -> Arc<ConsumerErrorState> {
        Arc::clone(&self.error_state)
    }

    pub fn subscribed(&self) -> &BTreeSet<String> {
        &self.subscribed
    }

    /// Create the ledger table
    pub async fn initialize(&self) -> Result<()> {
        self.ledger.initialize().await?;
        info!(
            expected_topics = ?self.expected_topics,
            batch_size = self.settings.batch_size,
            "CDC consumer initialized"
        );
        Ok(())
    }

    /// Run until `shutdown` turns true
    ///
    /// The batch in flight is finished and committed before returning.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Starting CDC sync loop");

        loop {
            if *shutdown.borrow() {
                info!("Shutdown signal received, stopping CDC sync loop");
                break;
            }

            if self.subscribed.is_empty() {
                self.refresh_subscription().await;
                if self.subscribed.is_empty() {
                    debug!("No expected topics exist yet");
                    if wait_or_shutdown(self.settings.poll_timeout, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            }

            let report = self.run_once().await;

            if report.is_clean() {
                self.error_state.record_success();
                self.metrics.consecutive_failed_batches.set(0);
                self.metrics.consumer_healthy.set(1);
                self.metrics.backoff_seconds.set(0);
                continue;
            }

            let consecutive = self.error_state.record_error();
            let backoff = self.error_state.calculate_backoff();
            self.metrics.consecutive_failed_batches.set(consecutive as i64);
            self.metrics.backoff_seconds.set(backoff.as_secs() as i64);
            self.metrics
                .consumer_healthy
                .set(if self.error_state.is_healthy() { 1 } else { 0 });

            if consecutive >= CRITICAL_ERROR_THRESHOLD {
                error!(
                    consecutive_errors = consecutive,
                    backoff_secs = backoff.as_secs(),
                    time_since_success_secs = self.error_state.time_since_success().as_secs(),
                    "CRITICAL: CDC sync experiencing persistent failures. \
                     Manual intervention may be required"
                );
            } else if consecutive >= UNHEALTHY_ERROR_THRESHOLD {
                warn!(
                    consecutive_errors = consecutive,
                    backoff_secs = backoff.as_secs(),
                    "CDC sync unhealthy - multiple consecutive failing batches"
                );
            } else {
                warn!(
                    consecutive_errors = consecutive,
                    backoff_secs = backoff.as_secs(),
                    failed = report.failed,
                    broker_errors = report.broker_errors,
                    "Batch finished with failures, backing off"
                );
            }

            if wait_or_shutdown(backoff, &mut shutdown).await {
                info!("Shutdown signal received during backoff");
                break;
            }
        }

        self.source.close().await
    }

    /// One full cycle: discovery, pending rewinds, poll, apply, commit
    pub async fn run_once(&mut self) -> BatchReport {
        self.refresh_subscription().await;

        let mut report = BatchReport::default();
        if self.subscribed.is_empty() {
            return report;
        }

        self.retry_pending_rewinds(&mut report).await;

        let batch = match self
            .source
            .poll_batch(self.settings.batch_size, self.settings.poll_timeout)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                error!("Kafka poll failed: {}", e);
                self.metrics.broker_errors_total.inc();
                report.broker_errors += 1;
                return report;
            }
        };

        report.polled = batch.len();
        if batch.is_empty() {
            return report;
        }

        self.process_batch(&batch, &mut report).await;
        self.finish_batch(&mut report).await;

        debug!(
            polled = report.polled,
            applied = report.applied,
            duplicates = report.duplicates,
            skipped = report.skipped,
            failed = report.failed,
            held_back = report.held_back,
            "Batch processed"
        );

        report
    }

    /// Subscribe to expected topics that appeared since the last check
    ///
    /// Only called between batches, so no handled offset is left uncommitted
    /// when the subscription changes.
    pub async fn refresh_subscription(&mut self) {
        let now = std::time::Instant::now();
        if !self.discovery.is_due(now) {
            return;
        }
        self.discovery.mark_run(now);

        let existing = match self.source.fetch_topic_names().await {
            Ok(topics) => topics,
            Err(e) => {
                warn!("Topic metadata fetch failed, retrying next interval: {}", e);
                self.metrics.broker_errors_total.inc();
                return;
            }
        };

        let fresh = discover_new_topics(&existing, &self.expected_topics, &self.subscribed);
        if fresh.is_empty() {
            return;
        }

        let mut next: BTreeSet<String> = self.subscribed.clone();
        next.extend(fresh.iter().cloned());

        match self.source.subscribe(&next).await {
            Ok(()) => {
                info!(new_topics = ?fresh, total = next.len(), "Subscribed to new CDC topics");
                self.subscribed = next;
                self.metrics.subscribed_topics.set(self.subscribed.len() as i64);
            }
            Err(e) => {
                error!(new_topics = ?fresh, "Failed to update subscription: {}", e);
                self.metrics.broker_errors_total.inc();
            }
        }
    }

    async fn process_batch(&mut self, batch: &[RawMessage], report: &mut BatchReport) {
        let mut blocked: HashSet<(String, i32)> = HashSet::new();
        let mut handled: BTreeMap<(String, i32), i64> = BTreeMap::new();

        for msg in batch {
            let partition_key = (msg.topic.clone(), msg.partition);
            // A later message must not overtake a failed one in the same partition
            if blocked.contains(&partition_key) {
                continue;
            }

            // The read position is past an unapplied message until the seek lands
            if let Some(&pending) = self.pending_rewinds.get(&partition_key) {
                if msg.offset > pending {
                    warn!(
                        topic = %msg.topic,
                        partition = msg.partition,
                        offset = msg.offset,
                        pending_offset = pending,
                        "Holding back partition until it is rewound"
                    );
                    report.held_back += 1;
                    report.rewound.push(CommitOffset {
                        topic: msg.topic.clone(),
                        partition: msg.partition,
                        next_offset: pending,
                    });
                    blocked.insert(partition_key);
                    continue;
                }
                // Redelivered from at or before the failed offset, order is intact again
                self.pending_rewinds.remove(&partition_key);
            }

            let outcome = match self.handle_message(msg).await {
                Ok(outcome) => {
                    self.attempts.remove(&msg.key());
                    Some(outcome)
                }
                Err(e) => {
                    report.failed += 1;
                    self.metrics.messages_failed_total.inc();
                    self.on_failure(msg, &e).await
                }
            };

            match outcome {
                Some(outcome) => {
                    report.record(outcome);
                    handled.insert(partition_key, msg.offset + 1);
                }
                None => {
                    report.rewound.push(CommitOffset {
                        topic: msg.topic.clone(),
                        partition: msg.partition,
                        next_offset: msg.offset,
                    });
                    blocked.insert(partition_key);
                }
            }
        }

        report.committed = handled
            .into_iter()
            .map(|((topic, partition), next_offset)| CommitOffset {
                topic,
                partition,
                next_offset,
            })
            .collect();
    }

    async fn finish_batch(&mut self, report: &mut BatchReport) {
        if !report.committed.is_empty() {
            match self.source.commit(&report.committed).await {
                Ok(()) => {
                    self.metrics.commits_total.inc();
                    debug!(offsets = ?report.committed, "Committed offsets");
                    prune_attempts(&mut self.attempts, &report.committed);
                }
                Err(e) => {
                    // Handled messages are ledgered, so redelivery is harmless
                    error!("Offset commit failed: {}", e);
                    self.metrics.broker_errors_total.inc();
                    report.broker_errors += 1;
                    report.committed.clear();
                }
            }
        }

        let mut rewind_failures = 0;
        for rewind in &report.rewound {
            let partition_key = (rewind.topic.clone(), rewind.partition);
            match self
                .source
                .rewind(&rewind.topic, rewind.partition, rewind.next_offset)
                .await
            {
                Ok(()) => {
                    self.pending_rewinds.remove(&partition_key);
                }
                Err(e) => {
                    error!(
                        topic = %rewind.topic,
                        partition = rewind.partition,
                        offset = rewind.next_offset,
                        "Failed to rewind partition, holding it back: {}",
                        e
                    );
                    self.metrics.broker_errors_total.inc();
                    rewind_failures += 1;
                    self.pending_rewinds.insert(partition_key, rewind.next_offset);
                }
            }
        }
        report.broker_errors += rewind_failures;
    }

    /// Seek partitions left behind by an earlier failed rewind
    async fn retry_pending_rewinds(&mut self, report: &mut BatchReport) {
        let pending: Vec<((String, i32), i64)> = self
            .pending_rewinds
            .iter()
            .map(|(key, offset)| (key.clone(), *offset))
            .collect();

        for ((topic, partition), offset) in pending {
            match self.source.rewind(&topic, partition, offset).await {
                Ok(()) => {
                    info!(topic = %topic, partition, offset, "Pending rewind completed");
                    self.pending_rewinds.remove(&(topic, partition));
                }
                Err(e) => {
                    warn!(topic = %topic, partition, offset, "Rewind retry failed: {}", e);
                    self.metrics.broker_errors_total.inc();
                    report.broker_errors += 1;
                }
            }
        }
    }

    /// Ledger check, decode, map, insert, mark
    async fn handle_message(&self, msg: &RawMessage) -> Result<MessageOutcome> {
        let key = msg.key();

        if self.ledger.is_processed(&key).await? {
            self.metrics.duplicates_total.inc();
            return Ok(MessageOutcome::Duplicate);
        }

        let event = match decode(msg) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(topic = %msg.topic, partition = msg.partition, offset = msg.offset, "Skipping tombstone");
                return Ok(self.skip(SkipReason::Tombstone));
            }
            Err(e) => {
                error!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    "Skipping undecodable CDC message: {}",
                    e
                );
                return Ok(self.skip(SkipReason::Undecodable));
            }
        };

        match &event.operation {
            op if op.is_upsert() => {}
            CdcOperation::Delete => {
                info!(topic = %msg.topic, offset = msg.offset, "Skipping delete event");
                return Ok(self.skip(SkipReason::Delete));
            }
            op => {
                warn!(topic = %msg.topic, offset = msg.offset, op = %op, "Skipping unknown CDC operation");
                return Ok(self.skip(SkipReason::UnknownOperation));
            }
        }

        let Some(after) = event.after.as_ref() else {
            warn!(
                topic = %msg.topic,
                offset = msg.offset,
                op = %event.operation,
                "Skipping CDC event without 'after' image"
            );
            return Ok(self.skip(SkipReason::MissingAfter));
        };

        let Some(mapping) = self.registry.resolve(&msg.topic) else {
            warn!(topic = %msg.topic, "No table mapping for topic, skipping");
            return Ok(self.skip(SkipReason::UnmappedTopic));
        };

        let row = mapping.apply(after, Utc::now());
        self.sink.insert_row(&row).await?;
        self.ledger.mark_processed(&key).await?;

        self.metrics.messages_applied_total.inc();
        debug!(
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            table = %row.table,
            op = %event.operation,
            source_ts_ms = ?event.ts_ms,
            "Applied CDC event"
        );

        Ok(MessageOutcome::Applied)
    }

    fn skip(&self, reason: SkipReason) -> MessageOutcome {
        self.metrics.messages_skipped_total.inc();
        MessageOutcome::Skipped(reason)
    }

    /// Decide whether a failed message is retried or dead-lettered
    ///
    /// Returns `Some` when the message counts as handled.
    async fn on_failure(&mut self, msg: &RawMessage, err: &CdcError) -> Option<MessageOutcome> {
        if err.is_transient() {
            error!(
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                "Transient failure applying CDC message, will retry: {}",
                err
            );
            return None;
        }

        let key = msg.key();
        let attempts = {
            let count = self.attempts.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };

        error!(
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            attempt = attempts,
            max_attempts = self.settings.max_apply_attempts,
            "Failed to apply CDC message: {}",
            err
        );

        if attempts < self.settings.max_apply_attempts {
            return None;
        }

        let Some(dead_letter) = self.dead_letter.as_ref() else {
            error!(
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                "Apply attempts exhausted and no dead-letter topic configured; partition stays blocked"
            );
            return None;
        };

        match dead_letter.publish(msg, &err.to_string(), attempts).await {
            Ok(()) => {
                self.attempts.remove(&key);
                self.metrics.dead_lettered_total.inc();
                Some(MessageOutcome::DeadLettered)
            }
            Err(e) => {
                error!(key = %key, "Dead-letter publish failed, will retry: {}", e);
                None
            }
        }
    }
}

/// Forget failure counts of messages their partition has committed past
fn prune_attempts(attempts: &mut HashMap<MessageKey, u32>, committed: &[CommitOffset]) {
    attempts.retain(|key, _| {
        !committed.iter().any(|c| {
            c.topic == key.topic && c.partition == key.partition && c.next_offset > key.offset
        })
    });
}

/// Sleep for `duration`; true if shutdown was requested meanwhile
async fn wait_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
