use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Metrics for CDC sync monitoring
///
/// Registered on a dedicated registry so tests can build as many loops as
/// they like without colliding on the process-wide default registry.
#[derive(Clone)]
pub struct CdcMetrics {
    registry: Registry,
    /// Messages whose row was inserted and ledgered
    pub messages_applied_total: IntCounter,
    /// Messages handled without a write (deletes, tombstones, unmapped, undecodable)
    pub messages_skipped_total: IntCounter,
    /// Messages found in the ledger and not applied again
    pub duplicates_total: IntCounter,
    /// Apply attempts that failed
    pub messages_failed_total: IntCounter,
    /// Messages given up on and published to the dead-letter topic
    pub dead_lettered_total: IntCounter,
    /// Successful offset commits
    pub commits_total: IntCounter,
    /// Broker errors while polling, committing or fetching metadata
    pub broker_errors_total: IntCounter,
    /// Size of the current subscription set
    pub subscribed_topics: IntGauge,
    /// Consecutive batches that ended with a failure (resets on a clean batch)
    pub consecutive_failed_batches: IntGauge,
    /// Consumer health status (1 = healthy, 0 = unhealthy)
    pub consumer_healthy: IntGauge,
    /// Current backoff duration in seconds
    pub backoff_seconds: IntGauge,
}

impl CdcMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Self::with_registry(Registry::new())
    }

    fn with_registry(registry: Registry) -> prometheus::Result<Self> {
        let messages_applied_total = IntCounter::new(
            "cdc_messages_applied_total",
            "Total number of CDC messages written to the sink",
        )?;
        let messages_skipped_total = IntCounter::new(
            "cdc_messages_skipped_total",
            "Total number of CDC messages handled without a sink write",
        )?;
        let duplicates_total = IntCounter::new(
            "cdc_duplicates_total",
            "Total number of redelivered CDC messages already in the ledger",
        )?;
        let messages_failed_total = IntCounter::new(
            "cdc_messages_failed_total",
            "Total number of failed CDC apply attempts",
        )?;
        let dead_lettered_total = IntCounter::new(
            "cdc_dead_lettered_total",
            "Total number of CDC messages published to the dead-letter topic",
        )?;
        let commits_total = IntCounter::new(
            "cdc_offset_commits_total",
            "Total number of successful offset commits",
        )?;
        let broker_errors_total = IntCounter::new(
            "cdc_broker_errors_total",
            "Total number of Kafka errors encountered",
        )?;
        let subscribed_topics = IntGauge::new(
            "cdc_subscribed_topics",
            "Number of topics in the current subscription",
        )?;
        let consecutive_failed_batches = IntGauge::new(
            "cdc_consecutive_failed_batches",
            "Current number of consecutive batches with failures",
        )?;
        let consumer_healthy = IntGauge::new(
            "cdc_consumer_healthy",
            "CDC consumer health status (1 = healthy, 0 = unhealthy)",
        )?;
        let backoff_seconds = IntGauge::new(
            "cdc_consumer_backoff_seconds",
            "Current backoff duration in seconds",
        )?;

        for metric in [
            Box::new(messages_applied_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(messages_skipped_total.clone()),
            Box::new(duplicates_total.clone()),
            Box::new(messages_failed_total.clone()),
            Box::new(dead_lettered_total.clone()),
            Box::new(commits_total.clone()),
            Box::new(broker_errors_total.clone()),
            Box::new(subscribed_topics.clone()),
            Box::new(consecutive_failed_batches.clone()),
            Box::new(consumer_healthy.clone()),
            Box::new(backoff_seconds.clone()),
        ] {
            registry.register(metric)?;
        }

        // Start as healthy
        consumer_healthy.set(1);

        Ok(Self {
            registry,
            messages_applied_total,
            messages_skipped_total,
            duplicates_total,
            messages_failed_total,
            dead_lettered_total,
            commits_total,
            broker_errors_total,
            subscribed_topics,
            consecutive_failed_batches,
            consumer_healthy,
            backoff_seconds,
        })
    }

    /// Prometheus text exposition of every registered metric
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
