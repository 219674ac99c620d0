//! Integration tests for the offset ledger
//!
//! These tests verify:
//! 1. Bootstrap of the `processed_messages` table
//! 2. Marking and checking `(topic, partition, offset)` keys
//! 3. Duplicate marks collapse to one live entry
//! 4. Concurrent checks against a shared store
//!
//! ClickHouse-backed tests are ignored by default.
//!
//! Run tests:
//! ```bash
//! export CLICKHOUSE_URL="http://localhost:8123"
//! cargo test --package idempotent-consumer --test integration_test -- --ignored --nocapture
//! ```
//!
//! Start a test server:
//! ```bash
//! docker run --name clickhouse-test -p 8123:8123 -d clickhouse/clickhouse-server:24.3
//! ```

use clickhouse::{Client, Row};
use idempotent_consumer::{
    ClickHouseLedger, IdempotencyGuard, InMemoryLedger, LedgerStore, MessageKey,
};
use serde::Deserialize;
use std::env;
use std::sync::Arc;

const TEST_TABLE: &str = "processed_messages_it";

fn clickhouse_client() -> Client {
    Client::default()
        .with_url(env::var("CLICKHOUSE_URL").unwrap_or_else(|_| "http://localhost:8123".into()))
        .with_user(env::var("CLICKHOUSE_USER").unwrap_or_else(|_| "default".into()))
        .with_password(env::var("CLICKHOUSE_PASSWORD").unwrap_or_default())
}

async fn fresh_ledger(client: &Client) -> IdempotencyGuard<ClickHouseLedger> {
    client
        .query(&format!("DROP TABLE IF EXISTS {}", TEST_TABLE))
        .execute()
        .await
        .expect("Failed to drop test ledger table");

    let store = ClickHouseLedger::new(client.clone())
        .with_table(TEST_TABLE)
        .expect("valid table name");
    let guard = IdempotencyGuard::new(store);
    guard.initialize().await.expect("Failed to create ledger table");
    guard
}

#[derive(Debug, Row, Deserialize)]
struct Count {
    n: u64,
}

/// Test: new key is not processed, marked key is
#[ignore = "Requires ClickHouse"]
#[tokio::test]
async fn test_clickhouse_mark_and_check() {
    let client = clickhouse_client();
    let guard = fresh_ledger(&client).await;
    let key = MessageKey::new("postgres.public.orders", 0, 100);

    assert!(!guard.is_processed(&key).await.expect("check failed"));

    guard.mark_processed(&key).await.expect("mark failed");

    assert!(guard.is_processed(&key).await.expect("check failed"));
    assert!(!guard
        .is_processed(&MessageKey::new("postgres.public.orders", 1, 100))
        .await
        .expect("check failed"));
}

/// Test: bootstrap is idempotent and duplicates collapse after merge
#[ignore = "Requires ClickHouse"]
#[tokio::test]
async fn test_clickhouse_duplicate_marks_collapse() {
    let client = clickhouse_client();
    let guard = fresh_ledger(&client).await;
    guard.initialize().await.expect("second bootstrap failed");

    let key = MessageKey::new("postgres.public.users", 3, 7);
    guard.mark_processed(&key).await.expect("mark failed");
    guard.mark_processed(&key).await.expect("duplicate mark failed");

    let row = client
        .query(&format!("SELECT count() AS n FROM {} FINAL", TEST_TABLE))
        .fetch_one::<Count>()
        .await
        .expect("count failed");

    assert_eq!(row.n, 1, "FINAL must collapse duplicate ledger rows");
}

/// Test: a shared in-memory store answers concurrent checks consistently
#[tokio::test]
async fn test_concurrent_checks_on_shared_store() {
    let store = Arc::new(InMemoryLedger::new());
    let guard = IdempotencyGuard::new(Arc::clone(&store));

    for offset in 0..10 {
        guard
            .mark_processed(&MessageKey::new("postgres.public.payments", 0, offset))
            .await
            .expect("mark failed");
    }

    let checks = (0..20).map(|offset| {
        let store = Arc::clone(&store);
        async move {
            store
                .contains(&MessageKey::new("postgres.public.payments", 0, offset))
                .await
                .expect("check failed")
        }
    });
    let results = futures_util::future::join_all(checks).await;

    assert_eq!(results.iter().filter(|hit| **hit).count(), 10);
    assert!(results[..10].iter().all(|hit| *hit));
    assert!(results[10..].iter().all(|hit| !*hit));
}
