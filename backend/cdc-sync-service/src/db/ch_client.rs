use clickhouse::Client;
use tracing::{debug, error};

use crate::config::CdcConfig;
use crate::error::Result;

/// ClickHouse client wrapper shared by the row sink and the ledger
#[derive(Clone)]
pub struct ClickHouseClient {
    client: Client,
}

impl ClickHouseClient {
    /// Create a client with write permissions
    ///
    /// `date_time_input_format = best_effort` lets bound timestamp and
    /// decimal strings land in `DateTime`/`Decimal` columns.
    pub fn new(url: &str, database: &str, username: &str, password: &str) -> Self {
        let client = Client::default()
            .with_url(url)
            .with_database(database)
            .with_user(username)
            .with_password(password)
            .with_option("date_time_input_format", "best_effort");

        Self { client }
    }

    pub fn from_config(config: &CdcConfig) -> Self {
        Self::new(
            &config.clickhouse_url,
            &config.clickhouse_db,
            &config.clickhouse_user,
            &config.clickhouse_password,
        )
    }

    /// Underlying client, for components that build their own queries
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Execute a statement without result rows (DDL, ad-hoc maintenance)
    pub async fn execute(&self, query: &str) -> Result<()> {
        debug!(
            "Executing ClickHouse statement (first 200 chars): {}",
            query.chars().take(200).collect::<String>()
        );

        self.client.query(query).execute().await.map_err(|e| {
            error!("ClickHouse execute failed: {}", e);
            e.into()
        })
    }

    /// Health check - verifies ClickHouse connection is alive
    pub async fn health_check(&self) -> Result<()> {
        #[derive(clickhouse::Row, serde::Deserialize)]
        struct HealthCheck {
            #[allow(dead_code)]
            result: u8,
        }

        self.client
            .query("SELECT 1 AS result")
            .fetch_one::<HealthCheck>()
            .await
            .map(|_| ())
            .map_err(|e| {
                error!("ClickHouse health check failed: {}", e);
                e.into()
            })
    }
}
