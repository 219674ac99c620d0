use async_trait::async_trait;
use idempotent_consumer::is_valid_identifier;
use tracing::{debug, error};

use super::mapping::SinkRow;
use crate::db::ClickHouseClient;
use crate::error::{CdcError, Result};

/// Analytics store receiving transformed rows
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Insert one row; returns only after the write is acknowledged
    async fn insert_row(&self, row: &SinkRow) -> Result<()>;
}

/// `INSERT INTO t (a, b) VALUES (?, ?)` for the row's columns
pub fn insert_sql(row: &SinkRow) -> Result<String> {
    if !is_valid_identifier(&row.table) {
        return Err(CdcError::Mapping(format!(
            "Invalid sink table '{}'",
            row.table
        )));
    }
    if row.columns.is_empty() {
        return Err(CdcError::Mapping(format!(
            "Row for '{}' has no columns",
            row.table
        )));
    }

    let mut columns = Vec::with_capacity(row.columns.len());
    for name in row.column_names() {
        if !is_valid_identifier(name) {
            return Err(CdcError::Mapping(format!(
                "Invalid column '{}' for sink table '{}'",
                name, row.table
            )));
        }
        columns.push(format!("`{}`", name));
    }

    let placeholders = vec!["?"; columns.len()].join(", ");
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ({})",
        row.table,
        columns.join(", "),
        placeholders
    ))
}

#[async_trait]
impl AnalyticsSink for ClickHouseClient {
    async fn insert_row(&self, row: &SinkRow) -> Result<()> {
        let sql = insert_sql(row)?;

        let mut query = self.inner().query(&sql);
        for (_, value) in &row.columns {
            query = query.bind(value);
        }

        query.execute().await.map_err(|e| {
            error!(table = %row.table, "ClickHouse insert error: {}", e);
            CdcError::ClickHouse(e)
        })?;

        debug!(table = %row.table, columns = row.columns.len(), "Inserted CDC row");
        Ok(())
    }
}
