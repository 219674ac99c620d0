//! Table mapping registry and the row transformer
//!
//! Maps a source table (resolved from the topic `<prefix>.<table>`) to its
//! sink table, renames fields and applies per-field transforms.

use chrono::{DateTime, Utc};
use idempotent_consumer::is_valid_identifier;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, error};

use super::transforms::{is_date_like, parse_timestamp, FieldTransform, SinkValue};
use crate::error::{CdcError, Result};

/// Column injected into every sink row
pub const ETL_TIMESTAMP_COLUMN: &str = "etl_updated_at";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldMapping {
    pub source: String,
    pub sink: String,
    #[serde(default)]
    pub transform: Option<FieldTransform>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TableMapping {
    pub source_table: String,
    pub sink_table: String,
    pub fields: Vec<FieldMapping>,
}

impl TableMapping {
    pub fn new(source_table: impl Into<String>, sink_table: impl Into<String>) -> Self {
        Self {
            source_table: source_table.into(),
            sink_table: sink_table.into(),
            fields: Vec::new(),
        }
    }

    /// Map `source` to `sink` unchanged (or via the date heuristic)
    pub fn field(mut self, source: &str, sink: &str) -> Self {
        self.fields.push(FieldMapping {
            source: source.to_string(),
            sink: sink.to_string(),
            transform: None,
        });
        self
    }

    pub fn field_with(mut self, source: &str, sink: &str, transform: FieldTransform) -> Self {
        self.fields.push(FieldMapping {
            source: source.to_string(),
            sink: sink.to_string(),
            transform: Some(transform),
        });
        self
    }

    pub fn transform_for(&self, field: &str) -> Option<FieldTransform> {
        self.fields
            .iter()
            .find(|f| f.source == field)
            .and_then(|f| f.transform)
    }

    fn validate(&self) -> Result<()> {
        for identifier in [&self.source_table, &self.sink_table] {
            if !is_valid_identifier(identifier) {
                return Err(CdcError::Mapping(format!(
                    "Invalid table name '{}'",
                    identifier
                )));
            }
        }

        if self.fields.is_empty() {
            return Err(CdcError::Mapping(format!(
                "Table '{}' maps no fields",
                self.source_table
            )));
        }

        let mut sink_columns = BTreeSet::new();
        for field in &self.fields {
            if !is_valid_identifier(&field.sink) {
                return Err(CdcError::Mapping(format!(
                    "Invalid column name '{}' in table '{}'",
                    field.sink, self.sink_table
                )));
            }
            if field.sink == ETL_TIMESTAMP_COLUMN || !sink_columns.insert(field.sink.as_str()) {
                return Err(CdcError::Mapping(format!(
                    "Column '{}' mapped more than once in table '{}'",
                    field.sink, self.sink_table
                )));
            }
        }

        Ok(())
    }

    /// Build the sink row from a source "after" image
    ///
    /// Mapped fields absent from the image are written as their transform's
    /// default (or NULL). Unmapped fields are dropped. A date-like field whose
    /// string value cannot be parsed is omitted from the row.
    pub fn apply(&self, after: &Map<String, Value>, now: DateTime<Utc>) -> SinkRow {
        let mut columns = Vec::with_capacity(self.fields.len() + 1);

        for field in &self.fields {
            let raw = after.get(&field.source);

            let value = match (field.transform, raw) {
                (Some(transform), raw) => transform.apply(raw),
                (None, Some(Value::String(s))) if is_date_like(&field.source) => {
                    match parse_timestamp(s) {
                        Some(ts) => SinkValue::Timestamp(ts),
                        None => {
                            error!(
                                table = %self.source_table,
                                field = %field.source,
                                value = %s,
                                "Unparsable date value, column omitted"
                            );
                            continue;
                        }
                    }
                }
                (None, Some(value)) => SinkValue::from_json(value),
                (None, None) => SinkValue::Null,
            };

            columns.push((field.sink.clone(), value));
        }

        columns.push((ETL_TIMESTAMP_COLUMN.to_string(), SinkValue::Timestamp(now)));

        SinkRow {
            table: self.sink_table.clone(),
            columns,
        }
    }
}

/// Transformed row ready for insertion
#[derive(Debug, Clone, PartialEq)]
pub struct SinkRow {
    pub table: String,
    pub columns: Vec<(String, SinkValue)>,
}

impl SinkRow {
    pub fn get(&self, column: &str) -> Option<&SinkValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }
}

/// Immutable set of table mappings, keyed by source table
#[derive(Debug, Clone)]
pub struct MappingRegistry {
    prefix: String,
    tables: BTreeMap<String, TableMapping>,
}

impl MappingRegistry {
    pub fn new(prefix: impl Into<String>, mappings: Vec<TableMapping>) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(CdcError::Mapping("Topic prefix must not be empty".into()));
        }

        let mut tables = BTreeMap::new();
        for mapping in mappings {
            mapping.validate()?;
            let source = mapping.source_table.clone();
            if tables.insert(source.clone(), mapping).is_some() {
                return Err(CdcError::Mapping(format!(
                    "Table '{}' mapped more than once",
                    source
                )));
            }
        }

        debug!(prefix = %prefix, tables = tables.len(), "Mapping registry built");
        Ok(Self { prefix, tables })
    }

    /// Mappings of the online store schema
    pub fn builtin(prefix: impl Into<String>) -> Result<Self> {
        use FieldTransform::{Count, Price, Rating};

        Self::new(
            prefix,
            vec![
                TableMapping::new("users", "users")
                    .field("id", "user_id")
                    .field("first_name", "first_name")
                    .field("last_name", "last_name")
                    .field("age", "user_age")
                    .field("is_verified_email", "is_verified_email")
                    .field("is_active", "is_active")
                    .field("date_joined", "date_joined")
                    .field("last_login", "last_login"),
                TableMapping::new("sellers", "sellers")
                    .field("id", "seller_id")
                    .field("first_name", "first_name")
                    .field("last_name", "last_name"),
                TableMapping::new("products", "products")
                    .field("id", "product_id")
                    .field("product_name", "product_name")
                    .field("main_category", "main_category")
                    .field("sub_category", "sub_category")
                    .field_with("external_ratings", "external_ratings", Rating)
                    .field_with("external_ratings_count", "external_ratings_count", Count)
                    .field_with("external_price", "external_price", Price),
                TableMapping::new("order_items", "order_items")
                    .field("order_id", "order_id")
                    .field("product_id", "product_id")
                    .field("seller_id", "seller_id")
                    .field("quantity", "quantity"),
                TableMapping::new("payments", "payments")
                    .field("order_id", "order_id")
                    .field("amount", "amount")
                    .field("currency", "currency")
                    .field("status", "status")
                    .field("payment_method", "payment_method")
                    .field("created_at", "created_at"),
                TableMapping::new("orders", "orders")
                    .field("id", "order_id")
                    .field("user_id", "user_id")
                    .field("status", "status")
                    .field("created_at", "order_date"),
            ],
        )
    }

    /// Load mappings from a JSON array of table mappings
    pub fn from_json_file(prefix: impl Into<String>, path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            CdcError::Config(format!("Failed to read mappings {}: {}", path.display(), e))
        })?;
        let mappings: Vec<TableMapping> = serde_json::from_str(&text).map_err(|e| {
            CdcError::Config(format!("Invalid mappings {}: {}", path.display(), e))
        })?;
        Self::new(prefix, mappings)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn topic_for(&self, table: &str) -> String {
        format!("{}.{}", self.prefix, table)
    }

    /// Source table encoded in `topic`, if it carries this registry's prefix
    pub fn table_for_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|table| !table.is_empty())
    }

    pub fn resolve(&self, topic: &str) -> Option<&TableMapping> {
        self.table_for_topic(topic)
            .and_then(|table| self.tables.get(table))
    }

    pub fn get(&self, table: &str) -> Option<&TableMapping> {
        self.tables.get(table)
    }

    /// Transform registered for `(table, field)`
    pub fn transform_for(&self, table: &str, field: &str) -> Option<FieldTransform> {
        self.tables.get(table)?.transform_for(field)
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableMapping> {
        self.tables.values()
    }

    /// Topics the loop should subscribe to, restricted to `selected` tables
    /// when given
    pub fn expected_topics(&self, selected: Option<&[String]>) -> Result<BTreeSet<String>> {
        match selected {
            None => Ok(self.tables.keys().map(|t| self.topic_for(t)).collect()),
            Some(selected) => selected
                .iter()
                .map(|table| {
                    if self.tables.contains_key(table) {
                        Ok(self.topic_for(table))
                    } else {
                        Err(CdcError::Config(format!(
                            "CDC_TABLES names unmapped table '{}'",
                            table
                        )))
                    }
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use chrono::TimeZone;
    use serde_json::json;
    use std::str::FromStr;

    fn registry() -> MappingRegistry {
        MappingRegistry::builtin("postgres.public").unwrap()
    }

    fn image(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_resolve() {
        let registry = registry();

        assert_eq!(
            registry.resolve("postgres.public.orders").unwrap().sink_table,
            "orders"
        );
        assert!(registry.resolve("postgres.public.audit_log").is_none());
        assert!(registry.resolve("mysql.shop.orders").is_none());
        assert!(registry.resolve("postgres.publicorders").is_none());
        assert!(registry.resolve("postgres.public.").is_none());
    }

    #[test]
    fn test_transform_lookup_by_table_and_field() {
        let registry = registry();

        assert_eq!(
            registry.transform_for("products", "external_price"),
            Some(FieldTransform::Price)
        );
        assert_eq!(registry.transform_for("products", "product_name"), None);
        assert_eq!(registry.transform_for("orders", "external_price"), None);
        assert_eq!(registry.transform_for("unknown", "external_price"), None);
    }

    #[test]
    fn test_apply_renames_and_drops_unmapped() {
        let now = Utc::now();
        let mapping = registry().get("orders").cloned().unwrap();
        let row = mapping.apply(
            &image(json!({
                "id": 17,
                "user_id": 4,
                "status": "shipped",
                "created_at": "2024-05-02T08:00:00Z",
                "internal_note": "drop me"
            })),
            now,
        );

        assert_eq!(row.table, "orders");
        assert_eq!(
            row.column_names().collect::<Vec<_>>(),
            vec!["order_id", "user_id", "status", "order_date", ETL_TIMESTAMP_COLUMN]
        );
        assert_eq!(row.get("order_id"), Some(&SinkValue::Int(17)));
        assert_eq!(
            row.get("order_date"),
            Some(&SinkValue::Timestamp(
                Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap()
            ))
        );
        assert_eq!(row.get(ETL_TIMESTAMP_COLUMN), Some(&SinkValue::Timestamp(now)));
        assert!(row.get("internal_note").is_none());
    }

    #[test]
    fn test_apply_product_transforms() {
        let mapping = registry().get("products").cloned().unwrap();
        let row = mapping.apply(
            &image(json!({
                "id": 3,
                "product_name": "Kettle",
                "external_price": "1,299.00 ₹",
                "external_ratings": "4.1"
            })),
            Utc::now(),
        );

        assert_eq!(
            row.get("external_price"),
            Some(&SinkValue::Decimal(BigDecimal::from_str("1299.00").unwrap()))
        );
        assert_eq!(row.get("external_ratings"), Some(&SinkValue::Float(4.1)));
        assert_eq!(row.get("external_ratings_count"), Some(&SinkValue::Int(0)));
        assert_eq!(row.get("main_category"), Some(&SinkValue::Null));
    }

    #[test]
    fn test_apply_omits_unparsable_date() {
        let mapping = registry().get("users").cloned().unwrap();
        let row = mapping.apply(
            &image(json!({
                "id": 1,
                "date_joined": "not a date",
                "last_login": null
            })),
            Utc::now(),
        );

        assert!(row.get("date_joined").is_none());
        assert_eq!(row.get("last_login"), Some(&SinkValue::Null));
        assert_eq!(row.get("user_id"), Some(&SinkValue::Int(1)));
    }

    #[test]
    fn test_new_rejects_bad_identifiers_and_duplicates() {
        let bad_table = TableMapping::new("users", "users; DROP TABLE x").field("id", "id");
        assert!(MappingRegistry::new("postgres.public", vec![bad_table]).is_err());

        let bad_column = TableMapping::new("users", "users").field("id", "user id");
        assert!(MappingRegistry::new("postgres.public", vec![bad_column]).is_err());

        let duplicate_column = TableMapping::new("users", "users")
            .field("id", "user_id")
            .field("uid", "user_id");
        assert!(MappingRegistry::new("postgres.public", vec![duplicate_column]).is_err());

        let injected = TableMapping::new("users", "users").field("ts", ETL_TIMESTAMP_COLUMN);
        assert!(MappingRegistry::new("postgres.public", vec![injected]).is_err());

        let twice = vec![
            TableMapping::new("users", "users").field("id", "user_id"),
            TableMapping::new("users", "users_v2").field("id", "user_id"),
        ];
        assert!(MappingRegistry::new("postgres.public", twice).is_err());
    }

    #[test]
    fn test_expected_topics() {
        let registry = registry();

        let all = registry.expected_topics(None).unwrap();
        assert_eq!(all.len(), 6);
        assert!(all.contains("postgres.public.order_items"));

        let selected = registry
            .expected_topics(Some(&["orders".to_string(), "payments".to_string()]))
            .unwrap();
        assert_eq!(
            selected.into_iter().collect::<Vec<_>>(),
            vec!["postgres.public.orders", "postgres.public.payments"]
        );

        assert!(registry
            .expected_topics(Some(&["audit_log".to_string()]))
            .is_err());
    }

    #[test]
    fn test_mappings_from_json() {
        let json = r#"[
            {
                "source_table": "reviews",
                "sink_table": "product_reviews",
                "fields": [
                    {"source": "id", "sink": "review_id"},
                    {"source": "score", "sink": "score", "transform": "rating"}
                ]
            }
        ]"#;
        let mappings: Vec<TableMapping> = serde_json::from_str(json).unwrap();
        let registry = MappingRegistry::new("cdc", mappings).unwrap();

        let mapping = registry.resolve("cdc.reviews").unwrap();
        assert_eq!(mapping.sink_table, "product_reviews");
        assert_eq!(
            registry.transform_for("reviews", "score"),
            Some(FieldTransform::Rating)
        );
    }
}
