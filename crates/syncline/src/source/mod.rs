//! Source engine adapters: discovery, column metadata, primary-key
//! detection and the change-log read path. One implementation per source
//! dialect conforms to [`SourceEngine`]; the physical drivers for the
//! commercial engines live outside this crate, which ships the shared
//! protocol pieces and the scripted in-memory adapter.

mod memory;

use std::{fmt::Debug, future::Future, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use memory::{MemorySource, MemoryTableSpec};
use serde::{Deserialize, Serialize};

use crate::{row::Row, schema::ColumnInfo};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("identifier rejected after sanitization: {0:?}")]
    UnsafeIdentifier(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("malformed change-log record at change_id {change_id}: {message}")]
    MalformedRecord { change_id: i64, message: String },
    #[error("no such table {schema}.{table}")]
    NoSuchTable { schema: String, table: String },
}

/// Source engines a catalog entry can point at.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceDialect {
    Db2,
    Mssql,
    MariaDb,
    Oracle,
    MongoDb,
    Postgres,
}

/// One row-level change as recorded by the source-side change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogRecord {
    /// Monotonically increasing per (schema, table).
    pub change_id: i64,
    pub operation: Operation,
    /// Primary-key values, or `{"_hash": …}` for tables without a key.
    pub pk_values: Row,
    /// Full post-image for inserts/updates, pre-image for deletes.
    #[serde(default)]
    pub row_data: Option<Row>,
    #[serde(default)]
    pub changed_at: Option<DateTime<Utc>>,
}

/// Key the change log uses for tables without a primary key.
pub const ROW_HASH_KEY: &str = "_hash";

impl ChangeLogRecord {
    pub fn row_hash(&self) -> Option<&str> {
        self.pk_values.get(ROW_HASH_KEY).and_then(|v| v.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
pub enum Operation {
    #[serde(rename = "I")]
    #[strum(serialize = "I")]
    Insert,
    #[serde(rename = "U")]
    #[strum(serialize = "U")]
    Update,
    #[serde(rename = "D")]
    #[strum(serialize = "D")]
    Delete,
}

/// A table surfaced by source discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredTable {
    pub schema: String,
    pub table: String,
    pub connection: String,
}

/// Adapter over one source database.
#[async_trait]
pub trait SourceEngine: Send + Sync + Debug {
    fn dialect(&self) -> SourceDialect;

    /// Connection descriptor as registered in the catalog.
    fn connection(&self) -> &str;

    async fn test_connection(&self) -> Result<bool, SourceError>;

    async fn discover_tables(&self) -> Result<Vec<DiscoveredTable>, SourceError>;

    /// Ordered primary-key columns; empty when the table has none.
    async fn detect_primary_key(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<String>, SourceError>;

    /// Best time-ordering candidate column; a fallback ordering hint only.
    async fn detect_time_column(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Option<String>, SourceError>;

    /// Ordered columns with target types already mapped to the canonical
    /// vocabulary.
    async fn get_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>, SourceError>;

    async fn count_rows(&self, schema: &str, table: &str) -> Result<i64, SourceError>;

    /// Source rows for the full-load path, paged by (offset, limit).
    async fn read_rows(
        &self,
        schema: &str,
        table: &str,
        offset: i64,
        limit: usize,
    ) -> Result<Vec<Row>, SourceError>;

    /// Change-log records strictly greater than `since_change_id`, ordered
    /// ascending, at most `max_rows`.
    async fn read_changes(
        &self,
        schema: &str,
        table: &str,
        since_change_id: i64,
        max_rows: usize,
    ) -> Result<Vec<ChangeLogRecord>, SourceError>;

    /// Install the change-log table and per-table triggers where the dialect
    /// supports them. Returns the current change-log high watermark so the
    /// first incremental run starts after the full load snapshot.
    async fn install_change_capture(&self, schema: &str, table: &str) -> Result<i64, SourceError>;
}

/// Ordered candidates for [`SourceEngine::detect_time_column`].
pub const TIME_COLUMN_CANDIDATES: &[&str] = &[
    "created_at",
    "updated_at",
    "last_modified",
    "modified_at",
    "created_date",
    "updated_date",
    "timestamp",
    "date_created",
    "date_modified",
];

/// Filter an identifier down to the printable-ASCII safe set used in
/// catalog-query SQL, doubling embedded single quotes. Statement
/// metacharacters are stripped outright; an identifier that sanitizes to
/// nothing aborts the operation.
pub fn sanitize_identifier(ident: &str) -> Result<String, SourceError> {
    let mut safe = String::with_capacity(ident.len());
    for c in ident.chars() {
        match c {
            '\'' => safe.push_str("''"),
            ';' | '\\' | '/' => {}
            c if (' '..='~').contains(&c) => safe.push(c),
            _ => {}
        }
    }
    if safe.trim().is_empty() {
        return Err(SourceError::UnsafeIdentifier(ident.to_string()));
    }
    Ok(safe)
}

/// Connection-open retry policy: 3 attempts, exponential backoff from 100 ms.
pub async fn retry_connect<T, E, F, Fut>(open: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    tryhard::retry_fn(open)
        .retries(2)
        .exponential_backoff(Duration::from_millis(100))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_passes_plain_identifiers() {
        assert_eq!(sanitize_identifier("ORDERS").unwrap(), "ORDERS");
        assert_eq!(sanitize_identifier("sales_2024").unwrap(), "sales_2024");
    }

    #[test]
    fn test_sanitize_doubles_quotes_and_strips_metacharacters() {
        assert_eq!(sanitize_identifier("o'brien").unwrap(), "o''brien");
        assert_eq!(sanitize_identifier("a;b\\c/d").unwrap(), "abcd");
        assert_eq!(sanitize_identifier("t\u{7}ab\u{fc}le").unwrap(), "table");
    }

    #[test]
    fn test_sanitize_rejects_empty_result() {
        assert!(matches!(
            sanitize_identifier(";;\\"),
            Err(SourceError::UnsafeIdentifier(_))
        ));
        assert!(matches!(
            sanitize_identifier("\u{fc}\u{e9}"),
            Err(SourceError::UnsafeIdentifier(_))
        ));
    }

    #[test]
    fn test_operation_wire_form() {
        assert_eq!(serde_json::to_string(&Operation::Insert).unwrap(), "\"I\"");
        assert_eq!(
            serde_json::from_str::<Operation>("\"D\"").unwrap(),
            Operation::Delete
        );
    }

    #[tokio::test]
    async fn test_retry_connect_eventually_succeeds() {
        let mut attempts = 0;
        let result: Result<u32, &str> = retry_connect(|| {
            attempts += 1;
            let attempt = attempts;
            async move {
                if attempt < 3 {
                    Err("refused")
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_connect_gives_up_after_three_attempts() {
        let mut attempts = 0;
        let result: Result<u32, &str> = retry_connect(|| {
            attempts += 1;
            async { Err("refused") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts, 3);
    }
}
