use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;

use super::{
    ChangeLogRecord, DiscoveredTable, Operation, SourceDialect, SourceEngine, SourceError,
    TIME_COLUMN_CANDIDATES,
};
use crate::{row::Row, schema::ColumnInfo};

/// Scripted in-memory source. Backs worker tests and the embedded mode:
/// tables carry columns, a primary key, rows for the full-load path and an
/// explicit change log for the incremental path.
#[derive(Debug)]
pub struct MemorySource {
    dialect: SourceDialect,
    connection: String,
    tables: Mutex<BTreeMap<(String, String), MemoryTableSpec>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTableSpec {
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Vec<String>,
    pub rows: Vec<Row>,
    pub change_log: Vec<ChangeLogRecord>,
    pub capture_installed: bool,
}

impl MemorySource {
    pub fn new(dialect: SourceDialect, connection: impl Into<String>) -> Self {
        Self {
            dialect,
            connection: connection.into(),
            tables: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn add_table(&self, schema: &str, table: &str, spec: MemoryTableSpec) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.insert((schema.to_string(), table.to_string()), spec);
        }
    }

    /// Append a change-log record; change ids are assigned monotonically.
    pub fn push_change(
        &self,
        schema: &str,
        table: &str,
        operation: Operation,
        pk_values: Row,
        row_data: Option<Row>,
    ) -> i64 {
        let mut tables = self.tables.lock().expect("memory source poisoned");
        let spec = tables
            .entry((schema.to_string(), table.to_string()))
            .or_default();
        let change_id = spec.change_log.last().map_or(1, |r| r.change_id + 1);
        spec.change_log.push(ChangeLogRecord {
            change_id,
            operation,
            pk_values,
            row_data,
            changed_at: None,
        });
        change_id
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<(String, String), MemoryTableSpec>> {
        self.tables.lock().expect("memory source poisoned")
    }

    fn with_table<R>(
        &self,
        schema: &str,
        table: &str,
        f: impl FnOnce(&MemoryTableSpec) -> R,
    ) -> Result<R, SourceError> {
        let tables = self.lock();
        tables
            .get(&(schema.to_string(), table.to_string()))
            .map(f)
            .ok_or_else(|| SourceError::NoSuchTable {
                schema: schema.to_string(),
                table: table.to_string(),
            })
    }
}

#[async_trait]
impl SourceEngine for MemorySource {
    fn dialect(&self) -> SourceDialect {
        self.dialect
    }

    fn connection(&self) -> &str {
        &self.connection
    }

    async fn test_connection(&self) -> Result<bool, SourceError> {
        Ok(true)
    }

    async fn discover_tables(&self) -> Result<Vec<DiscoveredTable>, SourceError> {
        Ok(self
            .lock()
            .keys()
            .map(|(schema, table)| DiscoveredTable {
                schema: schema.clone(),
                table: table.clone(),
                connection: self.connection.clone(),
            })
            .collect())
    }

    async fn detect_primary_key(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<String>, SourceError> {
        self.with_table(schema, table, |t| t.primary_key.clone())
    }

    async fn detect_time_column(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Option<String>, SourceError> {
        self.with_table(schema, table, |t| {
            TIME_COLUMN_CANDIDATES
                .iter()
                .find(|candidate| {
                    t.columns
                        .iter()
                        .any(|c| c.name.eq_ignore_ascii_case(candidate))
                })
                .map(|c| (*c).to_string())
        })
    }

    async fn get_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>, SourceError> {
        self.with_table(schema, table, |t| t.columns.clone())
    }

    async fn count_rows(&self, schema: &str, table: &str) -> Result<i64, SourceError> {
        self.with_table(schema, table, |t| t.rows.len() as i64)
    }

    async fn read_rows(
        &self,
        schema: &str,
        table: &str,
        offset: i64,
        limit: usize,
    ) -> Result<Vec<Row>, SourceError> {
        self.with_table(schema, table, |t| {
            t.rows
                .iter()
                .skip(usize::try_from(offset).unwrap_or(0))
                .take(limit)
                .cloned()
                .collect()
        })
    }

    async fn read_changes(
        &self,
        schema: &str,
        table: &str,
        since_change_id: i64,
        max_rows: usize,
    ) -> Result<Vec<ChangeLogRecord>, SourceError> {
        self.with_table(schema, table, |t| {
            t.change_log
                .iter()
                .filter(|r| r.change_id > since_change_id)
                .take(max_rows)
                .cloned()
                .collect()
        })
    }

    async fn install_change_capture(&self, schema: &str, table: &str) -> Result<i64, SourceError> {
        let mut tables = self.lock();
        let spec = tables
            .get_mut(&(schema.to_string(), table.to_string()))
            .ok_or_else(|| SourceError::NoSuchTable {
                schema: schema.to_string(),
                table: table.to_string(),
            })?;
        spec.capture_installed = true;
        Ok(spec.change_log.last().map_or(0, |r| r.change_id))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::row::row_of;

    fn source_with_table() -> MemorySource {
        let source = MemorySource::new(SourceDialect::MariaDb, "maria://test");
        source.add_table(
            "shop",
            "orders",
            MemoryTableSpec {
                columns: vec![
                    ColumnInfo::new("id", "BIGINT", false).primary_key(),
                    ColumnInfo::new("updated_at", "TIMESTAMP", true),
                ],
                primary_key: vec!["id".to_string()],
                rows: vec![row_of(&[("id", json!(1))]), row_of(&[("id", json!(2))])],
                ..MemoryTableSpec::default()
            },
        );
        source
    }

    #[tokio::test]
    async fn test_change_ids_are_monotone() {
        let source = source_with_table();
        let first = source.push_change(
            "shop",
            "orders",
            Operation::Insert,
            row_of(&[("id", json!(3))]),
            Some(row_of(&[("id", json!(3))])),
        );
        let second = source.push_change(
            "shop",
            "orders",
            Operation::Delete,
            row_of(&[("id", json!(3))]),
            None,
        );
        assert!(second > first);

        let changes = source.read_changes("shop", "orders", first, 10).await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].operation, Operation::Delete);
    }

    #[tokio::test]
    async fn test_time_column_detection_prefers_candidate_order() {
        let source = source_with_table();
        assert_eq!(
            source.detect_time_column("shop", "orders").await.unwrap(),
            Some("updated_at".to_string())
        );
    }

    #[tokio::test]
    async fn test_paged_reads() {
        let source = source_with_table();
        let page = source.read_rows("shop", "orders", 1, 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0]["id"], json!(2));
    }

    #[tokio::test]
    async fn test_install_capture_returns_watermark() {
        let source = source_with_table();
        assert_eq!(source.install_change_capture("shop", "orders").await.unwrap(), 0);
        source.push_change(
            "shop",
            "orders",
            Operation::Insert,
            row_of(&[("id", json!(9))]),
            Some(row_of(&[("id", json!(9))])),
        );
        assert_eq!(source.install_change_capture("shop", "orders").await.unwrap(), 1);
    }
}
