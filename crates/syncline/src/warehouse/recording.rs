//! Test and dry-run doubles for the warehouse seam: an executor that records
//! every statement and serves scripted query results, plus a fully stateful
//! in-memory engine that behaves like a tiny target store.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use super::{
    dialect::Dialect, EngineError, PostgresDialect, SqlExecutor, SqlWarehouseEngine,
    WarehouseDialect, WarehouseEngine,
};
use crate::{
    row::{Row, Value},
    schema::ColumnInfo,
};

/// Records SQL text and replays scripted results. Queries are matched by
/// substring against the scripted patterns, first match wins.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    inner: Mutex<RecordingState>,
}

#[derive(Debug, Default)]
struct RecordingState {
    statements: Vec<String>,
    scripted: Vec<(String, Vec<Row>)>,
    fail_matching: Option<String>,
}

impl RecordingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Engine over this executor with postgres quoting, the common setup in
    /// tests that only assert on the emitted SQL.
    pub fn engine(self: &Arc<Self>) -> SqlWarehouseEngine<PostgresDialect> {
        SqlWarehouseEngine::new(PostgresDialect, self.clone() as Arc<dyn SqlExecutor>)
    }

    pub fn script_query(&self, pattern: impl Into<String>, rows: Vec<Row>) {
        self.inner
            .lock()
            .expect("recording executor poisoned")
            .scripted
            .insert(0, (pattern.into(), rows));
    }

    /// Make any statement containing `pattern` fail.
    pub fn fail_matching(&self, pattern: impl Into<String>) {
        self.inner
            .lock()
            .expect("recording executor poisoned")
            .fail_matching = Some(pattern.into());
    }

    pub fn statements(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("recording executor poisoned")
            .statements
            .clone()
    }
}

#[async_trait]
impl SqlExecutor for RecordingExecutor {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, EngineError> {
        let mut state = self.inner.lock().expect("recording executor poisoned");
        if let Some(pattern) = &state.fail_matching {
            if sql.contains(pattern.as_str()) {
                return Err(EngineError::statement(format!("scripted failure: {sql}")));
            }
        }
        state.statements.push(sql.to_string());
        for (pattern, rows) in &state.scripted {
            if sql.contains(pattern.as_str()) {
                return Ok(rows.clone());
            }
        }
        Ok(Vec::new())
    }

    async fn execute(&self, sql: &str) -> Result<u64, EngineError> {
        let mut state = self.inner.lock().expect("recording executor poisoned");
        if let Some(pattern) = &state.fail_matching {
            if sql.contains(pattern.as_str()) {
                return Err(EngineError::statement(format!("scripted failure: {sql}")));
            }
        }
        state.statements.push(sql.to_string());
        Ok(1)
    }
}

/// Stateful in-memory target. Honors table DDL, inserts, keyed upserts and
/// deletes, so replication and builder flows can be exercised end to end
/// without a live warehouse. `execute_query` serves scripted results only.
#[derive(Debug, Default)]
pub struct RecordingEngine {
    inner: Mutex<EngineState>,
}

#[derive(Debug, Default)]
struct EngineState {
    schemas: Vec<String>,
    tables: BTreeMap<(String, String), MemoryTable>,
    scripted: Vec<(String, Vec<Row>)>,
    statements: Vec<String>,
}

#[derive(Debug, Default, Clone)]
struct MemoryTable {
    columns: Vec<ColumnInfo>,
    primary_keys: Vec<String>,
    rows: Vec<Row>,
}

impl RecordingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_query(&self, pattern: impl Into<String>, rows: Vec<Row>) {
        self.inner
            .lock()
            .expect("memory engine poisoned")
            .scripted
            .insert(0, (pattern.into(), rows));
    }

    pub fn rows(&self, schema: &str, table: &str) -> Vec<Row> {
        self.inner
            .lock()
            .expect("memory engine poisoned")
            .tables
            .get(&key(schema, table))
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn primary_keys(&self, schema: &str, table: &str) -> Vec<String> {
        self.inner
            .lock()
            .expect("memory engine poisoned")
            .tables
            .get(&key(schema, table))
            .map(|t| t.primary_keys.clone())
            .unwrap_or_default()
    }

    pub fn statements(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("memory engine poisoned")
            .statements
            .clone()
    }

    fn with_table<R>(
        &self,
        schema: &str,
        table: &str,
        f: impl FnOnce(&mut MemoryTable) -> R,
    ) -> Result<R, EngineError> {
        let mut state = self.inner.lock().expect("memory engine poisoned");
        let table = state
            .tables
            .get_mut(&key(schema, table))
            .ok_or_else(|| EngineError::statement(format!("no such table {schema}.{table}")))?;
        Ok(f(table))
    }
}

fn key(schema: &str, table: &str) -> (String, String) {
    (schema.to_lowercase(), table.to_lowercase())
}

fn row_from_values(columns: &[String], values: &[Value]) -> Row {
    columns
        .iter()
        .cloned()
        .zip(values.iter().cloned())
        .collect()
}

fn key_tuple(row: &Row, key_columns: &[String]) -> Vec<Value> {
    key_columns
        .iter()
        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
        .collect()
}

#[async_trait]
impl WarehouseEngine for RecordingEngine {
    fn dialect(&self) -> WarehouseDialect {
        WarehouseDialect::Postgres
    }

    async fn test_connection(&self) -> Result<bool, EngineError> {
        Ok(true)
    }

    async fn create_schema(&self, schema: &str) -> Result<(), EngineError> {
        let mut state = self.inner.lock().expect("memory engine poisoned");
        let schema = schema.to_lowercase();
        if !state.schemas.contains(&schema) {
            state.schemas.push(schema);
        }
        Ok(())
    }

    async fn create_table(
        &self,
        schema: &str,
        table: &str,
        columns: &[ColumnInfo],
        primary_keys: &[String],
    ) -> Result<(), EngineError> {
        let mut state = self.inner.lock().expect("memory engine poisoned");
        state.tables.entry(key(schema, table)).or_insert(MemoryTable {
            columns: columns.to_vec(),
            primary_keys: primary_keys.to_vec(),
            rows: Vec::new(),
        });
        Ok(())
    }

    async fn drop_table(&self, schema: &str, table: &str) -> Result<(), EngineError> {
        self.inner
            .lock()
            .expect("memory engine poisoned")
            .tables
            .remove(&key(schema, table));
        Ok(())
    }

    async fn truncate_table(&self, schema: &str, table: &str) -> Result<(), EngineError> {
        self.with_table(schema, table, |t| t.rows.clear())
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool, EngineError> {
        Ok(self
            .inner
            .lock()
            .expect("memory engine poisoned")
            .tables
            .contains_key(&key(schema, table)))
    }

    async fn count_rows(&self, schema: &str, table: &str) -> Result<i64, EngineError> {
        self.with_table(schema, table, |t| t.rows.len() as i64)
    }

    async fn table_columns(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ColumnInfo>, EngineError> {
        Ok(self
            .inner
            .lock()
            .expect("memory engine poisoned")
            .tables
            .get(&key(schema, table))
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    async fn add_column(
        &self,
        schema: &str,
        table: &str,
        column: &ColumnInfo,
    ) -> Result<(), EngineError> {
        self.with_table(schema, table, |t| {
            t.columns.push(column.clone());
            for row in &mut t.rows {
                row.insert(column.name.to_lowercase(), Value::Null);
            }
        })
    }

    async fn drop_column(
        &self,
        schema: &str,
        table: &str,
        column: &str,
    ) -> Result<(), EngineError> {
        let column = column.to_lowercase();
        self.with_table(schema, table, |t| {
            t.columns.retain(|c| c.name.to_lowercase() != column);
            for row in &mut t.rows {
                row.remove(&column);
            }
        })
    }

    async fn alter_column(
        &self,
        schema: &str,
        table: &str,
        _from: &ColumnInfo,
        to: &ColumnInfo,
    ) -> Result<(), EngineError> {
        self.with_table(schema, table, |t| {
            if let Some(col) = t
                .columns
                .iter_mut()
                .find(|c| c.name.eq_ignore_ascii_case(&to.name))
            {
                col.target_type.clone_from(&to.target_type);
                col.nullable = to.nullable;
            }
        })
    }

    async fn insert_rows(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64, EngineError> {
        self.with_table(schema, table, |t| {
            for values in rows {
                t.rows.push(row_from_values(columns, values));
            }
            rows.len() as u64
        })
    }

    async fn upsert_rows(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        primary_keys: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64, EngineError> {
        self.with_table(schema, table, |t| {
            for values in rows {
                let incoming = row_from_values(columns, values);
                let incoming_key = key_tuple(&incoming, primary_keys);
                match t
                    .rows
                    .iter_mut()
                    .find(|r| key_tuple(r, primary_keys) == incoming_key)
                {
                    Some(existing) => *existing = incoming,
                    None => t.rows.push(incoming),
                }
            }
            rows.len() as u64
        })
    }

    async fn delete_rows(
        &self,
        schema: &str,
        table: &str,
        key_columns: &[String],
        keys: &[Vec<Value>],
    ) -> Result<u64, EngineError> {
        self.with_table(schema, table, |t| {
            let before = t.rows.len();
            t.rows
                .retain(|r| !keys.contains(&key_tuple(r, key_columns)));
            (before - t.rows.len()) as u64
        })
    }

    async fn create_index(
        &self,
        _schema: &str,
        _table: &str,
        _columns: &[String],
        _name: Option<&str>,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn create_partition(
        &self,
        _schema: &str,
        _table: &str,
        _partition_column: &str,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    async fn select_rows(&self, schema: &str, table: &str) -> Result<Vec<Row>, EngineError> {
        Ok(self.rows(schema, table))
    }

    async fn execute_query(&self, sql: &str) -> Result<Vec<Row>, EngineError> {
        let mut state = self.inner.lock().expect("memory engine poisoned");
        state.statements.push(sql.to_string());
        for (pattern, rows) in &state.scripted {
            if sql.contains(pattern.as_str()) {
                return Ok(rows.clone());
            }
        }
        Ok(Vec::new())
    }

    async fn execute_statement(&self, sql: &str) -> Result<u64, EngineError> {
        self.inner
            .lock()
            .expect("memory engine poisoned")
            .statements
            .push(sql.to_string());
        Ok(0)
    }

    fn quote_identifier(&self, ident: &str) -> String {
        PostgresDialect.quote_identifier(ident)
    }

    fn quote_value(&self, value: &Value) -> String {
        PostgresDialect.quote_value(value)
    }

    fn map_type(&self, canonical: &str) -> String {
        PostgresDialect.map_type(canonical)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_upsert_replaces_by_key() {
        let engine = RecordingEngine::new();
        engine
            .create_table(
                "s",
                "t",
                &[
                    ColumnInfo::new("id", "BIGINT", false).primary_key(),
                    ColumnInfo::new("v", "TEXT", true),
                ],
                &["id".to_string()],
            )
            .await
            .unwrap();
        let cols = vec!["id".to_string(), "v".to_string()];
        engine
            .upsert_rows("s", "t", &cols, &["id".to_string()], &[vec![json!(1), json!("a")]])
            .await
            .unwrap();
        engine
            .upsert_rows("s", "t", &cols, &["id".to_string()], &[vec![json!(1), json!("b")]])
            .await
            .unwrap();
        let rows = engine.rows("s", "t");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["v"], json!("b"));
    }

    #[tokio::test]
    async fn test_delete_by_key_tuple() {
        let engine = RecordingEngine::new();
        engine
            .create_table("s", "t", &[ColumnInfo::new("id", "BIGINT", false)], &[])
            .await
            .unwrap();
        engine
            .insert_rows("s", "t", &["id".to_string()], &[vec![json!(1)], vec![json!(2)]])
            .await
            .unwrap();
        let deleted = engine
            .delete_rows("s", "t", &["id".to_string()], &[vec![json!(1)]])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(engine.rows("s", "t").len(), 1);
    }
}
