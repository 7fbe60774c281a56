//! Target warehouse engine: one polymorphic interface over the supported
//! analytical stores. Dialect implementations own identifier quoting, the
//! canonical→native type mapping and the idempotent upsert strategy; all of
//! them emit SQL text through a pluggable [`SqlExecutor`] so the statements
//! themselves are the tested artifact.

mod bigquery;
mod dialect;
mod postgres;
mod recording;
mod redshift;
mod snowflake;

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
pub use bigquery::BigQueryDialect;
pub use dialect::Dialect;
pub use postgres::PostgresDialect;
pub use recording::{RecordingEngine, RecordingExecutor};
pub use redshift::RedshiftDialect;
use serde::{Deserialize, Serialize};
pub use snowflake::SnowflakeDialect;

use crate::{
    row::{Row, Value},
    schema::ColumnInfo,
};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("statement failed: {message}")]
    Statement {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("unexpected result shape: {0}")]
    ResultShape(String),
}

impl EngineError {
    pub fn statement(message: impl Into<String>) -> Self {
        Self::Statement {
            message: message.into(),
            source: None,
        }
    }

    pub fn statement_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Statement {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum WarehouseDialect {
    Postgres,
    BigQuery,
    Redshift,
    Snowflake,
}

/// Executes SQL text against a concrete store. The postgres implementation
/// lives behind the `sqlx` feature; cloud warehouses are driven through
/// whatever executor the integration supplies.
#[async_trait]
pub trait SqlExecutor: Send + Sync + Debug {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, EngineError>;
    async fn execute(&self, sql: &str) -> Result<u64, EngineError>;
}

/// The polymorphic target interface shared by every warehouse dialect.
#[async_trait]
pub trait WarehouseEngine: Send + Sync + Debug {
    fn dialect(&self) -> WarehouseDialect;

    async fn test_connection(&self) -> Result<bool, EngineError>;
    async fn create_schema(&self, schema: &str) -> Result<(), EngineError>;
    async fn create_table(
        &self,
        schema: &str,
        table: &str,
        columns: &[ColumnInfo],
        primary_keys: &[String],
    ) -> Result<(), EngineError>;
    async fn drop_table(&self, schema: &str, table: &str) -> Result<(), EngineError>;
    async fn truncate_table(&self, schema: &str, table: &str) -> Result<(), EngineError>;
    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool, EngineError>;
    async fn count_rows(&self, schema: &str, table: &str) -> Result<i64, EngineError>;
    async fn table_columns(&self, schema: &str, table: &str)
        -> Result<Vec<ColumnInfo>, EngineError>;
    async fn add_column(
        &self,
        schema: &str,
        table: &str,
        column: &ColumnInfo,
    ) -> Result<(), EngineError>;
    async fn drop_column(&self, schema: &str, table: &str, column: &str)
        -> Result<(), EngineError>;
    async fn alter_column(
        &self,
        schema: &str,
        table: &str,
        from: &ColumnInfo,
        to: &ColumnInfo,
    ) -> Result<(), EngineError>;
    /// Best-effort batched insert.
    async fn insert_rows(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64, EngineError>;
    /// Idempotent insert-or-update keyed on `primary_keys`.
    async fn upsert_rows(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        primary_keys: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64, EngineError>;
    async fn delete_rows(
        &self,
        schema: &str,
        table: &str,
        key_columns: &[String],
        keys: &[Vec<Value>],
    ) -> Result<u64, EngineError>;
    /// No-op on engines without secondary indexes (BigQuery clusters at
    /// table creation instead).
    async fn create_index(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        name: Option<&str>,
    ) -> Result<(), EngineError>;
    /// No-op where the engine has no explicit partition DDL.
    async fn create_partition(
        &self,
        schema: &str,
        table: &str,
        partition_column: &str,
    ) -> Result<(), EngineError>;
    /// Full-table read, used by the builders to resolve current dimension
    /// and vault rows.
    async fn select_rows(&self, schema: &str, table: &str) -> Result<Vec<Row>, EngineError>;
    async fn execute_query(&self, sql: &str) -> Result<Vec<Row>, EngineError>;
    async fn execute_statement(&self, sql: &str) -> Result<u64, EngineError>;

    fn quote_identifier(&self, ident: &str) -> String;
    fn quote_value(&self, value: &Value) -> String;
    fn map_type(&self, canonical: &str) -> String;
}

/// Generic engine over a [`Dialect`]: every operation lowers to SQL text
/// produced by the dialect and runs through the executor.
#[derive(Debug)]
pub struct SqlWarehouseEngine<D: Dialect> {
    dialect: D,
    executor: Arc<dyn SqlExecutor>,
}

impl<D: Dialect> SqlWarehouseEngine<D> {
    pub fn new(dialect: D, executor: Arc<dyn SqlExecutor>) -> Self {
        Self { dialect, executor }
    }
}

/// Construct the engine for a dialect selector over the given executor.
pub fn new_engine(
    dialect: WarehouseDialect,
    executor: Arc<dyn SqlExecutor>,
) -> Arc<dyn WarehouseEngine> {
    match dialect {
        WarehouseDialect::Postgres => Arc::new(SqlWarehouseEngine::new(PostgresDialect, executor)),
        WarehouseDialect::BigQuery => Arc::new(SqlWarehouseEngine::new(BigQueryDialect, executor)),
        WarehouseDialect::Redshift => Arc::new(SqlWarehouseEngine::new(RedshiftDialect, executor)),
        WarehouseDialect::Snowflake => {
            Arc::new(SqlWarehouseEngine::new(SnowflakeDialect, executor))
        }
    }
}

#[async_trait]
impl<D: Dialect> WarehouseEngine for SqlWarehouseEngine<D> {
    fn dialect(&self) -> WarehouseDialect {
        self.dialect.kind()
    }

    async fn test_connection(&self) -> Result<bool, EngineError> {
        Ok(self.executor.query("SELECT 1").await.is_ok())
    }

    async fn create_schema(&self, schema: &str) -> Result<(), EngineError> {
        self.executor
            .execute(&self.dialect.create_schema_sql(schema))
            .await?;
        Ok(())
    }

    async fn create_table(
        &self,
        schema: &str,
        table: &str,
        columns: &[ColumnInfo],
        primary_keys: &[String],
    ) -> Result<(), EngineError> {
        let sql = self
            .dialect
            .create_table_sql(schema, table, columns, primary_keys);
        self.executor.execute(&sql).await?;
        Ok(())
    }

    async fn drop_table(&self, schema: &str, table: &str) -> Result<(), EngineError> {
        self.executor
            .execute(&format!(
                "DROP TABLE IF EXISTS {}",
                self.dialect.qualified(schema, table)
            ))
            .await?;
        Ok(())
    }

    async fn truncate_table(&self, schema: &str, table: &str) -> Result<(), EngineError> {
        self.executor
            .execute(&format!(
                "TRUNCATE TABLE {}",
                self.dialect.qualified(schema, table)
            ))
            .await?;
        Ok(())
    }

    async fn table_exists(&self, schema: &str, table: &str) -> Result<bool, EngineError> {
        let rows = self
            .executor
            .query(&self.dialect.table_exists_sql(schema, table))
            .await?;
        Ok(first_scalar_i64(&rows)? > 0)
    }

    async fn count_rows(&self, schema: &str, table: &str) -> Result<i64, EngineError> {
        let rows = self
            .executor
            .query(&format!(
                "SELECT COUNT(*) AS n FROM {}",
                self.dialect.qualified(schema, table)
            ))
            .await?;
        first_scalar_i64(&rows)
    }

    async fn table_columns(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ColumnInfo>, EngineError> {
        let rows = self
            .executor
            .query(&self.dialect.table_columns_sql(schema, table))
            .await?;
        let pk_columns = match self.dialect.primary_key_sql(schema, table) {
            Some(sql) => self
                .executor
                .query(&sql)
                .await?
                .iter()
                .filter_map(|r| r.values().next())
                .filter_map(|v| v.as_str().map(str::to_lowercase))
                .collect(),
            None => Vec::new(),
        };
        Ok(decode_column_rows(&rows, &pk_columns))
    }

    async fn add_column(
        &self,
        schema: &str,
        table: &str,
        column: &ColumnInfo,
    ) -> Result<(), EngineError> {
        self.executor
            .execute(&self.dialect.add_column_sql(schema, table, column))
            .await?;
        Ok(())
    }

    async fn drop_column(
        &self,
        schema: &str,
        table: &str,
        column: &str,
    ) -> Result<(), EngineError> {
        self.executor
            .execute(&format!(
                "ALTER TABLE {} DROP COLUMN {}",
                self.dialect.qualified(schema, table),
                self.dialect.quote_identifier(column)
            ))
            .await?;
        Ok(())
    }

    async fn alter_column(
        &self,
        schema: &str,
        table: &str,
        from: &ColumnInfo,
        to: &ColumnInfo,
    ) -> Result<(), EngineError> {
        for sql in self.dialect.alter_column_sql(schema, table, from, to) {
            self.executor.execute(&sql).await?;
        }
        Ok(())
    }

    async fn insert_rows(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64, EngineError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let sql = self.dialect.insert_sql(schema, table, columns, rows);
        self.executor.execute(&sql).await
    }

    async fn upsert_rows(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        primary_keys: &[String],
        rows: &[Vec<Value>],
    ) -> Result<u64, EngineError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut affected = 0;
        for sql in self
            .dialect
            .upsert_sql(schema, table, columns, primary_keys, rows)
        {
            affected = self.executor.execute(&sql).await?;
        }
        Ok(affected)
    }

    async fn delete_rows(
        &self,
        schema: &str,
        table: &str,
        key_columns: &[String],
        keys: &[Vec<Value>],
    ) -> Result<u64, EngineError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let sql = self.dialect.delete_sql(schema, table, key_columns, keys);
        self.executor.execute(&sql).await
    }

    async fn create_index(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        name: Option<&str>,
    ) -> Result<(), EngineError> {
        if let Some(sql) = self.dialect.create_index_sql(schema, table, columns, name) {
            self.executor.execute(&sql).await?;
        }
        Ok(())
    }

    async fn create_partition(
        &self,
        schema: &str,
        table: &str,
        partition_column: &str,
    ) -> Result<(), EngineError> {
        if let Some(sql) = self
            .dialect
            .create_partition_sql(schema, table, partition_column)
        {
            self.executor.execute(&sql).await?;
        }
        Ok(())
    }

    async fn select_rows(&self, schema: &str, table: &str) -> Result<Vec<Row>, EngineError> {
        self.executor
            .query(&format!("SELECT * FROM {}", self.dialect.qualified(schema, table)))
            .await
    }

    async fn execute_query(&self, sql: &str) -> Result<Vec<Row>, EngineError> {
        self.executor.query(sql).await
    }

    async fn execute_statement(&self, sql: &str) -> Result<u64, EngineError> {
        self.executor.execute(sql).await
    }

    fn quote_identifier(&self, ident: &str) -> String {
        self.dialect.quote_identifier(ident)
    }

    fn quote_value(&self, value: &Value) -> String {
        self.dialect.quote_value(value)
    }

    fn map_type(&self, canonical: &str) -> String {
        self.dialect.map_type(canonical)
    }
}

fn first_scalar_i64(rows: &[Row]) -> Result<i64, EngineError> {
    let row = rows
        .first()
        .ok_or_else(|| EngineError::ResultShape("expected one row".to_string()))?;
    let value = row
        .values()
        .next()
        .ok_or_else(|| EngineError::ResultShape("expected one column".to_string()))?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| EngineError::ResultShape(format!("not an integer: {n}"))),
        Value::String(s) => s
            .parse()
            .map_err(|_| EngineError::ResultShape(format!("not an integer: {s}"))),
        other => Err(EngineError::ResultShape(format!("not an integer: {other}"))),
    }
}

/// Decode information-schema column rows into [`ColumnInfo`]. Column names
/// follow the standard information_schema layout every supported dialect
/// exposes.
fn decode_column_rows(rows: &[Row], pk_columns: &[String]) -> Vec<ColumnInfo> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(name) = row.get("column_name").and_then(Value::as_str) else {
            continue;
        };
        let name = name.to_lowercase();
        let data_type = row
            .get("data_type")
            .and_then(Value::as_str)
            .unwrap_or("text")
            .to_string();
        let nullable = row
            .get("is_nullable")
            .and_then(Value::as_str)
            .is_none_or(|v| v.eq_ignore_ascii_case("YES"));
        let max_length = row
            .get("character_maximum_length")
            .and_then(crate::row::numeric_value)
            .map(|v| v as i64);
        let precision = row
            .get("numeric_precision")
            .and_then(crate::row::numeric_value)
            .map(|v| v as i32);
        let scale = row
            .get("numeric_scale")
            .and_then(crate::row::numeric_value)
            .map(|v| v as i32);
        let ordinal = row
            .get("ordinal_position")
            .and_then(crate::row::numeric_value)
            .map_or(0, |v| v as i32);

        let target_type = render_information_schema_type(&data_type, max_length, precision, scale);

        out.push(ColumnInfo {
            is_primary_key: pk_columns.contains(&name),
            name,
            source_type: data_type,
            target_type,
            nullable,
            default: row
                .get("column_default")
                .and_then(Value::as_str)
                .map(str::to_string),
            ordinal,
            max_length,
            numeric_precision: precision,
            numeric_scale: scale,
        })
    }
    out
}

/// Re-attach length/precision modifiers the information schema reports in
/// separate columns, so target types compare against mapped source types.
fn render_information_schema_type(
    data_type: &str,
    max_length: Option<i64>,
    precision: Option<i32>,
    scale: Option<i32>,
) -> String {
    match data_type.to_lowercase().as_str() {
        "character varying" | "varchar" => match max_length {
            Some(n) => format!("VARCHAR({n})"),
            None => "VARCHAR".to_string(),
        },
        "character" | "char" => match max_length {
            Some(n) => format!("CHAR({n})"),
            None => "CHAR(1)".to_string(),
        },
        "numeric" | "decimal" => match (precision, scale) {
            (Some(p), Some(s)) => format!("NUMERIC({p},{s})"),
            _ => "NUMERIC".to_string(),
        },
        other => other.to_uppercase(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_dialect_selector_round_trip() {
        for d in [
            WarehouseDialect::Postgres,
            WarehouseDialect::BigQuery,
            WarehouseDialect::Redshift,
            WarehouseDialect::Snowflake,
        ] {
            let s = d.to_string();
            assert_eq!(s.parse::<WarehouseDialect>().unwrap(), d);
        }
    }

    #[test]
    fn test_decode_column_rows() {
        let row: Row = json!({
            "column_name": "Email",
            "data_type": "character varying",
            "is_nullable": "YES",
            "character_maximum_length": 200,
            "ordinal_position": 3
        })
        .as_object()
        .unwrap()
        .clone();
        let cols = decode_column_rows(&[row], &["email".to_string()]);
        assert_eq!(cols.len(), 1);
        assert_eq!(cols[0].name, "email");
        assert_eq!(cols[0].target_type, "VARCHAR(200)");
        assert!(cols[0].nullable);
        assert!(cols[0].is_primary_key);
    }

    #[test]
    fn test_numeric_type_rendering() {
        assert_eq!(
            render_information_schema_type("numeric", None, Some(12), Some(2)),
            "NUMERIC(12,2)"
        );
        assert_eq!(render_information_schema_type("bigint", None, None, None), "BIGINT");
    }
}
