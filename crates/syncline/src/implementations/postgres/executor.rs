use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::json;
use sqlx::{postgres::PgRow, Column, PgPool, Row as SqlxRow};
use tracing::debug;

use crate::{
    row::{Row, Value},
    warehouse::{EngineError, SqlExecutor},
};

/// [`SqlExecutor`] over a postgres pool, decoding result rows into JSON
/// maps.
#[derive(Debug, Clone)]
pub struct PostgresExecutor {
    pool: PgPool,
}

impl PostgresExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl SqlExecutor for PostgresExecutor {
    async fn query(&self, sql: &str) -> Result<Vec<Row>, EngineError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| EngineError::statement_with_source(sql.to_string(), e))?;
        Ok(rows.iter().map(decode_pg_row).collect())
    }

    async fn execute(&self, sql: &str) -> Result<u64, EngineError> {
        let result = sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::statement_with_source(sql.to_string(), e))?;
        Ok(result.rows_affected())
    }
}

/// Best-effort column decoding to JSON: typed decodes are attempted from
/// the most common postgres types down to text; a value no decode accepts
/// surfaces as null.
pub fn decode_pg_row(row: &PgRow) -> Row {
    let mut out = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), decode_column(row, index));
    }
    out
}

fn decode_column(row: &PgRow, index: usize) -> Value {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map_or(Value::Null, Value::from);
    }
    if let Ok(value) = row.try_get::<Option<i32>, _>(index) {
        return value.map_or(Value::Null, Value::from);
    }
    if let Ok(value) = row.try_get::<Option<i16>, _>(index) {
        return value.map_or(Value::Null, Value::from);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value.map_or(Value::Null, Value::from);
    }
    if let Ok(value) = row.try_get::<Option<f32>, _>(index) {
        return value.map_or(Value::Null, |v| Value::from(f64::from(v)));
    }
    if let Ok(value) = row.try_get::<Option<bool>, _>(index) {
        return value.map_or(Value::Null, Value::from);
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.map_or(Value::Null, Value::from);
    }
    if let Ok(value) = row.try_get::<Option<DateTime<Utc>>, _>(index) {
        return value.map_or(Value::Null, |v| json!(v.to_rfc3339()));
    }
    if let Ok(value) = row.try_get::<Option<NaiveDateTime>, _>(index) {
        return value.map_or(Value::Null, |v| json!(v.format("%Y-%m-%d %H:%M:%S").to_string()));
    }
    if let Ok(value) = row.try_get::<Option<NaiveDate>, _>(index) {
        return value.map_or(Value::Null, |v| json!(v.format("%Y-%m-%d").to_string()));
    }
    if let Ok(value) = row.try_get::<Option<NaiveTime>, _>(index) {
        return value.map_or(Value::Null, |v| json!(v.format("%H:%M:%S").to_string()));
    }
    if let Ok(value) = row.try_get::<Option<uuid::Uuid>, _>(index) {
        return value.map_or(Value::Null, |v| json!(v.to_string()));
    }
    if let Ok(value) = row.try_get::<Option<Value>, _>(index) {
        return value.unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<Vec<String>>, _>(index) {
        return value.map_or(Value::Null, |v| json!(v));
    }
    debug!(index, "no decoder matched column type, reading as null");
    Value::Null
}
