use async_trait::async_trait;
use sqlx::{PgPool, Row as SqlxRow};
use tracing::info;

use super::executor::decode_pg_row;
use crate::{
    row::{Row, Value},
    schema::ColumnInfo,
    source::{
        sanitize_identifier, ChangeLogRecord, DiscoveredTable, Operation, SourceDialect,
        SourceEngine, SourceError, TIME_COLUMN_CANDIDATES,
    },
    CONFIG,
};

/// Source adapter for postgres databases: discovery and column metadata
/// from the information schema, change capture through a trigger-fed
/// change-log table in the configured metadata schema.
#[derive(Debug, Clone)]
pub struct PostgresSource {
    pool: PgPool,
    connection: String,
}

impl PostgresSource {
    pub fn new(pool: PgPool, connection: impl Into<String>) -> Self {
        Self {
            pool,
            connection: connection.into(),
        }
    }

    fn change_log_table(&self) -> String {
        format!("{}.ds_change_log", CONFIG.source_metadata_schema)
    }

    async fn query_rows(&self, sql: &str) -> Result<Vec<Row>, SourceError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SourceError::Query(format!("{sql}: {e}")))?;
        Ok(rows.iter().map(decode_pg_row).collect())
    }
}

#[async_trait]
impl SourceEngine for PostgresSource {
    fn dialect(&self) -> SourceDialect {
        SourceDialect::Postgres
    }

    fn connection(&self) -> &str {
        &self.connection
    }

    async fn test_connection(&self) -> Result<bool, SourceError> {
        Ok(sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok())
    }

    async fn discover_tables(&self) -> Result<Vec<DiscoveredTable>, SourceError> {
        let rows = self
            .query_rows(
                "SELECT table_schema, table_name FROM information_schema.tables \
                 WHERE table_type = 'BASE TABLE' \
                 AND table_schema NOT IN ('pg_catalog', 'information_schema') \
                 ORDER BY table_schema, table_name",
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(DiscoveredTable {
                    schema: row.get("table_schema")?.as_str()?.to_string(),
                    table: row.get("table_name")?.as_str()?.to_string(),
                    connection: self.connection.clone(),
                })
            })
            .filter(|t| t.schema != CONFIG.source_metadata_schema)
            .collect())
    }

    async fn detect_primary_key(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<String>, SourceError> {
        let schema = sanitize_identifier(schema)?;
        let table = sanitize_identifier(table)?;
        let rows = self
            .query_rows(&format!(
                "SELECT kcu.column_name FROM information_schema.table_constraints tc \
                 INNER JOIN information_schema.key_column_usage kcu \
                 ON tc.constraint_name = kcu.constraint_name \
                 AND tc.table_schema = kcu.table_schema \
                 WHERE tc.table_schema = '{schema}' AND tc.table_name = '{table}' \
                 AND tc.constraint_type = 'PRIMARY KEY' ORDER BY kcu.ordinal_position"
            ))
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("column_name"))
            .filter_map(Value::as_str)
            .map(str::to_lowercase)
            .collect())
    }

    async fn detect_time_column(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<Option<String>, SourceError> {
        let columns = self.get_columns(schema, table).await?;
        Ok(TIME_COLUMN_CANDIDATES
            .iter()
            .find(|candidate| {
                columns
                    .iter()
                    .any(|c| c.name.eq_ignore_ascii_case(candidate))
            })
            .map(|c| (*c).to_string()))
    }

    async fn get_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>, SourceError> {
        let safe_schema = sanitize_identifier(schema)?;
        let safe_table = sanitize_identifier(table)?;
        let rows = self
            .query_rows(&format!(
                "SELECT column_name, data_type, is_nullable, column_default, ordinal_position, \
                 character_maximum_length, numeric_precision, numeric_scale \
                 FROM information_schema.columns \
                 WHERE table_schema = '{safe_schema}' AND table_name = '{safe_table}' \
                 ORDER BY ordinal_position"
            ))
            .await?;
        let pk_columns = self.detect_primary_key(schema, table).await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let name = row.get("column_name")?.as_str()?.to_lowercase();
                let data_type = row.get("data_type")?.as_str()?.to_string();
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

                let target_type = map_postgres_type(&data_type, max_length, precision, scale);
                Some(ColumnInfo {
                    is_primary_key: pk_columns.contains(&name),
                    name,
                    source_type: data_type,
                    target_type,
                    nullable: row
                        .get("is_nullable")
                        .and_then(Value::as_str)
                        .is_none_or(|v| v.eq_ignore_ascii_case("YES")),
                    default: row
                        .get("column_default")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    ordinal: row
                        .get("ordinal_position")
                        .and_then(crate::row::numeric_value)
                        .map_or(0, |v| v as i32),
                    max_length,
                    numeric_precision: precision,
                    numeric_scale: scale,
                })
            })
            .collect())
    }

    async fn count_rows(&self, schema: &str, table: &str) -> Result<i64, SourceError> {
        let schema = sanitize_identifier(schema)?;
        let table = sanitize_identifier(table)?;
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{schema}\".\"{table}\""))
                .fetch_one(&self.pool)
                .await
                .map_err(|e| SourceError::Query(e.to_string()))?;
        Ok(count)
    }

    async fn read_rows(
        &self,
        schema: &str,
        table: &str,
        offset: i64,
        limit: usize,
    ) -> Result<Vec<Row>, SourceError> {
        let schema = sanitize_identifier(schema)?;
        let table = sanitize_identifier(table)?;
        self.query_rows(&format!(
            "SELECT * FROM \"{schema}\".\"{table}\" OFFSET {offset} LIMIT {limit}"
        ))
        .await
    }

    async fn read_changes(
        &self,
        schema: &str,
        table: &str,
        since_change_id: i64,
        max_rows: usize,
    ) -> Result<Vec<ChangeLogRecord>, SourceError> {
        let safe_schema = sanitize_identifier(schema)?;
        let safe_table = sanitize_identifier(table)?;
        let rows = self
            .query_rows(&format!(
                "SELECT change_id, operation, pk_values, row_data, changed_at \
                 FROM {} WHERE schema_name = '{safe_schema}' AND table_name = '{safe_table}' \
                 AND change_id > {since_change_id} ORDER BY change_id LIMIT {max_rows}",
                self.change_log_table()
            ))
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let change_id = row
                .get("change_id")
                .and_then(Value::as_i64)
                .ok_or_else(|| SourceError::MalformedRecord {
                    change_id: since_change_id,
                    message: "change_id is not an integer".to_string(),
                })?;
            let operation = match row.get("operation").and_then(Value::as_str) {
                Some("I") => Operation::Insert,
                Some("U") => Operation::Update,
                Some("D") => Operation::Delete,
                other => {
                    return Err(SourceError::MalformedRecord {
                        change_id,
                        message: format!("unknown operation {other:?}"),
                    })
                }
            };
            let pk_values = decode_json_field(row.get("pk_values")).ok_or_else(|| {
                SourceError::MalformedRecord {
                    change_id,
                    message: "pk_values is not a JSON object".to_string(),
                }
            })?;
            records.push(ChangeLogRecord {
                change_id,
                operation,
                pk_values,
                row_data: decode_json_field(row.get("row_data")),
                changed_at: row
                    .get("changed_at")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok()),
            });
        }
        Ok(records)
    }

    /// Create the change-log table and per-table row triggers. PK-less
    /// tables log a full-row sha256 under `_hash`.
    async fn install_change_capture(&self, schema: &str, table: &str) -> Result<i64, SourceError> {
        let safe_schema = sanitize_identifier(schema)?;
        let safe_table = sanitize_identifier(table)?;
        let metadata_schema = &CONFIG.source_metadata_schema;
        let change_log = self.change_log_table();

        // Multi-statement DDL has to run over the simple-query path.
        use sqlx::Executor;
        let setup = format!(
            "CREATE SCHEMA IF NOT EXISTS {metadata_schema}; \
             CREATE TABLE IF NOT EXISTS {change_log} ( \
               change_id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY, \
               schema_name TEXT NOT NULL, \
               table_name TEXT NOT NULL, \
               operation CHAR(1) NOT NULL, \
               pk_values JSONB NOT NULL, \
               row_data JSONB, \
               changed_at TIMESTAMPTZ NOT NULL DEFAULT now())"
        );
        self.pool
            .execute(setup.as_str())
            .await
            .map_err(|e| SourceError::Query(e.to_string()))?;

        let pk_columns = self.detect_primary_key(schema, table).await?;
        let pk_expression = if pk_columns.is_empty() {
            "jsonb_build_object('_hash', encode(sha256(convert_to(r::TEXT, 'UTF8')), 'hex'))"
                .to_string()
        } else {
            let pairs = pk_columns
                .iter()
                .map(|c| format!("'{c}', to_jsonb(r.\"{c}\")"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("jsonb_build_object({pairs})")
        };

        let function_name = format!(
            "{metadata_schema}.capture_{}_{}",
            safe_schema.to_lowercase(),
            safe_table.to_lowercase()
        );
        let trigger = format!(
            "CREATE OR REPLACE FUNCTION {function_name}() RETURNS trigger AS $$ \
             DECLARE r RECORD; \
             BEGIN \
               IF TG_OP = 'DELETE' THEN r := OLD; ELSE r := NEW; END IF; \
               INSERT INTO {change_log} (schema_name, table_name, operation, pk_values, row_data) \
               VALUES ('{safe_schema}', '{safe_table}', LEFT(TG_OP, 1), {pk_expression}, to_jsonb(r)); \
               RETURN r; \
             END $$ LANGUAGE plpgsql; \
             DROP TRIGGER IF EXISTS ds_capture ON \"{safe_schema}\".\"{safe_table}\"; \
             CREATE TRIGGER ds_capture AFTER INSERT OR UPDATE OR DELETE \
             ON \"{safe_schema}\".\"{safe_table}\" \
             FOR EACH ROW EXECUTE FUNCTION {function_name}()"
        );
        self.pool
            .execute(trigger.as_str())
            .await
            .map_err(|e| SourceError::Query(e.to_string()))?;

        let watermark: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT MAX(change_id) FROM {change_log} \
             WHERE schema_name = '{safe_schema}' AND table_name = '{safe_table}'"
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SourceError::Query(e.to_string()))?;

        info!(schema, table, "change capture installed");
        Ok(watermark.unwrap_or(0))
    }
}

fn decode_json_field(value: Option<&Value>) -> Option<Row> {
    match value {
        Some(Value::Object(object)) => Some(object.clone()),
        Some(Value::String(raw)) => serde_json::from_str::<Value>(raw)
            .ok()
            .and_then(|v| v.as_object().cloned()),
        _ => None,
    }
}

/// Postgres source types map onto the canonical vocabulary almost 1:1.
fn map_postgres_type(
    data_type: &str,
    max_length: Option<i64>,
    precision: Option<i32>,
    scale: Option<i32>,
) -> String {
    match data_type.to_lowercase().as_str() {
        "smallint" => "SMALLINT".to_string(),
        "integer" => "INTEGER".to_string(),
        "bigint" => "BIGINT".to_string(),
        "numeric" | "decimal" => match (precision, scale) {
            (Some(p), Some(s)) => format!("NUMERIC({p},{s})"),
            _ => "NUMERIC".to_string(),
        },
        "real" => "REAL".to_string(),
        "double precision" => "DOUBLE PRECISION".to_string(),
        "character varying" | "varchar" => match max_length {
            Some(n) => format!("VARCHAR({n})"),
            None => "VARCHAR".to_string(),
        },
        "character" | "char" => match max_length {
            Some(n) => format!("CHAR({n})"),
            None => "CHAR(1)".to_string(),
        },
        "text" => "TEXT".to_string(),
        "date" => "DATE".to_string(),
        "time without time zone" | "time" => "TIME".to_string(),
        "timestamp without time zone" | "timestamp with time zone" | "timestamp" => {
            "TIMESTAMP".to_string()
        }
        "boolean" => "BOOLEAN".to_string(),
        "bytea" => "BYTEA".to_string(),
        "json" | "jsonb" => "JSON".to_string(),
        _ => "TEXT".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_mapping() {
        assert_eq!(map_postgres_type("integer", None, None, None), "INTEGER");
        assert_eq!(
            map_postgres_type("character varying", Some(40), None, None),
            "VARCHAR(40)"
        );
        assert_eq!(
            map_postgres_type("numeric", None, Some(12), Some(2)),
            "NUMERIC(12,2)"
        );
        assert_eq!(
            map_postgres_type("timestamp with time zone", None, None, None),
            "TIMESTAMP"
        );
        assert_eq!(map_postgres_type("tsvector", None, None, None), "TEXT");
    }

    #[test]
    fn test_decode_json_field() {
        let object = serde_json::json!({"id": 1});
        assert!(decode_json_field(Some(&object)).is_some());
        let as_string = Value::String("{\"id\":2}".to_string());
        assert_eq!(
            decode_json_field(Some(&as_string)).unwrap()["id"],
            serde_json::json!(2)
        );
        assert!(decode_json_field(Some(&Value::Null)).is_none());
        assert!(decode_json_field(None).is_none());
    }
}
