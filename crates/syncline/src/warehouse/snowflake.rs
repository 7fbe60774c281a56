use super::{
    dialect::{merge_sql, Dialect},
    postgres::split_type,
    WarehouseDialect,
};
use crate::row::Value;

/// Snowflake target dialect. MERGE-based upsert, no secondary indexes,
/// micro-partitioning instead of explicit partition DDL.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnowflakeDialect;

impl Dialect for SnowflakeDialect {
    fn kind(&self) -> WarehouseDialect {
        WarehouseDialect::Snowflake
    }

    fn map_type(&self, canonical: &str) -> String {
        let (base, modifier) = split_type(canonical);
        match base.as_str() {
            "INTEGER" | "INT" => "INTEGER".to_string(),
            "BIGINT" => "BIGINT".to_string(),
            "SMALLINT" => "SMALLINT".to_string(),
            "NUMERIC" | "DECIMAL" => format!("NUMBER{modifier}"),
            "REAL" | "FLOAT" | "DOUBLE PRECISION" | "DOUBLE" => "FLOAT".to_string(),
            "VARCHAR" | "CHARACTER VARYING" | "TEXT" | "CLOB" => {
                if modifier.is_empty() {
                    "VARCHAR".to_string()
                } else {
                    format!("VARCHAR{modifier}")
                }
            }
            "CHAR" | "CHARACTER" => format!("CHAR{modifier}"),
            "DATE" => "DATE".to_string(),
            "TIME" => "TIME".to_string(),
            "TIMESTAMP" | "DATETIME" => "TIMESTAMP_NTZ".to_string(),
            "BOOLEAN" | "BOOL" => "BOOLEAN".to_string(),
            "BYTEA" | "BINARY" | "BLOB" => "BINARY".to_string(),
            "JSON" | "JSONB" => "VARIANT".to_string(),
            _ => "VARCHAR".to_string(),
        }
    }

    fn upsert_sql(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        primary_keys: &[String],
        rows: &[Vec<Value>],
    ) -> Vec<String> {
        vec![merge_sql(self, schema, table, columns, primary_keys, rows)]
    }

    fn create_index_sql(
        &self,
        _schema: &str,
        _table: &str,
        _columns: &[String],
        _name: Option<&str>,
    ) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_type_mapping() {
        let d = SnowflakeDialect;
        assert_eq!(d.map_type("NUMERIC(18,4)"), "NUMBER(18,4)");
        assert_eq!(d.map_type("TIMESTAMP"), "TIMESTAMP_NTZ");
        assert_eq!(d.map_type("JSON"), "VARIANT");
        assert_eq!(d.map_type("TEXT"), "VARCHAR");
    }

    #[test]
    fn test_upsert_merges() {
        let d = SnowflakeDialect;
        let sql = d.upsert_sql(
            "s",
            "t",
            &["id".into(), "v".into()],
            &["id".into()],
            &[vec![json!(7), json!("z")]],
        );
        assert_eq!(sql.len(), 1);
        assert!(sql[0].starts_with("MERGE INTO \"s\".\"t\" AS T"));
        assert!(sql[0].contains("(VALUES (7, 'z'))"));
    }
}
