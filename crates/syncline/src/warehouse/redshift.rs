use super::{dialect::Dialect, postgres::split_type, WarehouseDialect};
use crate::row::Value;

/// Redshift target dialect. No secondary indexes (sort/dist keys are a
/// table-creation concern); upsert is the documented delete-then-insert
/// staged inside one transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedshiftDialect;

impl Dialect for RedshiftDialect {
    fn kind(&self) -> WarehouseDialect {
        WarehouseDialect::Redshift
    }

    fn map_type(&self, canonical: &str) -> String {
        let (base, modifier) = split_type(canonical);
        match base.as_str() {
            "INTEGER" | "INT" => "INTEGER".to_string(),
            "BIGINT" => "BIGINT".to_string(),
            "SMALLINT" => "SMALLINT".to_string(),
            "NUMERIC" | "DECIMAL" => format!("NUMERIC{modifier}"),
            "REAL" | "FLOAT" => "REAL".to_string(),
            "DOUBLE PRECISION" | "DOUBLE" => "DOUBLE PRECISION".to_string(),
            "VARCHAR" | "CHARACTER VARYING" => {
                if modifier.is_empty() {
                    "VARCHAR(MAX)".to_string()
                } else {
                    format!("VARCHAR{modifier}")
                }
            }
            "CHAR" | "CHARACTER" => format!("CHAR{modifier}"),
            // Redshift has no TEXT; fall back to the widest varchar.
            "TEXT" | "CLOB" => "VARCHAR(MAX)".to_string(),
            "DATE" => "DATE".to_string(),
            "TIME" => "TIME".to_string(),
            "TIMESTAMP" | "DATETIME" => "TIMESTAMP".to_string(),
            "BOOLEAN" | "BOOL" => "BOOLEAN".to_string(),
            "BYTEA" | "BINARY" | "BLOB" => "VARBYTE".to_string(),
            "JSON" | "JSONB" => "SUPER".to_string(),
            _ => "VARCHAR(MAX)".to_string(),
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
        let key_positions: Vec<usize> = primary_keys
            .iter()
            .filter_map(|k| columns.iter().position(|c| c == k))
            .collect();
        let keys: Vec<Vec<Value>> = rows
            .iter()
            .map(|row| key_positions.iter().map(|&i| row[i].clone()).collect())
            .collect();
        vec![
            "BEGIN".to_string(),
            self.delete_sql(schema, table, primary_keys, &keys),
            self.insert_sql(schema, table, columns, rows),
            "COMMIT".to_string(),
        ]
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
    fn test_type_mapping_widest_varchar_fallback() {
        let d = RedshiftDialect;
        assert_eq!(d.map_type("TEXT"), "VARCHAR(MAX)");
        assert_eq!(d.map_type("VARCHAR"), "VARCHAR(MAX)");
        assert_eq!(d.map_type("VARCHAR(64)"), "VARCHAR(64)");
        assert_eq!(d.map_type("JSON"), "SUPER");
        assert_eq!(d.map_type("BYTEA"), "VARBYTE");
    }

    #[test]
    fn test_upsert_is_delete_then_insert_in_txn() {
        let d = RedshiftDialect;
        let sql = d.upsert_sql(
            "s",
            "t",
            &["id".into(), "v".into()],
            &["id".into()],
            &[vec![json!(1), json!("a")], vec![json!(2), json!("b")]],
        );
        assert_eq!(sql.len(), 4);
        assert_eq!(sql[0], "BEGIN");
        assert_eq!(sql[1], "DELETE FROM \"s\".\"t\" WHERE \"id\" IN (1, 2)");
        assert!(sql[2].starts_with("INSERT INTO \"s\".\"t\""));
        assert_eq!(sql[3], "COMMIT");
    }
}
