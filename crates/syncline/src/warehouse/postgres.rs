use super::{dialect::Dialect, WarehouseDialect};
use crate::row::Value;

/// PostgreSQL target dialect. The canonical type vocabulary is already
/// postgres-flavored, so the mapping is mostly identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn kind(&self) -> WarehouseDialect {
        WarehouseDialect::Postgres
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
            "VARCHAR" | "CHARACTER VARYING" => format!("VARCHAR{modifier}"),
            "CHAR" | "CHARACTER" => format!("CHAR{modifier}"),
            "TEXT" | "CLOB" => "TEXT".to_string(),
            "DATE" => "DATE".to_string(),
            "TIME" => "TIME".to_string(),
            "TIMESTAMP" | "DATETIME" => "TIMESTAMP".to_string(),
            "BOOLEAN" | "BOOL" => "BOOLEAN".to_string(),
            "BYTEA" | "BINARY" | "BLOB" => "BYTEA".to_string(),
            "JSON" | "JSONB" => "JSONB".to_string(),
            _ => "TEXT".to_string(),
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
        let insert = self.insert_sql(schema, table, columns, rows);
        let conflict_target = self.quoted_list(primary_keys);
        let updates = columns
            .iter()
            .filter(|c| !primary_keys.contains(c))
            .map(|c| {
                let q = self.quote_identifier(c);
                format!("{q} = EXCLUDED.{q}")
            })
            .collect::<Vec<_>>()
            .join(", ");
        let clause = if updates.is_empty() {
            format!("{insert} ON CONFLICT ({conflict_target}) DO NOTHING")
        } else {
            format!("{insert} ON CONFLICT ({conflict_target}) DO UPDATE SET {updates}")
        };
        vec![clause]
    }
}

/// Split `VARCHAR(200)` into `("VARCHAR", "(200)")`; the modifier is empty
/// when absent.
pub(super) fn split_type(canonical: &str) -> (String, String) {
    let trimmed = canonical.trim();
    match trimmed.find('(') {
        Some(idx) => (
            trimmed[..idx].trim().to_uppercase(),
            trimmed[idx..].to_string(),
        ),
        None => (trimmed.to_uppercase(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_type_mapping() {
        let d = PostgresDialect;
        assert_eq!(d.map_type("VARCHAR(50)"), "VARCHAR(50)");
        assert_eq!(d.map_type("numeric(12,2)"), "NUMERIC(12,2)");
        assert_eq!(d.map_type("DATETIME"), "TIMESTAMP");
        assert_eq!(d.map_type("GRAPHIC"), "TEXT");
    }

    #[test]
    fn test_upsert_uses_on_conflict() {
        let d = PostgresDialect;
        let sql = d.upsert_sql(
            "Sales",
            "Orders",
            &["id".into(), "total".into()],
            &["id".into()],
            &[vec![json!(1), json!("10.5")]],
        );
        assert_eq!(sql.len(), 1);
        assert_eq!(
            sql[0],
            "INSERT INTO \"sales\".\"orders\" (\"id\", \"total\") VALUES (1, '10.5') \
             ON CONFLICT (\"id\") DO UPDATE SET \"total\" = EXCLUDED.\"total\""
        );
    }

    #[test]
    fn test_upsert_all_key_columns_does_nothing_on_conflict() {
        let d = PostgresDialect;
        let sql = d.upsert_sql(
            "s",
            "t",
            &["id".into()],
            &["id".into()],
            &[vec![json!(1)]],
        );
        assert!(sql[0].ends_with("DO NOTHING"));
    }

    #[test]
    fn test_quote_value_escapes() {
        let d = PostgresDialect;
        assert_eq!(d.quote_value(&json!("O'Brien")), "'O''Brien'");
        assert_eq!(d.quote_value(&Value::Null), "NULL");
        assert_eq!(d.quote_value(&json!(true)), "TRUE");
    }
}
