use super::{
    dialect::{merge_sql, Dialect},
    postgres::split_type,
    WarehouseDialect,
};
use crate::{row::Value, schema::ColumnInfo};

/// BigQuery target dialect. No declared primary keys and no secondary
/// indexes; uniqueness is enforced by the MERGE upsert path and clustering
/// happens at table creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BigQueryDialect;

impl Dialect for BigQueryDialect {
    fn kind(&self) -> WarehouseDialect {
        WarehouseDialect::BigQuery
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{}`", ident.to_lowercase().replace('`', ""))
    }

    fn map_type(&self, canonical: &str) -> String {
        let (base, _) = split_type(canonical);
        match base.as_str() {
            "INTEGER" | "INT" | "BIGINT" | "SMALLINT" => "INT64".to_string(),
            "NUMERIC" | "DECIMAL" => "NUMERIC".to_string(),
            "REAL" | "FLOAT" | "DOUBLE PRECISION" | "DOUBLE" => "FLOAT64".to_string(),
            "DATE" => "DATE".to_string(),
            "TIME" => "TIME".to_string(),
            "TIMESTAMP" => "TIMESTAMP".to_string(),
            "DATETIME" => "DATETIME".to_string(),
            "BOOLEAN" | "BOOL" => "BOOL".to_string(),
            "BYTEA" | "BINARY" | "BLOB" => "BYTES".to_string(),
            "JSON" | "JSONB" => "JSON".to_string(),
            // VARCHAR/CHAR/TEXT and anything unknown: BigQuery has a single
            // unbounded string type.
            _ => "STRING".to_string(),
        }
    }

    fn primary_key_clause(&self, _primary_keys: &[String]) -> Option<String> {
        None
    }

    fn create_table_sql(
        &self,
        schema: &str,
        table: &str,
        columns: &[ColumnInfo],
        primary_keys: &[String],
    ) -> String {
        let defs: Vec<String> = columns.iter().map(|c| self.column_definition(c)).collect();
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.qualified(schema, table),
            defs.join(", ")
        );
        // Clustering on the key columns stands in for an index.
        if !primary_keys.is_empty() {
            sql.push_str(&format!(" CLUSTER BY {}", self.quoted_list(primary_keys)));
        }
        sql
    }

    fn column_definition(&self, column: &ColumnInfo) -> String {
        let mut def = format!(
            "{} {}",
            self.quote_identifier(&column.name),
            self.map_type(&column.target_type)
        );
        if !column.nullable {
            def.push_str(" NOT NULL");
        }
        def
    }

    fn primary_key_sql(&self, _schema: &str, _table: &str) -> Option<String> {
        None
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

    fn alter_column_sql(
        &self,
        schema: &str,
        table: &str,
        from: &ColumnInfo,
        to: &ColumnInfo,
    ) -> Vec<String> {
        let mut statements = vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} SET DATA TYPE {}",
            self.qualified(schema, table),
            self.quote_identifier(&to.name),
            self.map_type(&to.target_type)
        )];
        if from.nullable && !to.nullable {
            // BigQuery cannot add NOT NULL in place; dropping the constraint
            // is the only supported direction.
        } else if !from.nullable && to.nullable {
            statements.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL",
                self.qualified(schema, table),
                self.quote_identifier(&to.name)
            ));
        }
        statements
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_type_mapping_collapses_strings() {
        let d = BigQueryDialect;
        assert_eq!(d.map_type("VARCHAR(200)"), "STRING");
        assert_eq!(d.map_type("TEXT"), "STRING");
        assert_eq!(d.map_type("BIGINT"), "INT64");
        assert_eq!(d.map_type("DOUBLE PRECISION"), "FLOAT64");
        assert_eq!(d.map_type("BYTEA"), "BYTES");
    }

    #[test]
    fn test_create_table_clusters_on_keys() {
        let d = BigQueryDialect;
        let sql = d.create_table_sql(
            "analytics",
            "orders",
            &[
                ColumnInfo::new("id", "BIGINT", false),
                ColumnInfo::new("total", "NUMERIC(10,2)", true),
            ],
            &["id".to_string()],
        );
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS `analytics`.`orders` \
             (`id` INT64 NOT NULL, `total` NUMERIC) CLUSTER BY `id`"
        );
    }

    #[test]
    fn test_upsert_is_a_single_merge() {
        let d = BigQueryDialect;
        let sql = d.upsert_sql(
            "a",
            "t",
            &["id".into(), "v".into()],
            &["id".into()],
            &[vec![json!(1), json!("x")]],
        );
        assert_eq!(sql.len(), 1);
        assert!(sql[0].starts_with("MERGE INTO `a`.`t` AS T"));
        assert!(sql[0].contains("WHEN MATCHED THEN UPDATE SET T.`v` = S.`v`"));
        assert!(sql[0].contains("WHEN NOT MATCHED THEN INSERT"));
    }

    #[test]
    fn test_no_index_ddl() {
        let d = BigQueryDialect;
        assert!(d.create_index_sql("a", "t", &["id".into()], None).is_none());
    }
}
