//! SQL-text generation hooks implemented per warehouse dialect. Defaults
//! cover ANSI-ish behavior; dialects override where their DDL/DML deviates.

use std::fmt::Debug;

use itertools::Itertools;

use super::WarehouseDialect;
use crate::{row::Value, schema::ColumnInfo};

pub trait Dialect: Send + Sync + Debug + 'static {
    fn kind(&self) -> WarehouseDialect;

    /// Native rendering of a canonical type name. Dialects own the mapping
    /// table; unknown types fall back to the widest practical text type.
    fn map_type(&self, canonical: &str) -> String;

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.to_lowercase().replace('"', "\"\""))
    }

    fn quote_value(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => {
                if *b {
                    "TRUE".to_string()
                } else {
                    "FALSE".to_string()
                }
            }
            Value::Number(n) => n.to_string(),
            Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            other => format!("'{}'", other.to_string().replace('\'', "''")),
        }
    }

    fn qualified(&self, schema: &str, table: &str) -> String {
        format!(
            "{}.{}",
            self.quote_identifier(schema),
            self.quote_identifier(table)
        )
    }

    fn create_schema_sql(&self, schema: &str) -> String {
        format!("CREATE SCHEMA IF NOT EXISTS {}", self.quote_identifier(schema))
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
        if let Some(default) = &column.default {
            if !default.is_empty() && !default.eq_ignore_ascii_case("null") {
                def.push_str(" DEFAULT ");
                def.push_str(default);
            }
        }
        def
    }

    fn create_table_sql(
        &self,
        schema: &str,
        table: &str,
        columns: &[ColumnInfo],
        primary_keys: &[String],
    ) -> String {
        let mut defs: Vec<String> = columns.iter().map(|c| self.column_definition(c)).collect();
        if !primary_keys.is_empty() {
            if let Some(clause) = self.primary_key_clause(primary_keys) {
                defs.push(clause);
            }
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.qualified(schema, table),
            defs.join(", ")
        )
    }

    fn primary_key_clause(&self, primary_keys: &[String]) -> Option<String> {
        Some(format!(
            "PRIMARY KEY ({})",
            self.quoted_list(primary_keys)
        ))
    }

    fn quoted_list(&self, idents: &[String]) -> String {
        idents.iter().map(|c| self.quote_identifier(c)).join(", ")
    }

    fn values_list(&self, rows: &[Vec<Value>]) -> String {
        rows.iter()
            .map(|row| format!("({})", row.iter().map(|v| self.quote_value(v)).join(", ")))
            .join(", ")
    }

    fn insert_sql(&self, schema: &str, table: &str, columns: &[String], rows: &[Vec<Value>]) -> String {
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.qualified(schema, table),
            self.quoted_list(columns),
            self.values_list(rows)
        )
    }

    /// Idempotent upsert as one or more statements executed in order.
    fn upsert_sql(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        primary_keys: &[String],
        rows: &[Vec<Value>],
    ) -> Vec<String>;

    fn delete_sql(
        &self,
        schema: &str,
        table: &str,
        key_columns: &[String],
        keys: &[Vec<Value>],
    ) -> String {
        if key_columns.len() == 1 {
            let values = keys
                .iter()
                .filter_map(|k| k.first())
                .map(|v| self.quote_value(v))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "DELETE FROM {} WHERE {} IN ({})",
                self.qualified(schema, table),
                self.quote_identifier(&key_columns[0]),
                values
            )
        } else {
            let predicates = keys
                .iter()
                .map(|key| {
                    let conjuncts = key_columns
                        .iter()
                        .zip(key)
                        .map(|(c, v)| {
                            format!("{} = {}", self.quote_identifier(c), self.quote_value(v))
                        })
                        .collect::<Vec<_>>()
                        .join(" AND ");
                    format!("({conjuncts})")
                })
                .collect::<Vec<_>>()
                .join(" OR ");
            format!(
                "DELETE FROM {} WHERE {}",
                self.qualified(schema, table),
                predicates
            )
        }
    }

    fn table_exists_sql(&self, schema: &str, table: &str) -> String {
        format!(
            "SELECT COUNT(*) AS n FROM information_schema.tables \
             WHERE table_schema = '{}' AND table_name = '{}'",
            schema.to_lowercase().replace('\'', "''"),
            table.to_lowercase().replace('\'', "''")
        )
    }

    fn table_columns_sql(&self, schema: &str, table: &str) -> String {
        format!(
            "SELECT column_name, data_type, is_nullable, column_default, \
             ordinal_position, character_maximum_length, numeric_precision, numeric_scale \
             FROM information_schema.columns \
             WHERE table_schema = '{}' AND table_name = '{}' ORDER BY ordinal_position",
            schema.to_lowercase().replace('\'', "''"),
            table.to_lowercase().replace('\'', "''")
        )
    }

    /// Primary-key lookup; `None` on engines without declared keys.
    fn primary_key_sql(&self, schema: &str, table: &str) -> Option<String> {
        Some(format!(
            "SELECT kcu.column_name FROM information_schema.table_constraints tc \
             INNER JOIN information_schema.key_column_usage kcu \
             ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
             WHERE tc.table_schema = '{}' AND tc.table_name = '{}' \
             AND tc.constraint_type = 'PRIMARY KEY' ORDER BY kcu.ordinal_position",
            schema.to_lowercase().replace('\'', "''"),
            table.to_lowercase().replace('\'', "''")
        ))
    }

    fn add_column_sql(&self, schema: &str, table: &str, column: &ColumnInfo) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.qualified(schema, table),
            self.column_definition(column)
        )
    }

    /// Type change plus a nullability change where they differ; statements
    /// run in order.
    fn alter_column_sql(
        &self,
        schema: &str,
        table: &str,
        from: &ColumnInfo,
        to: &ColumnInfo,
    ) -> Vec<String> {
        let mut statements = vec![format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
            self.qualified(schema, table),
            self.quote_identifier(&to.name),
            self.map_type(&to.target_type)
        )];
        if from.nullable != to.nullable {
            let verb = if to.nullable {
                "DROP NOT NULL"
            } else {
                "SET NOT NULL"
            };
            statements.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} {verb}",
                self.qualified(schema, table),
                self.quote_identifier(&to.name)
            ));
        }
        statements
    }

    fn create_index_sql(
        &self,
        schema: &str,
        table: &str,
        columns: &[String],
        name: Option<&str>,
    ) -> Option<String> {
        let index_name = name.map_or_else(
            || format!("idx_{}_{}", table.to_lowercase(), columns.join("_").to_lowercase()),
            str::to_string,
        );
        Some(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            self.quote_identifier(&index_name),
            self.qualified(schema, table),
            self.quoted_list(columns)
        ))
    }

    fn create_partition_sql(
        &self,
        _schema: &str,
        _table: &str,
        _partition_column: &str,
    ) -> Option<String> {
        None
    }
}

/// Shared MERGE text used by the dialects that upsert via MERGE.
pub(super) fn merge_sql<D: Dialect + ?Sized>(
    dialect: &D,
    schema: &str,
    table: &str,
    columns: &[String],
    primary_keys: &[String],
    rows: &[Vec<Value>],
) -> String {
    let target = dialect.qualified(schema, table);
    let source_columns = dialect.quoted_list(columns);
    let on = primary_keys
        .iter()
        .map(|k| {
            format!(
                "T.{k} = S.{k}",
                k = dialect.quote_identifier(k)
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    let updates = columns
        .iter()
        .filter(|c| !primary_keys.contains(c))
        .map(|c| {
            format!(
                "T.{c} = S.{c}",
                c = dialect.quote_identifier(c)
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    let insert_values = columns
        .iter()
        .map(|c| format!("S.{}", dialect.quote_identifier(c)))
        .collect::<Vec<_>>()
        .join(", ");

    let update_clause = if updates.is_empty() {
        String::new()
    } else {
        format!("WHEN MATCHED THEN UPDATE SET {updates} ")
    };

    format!(
        "MERGE INTO {target} AS T USING (SELECT * FROM (VALUES {values}) AS V ({source_columns})) AS S \
         ON {on} {update_clause}WHEN NOT MATCHED THEN INSERT ({source_columns}) VALUES ({insert_values})",
        values = dialect.values_list(rows),
    )
}
