use std::collections::HashMap;

use super::{optional_str, require_str, string_list};
use crate::{
    row::{composite_key, Row, Value},
    transform::{StepContext, TransformError, Transformation},
};

const OPERATOR: &str = "lookup";

/// Cache key for a reference table; the cache itself is per-pipeline and
/// read-only once populated.
pub fn lookup_cache_key(config: &Value) -> String {
    format!(
        "{}|{}|{}|{}",
        optional_str(config, "connection_string").unwrap_or_default(),
        optional_str(config, "db_engine").unwrap_or_default(),
        optional_str(config, "lookup_schema").unwrap_or_default(),
        optional_str(config, "lookup_table").unwrap_or_default(),
    )
}

/// Reference-table enrichment: joins the batch against a preloaded lookup
/// table and appends the requested return columns. Unmatched rows keep
/// their data with null return columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct LookupTransformation;

impl Transformation for LookupTransformation {
    fn type_name(&self) -> &'static str {
        "lookup"
    }

    fn validate(&self, config: &Value) -> Result<(), TransformError> {
        require_str(config, "lookup_table", OPERATOR)?;
        let source = string_list(config, "source_columns", OPERATOR)?;
        let lookup = string_list(config, "lookup_columns", OPERATOR)?;
        let returns = string_list(config, "return_columns", OPERATOR)?;
        if source.is_empty() || source.len() != lookup.len() {
            return Err(TransformError::invalid(
                OPERATOR,
                "source_columns and lookup_columns must pair up",
            ));
        }
        if returns.is_empty() {
            return Err(TransformError::invalid(OPERATOR, "return_columns is empty"));
        }
        Ok(())
    }

    fn execute(
        &self,
        rows: Vec<Row>,
        config: &Value,
        ctx: &mut StepContext,
    ) -> Result<Vec<Row>, TransformError> {
        let cache_key = lookup_cache_key(config);
        let reference = ctx
            .lookup_cache
            .get(&cache_key)
            .cloned()
            .ok_or_else(|| TransformError::LookupUnavailable(cache_key.clone()))?;

        let source_columns = string_list(config, "source_columns", OPERATOR)?;
        let lookup_columns = string_list(config, "lookup_columns", OPERATOR)?;
        let return_columns = string_list(config, "return_columns", OPERATOR)?;

        // First match wins, as reference tables are expected to be unique on
        // their lookup key.
        let mut index: HashMap<String, &Row> = HashMap::new();
        for reference_row in reference.iter() {
            if let Some(key) = composite_key(reference_row, &lookup_columns) {
                index.entry(key).or_insert(reference_row);
            }
        }

        let mut out = Vec::with_capacity(rows.len());
        for mut row in rows {
            let matched = composite_key(&row, &source_columns)
                .and_then(|key| index.get(&key).copied());
            for column in &return_columns {
                let value = matched
                    .and_then(|reference_row| reference_row.get(column))
                    .cloned()
                    .unwrap_or(Value::Null);
                row.insert(column.clone(), value);
            }
            out.push(row);
        }
        Ok(out)
    }
}
