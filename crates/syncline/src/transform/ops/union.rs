use std::collections::{BTreeSet, HashSet};

use super::require_array;
use crate::{
    row::{row_signature, Row, Value},
    transform::{StepContext, TransformError, Transformation},
};

const OPERATOR: &str = "union";

/// Union of the pipeline batch with additional inline row sets. Output rows
/// are normalized to the superset of columns, absent columns becoming null;
/// `union` deduplicates by full-row signature, `union_all` keeps duplicates.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnionTransformation;

impl Transformation for UnionTransformation {
    fn type_name(&self) -> &'static str {
        "union"
    }

    fn validate(&self, config: &Value) -> Result<(), TransformError> {
        require_array(config, "additional_data", OPERATOR)?;
        if let Some(union_type) = config.get("union_type").and_then(Value::as_str) {
            if union_type != "union" && union_type != "union_all" {
                return Err(TransformError::invalid(
                    OPERATOR,
                    format!("invalid union_type: {union_type}"),
                ));
            }
        }
        Ok(())
    }

    fn execute(
        &self,
        rows: Vec<Row>,
        config: &Value,
        _ctx: &mut StepContext,
    ) -> Result<Vec<Row>, TransformError> {
        let additional: Vec<Vec<Row>> = require_array(config, "additional_data", OPERATOR)?
            .iter()
            .filter_map(Value::as_array)
            .map(|source| {
                source
                    .iter()
                    .filter_map(|v| v.as_object().cloned())
                    .collect()
            })
            .collect();
        let deduplicate = config
            .get("union_type")
            .and_then(Value::as_str)
            .unwrap_or("union_all")
            == "union";

        let mut all_columns: BTreeSet<String> = BTreeSet::new();
        for row in rows.iter().chain(additional.iter().flatten()) {
            for column in row.keys() {
                all_columns.insert(column.clone());
            }
        }

        let normalize = |row: &Row| -> Row {
            all_columns
                .iter()
                .map(|column| {
                    (
                        column.clone(),
                        row.get(column).cloned().unwrap_or(Value::Null),
                    )
                })
                .collect()
        };

        let mut out = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for row in rows.iter().chain(additional.iter().flatten()) {
            let normalized = normalize(row);
            if deduplicate {
                if !seen.insert(row_signature(&normalized)) {
                    continue;
                }
            }
            out.push(normalized);
        }
        Ok(out)
    }
}
