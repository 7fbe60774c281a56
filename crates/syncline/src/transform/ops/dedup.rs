use std::collections::HashSet;

use super::{optional_str, string_list};
use crate::{
    row::{value_text, Row, Value},
    transform::{StepContext, TransformError, Transformation},
};

const OPERATOR: &str = "deduplication";

/// Duplicate removal over key columns. `exact` compares normalized
/// signatures; `fuzzy`/`similarity` use Levenshtein similarity per key
/// column against the rows already kept. First occurrence wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeduplicationTransformation;

impl Transformation for DeduplicationTransformation {
    fn type_name(&self) -> &'static str {
        "deduplication"
    }

    fn validate(&self, config: &Value) -> Result<(), TransformError> {
        let key_columns = string_list(config, "key_columns", OPERATOR)?;
        if key_columns.is_empty() {
            return Err(TransformError::invalid(OPERATOR, "key_columns is empty"));
        }
        let method = optional_str(config, "method").unwrap_or("exact");
        if !matches!(method, "exact" | "fuzzy" | "similarity") {
            return Err(TransformError::invalid(
                OPERATOR,
                format!("invalid method: {method}"),
            ));
        }
        if let Some(threshold) = config.get("similarity_threshold") {
            let Some(threshold) = threshold.as_f64() else {
                return Err(TransformError::invalid(OPERATOR, "similarity_threshold must be a number"));
            };
            if !(0.0..=1.0).contains(&threshold) {
                return Err(TransformError::invalid(
                    OPERATOR,
                    "similarity_threshold must be within [0, 1]",
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
        let key_columns = string_list(config, "key_columns", OPERATOR)?;
        let method = optional_str(config, "method").unwrap_or("exact");
        let threshold = config
            .get("similarity_threshold")
            .and_then(Value::as_f64)
            .unwrap_or(0.8);

        if method == "exact" {
            let mut seen: HashSet<String> = HashSet::new();
            return Ok(rows
                .into_iter()
                .filter(|row| seen.insert(normalized_key(row, &key_columns)))
                .collect());
        }

        let mut kept: Vec<Row> = Vec::new();
        'rows: for row in rows {
            for existing in &kept {
                if are_similar(&row, existing, &key_columns, threshold) {
                    continue 'rows;
                }
            }
            kept.push(row);
        }
        Ok(kept)
    }
}

fn normalize(value: &Value) -> String {
    value_text(value).trim().to_lowercase()
}

fn normalized_key(row: &Row, key_columns: &[String]) -> String {
    key_columns
        .iter()
        .map(|c| row.get(c).map(normalize).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

/// Every key column must clear the similarity threshold for two rows to
/// count as duplicates.
fn are_similar(a: &Row, b: &Row, key_columns: &[String], threshold: f64) -> bool {
    key_columns.iter().all(|column| {
        let left = a.get(column).map(normalize).unwrap_or_default();
        let right = b.get(column).map(normalize).unwrap_or_default();
        strsim::normalized_levenshtein(&left, &right) >= threshold
    })
}
