use std::cmp::Ordering;

use super::require_array;
use crate::{
    row::{compare_values, Row, Value},
    transform::{StepContext, TransformError, Transformation},
};

const OPERATOR: &str = "sorter";

/// Stable multi-column sort. Nulls order before non-nulls; numerics compare
/// as numbers, strings lexicographically, anything else by serialized form.
#[derive(Debug, Clone, Copy, Default)]
pub struct SorterTransformation;

impl Transformation for SorterTransformation {
    fn type_name(&self) -> &'static str {
        "sorter"
    }

    fn validate(&self, config: &Value) -> Result<(), TransformError> {
        let sort_columns = require_array(config, "sort_columns", OPERATOR)?;
        if sort_columns.is_empty() {
            return Err(TransformError::invalid(OPERATOR, "sort_columns is empty"));
        }
        for spec in sort_columns {
            if spec.get("column").and_then(Value::as_str).is_none() {
                return Err(TransformError::invalid(OPERATOR, "sort spec needs a column"));
            }
            if let Some(order) = spec.get("order").and_then(Value::as_str) {
                if order != "asc" && order != "desc" {
                    return Err(TransformError::invalid(
                        OPERATOR,
                        format!("invalid sort order: {order}"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn execute(
        &self,
        mut rows: Vec<Row>,
        config: &Value,
        _ctx: &mut StepContext,
    ) -> Result<Vec<Row>, TransformError> {
        let specs: Vec<(String, bool)> = require_array(config, "sort_columns", OPERATOR)?
            .iter()
            .filter_map(|spec| {
                let column = spec.get("column")?.as_str()?.to_string();
                let descending = spec.get("order").and_then(Value::as_str) == Some("desc");
                Some((column, descending))
            })
            .collect();

        rows.sort_by(|a, b| {
            for (column, descending) in &specs {
                let left = a.get(column).unwrap_or(&Value::Null);
                let right = b.get(column).unwrap_or(&Value::Null);
                let ordering = compare_values(left, right);
                if ordering != Ordering::Equal {
                    return if *descending {
                        ordering.reverse()
                    } else {
                        ordering
                    };
                }
            }
            Ordering::Equal
        });
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::row::row_of;

    #[test]
    fn test_numeric_sort_with_nulls_first() {
        let op = SorterTransformation;
        let config = json!({"sort_columns": [{"column": "v", "order": "asc"}]});
        op.validate(&config).unwrap();
        let rows = vec![
            row_of(&[("v", json!(10))]),
            row_of(&[("v", Value::Null)]),
            row_of(&[("v", json!(2))]),
        ];
        let out = op
            .execute(rows, &config, &mut StepContext::default())
            .unwrap();
        assert_eq!(out[0]["v"], Value::Null);
        assert_eq!(out[1]["v"], json!(2));
        assert_eq!(out[2]["v"], json!(10));
    }

    #[test]
    fn test_multi_column_desc_is_stable() {
        let op = SorterTransformation;
        let config = json!({"sort_columns": [
            {"column": "g", "order": "asc"},
            {"column": "v", "order": "desc"}
        ]});
        let rows = vec![
            row_of(&[("g", json!("b")), ("v", json!(1)), ("seq", json!(0))]),
            row_of(&[("g", json!("a")), ("v", json!(1)), ("seq", json!(1))]),
            row_of(&[("g", json!("a")), ("v", json!(1)), ("seq", json!(2))]),
            row_of(&[("g", json!("a")), ("v", json!(5)), ("seq", json!(3))]),
        ];
        let out = op
            .execute(rows, &config, &mut StepContext::default())
            .unwrap();
        assert_eq!(out[0]["v"], json!(5));
        // Equal keys keep input order.
        assert_eq!(out[1]["seq"], json!(1));
        assert_eq!(out[2]["seq"], json!(2));
        assert_eq!(out[3]["g"], json!("b"));
    }
}
