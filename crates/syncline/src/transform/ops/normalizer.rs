use super::{optional_str, string_list};
use crate::{
    row::{Row, Value},
    transform::{StepContext, TransformError, Transformation},
};

const OPERATOR: &str = "normalizer";

/// Unpivot: explodes the listed columns into one output row each, carrying
/// a key column and a value column. Columns outside the list are preserved
/// on every emitted row.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizerTransformation;

impl Transformation for NormalizerTransformation {
    fn type_name(&self) -> &'static str {
        "normalizer"
    }

    fn validate(&self, config: &Value) -> Result<(), TransformError> {
        let columns = string_list(config, "columns_to_denormalize", OPERATOR)?;
        if columns.is_empty() {
            return Err(TransformError::invalid(
                OPERATOR,
                "columns_to_denormalize is empty",
            ));
        }
        Ok(())
    }

    fn execute(
        &self,
        rows: Vec<Row>,
        config: &Value,
        _ctx: &mut StepContext,
    ) -> Result<Vec<Row>, TransformError> {
        let columns = string_list(config, "columns_to_denormalize", OPERATOR)?;
        let key_column = optional_str(config, "key_column_name").unwrap_or("key").to_string();
        let value_column = optional_str(config, "value_column_name")
            .unwrap_or("value")
            .to_string();

        let mut out = Vec::new();
        for row in rows {
            let mut base = Row::new();
            for (column, value) in &row {
                if !columns.contains(column) {
                    base.insert(column.clone(), value.clone());
                }
            }
            for column in &columns {
                let Some(value) = row.get(column) else {
                    continue;
                };
                let mut exploded = base.clone();
                exploded.insert(key_column.clone(), Value::String(column.clone()));
                exploded.insert(value_column.clone(), value.clone());
                out.push(exploded);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::row::row_of;

    #[test]
    fn test_unpivot_explodes_listed_columns() {
        let op = NormalizerTransformation;
        let config = json!({
            "columns_to_denormalize": ["q1", "q2"],
            "key_column_name": "quarter",
            "value_column_name": "revenue"
        });
        op.validate(&config).unwrap();
        let rows = vec![row_of(&[
            ("region", json!("EMEA")),
            ("q1", json!(100)),
            ("q2", json!(150)),
        ])];
        let out = op
            .execute(rows, &config, &mut StepContext::default())
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["region"], json!("EMEA"));
        assert_eq!(out[0]["quarter"], json!("q1"));
        assert_eq!(out[0]["revenue"], json!(100));
        assert_eq!(out[1]["quarter"], json!("q2"));
        assert!(!out[0].contains_key("q1"));
    }

    #[test]
    fn test_missing_listed_columns_are_skipped() {
        let op = NormalizerTransformation;
        let config = json!({"columns_to_denormalize": ["a", "b"]});
        let rows = vec![row_of(&[("a", json!(1)), ("other", json!("x"))])];
        let out = op
            .execute(rows, &config, &mut StepContext::default())
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["key"], json!("a"));
        assert_eq!(out[0]["value"], json!(1));
    }
}
