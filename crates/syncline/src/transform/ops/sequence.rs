use serde_json::json;

use super::require_str;
use crate::{
    row::{Row, Value},
    transform::{StepContext, TransformError, Transformation},
};

const OPERATOR: &str = "sequence_generator";

/// Deterministic integer sequence in input order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceGeneratorTransformation;

impl Transformation for SequenceGeneratorTransformation {
    fn type_name(&self) -> &'static str {
        "sequence_generator"
    }

    fn validate(&self, config: &Value) -> Result<(), TransformError> {
        require_str(config, "target_column", OPERATOR)?;
        Ok(())
    }

    fn execute(
        &self,
        rows: Vec<Row>,
        config: &Value,
        _ctx: &mut StepContext,
    ) -> Result<Vec<Row>, TransformError> {
        let target_column = require_str(config, "target_column", OPERATOR)?.to_string();
        let start = config.get("start_value").and_then(Value::as_i64).unwrap_or(1);
        let increment = config.get("increment").and_then(Value::as_i64).unwrap_or(1);

        let mut current = start;
        let mut out = Vec::with_capacity(rows.len());
        for mut row in rows {
            row.insert(target_column.clone(), json!(current));
            current += increment;
            out.push(row);
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
    fn test_sequence_in_input_order() {
        let op = SequenceGeneratorTransformation;
        let config = json!({"target_column": "seq", "start_value": 100, "increment": 10});
        op.validate(&config).unwrap();
        let rows = vec![
            row_of(&[("v", json!("a"))]),
            row_of(&[("v", json!("b"))]),
            row_of(&[("v", json!("c"))]),
        ];
        let out = op
            .execute(rows, &config, &mut StepContext::default())
            .unwrap();
        assert_eq!(out[0]["seq"], json!(100));
        assert_eq!(out[1]["seq"], json!(110));
        assert_eq!(out[2]["seq"], json!(120));
    }

    #[test]
    fn test_defaults_start_at_one() {
        let op = SequenceGeneratorTransformation;
        let config = json!({"target_column": "n"});
        let rows = vec![row_of(&[("v", json!(0))])];
        let out = op
            .execute(rows, &config, &mut StepContext::default())
            .unwrap();
        assert_eq!(out[0]["n"], json!(1));
    }
}
