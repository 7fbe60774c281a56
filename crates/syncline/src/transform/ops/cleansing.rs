use super::require_array;
use crate::{
    row::{Row, Value},
    transform::{StepContext, TransformError, Transformation},
};

const OPERATOR: &str = "data_cleansing";
const VALID_OPERATIONS: &[&str] = &[
    "trim",
    "uppercase",
    "lowercase",
    "remove_special",
    "remove_whitespace",
    "remove_leading_zeros",
    "normalize_whitespace",
];

/// Per-column string cleansing, applied in rule order. Non-string values
/// pass through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataCleansingTransformation;

impl Transformation for DataCleansingTransformation {
    fn type_name(&self) -> &'static str {
        "data_cleansing"
    }

    fn validate(&self, config: &Value) -> Result<(), TransformError> {
        let rules = require_array(config, "rules", OPERATOR)?;
        if rules.is_empty() {
            return Err(TransformError::invalid(OPERATOR, "rules is empty"));
        }
        for rule in rules {
            if rule.get("column").and_then(Value::as_str).is_none() {
                return Err(TransformError::invalid(OPERATOR, "rule needs a column"));
            }
            let operations = rule
                .get("operations")
                .and_then(Value::as_array)
                .ok_or_else(|| TransformError::invalid(OPERATOR, "rule needs operations"))?;
            for operation in operations {
                let operation = operation.as_str().unwrap_or_default();
                if !VALID_OPERATIONS.contains(&operation) {
                    return Err(TransformError::invalid(
                        OPERATOR,
                        format!("invalid cleansing operation: {operation}"),
                    ));
                }
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
        let rules = require_array(config, "rules", OPERATOR)?;
        let mut out = Vec::with_capacity(rows.len());
        for mut row in rows {
            for rule in rules {
                let column = rule.get("column").and_then(Value::as_str).unwrap_or_default();
                let Some(Value::String(current)) = row.get(column) else {
                    continue;
                };
                let mut value = current.clone();
                if let Some(operations) = rule.get("operations").and_then(Value::as_array) {
                    for operation in operations {
                        value = apply(&value, operation.as_str().unwrap_or_default());
                    }
                }
                row.insert(column.to_string(), Value::String(value));
            }
            out.push(row);
        }
        Ok(out)
    }
}

fn apply(value: &str, operation: &str) -> String {
    match operation {
        "trim" => value.trim().to_string(),
        "uppercase" => value.to_uppercase(),
        "lowercase" => value.to_lowercase(),
        "remove_special" => value
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .collect(),
        "remove_whitespace" => value.chars().filter(|c| !c.is_whitespace()).collect(),
        "remove_leading_zeros" => {
            let stripped = value.trim_start_matches('0');
            if stripped.is_empty() && !value.is_empty() {
                "0".to_string()
            } else {
                stripped.to_string()
            }
        }
        "normalize_whitespace" => value.split_whitespace().collect::<Vec<_>>().join(" "),
        _ => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::row::row_of;

    #[test]
    fn test_operations_apply_in_order() {
        let op = DataCleansingTransformation;
        let config = json!({"rules": [
            {"column": "name", "operations": ["trim", "uppercase"]},
            {"column": "code", "operations": ["remove_leading_zeros"]},
            {"column": "text", "operations": ["normalize_whitespace"]},
            {"column": "id", "operations": ["remove_special", "remove_whitespace"]}
        ]});
        op.validate(&config).unwrap();
        let rows = vec![row_of(&[
            ("name", json!("  ada  ")),
            ("code", json!("000140")),
            ("text", json!("a   b\t c")),
            ("id", json!("A-1 b!2")),
            ("untouched", json!(7)),
        ])];
        let out = op
            .execute(rows, &config, &mut StepContext::default())
            .unwrap();
        assert_eq!(out[0]["name"], json!("ADA"));
        assert_eq!(out[0]["code"], json!("140"));
        assert_eq!(out[0]["text"], json!("a b c"));
        assert_eq!(out[0]["id"], json!("A1b2"));
        assert_eq!(out[0]["untouched"], json!(7));
    }

    #[test]
    fn test_all_zeros_keeps_one() {
        assert_eq!(apply("0000", "remove_leading_zeros"), "0");
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let op = DataCleansingTransformation;
        assert!(op
            .validate(&json!({"rules": [{"column": "a", "operations": ["explode"]}]}))
            .is_err());
    }
}
