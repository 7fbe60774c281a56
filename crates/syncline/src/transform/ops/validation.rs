use regex::Regex;
use serde_json::json;

use super::{optional_str, require_str};
use crate::{
    row::{value_text, Row, Value},
    transform::{StepContext, TransformError, Transformation},
};

const OPERATOR: &str = "data_validation";

/// Validation of addresses, phone numbers and emails: emits the normalized
/// value in a target column plus an `is_valid` boolean.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataValidationTransformation;

impl Transformation for DataValidationTransformation {
    fn type_name(&self) -> &'static str {
        "data_validation"
    }

    fn validate(&self, config: &Value) -> Result<(), TransformError> {
        let validation_type = require_str(config, "validation_type", OPERATOR)?;
        if !matches!(validation_type, "address" | "phone" | "email") {
            return Err(TransformError::invalid(
                OPERATOR,
                format!("invalid validation_type: {validation_type}"),
            ));
        }
        require_str(config, "source_column", OPERATOR)?;
        Ok(())
    }

    fn execute(
        &self,
        rows: Vec<Row>,
        config: &Value,
        _ctx: &mut StepContext,
    ) -> Result<Vec<Row>, TransformError> {
        let validation_type = require_str(config, "validation_type", OPERATOR)?.to_string();
        let source_column = require_str(config, "source_column", OPERATOR)?.to_string();
        let target_column = optional_str(config, "target_column")
            .map_or_else(|| format!("{source_column}_validated"), str::to_string);
        let is_valid_column = optional_str(config, "is_valid_column")
            .unwrap_or("is_valid")
            .to_string();

        let mut out = Vec::with_capacity(rows.len());
        for mut row in rows {
            let raw = row.get(&source_column).map(|v| value_text(v));
            let (validated, is_valid) = match raw {
                None => (Value::Null, false),
                Some(raw) => match validation_type.as_str() {
                    "email" => validate_email(&raw),
                    "phone" => validate_phone(&raw),
                    _ => validate_address(&raw),
                },
            };
            row.insert(target_column.clone(), validated);
            row.insert(is_valid_column.clone(), json!(is_valid));
            out.push(row);
        }
        Ok(out)
    }
}

fn validate_email(raw: &str) -> (Value, bool) {
    let email = raw.trim().to_lowercase();
    let re = Regex::new(r"^[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}$").expect("static regex");
    if re.is_match(&email) {
        (json!(email), true)
    } else {
        (Value::Null, false)
    }
}

fn validate_phone(raw: &str) -> (Value, bool) {
    let has_plus = raw.trim_start().starts_with('+');
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if (10..=15).contains(&digits.len()) {
        let normalized = if has_plus {
            format!("+{digits}")
        } else {
            digits
        };
        (json!(normalized), true)
    } else {
        (Value::Null, false)
    }
}

fn validate_address(raw: &str) -> (Value, bool) {
    let trimmed = raw.trim();
    let has_number = trimmed.chars().any(|c| c.is_ascii_digit());
    let has_letters = trimmed.chars().filter(|c| c.is_alphabetic()).count() >= 3;
    if trimmed.len() >= 5 && has_number && has_letters {
        (json!(trimmed), true)
    } else {
        (Value::Null, false)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::row::row_of;

    fn run(rows: Vec<Row>, validation_type: &str, source: &str) -> Vec<Row> {
        let op = DataValidationTransformation;
        let config = json!({"validation_type": validation_type, "source_column": source});
        op.validate(&config).unwrap();
        op.execute(rows, &config, &mut StepContext::default())
            .unwrap()
    }

    #[test]
    fn test_email_validation() {
        let rows = vec![
            row_of(&[("email", json!(" Ada@Example.COM "))]),
            row_of(&[("email", json!("not-an-email"))]),
        ];
        let out = run(rows, "email", "email");
        assert_eq!(out[0]["email_validated"], json!("ada@example.com"));
        assert_eq!(out[0]["is_valid"], json!(true));
        assert_eq!(out[1]["email_validated"], Value::Null);
        assert_eq!(out[1]["is_valid"], json!(false));
    }

    #[test]
    fn test_phone_validation_normalizes_digits() {
        let rows = vec![
            row_of(&[("phone", json!("+49 (30) 1234-5678"))]),
            row_of(&[("phone", json!("12345"))]),
        ];
        let out = run(rows, "phone", "phone");
        assert_eq!(out[0]["phone_validated"], json!("+493012345678"));
        assert_eq!(out[0]["is_valid"], json!(true));
        assert_eq!(out[1]["is_valid"], json!(false));
    }

    #[test]
    fn test_address_needs_number_and_street() {
        let rows = vec![
            row_of(&[("addr", json!("42 Galaxy Way"))]),
            row_of(&[("addr", json!("nowhere"))]),
        ];
        let out = run(rows, "address", "addr");
        assert_eq!(out[0]["is_valid"], json!(true));
        assert_eq!(out[1]["is_valid"], json!(false));
    }
}
