use std::collections::BTreeMap;

use serde_json::json;

use super::{optional_str, require_array};
use crate::{
    row::{compare_values, numeric_value, value_text, Row, Value},
    transform::{StepContext, TransformError, Transformation},
};

const OPERATOR: &str = "router";
const ROUTE_COLUMN: &str = "_route_name";
const VALID_OPS: &[&str] = &[
    "=", "!=", ">", "<", ">=", "<=", "LIKE", "IN", "NOT IN", "IS NULL", "IS NOT NULL",
];

/// Conditional routing: the first matching route claims a row; rows with no
/// match fall into `default_route` or are dropped. Routed rows carry a
/// `_route_name` column.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterTransformation;

impl Transformation for RouterTransformation {
    fn type_name(&self) -> &'static str {
        "router"
    }

    fn validate(&self, config: &Value) -> Result<(), TransformError> {
        let routes = require_array(config, "routes", OPERATOR)?;
        if routes.is_empty() {
            return Err(TransformError::invalid(OPERATOR, "routes is empty"));
        }
        for route in routes {
            if route.get("name").and_then(Value::as_str).is_none() {
                return Err(TransformError::invalid(OPERATOR, "route needs a name"));
            }
            let condition = route
                .get("condition")
                .ok_or_else(|| TransformError::invalid(OPERATOR, "route needs a condition"))?;
            if condition.get("column").and_then(Value::as_str).is_none() {
                return Err(TransformError::invalid(OPERATOR, "condition needs a column"));
            }
            let op = condition
                .get("op")
                .and_then(Value::as_str)
                .ok_or_else(|| TransformError::invalid(OPERATOR, "condition needs an op"))?;
            if !VALID_OPS.contains(&op) {
                return Err(TransformError::invalid(
                    OPERATOR,
                    format!("invalid condition operator: {op}"),
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
        let routes = require_array(config, "routes", OPERATOR)?;
        let default_route = optional_str(config, "default_route").unwrap_or_default();

        let mut groups: BTreeMap<String, Vec<Row>> = BTreeMap::new();
        for row in rows {
            let mut matched = None;
            for route in routes {
                let name = route.get("name").and_then(Value::as_str).unwrap_or_default();
                let condition = route.get("condition").cloned().unwrap_or(Value::Null);
                if evaluate_condition(&row, &condition) {
                    matched = Some(name.to_string());
                    break;
                }
            }
            let route_name = match matched {
                Some(name) => name,
                None if !default_route.is_empty() => default_route.to_string(),
                None => continue,
            };
            groups.entry(route_name).or_default().push(row);
        }

        let mut out = Vec::new();
        for (route_name, routed) in groups {
            for mut row in routed {
                row.insert(ROUTE_COLUMN.to_string(), json!(route_name));
                out.push(row);
            }
        }
        Ok(out)
    }
}

fn evaluate_condition(row: &Row, condition: &Value) -> bool {
    let Some(column) = condition.get("column").and_then(Value::as_str) else {
        return false;
    };
    let op = condition.get("op").and_then(Value::as_str).unwrap_or("=");
    let expected = condition.get("value").cloned().unwrap_or(Value::Null);
    let actual = row.get(column).cloned().unwrap_or(Value::Null);

    match op {
        "IS NULL" => actual.is_null(),
        "IS NOT NULL" => !actual.is_null(),
        "=" => values_equal(&actual, &expected),
        "!=" => !values_equal(&actual, &expected),
        ">" | "<" | ">=" | "<=" => {
            if actual.is_null() || expected.is_null() {
                return false;
            }
            let ordering = compare_values(&actual, &expected);
            match op {
                ">" => ordering == std::cmp::Ordering::Greater,
                "<" => ordering == std::cmp::Ordering::Less,
                ">=" => ordering != std::cmp::Ordering::Less,
                _ => ordering != std::cmp::Ordering::Greater,
            }
        }
        "LIKE" => {
            let Value::String(pattern) = &expected else {
                return false;
            };
            like_match(&value_text(&actual), pattern)
        }
        "IN" => expected
            .as_array()
            .is_some_and(|values| values.iter().any(|v| values_equal(&actual, v))),
        "NOT IN" => expected
            .as_array()
            .is_some_and(|values| !values.iter().any(|v| values_equal(&actual, v))),
        _ => false,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (numeric_value(a), numeric_value(b)) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => false,
    }
}

/// SQL LIKE over `%` (any run) and `_` (single char).
fn like_match(value: &str, pattern: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');
    for c in pattern.chars() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            c => regex.push_str(&regex::escape(&c.to_string())),
        }
    }
    regex.push('$');
    regex::Regex::new(&regex).is_ok_and(|re| re.is_match(value))
}
