use std::collections::HashMap;

use serde_json::json;

use super::require_array;
use crate::{
    row::{compare_values, Row, Value},
    transform::{StepContext, TransformError, Transformation},
};

const OPERATOR: &str = "window_functions";
const VALID_FUNCTIONS: &[&str] = &[
    "row_number",
    "lag",
    "lead",
    "first_value",
    "last_value",
    "rank",
    "dense_rank",
];

/// Windowed analytics: each window spec is applied per partition in
/// `order_by` order, writing its result into `target_column`. Input row
/// order is preserved in the output.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowFunctionsTransformation;

#[derive(Debug)]
struct WindowSpec {
    function: String,
    target_column: String,
    source_column: Option<String>,
    partition_by: Vec<String>,
    order_by: Vec<String>,
    offset: usize,
    default_value: Value,
}

impl WindowSpec {
    fn parse(spec: &Value) -> Result<Self, TransformError> {
        let function = spec
            .get("function")
            .and_then(Value::as_str)
            .ok_or_else(|| TransformError::invalid(OPERATOR, "window needs a function"))?;
        if !VALID_FUNCTIONS.contains(&function) {
            return Err(TransformError::invalid(
                OPERATOR,
                format!("invalid window function: {function}"),
            ));
        }
        let target_column = spec
            .get("target_column")
            .and_then(Value::as_str)
            .ok_or_else(|| TransformError::invalid(OPERATOR, "window needs a target_column"))?;
        let needs_source = matches!(function, "lag" | "lead" | "first_value" | "last_value");
        let source_column = spec.get("source_column").and_then(Value::as_str);
        if needs_source && source_column.is_none() {
            return Err(TransformError::invalid(
                OPERATOR,
                format!("{function} needs a source_column"),
            ));
        }

        let list = |key: &str| -> Vec<String> {
            match spec.get(key) {
                Some(Value::String(s)) => vec![s.clone()],
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                _ => Vec::new(),
            }
        };

        Ok(Self {
            function: function.to_string(),
            target_column: target_column.to_string(),
            source_column: source_column.map(str::to_string),
            partition_by: list("partition_by"),
            order_by: list("order_by"),
            offset: spec.get("offset").and_then(Value::as_u64).unwrap_or(1) as usize,
            default_value: spec.get("default_value").cloned().unwrap_or(Value::Null),
        })
    }
}

impl Transformation for WindowFunctionsTransformation {
    fn type_name(&self) -> &'static str {
        "window_functions"
    }

    fn validate(&self, config: &Value) -> Result<(), TransformError> {
        let windows = require_array(config, "windows", OPERATOR)?;
        if windows.is_empty() {
            return Err(TransformError::invalid(OPERATOR, "windows is empty"));
        }
        for spec in windows {
            WindowSpec::parse(spec)?;
        }
        Ok(())
    }

    fn execute(
        &self,
        mut rows: Vec<Row>,
        config: &Value,
        _ctx: &mut StepContext,
    ) -> Result<Vec<Row>, TransformError> {
        if rows.is_empty() {
            return Ok(rows);
        }
        let windows: Vec<WindowSpec> = require_array(config, "windows", OPERATOR)?
            .iter()
            .map(WindowSpec::parse)
            .collect::<Result<_, _>>()?;

        for window in &windows {
            apply_window(&mut rows, window);
        }
        Ok(rows)
    }
}

fn apply_window(rows: &mut [Row], window: &WindowSpec) {
    // Partition indices in first-occurrence order.
    let mut partitions: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, row) in rows.iter().enumerate() {
        let key = window
            .partition_by
            .iter()
            .map(|c| row.get(c).map_or("NULL".to_string(), |v| v.to_string()))
            .collect::<Vec<_>>()
            .join("|");
        partitions.entry(key).or_default().push(idx);
    }

    for indices in partitions.values() {
        let mut ordered = indices.clone();
        ordered.sort_by(|&a, &b| {
            for column in &window.order_by {
                let ordering = compare_values(
                    rows[a].get(column).unwrap_or(&Value::Null),
                    rows[b].get(column).unwrap_or(&Value::Null),
                );
                if ordering != std::cmp::Ordering::Equal {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });

        let source = |position: usize| -> Value {
            window
                .source_column
                .as_ref()
                .and_then(|c| rows[ordered[position]].get(c))
                .cloned()
                .unwrap_or(Value::Null)
        };
        let order_key = |position: usize| -> Value {
            window
                .order_by
                .first()
                .and_then(|c| rows[ordered[position]].get(c))
                .cloned()
                .unwrap_or(Value::Null)
        };

        let values: Vec<Value> = match window.function.as_str() {
            "row_number" => (0..ordered.len()).map(|i| json!(i as u64 + 1)).collect(),
            "lag" => (0..ordered.len())
                .map(|i| {
                    i.checked_sub(window.offset)
                        .map_or_else(|| window.default_value.clone(), source)
                })
                .collect(),
            "lead" => (0..ordered.len())
                .map(|i| {
                    let position = i + window.offset;
                    if position < ordered.len() {
                        source(position)
                    } else {
                        window.default_value.clone()
                    }
                })
                .collect(),
            "first_value" => (0..ordered.len()).map(|_| source(0)).collect(),
            "last_value" => {
                let last = source(ordered.len() - 1);
                (0..ordered.len()).map(|_| last.clone()).collect()
            }
            "rank" | "dense_rank" => {
                let dense = window.function == "dense_rank";
                let mut out = Vec::with_capacity(ordered.len());
                let mut rank = 0u64;
                let mut previous: Option<Value> = None;
                for i in 0..ordered.len() {
                    let current = order_key(i);
                    if previous.as_ref() != Some(&current) {
                        rank = if dense { rank + 1 } else { i as u64 + 1 };
                    }
                    previous = Some(current);
                    out.push(json!(rank));
                }
                out
            }
            _ => unreachable!("validated window function"),
        };

        for (position, value) in values.into_iter().enumerate() {
            rows[ordered[position]].insert(window.target_column.clone(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::row::row_of;

    fn rows() -> Vec<Row> {
        vec![
            row_of(&[("g", json!("a")), ("t", json!(2)), ("v", json!(20))]),
            row_of(&[("g", json!("a")), ("t", json!(1)), ("v", json!(10))]),
            row_of(&[("g", json!("b")), ("t", json!(1)), ("v", json!(99))]),
        ]
    }

    fn run(config: Value) -> Vec<Row> {
        let op = WindowFunctionsTransformation;
        op.validate(&config).unwrap();
        op.execute(rows(), &config, &mut StepContext::default())
            .unwrap()
    }

    #[test]
    fn test_lag_per_partition_in_order() {
        let out = run(json!({"windows": [{
            "function": "lag",
            "target_column": "prev_v",
            "source_column": "v",
            "partition_by": ["g"],
            "order_by": "t",
            "default_value": 0
        }]}));
        // Input order preserved; the t=2 row lags to the t=1 value.
        assert_eq!(out[0]["prev_v"], json!(10));
        assert_eq!(out[1]["prev_v"], json!(0));
        assert_eq!(out[2]["prev_v"], json!(0));
    }

    #[test]
    fn test_row_number_and_first_value() {
        let out = run(json!({"windows": [
            {"function": "row_number", "target_column": "rn", "partition_by": ["g"], "order_by": "t"},
            {"function": "first_value", "target_column": "first_v", "source_column": "v",
             "partition_by": ["g"], "order_by": "t"}
        ]}));
        assert_eq!(out[0]["rn"], json!(2));
        assert_eq!(out[1]["rn"], json!(1));
        assert_eq!(out[0]["first_v"], json!(10));
        assert_eq!(out[2]["first_v"], json!(99));
    }

    #[test]
    fn test_lead_runs_off_the_end_to_default() {
        let out = run(json!({"windows": [{
            "function": "lead",
            "target_column": "next_v",
            "source_column": "v",
            "partition_by": ["g"],
            "order_by": "t",
            "default_value": -1
        }]}));
        assert_eq!(out[1]["next_v"], json!(20));
        assert_eq!(out[0]["next_v"], json!(-1));
    }

    #[test]
    fn test_validate_requires_source_for_lag() {
        let op = WindowFunctionsTransformation;
        assert!(op
            .validate(&json!({"windows": [{"function": "lag", "target_column": "x"}]}))
            .is_err());
    }
}
