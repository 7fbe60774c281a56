use std::collections::BTreeMap;

use serde_json::json;

use super::{optional_string_list, require_array};
use crate::{
    row::{numeric_value, Row, Value},
    transform::{StepContext, TransformError, Transformation},
};

const OPERATOR: &str = "aggregate";
const VALID_FUNCTIONS: &[&str] = &[
    "sum", "count", "avg", "min", "max", "stddev", "variance", "percentile",
];

/// Group-and-aggregate. Empty `group_by` collapses the input into a single
/// row. Non-numeric and missing values are skipped by the numeric
/// functions; `count` counts present (non-null) values. Aggregates are
/// emitted as doubles.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateTransformation;

impl Transformation for AggregateTransformation {
    fn type_name(&self) -> &'static str {
        "aggregate"
    }

    fn validate(&self, config: &Value) -> Result<(), TransformError> {
        let aggregations = require_array(config, "aggregations", OPERATOR)?;
        if aggregations.is_empty() {
            return Err(TransformError::invalid(OPERATOR, "aggregations is empty"));
        }
        for spec in aggregations {
            let function = spec
                .get("function")
                .and_then(Value::as_str)
                .ok_or_else(|| TransformError::invalid(OPERATOR, "aggregation needs a function"))?;
            if !VALID_FUNCTIONS.contains(&function) {
                return Err(TransformError::invalid(
                    OPERATOR,
                    format!("invalid aggregation function: {function}"),
                ));
            }
            if spec.get("column").and_then(Value::as_str).is_none() {
                return Err(TransformError::invalid(OPERATOR, "aggregation needs a column"));
            }
            if function == "percentile"
                && spec.get("percentile_value").and_then(Value::as_f64).is_none()
            {
                return Err(TransformError::invalid(
                    OPERATOR,
                    "percentile requires percentile_value",
                ));
            }
        }
        if let Some(group_by) = config.get("group_by") {
            if !group_by.is_array() && !group_by.is_null() {
                return Err(TransformError::invalid(OPERATOR, "group_by must be an array"));
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
        if rows.is_empty() {
            return Ok(rows);
        }
        let group_by = optional_string_list(config, "group_by", OPERATOR)?;
        let aggregations = require_array(config, "aggregations", OPERATOR)?;

        let mut groups: BTreeMap<String, Vec<&Row>> = BTreeMap::new();
        if group_by.is_empty() {
            groups.insert(String::new(), rows.iter().collect());
        } else {
            for row in &rows {
                let key = group_by
                    .iter()
                    .map(|c| row.get(c).map_or("NULL".to_string(), |v| v.to_string()))
                    .collect::<Vec<_>>()
                    .join("|||");
                groups.entry(key).or_default().push(row);
            }
        }

        let mut out = Vec::with_capacity(groups.len());
        for group in groups.values() {
            let mut result = Row::new();
            if let Some(first) = group.first() {
                for column in &group_by {
                    if let Some(value) = first.get(column) {
                        result.insert(column.clone(), value.clone());
                    }
                }
            }
            for spec in aggregations {
                let column = spec.get("column").and_then(Value::as_str).unwrap_or_default();
                let function = spec
                    .get("function")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let alias = spec
                    .get("alias")
                    .and_then(Value::as_str)
                    .map_or_else(|| format!("{column}_{function}"), str::to_string);
                let value = apply_function(group, column, function, spec);
                result.insert(alias, json!(value));
            }
            out.push(result);
        }
        Ok(out)
    }
}

fn apply_function(group: &[&Row], column: &str, function: &str, spec: &Value) -> f64 {
    if function == "count" {
        return group
            .iter()
            .filter(|row| row.get(column).is_some_and(|v| !v.is_null()))
            .count() as f64;
    }

    let mut values: Vec<f64> = group
        .iter()
        .filter_map(|row| row.get(column))
        .filter_map(numeric_value)
        .collect();
    if values.is_empty() {
        return 0.0;
    }

    match function {
        "sum" => values.iter().sum(),
        "avg" => values.iter().sum::<f64>() / values.len() as f64,
        "min" => values.iter().copied().fold(f64::INFINITY, f64::min),
        "max" => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        "stddev" => sample_variance(&values).sqrt(),
        "variance" => sample_variance(&values),
        "percentile" => {
            values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let p = spec
                .get("percentile_value")
                .and_then(Value::as_f64)
                .unwrap_or(0.5)
                .clamp(0.0, 1.0);
            let index = ((values.len() - 1) as f64 * p) as usize;
            values[index.min(values.len() - 1)]
        }
        _ => 0.0,
    }
}

fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (values.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::row::row_of;

    fn run(rows: Vec<Row>, config: Value) -> Vec<Row> {
        let op = AggregateTransformation;
        op.validate(&config).unwrap();
        op.execute(rows, &config, &mut StepContext::default()).unwrap()
    }

    #[test]
    fn test_grouped_sum() {
        let rows = vec![
            row_of(&[("g", json!("A")), ("v", json!(10))]),
            row_of(&[("g", json!("A")), ("v", json!(20))]),
            row_of(&[("g", json!("B")), ("v", json!(15))]),
        ];
        let out = run(
            rows,
            json!({
                "group_by": ["g"],
                "aggregations": [{"column": "v", "function": "sum", "alias": "t"}]
            }),
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["g"], json!("A"));
        assert_eq!(out[0]["t"], json!(30.0));
        assert_eq!(out[1]["g"], json!("B"));
        assert_eq!(out[1]["t"], json!(15.0));
    }

    #[test]
    fn test_empty_group_by_is_global_aggregation() {
        let rows = vec![
            row_of(&[("v", json!(1))]),
            row_of(&[("v", json!(2))]),
            row_of(&[("v", json!(3))]),
        ];
        let out = run(
            rows,
            json!({"aggregations": [
                {"column": "v", "function": "avg", "alias": "mean"},
                {"column": "v", "function": "min", "alias": "lo"},
                {"column": "v", "function": "max", "alias": "hi"}
            ]}),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["mean"], json!(2.0));
        assert_eq!(out[0]["lo"], json!(1.0));
        assert_eq!(out[0]["hi"], json!(3.0));
    }

    #[test]
    fn test_count_counts_present_values_only() {
        let rows = vec![
            row_of(&[("v", json!(1))]),
            row_of(&[("v", Value::Null)]),
            row_of(&[("other", json!(9))]),
            row_of(&[("v", json!("not numeric"))]),
        ];
        let out = run(
            rows,
            json!({"aggregations": [{"column": "v", "function": "count", "alias": "n"}]}),
        );
        assert_eq!(out[0]["n"], json!(2.0));
    }

    #[test]
    fn test_non_numeric_skipped_in_sum() {
        let rows = vec![
            row_of(&[("v", json!("12"))]),
            row_of(&[("v", json!("oops"))]),
            row_of(&[("v", json!(8))]),
        ];
        let out = run(
            rows,
            json!({"aggregations": [{"column": "v", "function": "sum", "alias": "s"}]}),
        );
        assert_eq!(out[0]["s"], json!(20.0));
    }

    #[test]
    fn test_stddev_and_percentile() {
        let rows: Vec<Row> = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]
            .iter()
            .map(|v| row_of(&[("v", json!(v))]))
            .collect();
        let out = run(
            rows,
            json!({"aggregations": [
                {"column": "v", "function": "stddev", "alias": "sd"},
                {"column": "v", "function": "percentile", "alias": "p50", "percentile_value": 0.5}
            ]}),
        );
        let sd = out[0]["sd"].as_f64().unwrap();
        assert!((sd - 2.138).abs() < 0.01);
        assert_eq!(out[0]["p50"], json!(4.0));
    }

    #[test]
    fn test_percentile_requires_value() {
        let op = AggregateTransformation;
        let err = op.validate(&json!({
            "aggregations": [{"column": "v", "function": "percentile"}]
        }));
        assert!(err.is_err());
    }

    #[test]
    fn test_unknown_function_rejected() {
        let op = AggregateTransformation;
        assert!(op
            .validate(&json!({"aggregations": [{"column": "v", "function": "median"}]}))
            .is_err());
    }
}
