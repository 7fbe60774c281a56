use super::{require_array, string_list};
use crate::{
    join::{execute_join, JoinConfig, JoinType, TableStats},
    row::{Row, Value},
    transform::{StepContext, TransformError, Transformation},
};

const OPERATOR: &str = "join";

/// Equi-join of the pipeline batch against an inline right side. Algorithm
/// selection and execution are delegated to the join optimizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JoinTransformation;

impl Transformation for JoinTransformation {
    fn type_name(&self) -> &'static str {
        "join"
    }

    fn validate(&self, config: &Value) -> Result<(), TransformError> {
        require_array(config, "right_data", OPERATOR)?;
        let left = string_list(config, "left_columns", OPERATOR)?;
        let right = string_list(config, "right_columns", OPERATOR)?;
        if left.is_empty() || left.len() != right.len() {
            return Err(TransformError::invalid(
                OPERATOR,
                "left_columns and right_columns must pair up",
            ));
        }
        if let Some(join_type) = config.get("join_type").and_then(Value::as_str) {
            join_type
                .parse::<JoinType>()
                .map_err(|_| TransformError::invalid(OPERATOR, format!("invalid join_type: {join_type}")))?;
        }
        Ok(())
    }

    fn execute(
        &self,
        rows: Vec<Row>,
        config: &Value,
        _ctx: &mut StepContext,
    ) -> Result<Vec<Row>, TransformError> {
        let right: Vec<Row> = require_array(config, "right_data", OPERATOR)?
            .iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();
        let join_type = config
            .get("join_type")
            .and_then(Value::as_str)
            .unwrap_or("inner")
            .parse::<JoinType>()
            .map_err(|_| TransformError::invalid(OPERATOR, "invalid join_type"))?;

        let join_config = JoinConfig {
            left_table: "pipeline".to_string(),
            right_table: "right".to_string(),
            left_columns: string_list(config, "left_columns", OPERATOR)?,
            right_columns: string_list(config, "right_columns", OPERATOR)?,
            join_type,
            left_stats: TableStats::estimate("pipeline", &rows),
            right_stats: TableStats::estimate("right", &right),
            ..JoinConfig::default()
        };

        let outcome = execute_join(&join_config, &rows, &right)?;
        tracing::debug!(
            algorithm = %outcome.algorithm_used,
            rows = outcome.rows.len(),
            "join step finished"
        );
        Ok(outcome.rows)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::row::row_of;

    #[test]
    fn test_inner_join_by_config() {
        let op = JoinTransformation;
        let config = json!({
            "right_data": [{"id": 1, "d": "X"}, {"id": 2, "d": "Y"}],
            "join_type": "left",
            "left_columns": ["id"],
            "right_columns": ["id"]
        });
        op.validate(&config).unwrap();
        let rows = vec![
            row_of(&[("id", json!(1)), ("n", json!("A"))]),
            row_of(&[("id", json!(3)), ("n", json!("C"))]),
        ];
        let out = op
            .execute(rows, &config, &mut StepContext::default())
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["d"], json!("X"));
        assert_eq!(out[1]["d"], Value::Null);
    }

    #[test]
    fn test_validate_rejects_mismatched_columns() {
        let op = JoinTransformation;
        assert!(op
            .validate(&json!({
                "right_data": [],
                "left_columns": ["a"],
                "right_columns": ["a", "b"]
            }))
            .is_err());
    }
}
