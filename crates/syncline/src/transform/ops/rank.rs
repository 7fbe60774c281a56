use std::collections::HashMap;

use serde_json::json;

use super::{optional_string_list, require_str};
use crate::{
    row::{compare_values, Row, Value},
    transform::{StepContext, TransformError, Transformation},
};

const OPERATOR: &str = "rank";
const RANK_COLUMN: &str = "_rank";
const VALID_TYPES: &[&str] = &["top_n", "bottom_n", "rank", "dense_rank", "row_number"];

/// Ranking and truncation over an order column, optionally partitioned.
/// `top_n`/`bottom_n` truncate each partition; the ranking variants emit a
/// `_rank` column.
#[derive(Debug, Clone, Copy, Default)]
pub struct RankTransformation;

impl Transformation for RankTransformation {
    fn type_name(&self) -> &'static str {
        "rank"
    }

    fn validate(&self, config: &Value) -> Result<(), TransformError> {
        let rank_type = require_str(config, "rank_type", OPERATOR)?;
        if !VALID_TYPES.contains(&rank_type) {
            return Err(TransformError::invalid(
                OPERATOR,
                format!("invalid rank_type: {rank_type}"),
            ));
        }
        require_str(config, "order_column", OPERATOR)?;
        if (rank_type == "top_n" || rank_type == "bottom_n")
            && config.get("n").and_then(Value::as_u64).is_none()
        {
            return Err(TransformError::invalid(OPERATOR, "top/bottom require n"));
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
        let rank_type = require_str(config, "rank_type", OPERATOR)?.to_string();
        let order_column = require_str(config, "order_column", OPERATOR)?.to_string();
        let partition_by = optional_string_list(config, "partition_by", OPERATOR)?;
        let n = config.get("n").and_then(Value::as_u64).unwrap_or(10) as usize;

        // Partitions in first-occurrence order.
        let mut partition_index: HashMap<String, usize> = HashMap::new();
        let mut partitions: Vec<Vec<Row>> = Vec::new();
        for row in rows {
            let key = partition_by
                .iter()
                .map(|c| row.get(c).map_or("NULL".to_string(), |v| v.to_string()))
                .collect::<Vec<_>>()
                .join("|");
            match partition_index.get(&key) {
                Some(&idx) => partitions[idx].push(row),
                None => {
                    partition_index.insert(key, partitions.len());
                    partitions.push(vec![row]);
                }
            }
        }

        let mut out = Vec::new();
        for mut partition in partitions {
            let descending = rank_type == "top_n";
            partition.sort_by(|a, b| {
                let ordering = compare_values(
                    a.get(&order_column).unwrap_or(&Value::Null),
                    b.get(&order_column).unwrap_or(&Value::Null),
                );
                if descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });

            match rank_type.as_str() {
                "top_n" | "bottom_n" => {
                    partition.truncate(n);
                    out.extend(partition);
                }
                "row_number" => {
                    for (i, mut row) in partition.into_iter().enumerate() {
                        row.insert(RANK_COLUMN.to_string(), json!(i as u64 + 1));
                        out.push(row);
                    }
                }
                "rank" | "dense_rank" => {
                    let dense = rank_type == "dense_rank";
                    let mut rank = 0u64;
                    let mut previous: Option<Value> = None;
                    for (i, mut row) in partition.into_iter().enumerate() {
                        let current = row.get(&order_column).cloned().unwrap_or(Value::Null);
                        let tied = previous.as_ref() == Some(&current);
                        if !tied {
                            rank = if dense { rank + 1 } else { i as u64 + 1 };
                        }
                        previous = Some(current);
                        row.insert(RANK_COLUMN.to_string(), json!(rank));
                        out.push(row);
                    }
                }
                _ => unreachable!("validated rank_type"),
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

    fn rows() -> Vec<Row> {
        vec![
            row_of(&[("g", json!("a")), ("v", json!(30))]),
            row_of(&[("g", json!("a")), ("v", json!(10))]),
            row_of(&[("g", json!("a")), ("v", json!(20))]),
            row_of(&[("g", json!("b")), ("v", json!(5))]),
        ]
    }

    fn run(config: Value) -> Vec<Row> {
        let op = RankTransformation;
        op.validate(&config).unwrap();
        op.execute(rows(), &config, &mut StepContext::default())
            .unwrap()
    }

    #[test]
    fn test_top_n_truncates_per_partition() {
        let out = run(json!({
            "rank_type": "top_n",
            "order_column": "v",
            "partition_by": ["g"],
            "n": 2
        }));
        assert_eq!(out.len(), 3);
        assert_eq!(out[0]["v"], json!(30));
        assert_eq!(out[1]["v"], json!(20));
        assert_eq!(out[2]["g"], json!("b"));
    }

    #[test]
    fn test_row_number_emits_rank_column() {
        let out = run(json!({
            "rank_type": "row_number",
            "order_column": "v",
            "partition_by": ["g"]
        }));
        assert_eq!(out[0]["_rank"], json!(1));
        assert_eq!(out[0]["v"], json!(10));
        assert_eq!(out[2]["_rank"], json!(3));
    }

    #[test]
    fn test_rank_vs_dense_rank_with_ties() {
        let tied = vec![
            row_of(&[("v", json!(1))]),
            row_of(&[("v", json!(1))]),
            row_of(&[("v", json!(2))]),
        ];
        let op = RankTransformation;
        let ranks = |rank_type: &str| {
            op.execute(
                tied.clone(),
                &json!({"rank_type": rank_type, "order_column": "v"}),
                &mut StepContext::default(),
            )
            .unwrap()
            .iter()
            .map(|r| r["_rank"].as_u64().unwrap())
            .collect::<Vec<_>>()
        };
        assert_eq!(ranks("rank"), vec![1, 1, 3]);
        assert_eq!(ranks("dense_rank"), vec![1, 1, 2]);
    }

    #[test]
    fn test_top_n_requires_n() {
        let op = RankTransformation;
        assert!(op
            .validate(&json!({"rank_type": "top_n", "order_column": "v"}))
            .is_err());
    }
}
