//! Distributed join delegation: algorithm choice over size thresholds, SQL
//! emission with the matching hint, and a single-pass submit to the
//! external fabric. Rows never stream back into the local engine; only the
//! resulting count does.

use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{JoinConfig, JoinError};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DistributedAlgorithm {
    Broadcast,
    ShuffleHash,
    SortMerge,
}

/// External execution fabric; submits one SQL text and reports the number
/// of rows the statement produced.
#[async_trait]
pub trait DistributedBackend: Send + Sync + Debug {
    fn name(&self) -> &str;
    async fn submit(&self, sql: &str) -> Result<u64, JoinError>;
}

#[derive(Debug, Clone)]
pub struct DistributedJoinResult {
    pub algorithm_used: DistributedAlgorithm,
    pub row_count: u64,
    pub sql: String,
}

/// Broadcast when the smaller side fits under the byte threshold,
/// sort-merge for very large pairs, shuffle-hash for everything between.
pub fn select_distributed_algorithm(
    config: &JoinConfig,
    broadcast_threshold_mb: u64,
) -> DistributedAlgorithm {
    let smaller_mb = config
        .left_stats
        .estimated_size_bytes
        .min(config.right_stats.estimated_size_bytes)
        / (1024 * 1024);
    if smaller_mb < broadcast_threshold_mb {
        return DistributedAlgorithm::Broadcast;
    }
    let larger_rows = config
        .left_stats
        .estimated_rows
        .max(config.right_stats.estimated_rows);
    if larger_rows > 10_000_000 {
        return DistributedAlgorithm::SortMerge;
    }
    DistributedAlgorithm::ShuffleHash
}

/// SQL text for the join with the fabric hint matching the algorithm.
pub fn distributed_join_sql(config: &JoinConfig, algorithm: DistributedAlgorithm) -> String {
    let hint = match algorithm {
        DistributedAlgorithm::Broadcast => {
            let smaller = if config.left_stats.estimated_size_bytes
                <= config.right_stats.estimated_size_bytes
            {
                &config.left_table
            } else {
                &config.right_table
            };
            format!("/*+ BROADCAST({smaller}) */ ")
        }
        DistributedAlgorithm::ShuffleHash => "/*+ SHUFFLE_HASH */ ".to_string(),
        DistributedAlgorithm::SortMerge => "/*+ MERGE */ ".to_string(),
    };

    let join_kind = match config.join_type {
        super::JoinType::Inner => "INNER JOIN",
        super::JoinType::Left => "LEFT OUTER JOIN",
        super::JoinType::Right => "RIGHT OUTER JOIN",
        super::JoinType::FullOuter => "FULL OUTER JOIN",
    };

    let on = config
        .left_columns
        .iter()
        .zip(&config.right_columns)
        .map(|(l, r)| format!("l.{l} = r.{r}"))
        .collect::<Vec<_>>()
        .join(" AND ");

    format!(
        "SELECT {hint}l.*, r.* FROM {left} l {join_kind} {right} r ON {on}",
        left = config.left_table,
        right = config.right_table,
    )
}

/// Plans and submits distributed joins.
#[derive(Debug)]
pub struct DistributedJoinExecutor {
    broadcast_threshold_mb: u64,
}

impl DistributedJoinExecutor {
    pub fn new(broadcast_threshold_mb: u64) -> Self {
        Self {
            broadcast_threshold_mb,
        }
    }

    pub async fn execute(
        &self,
        backend: &dyn DistributedBackend,
        config: &JoinConfig,
    ) -> Result<DistributedJoinResult, JoinError> {
        if config.left_columns.len() != config.right_columns.len() {
            return Err(JoinError::ColumnArityMismatch {
                left: config.left_columns.len(),
                right: config.right_columns.len(),
            });
        }
        let algorithm = select_distributed_algorithm(config, self.broadcast_threshold_mb);
        let sql = distributed_join_sql(config, algorithm);
        info!(backend = backend.name(), %algorithm, "submitting distributed join");
        let row_count = backend.submit(&sql).await?;
        Ok(DistributedJoinResult {
            algorithm_used: algorithm,
            row_count,
            sql,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::join::{JoinType, TableStats};

    fn config(left_bytes: u64, right_bytes: u64, rows: usize) -> JoinConfig {
        JoinConfig {
            left_table: "orders".to_string(),
            right_table: "customers".to_string(),
            left_columns: vec!["customer_id".to_string()],
            right_columns: vec!["id".to_string()],
            join_type: JoinType::Inner,
            left_stats: TableStats {
                estimated_rows: rows,
                estimated_size_bytes: left_bytes,
                ..TableStats::default()
            },
            right_stats: TableStats {
                estimated_rows: rows,
                estimated_size_bytes: right_bytes,
                ..TableStats::default()
            },
            ..JoinConfig::default()
        }
    }

    #[test]
    fn test_broadcast_below_threshold() {
        let c = config(5 * 1024 * 1024, 500 * 1024 * 1024, 100_000);
        assert_eq!(
            select_distributed_algorithm(&c, 10),
            DistributedAlgorithm::Broadcast
        );
    }

    #[test]
    fn test_sort_merge_for_huge_pairs() {
        let c = config(50 * 1024 * 1024, 60 * 1024 * 1024, 20_000_000);
        assert_eq!(
            select_distributed_algorithm(&c, 10),
            DistributedAlgorithm::SortMerge
        );
    }

    #[test]
    fn test_shuffle_hash_in_between() {
        let c = config(50 * 1024 * 1024, 60 * 1024 * 1024, 100_000);
        assert_eq!(
            select_distributed_algorithm(&c, 10),
            DistributedAlgorithm::ShuffleHash
        );
    }

    #[test]
    fn test_broadcast_sql_hints_smaller_table() {
        let c = config(5 * 1024 * 1024, 500 * 1024 * 1024, 100_000);
        let sql = distributed_join_sql(&c, DistributedAlgorithm::Broadcast);
        assert!(sql.contains("/*+ BROADCAST(orders) */"));
        assert!(sql.contains("INNER JOIN customers r ON l.customer_id = r.id"));
    }

    #[derive(Debug, Default)]
    struct FakeBackend {
        submitted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DistributedBackend for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        async fn submit(&self, sql: &str) -> Result<u64, JoinError> {
            self.submitted.lock().unwrap().push(sql.to_string());
            Ok(77)
        }
    }

    #[tokio::test]
    async fn test_single_pass_submit() {
        let backend = FakeBackend::default();
        let executor = DistributedJoinExecutor::new(10);
        let result = executor
            .execute(&backend, &config(1024, 2048, 10))
            .await
            .unwrap();
        assert_eq!(result.row_count, 77);
        assert_eq!(result.algorithm_used, DistributedAlgorithm::Broadcast);
        assert_eq!(backend.submitted.lock().unwrap().len(), 1);
    }
}
