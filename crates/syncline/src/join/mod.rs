//! Join optimizer: algorithm selection over side statistics plus the local
//! executors (hash, sort-merge, nested-loop). All executors produce the
//! same row multiset for the same inputs and join spec; selection is purely
//! a performance decision.

mod distributed;

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    time::{Duration, Instant},
};

pub use distributed::{
    distributed_join_sql, select_distributed_algorithm, DistributedAlgorithm, DistributedBackend,
    DistributedJoinExecutor, DistributedJoinResult,
};
use serde::{Deserialize, Serialize};

use crate::row::{composite_key, estimate_batch_bytes, Row, Value};

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("left and right join columns must pair up ({left} vs {right})")]
    ColumnArityMismatch { left: usize, right: usize },
    #[error("distributed backend error: {0}")]
    Backend(String),
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JoinAlgorithm {
    #[default]
    Auto,
    HashJoin,
    SortMergeJoin,
    NestedLoop,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    #[default]
    Inner,
    Left,
    Right,
    FullOuter,
}

impl JoinType {
    fn keeps_unmatched_left(self) -> bool {
        matches!(self, Self::Left | Self::FullOuter)
    }

    fn keeps_unmatched_right(self) -> bool {
        matches!(self, Self::Right | Self::FullOuter)
    }
}

/// Per-side statistics driving algorithm selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableStats {
    pub table_name: String,
    pub estimated_rows: usize,
    pub estimated_size_bytes: u64,
    #[serde(default)]
    pub sorted: bool,
    #[serde(default)]
    pub sort_column: Option<String>,
    #[serde(default)]
    pub indexed_columns: Vec<String>,
}

impl TableStats {
    /// Estimate from an in-memory batch: row count times first-row size.
    pub fn estimate(table_name: impl Into<String>, rows: &[Row]) -> Self {
        Self {
            table_name: table_name.into(),
            estimated_rows: rows.len(),
            estimated_size_bytes: estimate_batch_bytes(rows),
            sorted: false,
            sort_column: None,
            indexed_columns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JoinConfig {
    pub left_table: String,
    pub right_table: String,
    pub left_columns: Vec<String>,
    pub right_columns: Vec<String>,
    pub join_type: JoinType,
    pub preferred_algorithm: JoinAlgorithm,
    pub left_stats: TableStats,
    pub right_stats: TableStats,
}

#[derive(Debug)]
pub struct JoinOutcome {
    pub rows: Vec<Row>,
    pub algorithm_used: JoinAlgorithm,
    pub rows_processed: usize,
    pub elapsed: Duration,
}

/// Pick the execution algorithm for a join spec.
///
/// A forced algorithm always wins. Otherwise: hash join when the right side
/// is small outright or small relative to the left; sort-merge when both
/// sides are already sorted on their join keys or either side is very
/// large; hash join for mid-size pairs; nested loop only when both sides
/// are tiny; sort-merge as the default for everything else.
pub fn select_algorithm(config: &JoinConfig) -> JoinAlgorithm {
    if config.preferred_algorithm != JoinAlgorithm::Auto {
        return config.preferred_algorithm;
    }

    let left_rows = config.left_stats.estimated_rows;
    let right_rows = config.right_stats.estimated_rows;
    let right_bytes = config.right_stats.estimated_size_bytes;

    if right_rows < 10_000 || (right_bytes < 1024 * 1024 && right_rows <= left_rows / 10) {
        return JoinAlgorithm::HashJoin;
    }

    if config.left_stats.sorted && config.right_stats.sorted {
        let left_on_key = match (&config.left_stats.sort_column, config.left_columns.first()) {
            (Some(sorted_on), Some(key)) => sorted_on == key,
            _ => false,
        };
        let right_on_key = match (&config.right_stats.sort_column, config.right_columns.first()) {
            (Some(sorted_on), Some(key)) => sorted_on == key,
            _ => false,
        };
        if left_on_key && right_on_key {
            return JoinAlgorithm::SortMergeJoin;
        }
    }

    if left_rows > 1_000_000 || right_rows > 1_000_000 {
        return JoinAlgorithm::SortMergeJoin;
    }
    if left_rows < 100_000 && right_rows < 100_000 {
        return JoinAlgorithm::HashJoin;
    }
    if left_rows < 1000 && right_rows < 1000 {
        return JoinAlgorithm::NestedLoop;
    }
    JoinAlgorithm::SortMergeJoin
}

/// Execute the join with the selected algorithm.
pub fn execute_join(
    config: &JoinConfig,
    left: &[Row],
    right: &[Row],
) -> Result<JoinOutcome, JoinError> {
    if config.left_columns.len() != config.right_columns.len() {
        return Err(JoinError::ColumnArityMismatch {
            left: config.left_columns.len(),
            right: config.right_columns.len(),
        });
    }

    let algorithm = match select_algorithm(config) {
        JoinAlgorithm::Auto => JoinAlgorithm::HashJoin,
        other => other,
    };
    let started = Instant::now();
    let shape = MergeShape::of(left, right);

    let rows = match algorithm {
        JoinAlgorithm::HashJoin | JoinAlgorithm::Auto => hash_join(config, left, right, &shape),
        JoinAlgorithm::SortMergeJoin => sort_merge_join(config, left, right, &shape),
        JoinAlgorithm::NestedLoop => nested_loop_join(config, left, right, &shape),
    };

    let rows_processed = match algorithm {
        JoinAlgorithm::NestedLoop => left.len() * right.len(),
        _ => left.len() + right.len(),
    };

    Ok(JoinOutcome {
        rows,
        algorithm_used: algorithm,
        rows_processed,
        elapsed: started.elapsed(),
    })
}

/// Output column shape: left columns keep their names; right columns that
/// collide with a left column are namespaced with the `right_` prefix so
/// unmatched outer rows can still materialize every output column as null.
#[derive(Debug)]
struct MergeShape {
    left_columns: Vec<String>,
    /// (source name on the right row, output name)
    right_columns: Vec<(String, String)>,
}

impl MergeShape {
    fn of(left: &[Row], right: &[Row]) -> Self {
        let mut left_columns: Vec<String> = Vec::new();
        let mut seen_left: HashSet<String> = HashSet::new();
        for row in left {
            for column in row.keys() {
                if seen_left.insert(column.clone()) {
                    left_columns.push(column.clone());
                }
            }
        }

        let mut right_source: BTreeSet<String> = BTreeSet::new();
        for row in right {
            for column in row.keys() {
                right_source.insert(column.clone());
            }
        }
        let right_columns = right_source
            .into_iter()
            .map(|column| {
                let output = if seen_left.contains(&column) {
                    format!("right_{column}")
                } else {
                    column.clone()
                };
                (column, output)
            })
            .collect();

        Self {
            left_columns,
            right_columns,
        }
    }

    fn merge(&self, left: Option<&Row>, right: Option<&Row>) -> Row {
        let mut merged = Row::new();
        for column in &self.left_columns {
            let value = left
                .and_then(|row| row.get(column))
                .cloned()
                .unwrap_or(Value::Null);
            merged.insert(column.clone(), value);
        }
        for (source, output) in &self.right_columns {
            let value = right
                .and_then(|row| row.get(source))
                .cloned()
                .unwrap_or(Value::Null);
            merged.insert(output.clone(), value);
        }
        merged
    }
}

fn hash_join(config: &JoinConfig, left: &[Row], right: &[Row], shape: &MergeShape) -> Vec<Row> {
    let mut table: HashMap<String, Vec<&Row>> = HashMap::new();
    for row in right {
        if let Some(key) = composite_key(row, &config.right_columns) {
            table.entry(key).or_default().push(row);
        }
    }

    let mut out = Vec::new();
    let mut matched_right_keys: HashSet<String> = HashSet::new();

    for left_row in left {
        let key = composite_key(left_row, &config.left_columns);
        let matches = key.as_ref().and_then(|k| table.get(k));
        match matches {
            Some(right_rows) => {
                for &right_row in right_rows {
                    out.push(shape.merge(Some(left_row), Some(right_row)));
                }
                if let Some(key) = key {
                    matched_right_keys.insert(key);
                }
            }
            None => {
                if config.join_type.keeps_unmatched_left() {
                    out.push(shape.merge(Some(left_row), None));
                }
            }
        }
    }

    if config.join_type.keeps_unmatched_right() {
        for right_row in right {
            let unmatched = composite_key(right_row, &config.right_columns)
                .is_none_or(|key| !matched_right_keys.contains(&key));
            if unmatched {
                out.push(shape.merge(None, Some(right_row)));
            }
        }
    }
    out
}

fn sort_merge_join(
    config: &JoinConfig,
    left: &[Row],
    right: &[Row],
    shape: &MergeShape,
) -> Vec<Row> {
    // Rows without a complete key cannot match; they surface only through
    // the outer modes.
    let mut keyed_left: Vec<(String, &Row)> = Vec::with_capacity(left.len());
    let mut keyless_left: Vec<&Row> = Vec::new();
    for row in left {
        match composite_key(row, &config.left_columns) {
            Some(key) => keyed_left.push((key, row)),
            None => keyless_left.push(row),
        }
    }
    let mut keyed_right: Vec<(String, &Row)> = Vec::with_capacity(right.len());
    let mut keyless_right: Vec<&Row> = Vec::new();
    for row in right {
        match composite_key(row, &config.right_columns) {
            Some(key) => keyed_right.push((key, row)),
            None => keyless_right.push(row),
        }
    }
    keyed_left.sort_by(|a, b| a.0.cmp(&b.0));
    keyed_right.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = Vec::new();
    let mut l = 0;
    let mut r = 0;
    while l < keyed_left.len() && r < keyed_right.len() {
        match keyed_left[l].0.cmp(&keyed_right[r].0) {
            std::cmp::Ordering::Less => {
                if config.join_type.keeps_unmatched_left() {
                    out.push(shape.merge(Some(keyed_left[l].1), None));
                }
                l += 1;
            }
            std::cmp::Ordering::Greater => {
                if config.join_type.keeps_unmatched_right() {
                    out.push(shape.merge(None, Some(keyed_right[r].1)));
                }
                r += 1;
            }
            std::cmp::Ordering::Equal => {
                let key = keyed_left[l].0.clone();
                let right_start = r;
                while r < keyed_right.len() && keyed_right[r].0 == key {
                    r += 1;
                }
                while l < keyed_left.len() && keyed_left[l].0 == key {
                    for matched in &keyed_right[right_start..r] {
                        out.push(shape.merge(Some(keyed_left[l].1), Some(matched.1)));
                    }
                    l += 1;
                }
            }
        }
    }
    if config.join_type.keeps_unmatched_left() {
        for (_, row) in &keyed_left[l..] {
            out.push(shape.merge(Some(*row), None));
        }
        for row in keyless_left {
            out.push(shape.merge(Some(row), None));
        }
    }
    if config.join_type.keeps_unmatched_right() {
        for (_, row) in &keyed_right[r..] {
            out.push(shape.merge(None, Some(*row)));
        }
        for row in keyless_right {
            out.push(shape.merge(None, Some(row)));
        }
    }
    out
}

fn nested_loop_join(
    config: &JoinConfig,
    left: &[Row],
    right: &[Row],
    shape: &MergeShape,
) -> Vec<Row> {
    let mut out = Vec::new();
    let mut matched_right = vec![false; right.len()];

    for left_row in left {
        let left_key = composite_key(left_row, &config.left_columns);
        let mut matched = false;
        if let Some(left_key) = &left_key {
            for (idx, right_row) in right.iter().enumerate() {
                let hit = composite_key(right_row, &config.right_columns)
                    .is_some_and(|right_key| &right_key == left_key);
                if hit {
                    out.push(shape.merge(Some(left_row), Some(right_row)));
                    matched = true;
                    matched_right[idx] = true;
                }
            }
        }
        if !matched && config.join_type.keeps_unmatched_left() {
            out.push(shape.merge(Some(left_row), None));
        }
    }

    if config.join_type.keeps_unmatched_right() {
        for (idx, right_row) in right.iter().enumerate() {
            if !matched_right[idx] {
                out.push(shape.merge(None, Some(right_row)));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::row::{row_of, row_signature};

    fn stats(rows: usize, bytes: u64) -> TableStats {
        TableStats {
            estimated_rows: rows,
            estimated_size_bytes: bytes,
            ..TableStats::default()
        }
    }

    fn config(join_type: JoinType) -> JoinConfig {
        JoinConfig {
            left_columns: vec!["id".to_string()],
            right_columns: vec!["id".to_string()],
            join_type,
            ..JoinConfig::default()
        }
    }

    fn left_rows() -> Vec<Row> {
        vec![
            row_of(&[("id", json!(1)), ("n", json!("A"))]),
            row_of(&[("id", json!(2)), ("n", json!("B"))]),
            row_of(&[("id", json!(3)), ("n", json!("C"))]),
        ]
    }

    fn right_rows() -> Vec<Row> {
        vec![
            row_of(&[("id", json!(1)), ("d", json!("X"))]),
            row_of(&[("id", json!(2)), ("d", json!("Y"))]),
        ]
    }

    #[test]
    fn test_selection_rules() {
        let mut c = JoinConfig {
            left_stats: stats(1_000_000_0, 1 << 30),
            right_stats: stats(500, 10_000),
            ..config(JoinType::Inner)
        };
        assert_eq!(select_algorithm(&c), JoinAlgorithm::HashJoin);

        c.left_stats = stats(2_000_000, 1 << 30);
        c.right_stats = stats(2_000_000, 1 << 30);
        assert_eq!(select_algorithm(&c), JoinAlgorithm::SortMergeJoin);

        c.left_stats = stats(50_000, 1 << 20);
        c.right_stats = stats(50_000, 1 << 20);
        assert_eq!(select_algorithm(&c), JoinAlgorithm::HashJoin);

        c.left_stats = stats(50_000, 1 << 20);
        c.right_stats = stats(50_000, 1 << 20);
        c.left_stats.sorted = true;
        c.left_stats.sort_column = Some("id".to_string());
        c.right_stats.sorted = true;
        c.right_stats.sort_column = Some("id".to_string());
        assert_eq!(select_algorithm(&c), JoinAlgorithm::SortMergeJoin);

        c.preferred_algorithm = JoinAlgorithm::NestedLoop;
        assert_eq!(select_algorithm(&c), JoinAlgorithm::NestedLoop);
    }

    #[test]
    fn test_join_modes_cardinality() {
        for (join_type, expected) in [
            (JoinType::Inner, 2),
            (JoinType::Left, 3),
            (JoinType::Right, 2),
            (JoinType::FullOuter, 3),
        ] {
            let outcome =
                execute_join(&config(join_type), &left_rows(), &right_rows()).unwrap();
            assert_eq!(outcome.rows.len(), expected, "{join_type}");
        }
    }

    #[test]
    fn test_left_join_fills_nulls() {
        let outcome = execute_join(&config(JoinType::Left), &left_rows(), &right_rows()).unwrap();
        let unmatched = outcome
            .rows
            .iter()
            .find(|r| r["id"] == json!(3))
            .expect("row for id=3");
        assert_eq!(unmatched["d"], Value::Null);
        assert_eq!(unmatched["n"], json!("C"));
    }

    #[test]
    fn test_hash_and_sort_merge_agree_on_multisets() {
        for join_type in [
            JoinType::Inner,
            JoinType::Left,
            JoinType::Right,
            JoinType::FullOuter,
        ] {
            let mut c = config(join_type);
            c.preferred_algorithm = JoinAlgorithm::HashJoin;
            let hash = execute_join(&c, &left_rows(), &right_rows()).unwrap();
            c.preferred_algorithm = JoinAlgorithm::SortMergeJoin;
            let merge = execute_join(&c, &left_rows(), &right_rows()).unwrap();
            c.preferred_algorithm = JoinAlgorithm::NestedLoop;
            let nested = execute_join(&c, &left_rows(), &right_rows()).unwrap();

            let signatures = |rows: &[Row]| {
                let mut v: Vec<String> = rows.iter().map(row_signature).collect();
                v.sort();
                v
            };
            assert_eq!(signatures(&hash.rows), signatures(&merge.rows), "{join_type}");
            assert_eq!(signatures(&hash.rows), signatures(&nested.rows), "{join_type}");
        }
    }

    #[test]
    fn test_duplicate_right_keys_multiply() {
        let right = vec![
            row_of(&[("id", json!(1)), ("d", json!("X"))]),
            row_of(&[("id", json!(1)), ("d", json!("Z"))]),
        ];
        let outcome = execute_join(&config(JoinType::Inner), &left_rows(), &right).unwrap();
        assert_eq!(outcome.rows.len(), 2);
    }

    #[test]
    fn test_colliding_right_columns_are_namespaced() {
        let right = vec![row_of(&[("id", json!(1)), ("n", json!("other"))])];
        let outcome = execute_join(&config(JoinType::Inner), &left_rows(), &right).unwrap();
        assert_eq!(outcome.rows[0]["n"], json!("A"));
        assert_eq!(outcome.rows[0]["right_n"], json!("other"));
        // The join key collides too and keeps the left value.
        assert_eq!(outcome.rows[0]["right_id"], json!(1));
    }

    #[test]
    fn test_missing_join_key_never_matches() {
        let left = vec![row_of(&[("n", json!("A"))])];
        let right = right_rows();
        let outcome = execute_join(&config(JoinType::Left), &left, &right).unwrap();
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0]["d"], Value::Null);
    }

    #[test]
    fn test_arity_mismatch_rejected() {
        let mut c = config(JoinType::Inner);
        c.right_columns.push("extra".to_string());
        assert!(matches!(
            execute_join(&c, &left_rows(), &right_rows()),
            Err(JoinError::ColumnArityMismatch { .. })
        ));
    }
}
