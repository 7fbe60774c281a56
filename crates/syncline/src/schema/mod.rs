//! Schema synchronization: diffing source column sets against the target
//! and emitting the safe subset of DDL.

mod sync;

use serde::{Deserialize, Serialize};
pub use sync::{SchemaSynchronizer, SyncOutcome};

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("target engine error: {0}")]
    Engine(#[from] crate::warehouse::EngineError),
}

/// Column metadata as discovered on a source or target.
///
/// Equality deliberately covers only `(name, target_type, nullable)`; the
/// remaining fields are advisory and must not force spurious ALTERs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub source_type: String,
    pub target_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<String>,
    pub ordinal: i32,
    #[serde(default)]
    pub max_length: Option<i64>,
    #[serde(default)]
    pub numeric_precision: Option<i32>,
    #[serde(default)]
    pub numeric_scale: Option<i32>,
    #[serde(default)]
    pub is_primary_key: bool,
}

impl PartialEq for ColumnInfo {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.target_type.eq_ignore_ascii_case(&other.target_type)
            && self.nullable == other.nullable
    }
}

impl Eq for ColumnInfo {}

impl ColumnInfo {
    /// Minimal constructor for the common case; advisory fields default off.
    pub fn new(name: impl Into<String>, target_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            source_type: String::new(),
            target_type: target_type.into(),
            nullable,
            default: None,
            ordinal: 0,
            max_length: None,
            numeric_precision: None,
            numeric_scale: None,
            is_primary_key: false,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }
}

/// Ordered column changes required to bring a target in line with a source.
#[derive(Debug, Clone, Default)]
pub struct SchemaDiff {
    pub columns_to_add: Vec<ColumnInfo>,
    pub columns_to_drop: Vec<ColumnInfo>,
    /// Pairs of (current target column, desired source column).
    pub columns_to_modify: Vec<(ColumnInfo, ColumnInfo)>,
}

impl SchemaDiff {
    pub fn has_changes(&self) -> bool {
        !self.columns_to_add.is_empty()
            || !self.columns_to_drop.is_empty()
            || !self.columns_to_modify.is_empty()
    }

    /// True when applying this diff would add or drop a primary-key column,
    /// which is never done in place and forces a full-load reset instead.
    pub fn touches_primary_key(&self) -> bool {
        self.columns_to_add.iter().any(|c| c.is_primary_key)
            || self.columns_to_drop.iter().any(|c| c.is_primary_key)
    }
}

/// Diff source against target columns, matching by lower-cased name.
pub fn diff(source: &[ColumnInfo], target: &[ColumnInfo]) -> SchemaDiff {
    let source_by_name: std::collections::HashMap<String, &ColumnInfo> = source
        .iter()
        .map(|c| (c.name.to_lowercase(), c))
        .collect();
    let target_by_name: std::collections::HashMap<String, &ColumnInfo> = target
        .iter()
        .map(|c| (c.name.to_lowercase(), c))
        .collect();

    let mut out = SchemaDiff::default();

    for source_col in source {
        match target_by_name.get(&source_col.name.to_lowercase()) {
            None => out.columns_to_add.push(source_col.clone()),
            Some(target_col) => {
                if !target_col
                    .target_type
                    .eq_ignore_ascii_case(&source_col.target_type)
                    || target_col.nullable != source_col.nullable
                {
                    out.columns_to_modify
                        .push(((*target_col).clone(), source_col.clone()));
                }
            }
        }
    }

    for target_col in target {
        if !source_by_name.contains_key(&target_col.name.to_lowercase()) {
            out.columns_to_drop.push(target_col.clone());
        }
    }

    out
}

/// Whether an in-place ALTER COLUMN between the two types is safe.
///
/// Safe: identical normalized types, varchar↔varchar (any length),
/// char↔char, numeric↔numeric, and the integer widenings
/// smallint→integer, integer→bigint, smallint→bigint.
pub fn is_type_change_compatible(old_type: &str, new_type: &str) -> bool {
    let old = old_type.to_uppercase();
    let new = new_type.to_uppercase();

    if old == new {
        return true;
    }
    if old.contains("VARCHAR") && new.contains("VARCHAR") {
        return true;
    }
    if old.contains("CHAR") && new.contains("CHAR") {
        return true;
    }
    if old.contains("NUMERIC") && new.contains("NUMERIC") {
        return true;
    }
    if old.contains("INTEGER") && new.contains("BIGINT") {
        return true;
    }
    if old.contains("SMALLINT") && (new.contains("INTEGER") || new.contains("BIGINT")) {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, ty: &str, nullable: bool) -> ColumnInfo {
        ColumnInfo::new(name, ty, nullable)
    }

    #[test]
    fn test_diff_identity_is_empty() {
        let cols = vec![col("id", "BIGINT", false), col("name", "VARCHAR(50)", true)];
        let d = diff(&cols, &cols);
        assert!(!d.has_changes());
    }

    #[test]
    fn test_diff_add_drop_modify() {
        let source = vec![
            col("id", "BIGINT", false),
            col("email", "VARCHAR(200)", true),
            col("age", "BIGINT", true),
        ];
        let target = vec![
            col("id", "BIGINT", false),
            col("age", "INTEGER", true),
            col("legacy", "TEXT", true),
        ];
        let d = diff(&source, &target);
        assert_eq!(d.columns_to_add.len(), 1);
        assert_eq!(d.columns_to_add[0].name, "email");
        assert_eq!(d.columns_to_drop.len(), 1);
        assert_eq!(d.columns_to_drop[0].name, "legacy");
        assert_eq!(d.columns_to_modify.len(), 1);
        assert_eq!(d.columns_to_modify[0].1.target_type, "BIGINT");
    }

    #[test]
    fn test_diff_matches_names_case_insensitively() {
        let source = vec![col("ID", "BIGINT", false)];
        let target = vec![col("id", "BIGINT", false)];
        assert!(!diff(&source, &target).has_changes());
    }

    #[test]
    fn test_nullability_change_is_a_modify() {
        let source = vec![col("id", "BIGINT", true)];
        let target = vec![col("id", "BIGINT", false)];
        let d = diff(&source, &target);
        assert_eq!(d.columns_to_modify.len(), 1);
    }

    #[test]
    fn test_type_compatibility() {
        assert!(is_type_change_compatible("VARCHAR(10)", "VARCHAR(200)"));
        assert!(is_type_change_compatible("CHAR(1)", "CHAR(8)"));
        assert!(is_type_change_compatible("NUMERIC(10,2)", "NUMERIC(18,4)"));
        assert!(is_type_change_compatible("INTEGER", "BIGINT"));
        assert!(is_type_change_compatible("SMALLINT", "INTEGER"));
        assert!(is_type_change_compatible("SMALLINT", "BIGINT"));
        assert!(!is_type_change_compatible("BIGINT", "INTEGER"));
        assert!(!is_type_change_compatible("TEXT", "BIGINT"));
        assert!(!is_type_change_compatible("TIMESTAMP", "DATE"));
    }

    #[test]
    fn test_pk_add_or_drop_flags_reset() {
        let source = vec![col("id", "BIGINT", false)];
        let target = vec![
            col("id", "BIGINT", false),
            col("old_pk", "BIGINT", false).primary_key(),
        ];
        let d = diff(&source, &target);
        assert!(d.touches_primary_key());
    }
}
