//! Value cleansing applied to every source value before it reaches the
//! target: canonical null substitution per target-type category, control
//! character stripping and varchar truncation.

use crate::{
    row::{Row, Value},
    schema::ColumnInfo,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeCategory {
    Integer,
    Decimal,
    Timestamp,
    Date,
    Time,
    Boolean,
    Binary,
    Text,
}

fn categorize(target_type: &str) -> TypeCategory {
    let t = target_type.to_uppercase();
    if t.contains("INT") {
        TypeCategory::Integer
    } else if t.contains("NUMERIC")
        || t.contains("NUMBER")
        || t.contains("DECIMAL")
        || t.contains("REAL")
        || t.contains("FLOAT")
        || t.contains("DOUBLE")
    {
        TypeCategory::Decimal
    } else if t.contains("TIMESTAMP") || t.contains("DATETIME") {
        TypeCategory::Timestamp
    } else if t.contains("DATE") {
        TypeCategory::Date
    } else if t.contains("TIME") {
        TypeCategory::Time
    } else if t.contains("BOOL") {
        TypeCategory::Boolean
    } else if t.contains("BYTEA") || t.contains("BINARY") || t.contains("BLOB")
        || t.contains("VARBYTE") || t.contains("BYTES")
    {
        TypeCategory::Binary
    } else {
        TypeCategory::Text
    }
}

/// Whether the raw string form reads as null: empty, literal null markers,
/// sentinel dates, or any non-printable / non-ASCII byte.
fn is_nullish(raw: &str, category: TypeCategory) -> bool {
    if raw.is_empty()
        || raw == "NULL"
        || raw == "null"
        || raw == "\\N"
        || raw == "\\0"
        || raw.contains("0000-")
        || raw.contains("1900-01-01")
        || raw.contains("1970-01-01")
    {
        return true;
    }
    if raw.bytes().any(|b| b > 127 || b < 32) {
        return true;
    }
    if matches!(category, TypeCategory::Timestamp | TypeCategory::Date) {
        if raw.len() < 10 || !raw.contains('-') || raw.contains("0000") {
            return true;
        }
        if raw.contains("-00") || raw.contains(" 00:00:00") {
            return true;
        }
    }
    false
}

/// Canonical substitute for a null value in each target-type category.
fn null_substitute(category: TypeCategory) -> Value {
    match category {
        TypeCategory::Integer => Value::from(0),
        TypeCategory::Decimal => Value::from(0.0),
        TypeCategory::Timestamp => Value::String("1970-01-01 00:00:00".to_string()),
        TypeCategory::Date => Value::String("1970-01-01".to_string()),
        TypeCategory::Time => Value::String("00:00:00".to_string()),
        TypeCategory::Boolean => Value::Bool(false),
        TypeCategory::Binary => Value::Null,
        TypeCategory::Text => Value::String("DEFAULT".to_string()),
    }
}

fn varchar_limit(target_type: &str) -> Option<usize> {
    let t = target_type.to_uppercase();
    if !t.starts_with("VARCHAR") && !t.starts_with("CHAR") {
        return None;
    }
    let open = t.find('(')?;
    let close = t.find(')')?;
    t[open + 1..close].trim().parse().ok()
}

/// Clean one value for a target column type. Null-ish inputs get the
/// category's canonical substitute; surviving strings lose control
/// characters (tab/newline/carriage-return excepted) and are truncated to
/// the declared varchar length.
pub fn clean_value(value: &Value, target_type: &str) -> Value {
    let category = categorize(target_type);

    let raw = match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    };

    if is_nullish(&raw, category) {
        return null_substitute(category);
    }

    if category == TypeCategory::Binary && !raw.chars().all(|c| c.is_ascii_hexdigit()) {
        return Value::Null;
    }

    match value {
        Value::String(s) => {
            let mut cleaned: String = s
                .chars()
                .filter(|&c| c >= ' ' || c == '\t' || c == '\n' || c == '\r')
                .collect();
            if let Some(limit) = varchar_limit(target_type) {
                if cleaned.chars().count() > limit {
                    cleaned = cleaned.chars().take(limit).collect();
                }
            }
            Value::String(cleaned)
        }
        other => other.clone(),
    }
}

/// Clean a whole source row into target column order. Lookup is exact first,
/// then case-insensitive, since source identifiers keep their original case
/// while target columns are lowercased.
pub fn clean_row_values(row: &Row, columns: &[ColumnInfo]) -> Vec<Value> {
    columns
        .iter()
        .map(|col| {
            let value = row.get(&col.name).or_else(|| {
                row.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(&col.name))
                    .map(|(_, v)| v)
            });
            clean_value(value.unwrap_or(&Value::Null), &col.target_type)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::row::row_of;

    #[test]
    fn test_null_substitution_per_category() {
        assert_eq!(clean_value(&Value::Null, "INTEGER"), json!(0));
        assert_eq!(clean_value(&json!(""), "BIGINT"), json!(0));
        assert_eq!(clean_value(&Value::Null, "NUMERIC(10,2)"), json!(0.0));
        assert_eq!(
            clean_value(&json!("NULL"), "TIMESTAMP"),
            json!("1970-01-01 00:00:00")
        );
        assert_eq!(clean_value(&json!("\\N"), "DATE"), json!("1970-01-01"));
        assert_eq!(clean_value(&Value::Null, "TIME"), json!("00:00:00"));
        assert_eq!(clean_value(&Value::Null, "BOOLEAN"), json!(false));
        assert_eq!(clean_value(&Value::Null, "BYTEA"), Value::Null);
        assert_eq!(clean_value(&Value::Null, "VARCHAR(20)"), json!("DEFAULT"));
    }

    #[test]
    fn test_sentinel_dates_read_as_null() {
        assert_eq!(
            clean_value(&json!("1900-01-01 10:30:00"), "TIMESTAMP"),
            json!("1970-01-01 00:00:00")
        );
        assert_eq!(
            clean_value(&json!("0000-12-01"), "DATE"),
            json!("1970-01-01")
        );
        // Midnight timestamps hit the sentinel rule as well.
        assert_eq!(
            clean_value(&json!("2023-05-10 00:00:00"), "TIMESTAMP"),
            json!("1970-01-01 00:00:00")
        );
    }

    #[test]
    fn test_valid_values_survive() {
        assert_eq!(clean_value(&json!(42), "INTEGER"), json!(42));
        assert_eq!(
            clean_value(&json!("2023-05-10 14:30:00"), "TIMESTAMP"),
            json!("2023-05-10 14:30:00")
        );
        assert_eq!(clean_value(&json!("hello"), "VARCHAR(50)"), json!("hello"));
    }

    #[test]
    fn test_non_ascii_bytes_force_null() {
        assert_eq!(clean_value(&json!("caf\u{e9}"), "VARCHAR(10)"), json!("DEFAULT"));
        assert_eq!(clean_value(&json!("a\u{7}b"), "INTEGER"), json!(0));
    }

    #[test]
    fn test_varchar_truncation() {
        assert_eq!(
            clean_value(&json!("abcdefghij"), "VARCHAR(4)"),
            json!("abcd")
        );
    }

    #[test]
    fn test_binary_requires_hex() {
        assert_eq!(clean_value(&json!("deadbeef"), "BYTEA"), json!("deadbeef"));
        assert_eq!(clean_value(&json!("not hex!"), "BYTEA"), Value::Null);
    }

    #[test]
    fn test_row_cleaning_matches_columns_case_insensitively() {
        let row = row_of(&[("ID", json!(7)), ("Name", json!("x"))]);
        let columns = vec![
            ColumnInfo::new("id", "BIGINT", false),
            ColumnInfo::new("name", "VARCHAR(10)", true),
            ColumnInfo::new("missing", "INTEGER", true),
        ];
        assert_eq!(
            clean_row_values(&row, &columns),
            vec![json!(7), json!("x"), json!(0)]
        );
    }
}
