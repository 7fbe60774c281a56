//! Row representation shared by the replication, transformation and build
//! subsystems: an ordered mapping from column name to JSON value.

use std::cmp::Ordering;

pub use serde_json::Value;

pub type Row = serde_json::Map<String, Value>;

/// Coerce a value into a number for aggregation and comparison purposes.
/// Strings holding a numeric literal are parsed; everything else is `None`.
pub fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Total order over values: null sorts before everything, numbers compare
/// numerically, strings lexicographically, everything else by serialized form.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => {
            if let (Some(x), Some(y)) = (numeric_value(a), numeric_value(b)) {
                return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
            }
            match (a, b) {
                (Value::String(x), Value::String(y)) => x.cmp(y),
                _ => a.to_string().cmp(&b.to_string()),
            }
        }
    }
}

/// Canonical string form of a value, used for join keys, group keys and
/// row signatures. Strings are taken verbatim so `"1"` and `1` stay distinct
/// only where JSON distinguishes them.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Composite key over the named columns. `None` when any column is absent,
/// which callers treat as "does not participate" (e.g. no join match).
pub fn composite_key(row: &Row, columns: &[String]) -> Option<String> {
    let mut parts = Vec::with_capacity(columns.len());
    for column in columns {
        parts.push(row.get(column)?.to_string());
    }
    Some(parts.join("|"))
}

/// Full-row signature over every column, deterministic across insertion
/// order. Used by union deduplication and exact dedup.
pub fn row_signature(row: &Row) -> String {
    let mut columns: Vec<&String> = row.keys().collect();
    columns.sort();
    let mut signature = String::new();
    for column in columns {
        signature.push_str(column);
        signature.push('=');
        signature.push_str(&row[column].to_string());
        signature.push('\u{1f}');
    }
    signature
}

/// Build a row literal from (column, value) pairs.
pub fn row_of(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

/// Rough in-memory footprint of a batch, used for memory accounting and
/// join-side statistics.
pub fn estimate_batch_bytes(rows: &[Row]) -> u64 {
    rows.first().map_or(0, |first| {
        Value::Object(first.clone()).to_string().len() as u64 * rows.len() as u64
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(value: Value) -> Row {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(numeric_value(&json!(3)), Some(3.0));
        assert_eq!(numeric_value(&json!("4.5")), Some(4.5));
        assert_eq!(numeric_value(&json!("abc")), None);
        assert_eq!(numeric_value(&Value::Null), None);
    }

    #[test]
    fn test_null_sorts_first() {
        assert_eq!(compare_values(&Value::Null, &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!("a"), &Value::Null), Ordering::Greater);
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!("10"), &json!("9")), Ordering::Less);
    }

    #[test]
    fn test_composite_key_missing_column() {
        let r = row(json!({"id": 1}));
        assert_eq!(composite_key(&r, &["id".into()]), Some("1".to_string()));
        assert_eq!(composite_key(&r, &["id".into(), "x".into()]), None);
    }

    #[test]
    fn test_signature_ignores_insertion_order() {
        let mut a = Row::new();
        a.insert("x".into(), json!(1));
        a.insert("y".into(), json!(2));
        let mut b = Row::new();
        b.insert("y".into(), json!(2));
        b.insert("x".into(), json!(1));
        assert_eq!(row_signature(&a), row_signature(&b));
    }
}
