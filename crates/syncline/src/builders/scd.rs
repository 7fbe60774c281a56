//! Pure SCD planning: given the current dimension rows and the incoming
//! source rows, compute what to write. The builders apply plans through the
//! warehouse engine; keeping the diff pure keeps every strategy testable.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::row::{composite_key, Row, Value};

#[derive(Debug, Default, PartialEq)]
pub struct Scd1Plan {
    /// Full incoming rows whose key already exists with changed attributes.
    pub updates: Vec<Row>,
    /// Incoming rows with unseen keys.
    pub inserts: Vec<Row>,
}

#[derive(Debug, Default, PartialEq)]
pub struct Scd2Plan {
    /// Business-key tuples whose current version must be closed
    /// (valid_to = now, is_current = false).
    pub closes: Vec<Row>,
    /// New current versions (valid_from = now, is_current = true).
    pub inserts: Vec<Row>,
}

#[derive(Debug, Default, PartialEq)]
pub struct Scd3Plan {
    /// Incoming rows carrying `prior_<attr>` columns for each changed
    /// attribute.
    pub updates: Vec<Row>,
    pub inserts: Vec<Row>,
}

fn attributes_differ(current: &Row, incoming: &Row, attributes: &[String]) -> bool {
    attributes.iter().any(|attribute| {
        current.get(attribute).unwrap_or(&Value::Null)
            != incoming.get(attribute).unwrap_or(&Value::Null)
    })
}

fn index_by_key<'a>(rows: &'a [Row], business_keys: &[String]) -> HashMap<String, &'a Row> {
    let mut index = HashMap::with_capacity(rows.len());
    for row in rows {
        if let Some(key) = composite_key(row, business_keys) {
            index.insert(key, row);
        }
    }
    index
}

fn key_tuple(row: &Row, business_keys: &[String]) -> Row {
    business_keys
        .iter()
        .filter_map(|k| row.get(k).map(|v| (k.clone(), v.clone())))
        .collect()
}

/// Overwrite on business-key match.
pub fn scd1_plan(
    current: &[Row],
    incoming: &[Row],
    business_keys: &[String],
    attributes: &[String],
) -> Scd1Plan {
    let index = index_by_key(current, business_keys);
    let mut plan = Scd1Plan::default();
    for row in incoming {
        let Some(key) = composite_key(row, business_keys) else {
            continue;
        };
        match index.get(&key) {
            None => plan.inserts.push(row.clone()),
            Some(existing) if attributes_differ(existing, row, attributes) => {
                plan.updates.push(row.clone());
            }
            Some(_) => {}
        }
    }
    plan
}

/// Versioned history: close the changed current row, insert a new current
/// version. `current` must hold only the rows where is_current is true.
/// Applying the same source twice yields an empty plan the second time.
pub fn scd2_plan(
    current: &[Row],
    incoming: &[Row],
    business_keys: &[String],
    attributes: &[String],
    valid_from_column: &str,
    valid_to_column: &str,
    is_current_column: &str,
    now: DateTime<Utc>,
) -> Scd2Plan {
    let index = index_by_key(current, business_keys);
    let timestamp = now.to_rfc3339();
    let mut plan = Scd2Plan::default();
    for row in incoming {
        let Some(key) = composite_key(row, business_keys) else {
            continue;
        };
        let needs_version = match index.get(&key) {
            None => true,
            Some(existing) => {
                if attributes_differ(existing, row, attributes) {
                    plan.closes.push(key_tuple(row, business_keys));
                    true
                } else {
                    false
                }
            }
        };
        if needs_version {
            let mut version = row.clone();
            version.insert(valid_from_column.to_string(), json!(timestamp));
            version.insert(valid_to_column.to_string(), Value::Null);
            version.insert(is_current_column.to_string(), json!(true));
            plan.inserts.push(version);
        }
    }
    plan
}

/// Previous-value columns: on change, the update carries `prior_<attr>`
/// holding the replaced value.
pub fn scd3_plan(
    current: &[Row],
    incoming: &[Row],
    business_keys: &[String],
    attributes: &[String],
) -> Scd3Plan {
    let index = index_by_key(current, business_keys);
    let mut plan = Scd3Plan::default();
    for row in incoming {
        let Some(key) = composite_key(row, business_keys) else {
            continue;
        };
        match index.get(&key) {
            None => {
                let mut insert = row.clone();
                for attribute in attributes {
                    insert.insert(format!("prior_{attribute}"), Value::Null);
                }
                plan.inserts.push(insert);
            }
            Some(existing) if attributes_differ(existing, row, attributes) => {
                let mut update = row.clone();
                for attribute in attributes {
                    let prior = existing.get(attribute).cloned().unwrap_or(Value::Null);
                    update.insert(format!("prior_{attribute}"), prior);
                }
                plan.updates.push(update);
            }
            Some(_) => {}
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::row::row_of;

    fn keys() -> Vec<String> {
        vec!["id".to_string()]
    }

    fn attrs() -> Vec<String> {
        vec!["name".to_string()]
    }

    #[test]
    fn test_scd1_splits_updates_and_inserts() {
        let current = vec![row_of(&[("id", json!(1)), ("name", json!("old"))])];
        let incoming = vec![
            row_of(&[("id", json!(1)), ("name", json!("new"))]),
            row_of(&[("id", json!(2)), ("name", json!("fresh"))]),
            row_of(&[("id", json!(1)), ("name", json!("new"))]),
        ];
        // Third row is unchanged relative to the planned update, but SCD-1
        // plans against the stored state: it still differs from `old`.
        let plan = scd1_plan(&current, &incoming, &keys(), &attrs());
        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.updates.len(), 2);
    }

    #[test]
    fn test_scd1_no_change_is_a_noop() {
        let current = vec![row_of(&[("id", json!(1)), ("name", json!("same"))])];
        let incoming = current.clone();
        let plan = scd1_plan(&current, &incoming, &keys(), &attrs());
        assert_eq!(plan, Scd1Plan::default());
    }

    #[test]
    fn test_scd2_closes_and_versions() {
        let now = Utc::now();
        let current = vec![row_of(&[
            ("id", json!(1)),
            ("name", json!("old")),
            ("is_current", json!(true)),
        ])];
        let incoming = vec![
            row_of(&[("id", json!(1)), ("name", json!("new"))]),
            row_of(&[("id", json!(2)), ("name", json!("first"))]),
        ];
        let plan = scd2_plan(
            &current,
            &incoming,
            &keys(),
            &attrs(),
            "valid_from",
            "valid_to",
            "is_current",
            now,
        );
        assert_eq!(plan.closes.len(), 1);
        assert_eq!(plan.closes[0]["id"], json!(1));
        assert_eq!(plan.inserts.len(), 2);
        assert_eq!(plan.inserts[0]["is_current"], json!(true));
        assert_eq!(plan.inserts[0]["valid_to"], Value::Null);
    }

    #[test]
    fn test_scd2_is_idempotent_after_first_pass() {
        let now = Utc::now();
        let incoming = vec![row_of(&[("id", json!(1)), ("name", json!("v1"))])];
        let first = scd2_plan(
            &[],
            &incoming,
            &keys(),
            &attrs(),
            "valid_from",
            "valid_to",
            "is_current",
            now,
        );
        assert_eq!(first.inserts.len(), 1);

        // The inserted versions become the current rows; replaying the same
        // source produces no new versions.
        let second = scd2_plan(
            &first.inserts,
            &incoming,
            &keys(),
            &attrs(),
            "valid_from",
            "valid_to",
            "is_current",
            now,
        );
        assert_eq!(second, Scd2Plan::default());
    }

    #[test]
    fn test_scd3_records_prior_value() {
        let current = vec![row_of(&[("id", json!(1)), ("name", json!("old"))])];
        let incoming = vec![row_of(&[("id", json!(1)), ("name", json!("new"))])];
        let plan = scd3_plan(&current, &incoming, &keys(), &attrs());
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0]["prior_name"], json!("old"));
        assert_eq!(plan.updates[0]["name"], json!("new"));
    }
}
