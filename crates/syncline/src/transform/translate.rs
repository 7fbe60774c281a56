//! Pipeline → SQL translation for the distributed path. Each supported
//! step wraps the previous query as a derived table; a single untranslatable
//! step makes the whole pipeline ineligible and the engine runs it locally.

use crate::row::Value;

use super::{Pipeline, PipelineStep};

/// Translate a whole pipeline into one SQL text over `source_table`.
/// Returns `None` when any step has no SQL equivalent.
pub fn translate_pipeline(pipeline: &Pipeline, source_table: &str) -> Option<String> {
    let mut sql = format!("SELECT * FROM {source_table}");
    for (index, step) in pipeline.transformations.iter().enumerate() {
        sql = translate_step(step, &sql, index)?;
    }
    Some(sql)
}

fn translate_step(step: &PipelineStep, inner: &str, index: usize) -> Option<String> {
    match step.step_type.as_str() {
        "aggregate" => translate_aggregate(&step.config, inner, index),
        "sorter" => translate_sorter(&step.config, inner, index),
        "rank" => translate_rank(&step.config, inner, index),
        _ => None,
    }
}

fn quoted(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn translate_aggregate(config: &Value, inner: &str, index: usize) -> Option<String> {
    let aggregations = config.get("aggregations")?.as_array()?;
    let group_by: Vec<&str> = config
        .get("group_by")
        .and_then(Value::as_array)
        .map(|columns| columns.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut select: Vec<String> = group_by.iter().map(|c| quoted(c)).collect();
    for spec in aggregations {
        let column = spec.get("column")?.as_str()?;
        let function = spec.get("function")?.as_str()?;
        let sql_function = match function {
            "sum" => "SUM",
            "count" => "COUNT",
            "avg" => "AVG",
            "min" => "MIN",
            "max" => "MAX",
            "stddev" => "STDDEV",
            "variance" => "VARIANCE",
            // No portable single-call form.
            _ => return None,
        };
        let alias = spec
            .get("alias")
            .and_then(Value::as_str)
            .map_or_else(|| format!("{column}_{function}"), str::to_string);
        select.push(format!(
            "{sql_function}({}) AS {}",
            quoted(column),
            quoted(&alias)
        ));
    }

    let mut sql = format!("SELECT {} FROM ({inner}) AS t{index}", select.join(", "));
    if !group_by.is_empty() {
        let grouped: Vec<String> = group_by.iter().map(|c| quoted(c)).collect();
        sql.push_str(&format!(" GROUP BY {}", grouped.join(", ")));
    }
    Some(sql)
}

fn translate_sorter(config: &Value, inner: &str, index: usize) -> Option<String> {
    let sort_columns = config.get("sort_columns")?.as_array()?;
    let mut order: Vec<String> = Vec::with_capacity(sort_columns.len());
    for spec in sort_columns {
        let column = spec.get("column")?.as_str()?;
        let direction = match spec.get("order").and_then(Value::as_str) {
            Some("desc") => "DESC",
            _ => "ASC",
        };
        order.push(format!("{} {direction}", quoted(column)));
    }
    Some(format!(
        "SELECT * FROM ({inner}) AS t{index} ORDER BY {}",
        order.join(", ")
    ))
}

fn translate_rank(config: &Value, inner: &str, index: usize) -> Option<String> {
    let rank_type = config.get("rank_type")?.as_str()?;
    let order_column = config.get("order_column")?.as_str()?;
    // Partitioned variants have no single-query equivalent here.
    if config.get("partition_by").is_some() {
        return None;
    }
    match rank_type {
        "top_n" | "bottom_n" => {
            let n = config.get("n").and_then(Value::as_u64)?;
            let direction = if rank_type == "top_n" { "DESC" } else { "ASC" };
            Some(format!(
                "SELECT * FROM ({inner}) AS t{index} ORDER BY {} {direction} LIMIT {n}",
                quoted(order_column)
            ))
        }
        "row_number" | "rank" | "dense_rank" => {
            let window = match rank_type {
                "row_number" => "ROW_NUMBER()",
                "rank" => "RANK()",
                _ => "DENSE_RANK()",
            };
            Some(format!(
                "SELECT *, {window} OVER (ORDER BY {}) AS \"_rank\" FROM ({inner}) AS t{index}",
                quoted(order_column)
            ))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn pipeline(steps: serde_json::Value) -> Pipeline {
        serde_json::from_value(json!({ "transformations": steps })).unwrap()
    }

    #[test]
    fn test_aggregate_then_sort_nests() {
        let p = pipeline(json!([
            {"type": "aggregate", "config": {
                "group_by": ["g"],
                "aggregations": [{"column": "v", "function": "sum", "alias": "t"}]
            }},
            {"type": "sorter", "config": {"sort_columns": [{"column": "t", "order": "desc"}]}}
        ]));
        let sql = translate_pipeline(&p, "bronze.orders").unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM (SELECT \"g\", SUM(\"v\") AS \"t\" FROM \
             (SELECT * FROM bronze.orders) AS t0 GROUP BY \"g\") AS t1 ORDER BY \"t\" DESC"
        );
    }

    #[test]
    fn test_top_n_becomes_limit() {
        let p = pipeline(json!([
            {"type": "rank", "config": {"rank_type": "top_n", "order_column": "v", "n": 5}}
        ]));
        let sql = translate_pipeline(&p, "t").unwrap();
        assert!(sql.ends_with("ORDER BY \"v\" DESC LIMIT 5"));
    }

    #[test]
    fn test_untranslatable_step_bails_out() {
        let p = pipeline(json!([
            {"type": "aggregate", "config": {
                "aggregations": [{"column": "v", "function": "sum"}]
            }},
            {"type": "geolocation", "config": {"operation": "distance"}}
        ]));
        assert!(translate_pipeline(&p, "t").is_none());
    }

    #[test]
    fn test_percentile_is_not_translatable() {
        let p = pipeline(json!([
            {"type": "aggregate", "config": {
                "aggregations": [{"column": "v", "function": "percentile", "percentile_value": 0.5}]
            }}
        ]));
        assert!(translate_pipeline(&p, "t").is_none());
    }
}
