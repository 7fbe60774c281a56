//! Warehouse builds: Bronze (raw copy) → Silver (cleansed via the
//! transformation engine) → Gold (dimensions with SCD, facts full-load).

use std::{collections::BTreeSet, sync::Arc};

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use super::{
    model::{DimensionTable, FactTable, ScdType, WarehouseModel},
    repository::ModelStore,
    scd::{scd1_plan, scd2_plan, scd3_plan},
    validate::validate_warehouse_model,
    BuildError,
};
use crate::{
    process_log::{ProcessLog, RunStatus},
    row::{Row, Value},
    schema::ColumnInfo,
    transform::{ExecutionContext, Pipeline, TransformationEngine},
    warehouse::WarehouseEngine,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildReport {
    pub entity: String,
    pub rows_processed: i64,
    pub tables_built: usize,
}

/// Drives one warehouse model end to end. A failing table leaves the
/// target in a consistent intermediate state: each table is either fully
/// (re)loaded or untouched.
#[derive(Debug)]
pub struct WarehouseBuilder {
    models: Arc<dyn ModelStore>,
    engine: Arc<dyn WarehouseEngine>,
    transforms: Arc<TransformationEngine>,
    process_log: Arc<dyn ProcessLog>,
}

impl WarehouseBuilder {
    pub fn new(
        models: Arc<dyn ModelStore>,
        engine: Arc<dyn WarehouseEngine>,
        transforms: Arc<TransformationEngine>,
        process_log: Arc<dyn ProcessLog>,
    ) -> Self {
        Self {
            models,
            engine,
            transforms,
            process_log,
        }
    }

    pub async fn build_all_active(&self) -> Result<Vec<BuildReport>, BuildError> {
        let mut reports = Vec::new();
        for model in self.models.list_active_warehouses().await? {
            reports.push(self.build(&model.warehouse_name).await?);
        }
        Ok(reports)
    }

    pub async fn build(&self, name: &str) -> Result<BuildReport, BuildError> {
        let model = self
            .models
            .get_warehouse(name)
            .await?
            .ok_or_else(|| BuildError::UnknownModel(name.to_string()))?;
        validate_warehouse_model(&model)?;

        let entity = format!("warehouse:{name}");
        let run_id = self.process_log.start(&entity).await?;
        info!(warehouse = name, %run_id, "warehouse build started");

        let result = self.build_model(&model).await;
        let now = Utc::now();
        match &result {
            Ok(report) => {
                self.process_log
                    .finish(run_id, RunStatus::Success, report.rows_processed, None)
                    .await?;
                self.models
                    .update_warehouse_build_status(name, "SUCCESS", now)
                    .await?;
            }
            Err(e) => {
                self.process_log
                    .finish(run_id, RunStatus::Failed, 0, Some(e.to_string()))
                    .await?;
                self.models
                    .update_warehouse_build_status(name, "FAILED", now)
                    .await?;
            }
        }
        result
    }

    async fn build_model(&self, model: &WarehouseModel) -> Result<BuildReport, BuildError> {
        let mut rows_processed = 0i64;
        let mut tables_built = 0usize;

        for dimension in &model.dimensions {
            let source_rows = self.engine.execute_query(&dimension.source_query).await?;
            rows_processed += source_rows.len() as i64;
            let silver_rows = self
                .promote_through_silver(model, &dimension.target_table, source_rows)
                .await?;
            self.build_dimension(model, dimension, &silver_rows).await?;
            tables_built += 1;
        }

        for fact in &model.facts {
            let source_rows = self.engine.execute_query(&fact.source_query).await?;
            rows_processed += source_rows.len() as i64;
            let silver_rows = self
                .promote_through_silver(model, &fact.target_table, source_rows)
                .await?;
            self.build_fact(model, fact, silver_rows).await?;
            tables_built += 1;
        }

        Ok(BuildReport {
            entity: model.warehouse_name.clone(),
            rows_processed,
            tables_built,
        })
    }

    /// Bronze is the raw copy; Silver runs the cleansing pipeline over it.
    async fn promote_through_silver(
        &self,
        model: &WarehouseModel,
        table: &str,
        source_rows: Vec<Row>,
    ) -> Result<Vec<Row>, BuildError> {
        self.reload_table(&model.bronze_schema(), table, &source_rows, &[])
            .await?;

        let silver_rows = match cleansing_pipeline(&source_rows) {
            Some(pipeline) => {
                let ctx = ExecutionContext {
                    input_schemas: vec![model.bronze_schema()],
                    input_tables: vec![table.to_string()],
                    output_schemas: vec![model.silver_schema()],
                    output_tables: vec![table.to_string()],
                    ..ExecutionContext::default()
                };
                self.transforms
                    .execute_pipeline(source_rows, &pipeline, &ctx)
                    .await?
            }
            None => source_rows,
        };

        self.reload_table(&model.silver_schema(), table, &silver_rows, &[])
            .await?;
        Ok(silver_rows)
    }

    async fn build_dimension(
        &self,
        model: &WarehouseModel,
        dimension: &DimensionTable,
        incoming: &[Row],
    ) -> Result<(), BuildError> {
        let schema = model.gold_schema();
        let table = dimension.target_table.to_lowercase();
        self.engine.create_schema(&schema).await?;

        let mut columns = infer_columns(incoming);
        let primary_keys: Vec<String> = match dimension.scd_type {
            // Version history forbids a business-key primary key.
            ScdType::Type2 => {
                columns.push(ColumnInfo::new(&dimension.valid_from_column, "TIMESTAMP", true));
                columns.push(ColumnInfo::new(&dimension.valid_to_column, "TIMESTAMP", true));
                columns.push(ColumnInfo::new(&dimension.is_current_column, "BOOLEAN", true));
                Vec::new()
            }
            ScdType::Type3 => {
                for attribute in &dimension.attributes {
                    columns.push(ColumnInfo::new(format!("prior_{attribute}"), "TEXT", true));
                }
                dimension.business_keys.clone()
            }
            ScdType::Type1 => dimension.business_keys.clone(),
        };
        if !self.engine.table_exists(&schema, &table).await? {
            self.engine
                .create_table(&schema, &table, &columns, &primary_keys)
                .await?;
            for index in &dimension.index_columns {
                self.engine
                    .create_index(&schema, &table, std::slice::from_ref(index), None)
                    .await?;
            }
            if let Some(partition_column) = &dimension.partition_column {
                self.engine
                    .create_partition(&schema, &table, partition_column)
                    .await?;
            }
        }

        let existing = self.engine.select_rows(&schema, &table).await?;
        match dimension.scd_type {
            ScdType::Type1 => {
                let plan = scd1_plan(
                    &existing,
                    incoming,
                    &dimension.business_keys,
                    &dimension.attributes,
                );
                let writes: Vec<&Row> = plan.updates.iter().chain(&plan.inserts).collect();
                self.upsert(&schema, &table, &dimension.business_keys, &writes)
                    .await?;
            }
            ScdType::Type2 => {
                let current: Vec<Row> = existing
                    .into_iter()
                    .filter(|row| {
                        row.get(&dimension.is_current_column)
                            .and_then(Value::as_bool)
                            .unwrap_or(false)
                    })
                    .collect();
                let plan = scd2_plan(
                    &current,
                    incoming,
                    &dimension.business_keys,
                    &dimension.attributes,
                    &dimension.valid_from_column,
                    &dimension.valid_to_column,
                    &dimension.is_current_column,
                    Utc::now(),
                );
                self.close_current_versions(&schema, &table, dimension, &current, &plan.closes)
                    .await?;
                if !plan.inserts.is_empty() {
                    let (insert_columns, values) = column_values(&plan.inserts);
                    self.engine
                        .insert_rows(&schema, &table, &insert_columns, &values)
                        .await?;
                }
            }
            ScdType::Type3 => {
                let plan = scd3_plan(
                    &existing,
                    incoming,
                    &dimension.business_keys,
                    &dimension.attributes,
                );
                let writes: Vec<&Row> = plan.updates.iter().chain(&plan.inserts).collect();
                self.upsert(&schema, &table, &dimension.business_keys, &writes)
                    .await?;
            }
        }
        Ok(())
    }

    /// Close a changed current version: replace it with a copy carrying
    /// valid_to/now and is_current=false, so history survives all engines'
    /// upsert paths.
    async fn close_current_versions(
        &self,
        schema: &str,
        table: &str,
        dimension: &DimensionTable,
        current: &[Row],
        closes: &[Row],
    ) -> Result<(), BuildError> {
        if closes.is_empty() {
            return Ok(());
        }
        let now = Utc::now().to_rfc3339();
        let mut delete_key_columns = dimension.business_keys.clone();
        delete_key_columns.push(dimension.is_current_column.clone());

        let mut closed_rows = Vec::new();
        let mut delete_keys = Vec::new();
        for close_key in closes {
            for row in current {
                let matches = dimension
                    .business_keys
                    .iter()
                    .all(|k| row.get(k) == close_key.get(k));
                if !matches {
                    continue;
                }
                let mut closed = row.clone();
                closed.insert(dimension.valid_to_column.clone(), json!(now));
                closed.insert(dimension.is_current_column.clone(), json!(false));
                closed_rows.push(closed);

                let mut key: Vec<Value> = dimension
                    .business_keys
                    .iter()
                    .map(|k| row.get(k).cloned().unwrap_or(Value::Null))
                    .collect();
                key.push(json!(true));
                delete_keys.push(key);
            }
        }

        self.engine
            .delete_rows(schema, table, &delete_key_columns, &delete_keys)
            .await?;
        if !closed_rows.is_empty() {
            let (columns, values) = column_values(&closed_rows);
            self.engine
                .insert_rows(schema, table, &columns, &values)
                .await?;
        }
        Ok(())
    }

    async fn build_fact(
        &self,
        model: &WarehouseModel,
        fact: &FactTable,
        rows: Vec<Row>,
    ) -> Result<(), BuildError> {
        let schema = model.gold_schema();
        let table = fact.target_table.to_lowercase();

        // Dimension keys resolve against the current rows of referenced
        // dimensions; dangling references load anyway but are surfaced.
        for key_column in &fact.dimension_keys {
            let Some(dimension) = model
                .dimensions
                .iter()
                .find(|d| d.business_keys.contains(key_column))
            else {
                continue;
            };
            let dimension_rows = self
                .engine
                .select_rows(&schema, &dimension.target_table.to_lowercase())
                .await?;
            let known: BTreeSet<String> = dimension_rows
                .iter()
                .filter(|row| {
                    dimension.scd_type != ScdType::Type2
                        || row
                            .get(&dimension.is_current_column)
                            .and_then(Value::as_bool)
                            .unwrap_or(false)
                })
                .filter_map(|row| row.get(key_column).map(|v| v.to_string()))
                .collect();
            let dangling = rows
                .iter()
                .filter_map(|row| row.get(key_column))
                .filter(|v| !known.contains(&v.to_string()))
                .count();
            if dangling > 0 {
                warn!(
                    fact = %fact.fact_name,
                    key = %key_column,
                    dangling,
                    "fact rows reference missing dimension keys"
                );
            }
        }

        self.reload_table(&schema, &table, &rows, &fact.index_columns)
            .await?;
        if let Some(partition_column) = &fact.partition_column {
            self.engine
                .create_partition(&schema, &table, partition_column)
                .await?;
        }
        Ok(())
    }

    /// Full reload: drop, recreate from inferred columns, insert.
    async fn reload_table(
        &self,
        schema: &str,
        table: &str,
        rows: &[Row],
        index_columns: &[String],
    ) -> Result<(), BuildError> {
        let table = table.to_lowercase();
        self.engine.create_schema(schema).await?;
        self.engine.drop_table(schema, &table).await?;
        let columns = infer_columns(rows);
        if columns.is_empty() {
            return Ok(());
        }
        self.engine
            .create_table(schema, &table, &columns, &[])
            .await?;
        for index in index_columns {
            self.engine
                .create_index(schema, &table, std::slice::from_ref(index), None)
                .await?;
        }
        if !rows.is_empty() {
            let (column_names, values) = column_values(rows);
            self.engine
                .insert_rows(schema, &table, &column_names, &values)
                .await?;
        }
        Ok(())
    }

    async fn upsert(
        &self,
        schema: &str,
        table: &str,
        keys: &[String],
        rows: &[&Row],
    ) -> Result<(), BuildError> {
        if rows.is_empty() {
            return Ok(());
        }
        let owned: Vec<Row> = rows.iter().map(|r| (*r).clone()).collect();
        let (columns, values) = column_values(&owned);
        self.engine
            .upsert_rows(schema, table, &columns, keys, &values)
            .await?;
        Ok(())
    }
}

/// Column set over a batch with light typing from the first non-null value.
pub(super) fn infer_columns(rows: &[Row]) -> Vec<ColumnInfo> {
    let mut names: BTreeSet<&String> = BTreeSet::new();
    for row in rows {
        names.extend(row.keys());
    }
    names
        .into_iter()
        .map(|name| {
            let sample = rows.iter().find_map(|row| {
                row.get(name).filter(|value| !value.is_null())
            });
            let target_type = match sample {
                Some(Value::Bool(_)) => "BOOLEAN",
                Some(Value::Number(n)) if n.is_i64() => "BIGINT",
                Some(Value::Number(_)) => "DOUBLE PRECISION",
                Some(Value::Object(_) | Value::Array(_)) => "JSON",
                _ => "TEXT",
            };
            ColumnInfo::new(name.to_lowercase(), target_type, true)
        })
        .collect()
}

/// Rows flattened into (columns, value matrix) for the engine's batch
/// operations.
pub(super) fn column_values(rows: &[Row]) -> (Vec<String>, Vec<Vec<Value>>) {
    let mut names: BTreeSet<String> = BTreeSet::new();
    for row in rows {
        names.extend(row.keys().cloned());
    }
    let columns: Vec<String> = names.into_iter().collect();
    let values = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect();
    (columns, values)
}

/// Silver cleansing: trim and whitespace-normalize every string column.
fn cleansing_pipeline(rows: &[Row]) -> Option<Pipeline> {
    let mut string_columns: BTreeSet<&String> = BTreeSet::new();
    for row in rows {
        for (column, value) in row {
            if value.is_string() {
                string_columns.insert(column);
            }
        }
    }
    if string_columns.is_empty() {
        return None;
    }
    let rules: Vec<Value> = string_columns
        .into_iter()
        .map(|column| {
            json!({
                "column": column,
                "operations": ["trim", "normalize_whitespace"]
            })
        })
        .collect();
    Some(Pipeline {
        transformations: vec![crate::transform::PipelineStep {
            step_type: "data_cleansing".to_string(),
            config: json!({ "rules": rules }),
        }],
        use_distributed: Some(false),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        builders::model::SchemaShape,
        builders::{model::DataLayer, MemoryModelStore},
        process_log::MemoryProcessLog,
        row::row_of,
        transform::TransformationRegistry,
        warehouse::RecordingEngine,
    };

    fn model(scd_type: ScdType) -> WarehouseModel {
        WarehouseModel {
            warehouse_name: "sales".to_string(),
            description: String::new(),
            schema_shape: SchemaShape::StarSchema,
            target_layer: DataLayer::Gold,
            target_schema: "dw".to_string(),
            dimensions: vec![DimensionTable {
                dimension_name: "dim_customer".to_string(),
                target_table: "dim_customer".to_string(),
                scd_type,
                source_query: "SELECT * FROM staging.customers".to_string(),
                business_keys: vec!["customer_id".to_string()],
                attributes: vec!["name".to_string()],
                valid_from_column: "valid_from".to_string(),
                valid_to_column: "valid_to".to_string(),
                is_current_column: "is_current".to_string(),
                index_columns: Vec::new(),
                partition_column: None,
            }],
            facts: vec![FactTable {
                fact_name: "fact_orders".to_string(),
                target_table: "fact_orders".to_string(),
                source_query: "SELECT * FROM staging.orders".to_string(),
                dimension_keys: vec!["customer_id".to_string()],
                measures: vec!["amount".to_string()],
                index_columns: Vec::new(),
                partition_column: None,
            }],
            schedule_cron: None,
            active: true,
            enabled: true,
            last_build_time: None,
            last_build_status: None,
        }
    }

    struct Fixture {
        builder: WarehouseBuilder,
        engine: Arc<RecordingEngine>,
        models: Arc<MemoryModelStore>,
        process_log: Arc<MemoryProcessLog>,
    }

    async fn fixture(scd_type: ScdType) -> Fixture {
        let engine = RecordingEngine::new();
        engine.script_query(
            "staging.customers",
            vec![
                row_of(&[("customer_id", json!(1)), ("name", json!("  Ada  "))]),
                row_of(&[("customer_id", json!(2)), ("name", json!("Grace"))]),
            ],
        );
        engine.script_query(
            "staging.orders",
            vec![
                row_of(&[("customer_id", json!(1)), ("amount", json!(10.5))]),
                row_of(&[("customer_id", json!(9)), ("amount", json!(3.0))]),
            ],
        );
        let models = Arc::new(MemoryModelStore::new());
        models.upsert_warehouse(model(scd_type)).await.unwrap();
        let process_log = Arc::new(MemoryProcessLog::new());
        let builder = WarehouseBuilder::new(
            models.clone(),
            engine.clone(),
            Arc::new(TransformationEngine::new(TransformationRegistry::builtin())),
            process_log.clone(),
        );
        Fixture {
            builder,
            engine,
            models,
            process_log,
        }
    }

    #[tokio::test]
    async fn test_layers_and_cleansing() {
        let fix = fixture(ScdType::Type1).await;
        let report = fix.builder.build("sales").await.unwrap();
        assert_eq!(report.tables_built, 2);
        assert_eq!(report.rows_processed, 4);

        // Bronze keeps the raw value, silver is cleansed.
        let bronze = fix.engine.rows("dw_bronze", "dim_customer");
        assert_eq!(bronze[0]["name"], json!("  Ada  "));
        let silver = fix.engine.rows("dw_silver", "dim_customer");
        assert_eq!(silver[0]["name"], json!("Ada"));

        // Gold dimension upserted on the business key.
        let gold = fix.engine.rows("dw", "dim_customer");
        assert_eq!(gold.len(), 2);

        let last = fix
            .process_log
            .last_run("warehouse:sales")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.status, RunStatus::Success);
        let stored = fix.models.get_warehouse("sales").await.unwrap().unwrap();
        assert_eq!(stored.last_build_status.as_deref(), Some("SUCCESS"));
    }

    #[tokio::test]
    async fn test_scd2_versions_and_idempotency() {
        let fix = fixture(ScdType::Type2).await;
        fix.builder.build("sales").await.unwrap();
        let after_first = fix.engine.rows("dw", "dim_customer");
        assert_eq!(after_first.len(), 2);
        assert!(after_first.iter().all(|r| r["is_current"] == json!(true)));

        // Second build over identical source data adds no versions.
        fix.builder.build("sales").await.unwrap();
        assert_eq!(fix.engine.rows("dw", "dim_customer").len(), 2);
    }

    #[tokio::test]
    async fn test_scd2_change_closes_old_version() {
        let fix = fixture(ScdType::Type2).await;
        fix.builder.build("sales").await.unwrap();

        // The customer is renamed at the source.
        fix.engine.script_query(
            "staging.customers",
            vec![
                row_of(&[("customer_id", json!(1)), ("name", json!("Ada L."))]),
                row_of(&[("customer_id", json!(2)), ("name", json!("Grace"))]),
            ],
        );
        fix.builder.build("sales").await.unwrap();

        let rows = fix.engine.rows("dw", "dim_customer");
        assert_eq!(rows.len(), 3);
        let current: Vec<_> = rows
            .iter()
            .filter(|r| r["is_current"] == json!(true))
            .collect();
        assert_eq!(current.len(), 2);
        let closed: Vec<_> = rows
            .iter()
            .filter(|r| r["is_current"] == json!(false))
            .collect();
        assert_eq!(closed.len(), 1);
        assert!(closed[0]["valid_to"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_warehouse_is_an_error() {
        let fix = fixture(ScdType::Type1).await;
        assert!(matches!(
            fix.builder.build("nope").await,
            Err(BuildError::UnknownModel(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_model_rejected_before_any_ddl() {
        let fix = fixture(ScdType::Type1).await;
        let mut broken = model(ScdType::Type1);
        broken.dimensions[0].business_keys.clear();
        fix.models.upsert_warehouse(broken).await.unwrap();
        assert!(matches!(
            fix.builder.build("sales").await,
            Err(BuildError::InvalidModel(_))
        ));
        assert!(fix.engine.rows("dw", "dim_customer").is_empty());
    }
}
