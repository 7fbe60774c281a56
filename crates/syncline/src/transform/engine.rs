use std::{fmt::Debug, sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    lineage::{LineageSink, TransformationRecord},
    ops::lookup_cache_key,
    StepContext, TransformError, TransformationRegistry,
};
use crate::{
    join::DistributedBackend,
    memory::MemoryManager,
    row::{estimate_batch_bytes, Row, Value},
    transform::translate_pipeline,
};

/// One pipeline step: an operator type plus its open config map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub config: Value,
}

/// An ordered list of operator steps. `use_distributed` forces or forbids
/// the distributed path; unset falls back to the step-count threshold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pipeline {
    pub transformations: Vec<PipelineStep>,
    #[serde(default)]
    pub use_distributed: Option<bool>,
}

/// Workflow/task identifiers and table scope carried into lineage records.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub workflow_name: Option<String>,
    pub task_name: Option<String>,
    pub workflow_execution_id: Option<i64>,
    pub task_execution_id: Option<i64>,
    pub input_schemas: Vec<String>,
    pub input_tables: Vec<String>,
    pub output_schemas: Vec<String>,
    pub output_tables: Vec<String>,
    /// Table name the distributed translator selects from.
    pub source_table: Option<String>,
}

/// Loads lookup reference tables for the per-pipeline cache.
#[async_trait]
pub trait LookupProvider: Send + Sync + Debug {
    async fn load(&self, config: &Value) -> Result<Vec<Row>, TransformError>;
}

/// Sequential pipeline executor over the operator registry.
#[derive(Debug)]
pub struct TransformationEngine {
    registry: TransformationRegistry,
    lineage: Option<Arc<dyn LineageSink>>,
    distributed: Option<Arc<dyn DistributedBackend>>,
    lookups: Option<Arc<dyn LookupProvider>>,
    memory: Option<Arc<MemoryManager>>,
    distributed_step_threshold: usize,
}

impl TransformationEngine {
    pub fn new(registry: TransformationRegistry) -> Self {
        Self {
            registry,
            lineage: None,
            distributed: None,
            lookups: None,
            memory: None,
            distributed_step_threshold: crate::CONFIG.distributed.pipeline_step_threshold,
        }
    }

    pub fn with_lineage(mut self, lineage: Arc<dyn LineageSink>) -> Self {
        self.lineage = Some(lineage);
        self
    }

    pub fn with_distributed(mut self, backend: Arc<dyn DistributedBackend>) -> Self {
        self.distributed = Some(backend);
        self
    }

    pub fn with_lookup_provider(mut self, provider: Arc<dyn LookupProvider>) -> Self {
        self.lookups = Some(provider);
        self
    }

    pub fn with_memory_manager(mut self, memory: Arc<MemoryManager>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn registry(&self) -> &TransformationRegistry {
        &self.registry
    }

    /// Validate every step before any executes; a pipeline failing
    /// validation is rejected as a whole.
    pub fn validate_pipeline(&self, pipeline: &Pipeline) -> Result<(), TransformError> {
        for step in &pipeline.transformations {
            let operator = self
                .registry
                .get(&step.step_type)
                .ok_or_else(|| TransformError::UnknownType(step.step_type.clone()))?;
            operator.validate(&step.config)?;
        }
        Ok(())
    }

    /// Run the pipeline. Steps execute sequentially on one task; an empty
    /// intermediate result warns but does not fail. With a distributed
    /// backend configured and selected, the whole pipeline is translated to
    /// one SQL text and submitted instead; the fabric materializes the
    /// result and the local batch passes through unchanged. Translation or
    /// submission failure falls back to local execution.
    pub async fn execute_pipeline(
        &self,
        rows: Vec<Row>,
        pipeline: &Pipeline,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Row>, TransformError> {
        self.validate_pipeline(pipeline)?;

        if self.should_use_distributed(pipeline) {
            match self.execute_distributed(pipeline, ctx).await {
                Ok(()) => return Ok(rows),
                Err(e) => {
                    warn!(error = %e, "distributed execution failed, falling back to local");
                }
            }
        }

        let mut step_ctx = StepContext::default();
        self.preload_lookups(pipeline, &mut step_ctx).await?;

        let mut current = rows;
        for step in &pipeline.transformations {
            let operator = self
                .registry
                .get(&step.step_type)
                .ok_or_else(|| TransformError::UnknownType(step.step_type.clone()))?;

            let input_len = current.len();
            let _reservation = self.memory.as_ref().and_then(|memory| {
                memory
                    .reserve(estimate_batch_bytes(&current), Some(operator.type_name()))
                    .ok()
            });

            let started = Instant::now();
            let result = operator.execute(current, &step.config, &mut step_ctx);
            let elapsed = started.elapsed();

            match result {
                Ok(next) => {
                    if next.is_empty() && input_len > 0 {
                        warn!(
                            step = %step.step_type,
                            "transformation returned an empty result for non-empty input"
                        );
                    }
                    debug!(step = %step.step_type, rows = next.len(), ?elapsed, "step finished");
                    self.record_lineage(step, ctx, next.len() as u64, elapsed.as_millis() as u64, None)
                        .await;
                    current = next;
                }
                Err(e) => {
                    self.record_lineage(
                        step,
                        ctx,
                        0,
                        elapsed.as_millis() as u64,
                        Some(e.to_string()),
                    )
                    .await;
                    return Err(e);
                }
            }
        }
        Ok(current)
    }

    fn should_use_distributed(&self, pipeline: &Pipeline) -> bool {
        if self.distributed.is_none() {
            return false;
        }
        match pipeline.use_distributed {
            Some(forced) => forced,
            None => pipeline.transformations.len() > self.distributed_step_threshold,
        }
    }

    async fn execute_distributed(
        &self,
        pipeline: &Pipeline,
        ctx: &ExecutionContext,
    ) -> Result<(), TransformError> {
        let backend = self
            .distributed
            .as_ref()
            .ok_or_else(|| TransformError::execution("distributed", "no backend configured"))?;
        let source_table = ctx.source_table.as_deref().unwrap_or("input_data");
        let sql = translate_pipeline(pipeline, source_table).ok_or_else(|| {
            TransformError::execution("distributed", "pipeline is not fully translatable")
        })?;
        let row_count = backend
            .submit(&sql)
            .await
            .map_err(|e| TransformError::execution("distributed", e.to_string()))?;
        info!(backend = backend.name(), row_count, "pipeline executed on distributed backend");
        Ok(())
    }

    async fn preload_lookups(
        &self,
        pipeline: &Pipeline,
        step_ctx: &mut StepContext,
    ) -> Result<(), TransformError> {
        for step in &pipeline.transformations {
            if step.step_type != "lookup" {
                continue;
            }
            let cache_key = lookup_cache_key(&step.config);
            if step_ctx.lookup_cache.contains_key(&cache_key) {
                continue;
            }
            let provider = self
                .lookups
                .as_ref()
                .ok_or_else(|| TransformError::LookupUnavailable(cache_key.clone()))?;
            let reference = provider.load(&step.config).await?;
            debug!(key = %cache_key, rows = reference.len(), "lookup table loaded");
            step_ctx.lookup_cache.insert(cache_key, Arc::new(reference));
        }
        Ok(())
    }

    async fn record_lineage(
        &self,
        step: &PipelineStep,
        ctx: &ExecutionContext,
        rows_processed: u64,
        duration_ms: u64,
        error: Option<String>,
    ) {
        let Some(lineage) = &self.lineage else { return };
        let record = TransformationRecord {
            transformation_id: Uuid::new_v4(),
            transformation_type: step.step_type.clone(),
            config: step.config.clone(),
            workflow_name: ctx.workflow_name.clone(),
            task_name: ctx.task_name.clone(),
            workflow_execution_id: ctx.workflow_execution_id,
            task_execution_id: ctx.task_execution_id,
            input_schemas: ctx.input_schemas.clone(),
            input_tables: ctx.input_tables.clone(),
            input_columns: Vec::new(),
            output_schemas: ctx.output_schemas.clone(),
            output_tables: ctx.output_tables.clone(),
            output_columns: Vec::new(),
            executed_at: Utc::now(),
            rows_processed,
            duration_ms,
            success: error.is_none(),
            error,
        };
        if let Err(e) = lineage.record(record).await {
            warn!(error = %e, "failed to record transformation lineage");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        join::JoinError,
        row::row_of,
        transform::{MemoryLineage, TransformationRegistry},
    };

    fn engine() -> TransformationEngine {
        TransformationEngine::new(TransformationRegistry::builtin())
    }

    fn pipeline(steps: Value) -> Pipeline {
        serde_json::from_value(json!({ "transformations": steps })).unwrap()
    }

    fn rows() -> Vec<Row> {
        vec![
            row_of(&[("g", json!("A")), ("v", json!(10))]),
            row_of(&[("g", json!("A")), ("v", json!(20))]),
            row_of(&[("g", json!("B")), ("v", json!(15))]),
        ]
    }

    #[tokio::test]
    async fn test_steps_chain_sequentially() {
        let pipeline = pipeline(json!([
            {"type": "aggregate", "config": {
                "group_by": ["g"],
                "aggregations": [{"column": "v", "function": "sum", "alias": "t"}]
            }},
            {"type": "sorter", "config": {
                "sort_columns": [{"column": "t", "order": "desc"}]
            }}
        ]));
        let out = engine()
            .execute_pipeline(rows(), &pipeline, &ExecutionContext::default())
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["t"], json!(30.0));
        assert_eq!(out[1]["t"], json!(15.0));
    }

    #[tokio::test]
    async fn test_invalid_step_rejects_whole_pipeline() {
        let pipeline = pipeline(json!([
            {"type": "sorter", "config": {"sort_columns": [{"column": "v"}]}},
            {"type": "aggregate", "config": {"aggregations": []}}
        ]));
        let result = engine()
            .execute_pipeline(rows(), &pipeline, &ExecutionContext::default())
            .await;
        assert!(matches!(result, Err(TransformError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_unknown_operator_rejected() {
        let pipeline = pipeline(json!([{"type": "teleport", "config": {}}]));
        let result = engine().validate_pipeline(&pipeline);
        assert!(matches!(result, Err(TransformError::UnknownType(t)) if t == "teleport"));
    }

    #[tokio::test]
    async fn test_lineage_records_per_step() {
        let lineage = Arc::new(MemoryLineage::new());
        let engine = engine().with_lineage(lineage.clone());
        let pipeline = pipeline(json!([
            {"type": "sequence_generator", "config": {"target_column": "seq"}},
            {"type": "sorter", "config": {"sort_columns": [{"column": "seq", "order": "desc"}]}}
        ]));
        let mut ctx = ExecutionContext::default();
        ctx.workflow_name = Some("nightly".to_string());
        engine.execute_pipeline(rows(), &pipeline, &ctx).await.unwrap();

        let records = lineage.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].transformation_type, "sequence_generator");
        assert!(records.iter().all(|r| r.success));
        assert_eq!(records[0].workflow_name.as_deref(), Some("nightly"));
        assert_eq!(records[0].rows_processed, 3);
    }

    #[tokio::test]
    async fn test_empty_result_warns_but_succeeds() {
        let pipeline = pipeline(json!([
            {"type": "router", "config": {
                "routes": [{"name": "none", "condition": {"column": "v", "op": ">", "value": 1000}}]
            }}
        ]));
        let out = engine()
            .execute_pipeline(rows(), &pipeline, &ExecutionContext::default())
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[derive(Debug)]
    struct FixedLookupProvider;

    #[async_trait]
    impl LookupProvider for FixedLookupProvider {
        async fn load(&self, _config: &Value) -> Result<Vec<Row>, TransformError> {
            Ok(vec![row_of(&[
                ("code", json!("A")),
                ("label", json!("Alpha")),
            ])])
        }
    }

    #[tokio::test]
    async fn test_lookup_cache_preloaded_once_per_pipeline() {
        let engine = engine().with_lookup_provider(Arc::new(FixedLookupProvider));
        let pipeline = pipeline(json!([
            {"type": "lookup", "config": {
                "lookup_table": "codes",
                "source_columns": ["g"],
                "lookup_columns": ["code"],
                "return_columns": ["label"]
            }}
        ]));
        let out = engine
            .execute_pipeline(rows(), &pipeline, &ExecutionContext::default())
            .await
            .unwrap();
        assert_eq!(out[0]["label"], json!("Alpha"));
        assert_eq!(out[2]["label"], Value::Null);
    }

    #[derive(Debug, Default)]
    struct FlakyBackend {
        fail: bool,
    }

    #[async_trait]
    impl DistributedBackend for FlakyBackend {
        fn name(&self) -> &str {
            "test-fabric"
        }

        async fn submit(&self, _sql: &str) -> Result<u64, JoinError> {
            if self.fail {
                Err(JoinError::Backend("fabric unavailable".to_string()))
            } else {
                Ok(42)
            }
        }
    }

    #[tokio::test]
    async fn test_distributed_failure_falls_back_to_local() {
        let engine = engine().with_distributed(Arc::new(FlakyBackend { fail: true }));
        let mut p = pipeline(json!([
            {"type": "aggregate", "config": {
                "group_by": ["g"],
                "aggregations": [{"column": "v", "function": "sum", "alias": "t"}]
            }}
        ]));
        p.use_distributed = Some(true);
        let out = engine
            .execute_pipeline(rows(), &p, &ExecutionContext::default())
            .await
            .unwrap();
        // Local fallback actually aggregated.
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn test_distributed_success_passes_batch_through() {
        let engine = engine().with_distributed(Arc::new(FlakyBackend { fail: false }));
        let mut p = pipeline(json!([
            {"type": "aggregate", "config": {
                "group_by": ["g"],
                "aggregations": [{"column": "v", "function": "sum", "alias": "t"}]
            }}
        ]));
        p.use_distributed = Some(true);
        let input = rows();
        let out = engine
            .execute_pipeline(input.clone(), &p, &ExecutionContext::default())
            .await
            .unwrap();
        assert_eq!(out, input);
    }
}
