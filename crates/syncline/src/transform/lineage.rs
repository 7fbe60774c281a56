//! Transformation lineage: one append-only record per executed step.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::row::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformationRecord {
    pub transformation_id: Uuid,
    pub transformation_type: String,
    pub config: Value,
    #[serde(default)]
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub task_name: Option<String>,
    #[serde(default)]
    pub workflow_execution_id: Option<i64>,
    #[serde(default)]
    pub task_execution_id: Option<i64>,
    #[serde(default)]
    pub input_schemas: Vec<String>,
    #[serde(default)]
    pub input_tables: Vec<String>,
    #[serde(default)]
    pub input_columns: Vec<String>,
    #[serde(default)]
    pub output_schemas: Vec<String>,
    #[serde(default)]
    pub output_tables: Vec<String>,
    #[serde(default)]
    pub output_columns: Vec<String>,
    pub executed_at: DateTime<Utc>,
    pub rows_processed: u64,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Append-only sink for lineage records.
#[async_trait]
pub trait LineageSink: Send + Sync + std::fmt::Debug {
    async fn record(&self, record: TransformationRecord) -> Result<(), crate::transform::TransformError>;
}

/// In-memory lineage sink for tests and the embedded mode.
#[derive(Debug, Default)]
pub struct MemoryLineage {
    records: Mutex<Vec<TransformationRecord>>,
}

impl MemoryLineage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TransformationRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LineageSink for MemoryLineage {
    async fn record(
        &self,
        record: TransformationRecord,
    ) -> Result<(), crate::transform::TransformError> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
        Ok(())
    }
}
