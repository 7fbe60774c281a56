//! Process log: one row per build or sync run, appended at start and
//! finalized with SUCCESS/FAILED.

use std::{fmt::Debug, sync::Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::row::Value;

#[derive(Debug, thiserror::Error)]
pub enum ProcessLogError {
    #[error("run not found: {0}")]
    NotFound(Uuid),
    #[error("process log store error: {0}")]
    Store(String),
}

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
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Started,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessLogRecord {
    pub run_id: Uuid,
    /// What ran: a table key, a warehouse name, a vault name.
    pub entity: String,
    pub status: RunStatus,
    pub rows_processed: i64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ProcessLog: Send + Sync + Debug {
    /// Open a run in STARTED state, returning its id.
    async fn start(&self, entity: &str) -> Result<Uuid, ProcessLogError>;

    async fn finish(
        &self,
        run_id: Uuid,
        status: RunStatus,
        rows_processed: i64,
        error: Option<String>,
    ) -> Result<(), ProcessLogError>;

    async fn recent_runs(&self, limit: usize) -> Result<Vec<ProcessLogRecord>, ProcessLogError>;

    /// Latest run for an entity, if any.
    async fn last_run(&self, entity: &str) -> Result<Option<ProcessLogRecord>, ProcessLogError>;
}

#[derive(Debug, Default)]
pub struct MemoryProcessLog {
    runs: Mutex<Vec<ProcessLogRecord>>,
}

impl MemoryProcessLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessLog for MemoryProcessLog {
    async fn start(&self, entity: &str) -> Result<Uuid, ProcessLogError> {
        let record = ProcessLogRecord {
            run_id: Uuid::new_v4(),
            entity: entity.to_string(),
            status: RunStatus::Started,
            rows_processed: 0,
            error: None,
            metadata: serde_json::Map::new(),
            started_at: Utc::now(),
            finished_at: None,
        };
        let run_id = record.run_id;
        self.runs
            .lock()
            .map_err(|_| ProcessLogError::Store("process log mutex poisoned".to_string()))?
            .push(record);
        Ok(run_id)
    }

    async fn finish(
        &self,
        run_id: Uuid,
        status: RunStatus,
        rows_processed: i64,
        error: Option<String>,
    ) -> Result<(), ProcessLogError> {
        let mut runs = self
            .runs
            .lock()
            .map_err(|_| ProcessLogError::Store("process log mutex poisoned".to_string()))?;
        let run = runs
            .iter_mut()
            .find(|r| r.run_id == run_id)
            .ok_or(ProcessLogError::NotFound(run_id))?;
        run.status = status;
        run.rows_processed = rows_processed;
        run.error = error;
        run.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<ProcessLogRecord>, ProcessLogError> {
        let runs = self
            .runs
            .lock()
            .map_err(|_| ProcessLogError::Store("process log mutex poisoned".to_string()))?;
        Ok(runs.iter().rev().take(limit).cloned().collect())
    }

    async fn last_run(&self, entity: &str) -> Result<Option<ProcessLogRecord>, ProcessLogError> {
        let runs = self
            .runs
            .lock()
            .map_err(|_| ProcessLogError::Store("process log mutex poisoned".to_string()))?;
        Ok(runs.iter().rev().find(|r| r.entity == entity).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_then_finish() {
        let log = MemoryProcessLog::new();
        let run_id = log.start("warehouse:sales").await.unwrap();
        log.finish(run_id, RunStatus::Success, 1234, None).await.unwrap();

        let last = log.last_run("warehouse:sales").await.unwrap().unwrap();
        assert_eq!(last.status, RunStatus::Success);
        assert_eq!(last.rows_processed, 1234);
        assert!(last.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_recent_runs_newest_first() {
        let log = MemoryProcessLog::new();
        for entity in ["a", "b", "c"] {
            log.start(entity).await.unwrap();
        }
        let recent = log.recent_runs(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].entity, "c");
    }
}
