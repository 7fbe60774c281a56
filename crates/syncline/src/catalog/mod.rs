//! Metadata catalog: the persistent registry of replicated tables, their
//! status, primary keys and sync watermarks.

mod memory;
mod ops;

use std::fmt::Debug;

use async_trait::async_trait;
pub use memory::MemoryCatalog;
pub use ops::CatalogMaintenance;
use serde::{Deserialize, Serialize};

use crate::{row::Value, source::SourceDialect};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("identifying field must not be empty: {0}")]
    EmptyIdentifier(&'static str),
    #[error("catalog entry not found: {0}")]
    NotFound(TableKey),
    #[error("catalog backend error: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
    #[error("target engine error: {0}")]
    Engine(#[from] crate::warehouse::EngineError),
}

impl CatalogError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }

    pub fn backend_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Logical replication status of a catalog entry.
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
pub enum TableStatus {
    Pending,
    FullLoad,
    ListeningChanges,
    NoData,
    Skip,
    Error,
}

/// How per-row identity is tracked for incremental sync. `Offset` is a
/// deprecated alias kept only so legacy rows deserialize; `cleanup` rewrites
/// it to `Cdc`.
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
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum PkStrategy {
    #[default]
    Cdc,
    Offset,
}

/// Primary identity of a catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableKey {
    pub schema: String,
    pub table: String,
    pub engine: SourceDialect,
}

impl TableKey {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, engine: SourceDialect) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            engine,
        }
    }

    /// Target-side identifiers are always lowercased.
    pub fn target_schema(&self) -> String {
        self.schema.to_lowercase()
    }

    pub fn target_table(&self) -> String {
        self.table.to_lowercase()
    }
}

impl std::fmt::Display for TableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{} ({})", self.schema, self.table, self.engine)
    }
}

pub const LAST_CHANGE_ID_KEY: &str = "last_change_id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub schema: String,
    pub table: String,
    pub engine: SourceDialect,
    pub connection: String,
    pub status: TableStatus,
    pub active: bool,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub pk_columns: Vec<String>,
    #[serde(default)]
    pub pk_strategy: PkStrategy,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub sync_metadata: serde_json::Map<String, Value>,
}

impl CatalogEntry {
    pub fn key(&self) -> TableKey {
        TableKey::new(self.schema.clone(), self.table.clone(), self.engine)
    }

    pub fn has_primary_key(&self) -> bool {
        !self.pk_columns.is_empty()
    }

    /// Last applied change id, parsed defensively from the stringified form
    /// the catalog stores. Absent or unparseable values read as 0.
    pub fn last_change_id(&self) -> i64 {
        match self.sync_metadata.get(LAST_CHANGE_ID_KEY) {
            Some(Value::String(s)) if !s.is_empty() && s.len() <= 20 => s.parse().unwrap_or(0),
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn set_last_change_id(&mut self, change_id: i64) {
        self.sync_metadata.insert(
            LAST_CHANGE_ID_KEY.to_string(),
            Value::String(change_id.to_string()),
        );
    }
}

/// What an upsert did to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New entry, registered with status FULL_LOAD.
    Inserted,
    /// Known entry with an unchanged key set; only size was refreshed.
    SizeUpdated,
    /// The primary-key set changed; status was reset to FULL_LOAD.
    PkChangedReset,
}

/// Row filter for bulk deletes.
#[derive(Debug, Clone)]
pub struct DeleteFilter {
    pub schema: String,
    pub table: String,
    pub engine: SourceDialect,
    pub connection: Option<String>,
}

/// Persistent store for catalog entries. Every mutation runs in its own
/// transaction; errors surface to the caller with no partial commits.
#[async_trait]
pub trait CatalogStore: Send + Sync + Debug {
    /// Distinct connection descriptors registered for a source engine.
    async fn list_connections(&self, engine: SourceDialect) -> Result<Vec<String>, CatalogError>;

    /// Entries for (engine, connection), ordered by (schema, table).
    async fn list_entries(
        &self,
        engine: SourceDialect,
        connection: &str,
    ) -> Result<Vec<CatalogEntry>, CatalogError>;

    async fn list_all(&self) -> Result<Vec<CatalogEntry>, CatalogError>;

    async fn list_active(&self) -> Result<Vec<CatalogEntry>, CatalogError>;

    async fn get(&self, key: &TableKey) -> Result<Option<CatalogEntry>, CatalogError>;

    /// Register or refresh a table. New entries start at FULL_LOAD; a
    /// changed primary-key set resets an existing entry to FULL_LOAD; an
    /// unchanged key set only refreshes the size estimate.
    async fn upsert(
        &self,
        key: &TableKey,
        connection: &str,
        pk_columns: &[String],
        active: bool,
        size: i64,
    ) -> Result<UpsertOutcome, CatalogError>;

    /// Bulk cluster-label update scoped to (connection, engine). Returns the
    /// number of rows touched.
    async fn update_cluster(
        &self,
        cluster: &str,
        connection: &str,
        engine: SourceDialect,
    ) -> Result<u64, CatalogError>;

    /// Remove matching rows, returning them so the caller can drop targets.
    async fn delete(&self, filter: &DeleteFilter) -> Result<Vec<CatalogEntry>, CatalogError>;

    async fn set_status(&self, key: &TableKey, status: TableStatus) -> Result<(), CatalogError>;

    async fn set_active(&self, key: &TableKey, active: bool) -> Result<(), CatalogError>;

    async fn set_sync_metadata(
        &self,
        key: &TableKey,
        metadata: serde_json::Map<String, Value>,
    ) -> Result<(), CatalogError>;

    /// Monotone watermark advance; a lower value than the stored one is a
    /// no-op.
    async fn advance_watermark(&self, key: &TableKey, change_id: i64) -> Result<(), CatalogError>;

    /// Rewrite deprecated OFFSET pk-strategy rows to CDC. Returns the number
    /// of rows migrated.
    async fn cleanup_pk_strategy(&self) -> Result<u64, CatalogError>;
}

pub(crate) fn require_non_empty(value: &str, field: &'static str) -> Result<(), CatalogError> {
    if value.trim().is_empty() {
        return Err(CatalogError::EmptyIdentifier(field));
    }
    Ok(())
}
