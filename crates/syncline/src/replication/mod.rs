//! Replication: per-table full loads and CDC batch application, plus the
//! supervisor that fans jobs out over a bounded worker pool.

mod cleanse;
mod supervisor;
mod worker;

pub use cleanse::{clean_row_values, clean_value};
pub use supervisor::{RunSummary, SourceFactory, Supervisor};
pub use worker::{Replicator, TableOutcome};

use crate::{catalog::TableKey, source::SourceEngine, warehouse::WarehouseEngine};

/// Column counts on both sides of a replicated table, used to validate
/// that schema sync kept source and target aligned.
pub async fn column_counts(
    source: &dyn SourceEngine,
    target: &dyn WarehouseEngine,
    key: &TableKey,
) -> Result<(usize, usize), ReplicationError> {
    let source_columns = source
        .get_columns(&key.schema, &key.table)
        .await
        .map_err(|source| ReplicationError::Source {
            table: key.clone(),
            source,
        })?;
    let target_columns = target
        .table_columns(&key.target_schema(), &key.target_table())
        .await
        .map_err(|source| ReplicationError::Target {
            table: key.clone(),
            source,
        })?;
    Ok((source_columns.len(), target_columns.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        schema::ColumnInfo,
        source::{MemorySource, MemoryTableSpec, SourceDialect},
        warehouse::RecordingEngine,
    };

    #[tokio::test]
    async fn test_column_counts() {
        let source = MemorySource::new(SourceDialect::Db2, "db2://x");
        source.add_table(
            "s",
            "t",
            MemoryTableSpec {
                columns: vec![
                    ColumnInfo::new("id", "BIGINT", false),
                    ColumnInfo::new("v", "TEXT", true),
                ],
                ..MemoryTableSpec::default()
            },
        );
        let engine = RecordingEngine::new();
        engine
            .create_table("s", "t", &[ColumnInfo::new("id", "BIGINT", false)], &[])
            .await
            .unwrap();

        let key = TableKey::new("s", "t", SourceDialect::Db2);
        let (source_count, target_count) =
            column_counts(&source, engine.as_ref(), &key).await.unwrap();
        assert_eq!(source_count, 2);
        assert_eq!(target_count, 1);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("source error for {table}: {source}")]
    Source {
        table: TableKey,
        #[source]
        source: crate::source::SourceError,
    },
    #[error("target error for {table}: {source}")]
    Target {
        table: TableKey,
        #[source]
        source: crate::warehouse::EngineError,
    },
    #[error("catalog error: {0}")]
    Catalog(#[from] crate::catalog::CatalogError),
    #[error("schema sync failed for {table}: {source}")]
    Schema {
        table: TableKey,
        #[source]
        source: crate::schema::SchemaError,
    },
    #[error("no columns discovered for {0}")]
    NoColumns(TableKey),
    #[error("job cancelled for {0}")]
    Cancelled(TableKey),
}

impl ReplicationError {
    /// Transient errors leave the entry's status untouched so the next run
    /// retries from the committed watermark; permanent ones move the entry
    /// to ERROR.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Source { source, .. } => {
                matches!(source, crate::source::SourceError::Connection(_))
            }
            Self::Target { source, .. } => {
                matches!(source, crate::warehouse::EngineError::Connection(_))
            }
            Self::Cancelled(_) => true,
            _ => false,
        }
    }
}
