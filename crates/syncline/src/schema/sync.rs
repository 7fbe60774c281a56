use tracing::{debug, info, warn};

use super::{diff, is_type_change_compatible, ColumnInfo, SchemaDiff, SchemaError};
use crate::warehouse::WarehouseEngine;

/// Result of reconciling a target table against the source columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing to do.
    InSync,
    /// DDL was applied; counts are (added, dropped, modified).
    Applied {
        added: usize,
        dropped: usize,
        modified: usize,
    },
    /// Target table does not exist yet; creation happens at first load.
    TargetMissing,
    /// The diff touches a primary-key column. The caller must drop the
    /// target and reset the table to FULL_LOAD.
    RequiresFullLoad,
}

/// Applies schema diffs to a target through the warehouse engine.
#[derive(Debug)]
pub struct SchemaSynchronizer<'a> {
    engine: &'a dyn WarehouseEngine,
}

impl<'a> SchemaSynchronizer<'a> {
    pub fn new(engine: &'a dyn WarehouseEngine) -> Self {
        Self { engine }
    }

    /// Diff the source columns against the live target and apply the safe
    /// subset of changes.
    pub async fn sync(
        &self,
        source_columns: &[ColumnInfo],
        schema: &str,
        table: &str,
    ) -> Result<SyncOutcome, SchemaError> {
        let target_columns = self.engine.table_columns(schema, table).await?;
        if target_columns.is_empty() {
            debug!(schema, table, "target table missing, created at first load");
            return Ok(SyncOutcome::TargetMissing);
        }

        let changes = diff(source_columns, &target_columns);
        if !changes.has_changes() {
            return Ok(SyncOutcome::InSync);
        }
        self.apply(&changes, schema, table).await
    }

    /// Apply a precomputed diff. Incompatible type changes are skipped with
    /// a warning; primary-key adds/drops abort with the reset sentinel.
    pub async fn apply(
        &self,
        changes: &SchemaDiff,
        schema: &str,
        table: &str,
    ) -> Result<SyncOutcome, SchemaError> {
        if changes.touches_primary_key() {
            warn!(
                schema,
                table, "schema change touches a primary-key column, full reload required"
            );
            return Ok(SyncOutcome::RequiresFullLoad);
        }

        info!(
            schema,
            table,
            add = changes.columns_to_add.len(),
            drop = changes.columns_to_drop.len(),
            modify = changes.columns_to_modify.len(),
            "applying schema changes"
        );

        for column in &changes.columns_to_add {
            self.engine.add_column(schema, table, column).await?;
        }

        for column in &changes.columns_to_drop {
            warn!(
                schema,
                table,
                column = %column.name,
                "dropping column no longer present on source"
            );
            self.engine.drop_column(schema, table, &column.name).await?;
        }

        let mut modified = 0;
        for (from, to) in &changes.columns_to_modify {
            if !is_type_change_compatible(&from.target_type, &to.target_type) {
                warn!(
                    schema,
                    table,
                    column = %to.name,
                    from = %from.target_type,
                    to = %to.target_type,
                    "incompatible type change, skipping"
                );
                continue;
            }
            self.engine.alter_column(schema, table, from, to).await?;
            modified += 1;
        }

        Ok(SyncOutcome::Applied {
            added: changes.columns_to_add.len(),
            dropped: changes.columns_to_drop.len(),
            modified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::RecordingEngine;

    fn col(name: &str, ty: &str, nullable: bool) -> ColumnInfo {
        ColumnInfo::new(name, ty, nullable)
    }

    #[tokio::test]
    async fn test_sync_missing_target_is_a_noop() {
        let engine = RecordingEngine::new();
        let sync = SchemaSynchronizer::new(engine.as_ref());
        let outcome = sync
            .sync(&[col("id", "BIGINT", false)], "s", "missing")
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::TargetMissing);
        assert!(engine.statements().is_empty());
    }

    #[tokio::test]
    async fn test_sync_in_sync() {
        let engine = RecordingEngine::new();
        engine
            .create_table("s", "t", &[col("id", "BIGINT", false)], &["id".to_string()])
            .await
            .unwrap();
        let sync = SchemaSynchronizer::new(engine.as_ref());
        let outcome = sync.sync(&[col("id", "BIGINT", false)], "s", "t").await.unwrap();
        assert_eq!(outcome, SyncOutcome::InSync);
    }

    #[tokio::test]
    async fn test_sync_adds_new_nullable_column() {
        let engine = RecordingEngine::new();
        engine
            .create_table("s", "t", &[col("id", "BIGINT", false)], &["id".to_string()])
            .await
            .unwrap();
        let sync = SchemaSynchronizer::new(engine.as_ref());
        let outcome = sync
            .sync(
                &[col("id", "BIGINT", false), col("email", "VARCHAR(200)", true)],
                "s",
                "t",
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Applied {
                added: 1,
                dropped: 0,
                modified: 0
            }
        );
        let columns = engine.table_columns("s", "t").await.unwrap();
        assert!(columns.iter().any(|c| c.name == "email"));
    }

    #[tokio::test]
    async fn test_pk_drop_returns_reset_sentinel() {
        let engine = RecordingEngine::new();
        engine
            .create_table(
                "s",
                "t",
                &[col("id", "BIGINT", false).primary_key(), col("v", "TEXT", true)],
                &["id".to_string()],
            )
            .await
            .unwrap();
        let sync = SchemaSynchronizer::new(engine.as_ref());
        // Source lost the pk column entirely.
        let outcome = sync.sync(&[col("v", "TEXT", true)], "s", "t").await.unwrap();
        assert_eq!(outcome, SyncOutcome::RequiresFullLoad);
    }

    #[tokio::test]
    async fn test_incompatible_modify_is_skipped() {
        let engine = RecordingEngine::new();
        engine
            .create_table("s", "t", &[col("v", "TEXT", true)], &[])
            .await
            .unwrap();
        let sync = SchemaSynchronizer::new(engine.as_ref());
        let outcome = sync.sync(&[col("v", "BIGINT", true)], "s", "t").await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Applied {
                added: 0,
                dropped: 0,
                modified: 0
            }
        );
        // Unchanged on the target.
        let columns = engine.table_columns("s", "t").await.unwrap();
        assert_eq!(columns[0].target_type, "TEXT");
    }
}
