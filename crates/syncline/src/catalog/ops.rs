use std::collections::BTreeMap;

use tracing::{info, warn};

use super::{CatalogError, CatalogStore, DeleteFilter, TableKey, TableStatus};
use crate::warehouse::WarehouseEngine;

/// Composite catalog lifecycle operations that need both the store and the
/// target engine: reactivation probes, skip/truncate transitions, resets and
/// size sweeps.
#[derive(Debug)]
pub struct CatalogMaintenance<'a> {
    store: &'a dyn CatalogStore,
    engine: &'a dyn WarehouseEngine,
}

impl<'a> CatalogMaintenance<'a> {
    pub fn new(store: &'a dyn CatalogStore, engine: &'a dyn WarehouseEngine) -> Self {
        Self { store, engine }
    }

    /// Probe every (inactive, NO_DATA) entry's target; entries whose target
    /// holds at least one row flip back to active FULL_LOAD.
    pub async fn reactivate_with_data(&self) -> Result<u64, CatalogError> {
        let mut reactivated = 0;
        for entry in self.store.list_all().await? {
            if entry.active || entry.status != TableStatus::NoData {
                continue;
            }
            let key = entry.key();
            let exists = self
                .engine
                .table_exists(&key.target_schema(), &key.target_table())
                .await?;
            if !exists {
                continue;
            }
            let rows = self
                .engine
                .count_rows(&key.target_schema(), &key.target_table())
                .await?;
            if rows > 0 {
                info!(table = %key, rows, "reactivating entry with data");
                self.store.set_active(&key, true).await?;
                self.store.set_status(&key, TableStatus::FullLoad).await?;
                reactivated += 1;
            }
        }
        Ok(reactivated)
    }

    /// Deactivate active entries whose target is missing or empty, marking
    /// them NO_DATA.
    pub async fn deactivate_empty(&self) -> Result<u64, CatalogError> {
        let mut deactivated = 0;
        for entry in self.store.list_active().await? {
            let key = entry.key();
            let exists = self
                .engine
                .table_exists(&key.target_schema(), &key.target_table())
                .await?;
            let rows = if exists {
                self.engine
                    .count_rows(&key.target_schema(), &key.target_table())
                    .await?
            } else {
                0
            };
            if rows == 0 {
                info!(table = %key, "deactivating empty entry");
                self.store.set_active(&key, false).await?;
                self.store.set_status(&key, TableStatus::NoData).await?;
                deactivated += 1;
            }
        }
        Ok(deactivated)
    }

    /// Move every inactive entry to SKIP, optionally truncating its target.
    pub async fn mark_inactive_as_skip(&self, truncate_target: bool) -> Result<u64, CatalogError> {
        let mut skipped = 0;
        for entry in self.store.list_all().await? {
            if entry.active || entry.status == TableStatus::Skip {
                continue;
            }
            let key = entry.key();
            if truncate_target
                && self
                    .engine
                    .table_exists(&key.target_schema(), &key.target_table())
                    .await?
            {
                self.engine
                    .truncate_table(&key.target_schema(), &key.target_table())
                    .await?;
            }
            self.store.set_status(&key, TableStatus::Skip).await?;
            skipped += 1;
        }
        Ok(skipped)
    }

    /// Drop the target table (if present) and reset the entry to FULL_LOAD.
    /// Primary-key metadata is preserved.
    pub async fn reset_table(&self, key: &TableKey) -> Result<(), CatalogError> {
        let entry = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| CatalogError::NotFound(key.clone()))?;
        if self
            .engine
            .table_exists(&key.target_schema(), &key.target_table())
            .await?
        {
            self.engine
                .drop_table(&key.target_schema(), &key.target_table())
                .await?;
        }
        info!(table = %key, pk = ?entry.pk_columns, "reset to full load");
        self.store.set_status(key, TableStatus::FullLoad).await?;
        self.store
            .set_sync_metadata(key, serde_json::Map::new())
            .await
    }

    /// Delete catalog rows matching the filter, dropping targets when asked.
    pub async fn delete(
        &self,
        filter: &DeleteFilter,
        drop_target: bool,
    ) -> Result<u64, CatalogError> {
        let removed = self.store.delete(filter).await?;
        if drop_target {
            for entry in &removed {
                let key = entry.key();
                self.engine
                    .drop_table(&key.target_schema(), &key.target_table())
                    .await?;
            }
        }
        Ok(removed.len() as u64)
    }

    /// Row counts over every tracked target, keyed `schema|table`. Targets
    /// that do not exist yet are skipped.
    pub async fn table_sizes_batch(&self) -> Result<BTreeMap<String, i64>, CatalogError> {
        let mut sizes = BTreeMap::new();
        for entry in self.store.list_all().await? {
            let key = entry.key();
            let (schema, table) = (key.target_schema(), key.target_table());
            if !self.engine.table_exists(&schema, &table).await? {
                continue;
            }
            match self.engine.count_rows(&schema, &table).await {
                Ok(rows) => {
                    sizes.insert(format!("{schema}|{table}"), rows);
                }
                Err(e) => warn!(table = %key, error = %e, "size probe failed"),
            }
        }
        Ok(sizes)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        catalog::{CatalogStore, MemoryCatalog},
        schema::ColumnInfo,
        source::SourceDialect,
        warehouse::{RecordingEngine, WarehouseEngine},
    };

    fn key(schema: &str, table: &str) -> TableKey {
        TableKey::new(schema, table, SourceDialect::MariaDb)
    }

    async fn seeded_target(engine: &RecordingEngine, schema: &str, table: &str, rows: usize) {
        engine
            .create_table(
                schema,
                table,
                &[ColumnInfo::new("id", "BIGINT", false)],
                &["id".to_string()],
            )
            .await
            .unwrap();
        for i in 0..rows {
            engine
                .insert_rows(schema, table, &["id".to_string()], &[vec![json!(i)]])
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_reactivate_flips_only_entries_with_rows() {
        let store = MemoryCatalog::new();
        let engine = RecordingEngine::new();
        for table in ["with_rows", "empty", "missing"] {
            let k = key("s", table);
            store.upsert(&k, "c", &[], false, 0).await.unwrap();
            store.set_status(&k, TableStatus::NoData).await.unwrap();
        }
        seeded_target(&engine, "s", "with_rows", 3).await;
        seeded_target(&engine, "s", "empty", 0).await;

        let maintenance = CatalogMaintenance::new(&store, engine.as_ref());
        assert_eq!(maintenance.reactivate_with_data().await.unwrap(), 1);

        let reactivated = store.get(&key("s", "with_rows")).await.unwrap().unwrap();
        assert!(reactivated.active);
        assert_eq!(reactivated.status, TableStatus::FullLoad);
        let untouched = store.get(&key("s", "empty")).await.unwrap().unwrap();
        assert!(!untouched.active);
    }

    #[tokio::test]
    async fn test_skip_transition_truncates_when_asked() {
        let store = MemoryCatalog::new();
        let engine = RecordingEngine::new();
        let k = key("s", "t");
        store.upsert(&k, "c", &[], false, 0).await.unwrap();
        store.set_status(&k, TableStatus::NoData).await.unwrap();
        seeded_target(&engine, "s", "t", 2).await;

        let maintenance = CatalogMaintenance::new(&store, engine.as_ref());
        assert_eq!(maintenance.mark_inactive_as_skip(true).await.unwrap(), 1);
        assert_eq!(
            store.get(&k).await.unwrap().unwrap().status,
            TableStatus::Skip
        );
        assert!(engine.rows("s", "t").is_empty());
    }

    #[tokio::test]
    async fn test_reset_drops_target_and_keeps_pk() {
        let store = MemoryCatalog::new();
        let engine = RecordingEngine::new();
        let k = key("s", "t");
        store
            .upsert(&k, "c", &["id".to_string()], true, 0)
            .await
            .unwrap();
        store
            .set_status(&k, TableStatus::ListeningChanges)
            .await
            .unwrap();
        seeded_target(&engine, "s", "t", 1).await;

        let maintenance = CatalogMaintenance::new(&store, engine.as_ref());
        maintenance.reset_table(&k).await.unwrap();

        assert!(!engine.table_exists("s", "t").await.unwrap());
        let entry = store.get(&k).await.unwrap().unwrap();
        assert_eq!(entry.status, TableStatus::FullLoad);
        assert_eq!(entry.pk_columns, vec!["id".to_string()]);
        assert_eq!(entry.last_change_id(), 0);
    }

    #[tokio::test]
    async fn test_table_sizes_batch() {
        let store = MemoryCatalog::new();
        let engine = RecordingEngine::new();
        store.upsert(&key("s", "a"), "c", &[], true, 0).await.unwrap();
        store.upsert(&key("s", "b"), "c", &[], true, 0).await.unwrap();
        seeded_target(&engine, "s", "a", 2).await;

        let maintenance = CatalogMaintenance::new(&store, engine.as_ref());
        let sizes = maintenance.table_sizes_batch().await.unwrap();
        assert_eq!(sizes.get("s|a"), Some(&2));
        assert!(!sizes.contains_key("s|b"));
    }
}
