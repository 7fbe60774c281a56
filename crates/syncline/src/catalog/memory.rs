use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;

use super::{
    require_non_empty, CatalogEntry, CatalogError, CatalogStore, DeleteFilter, PkStrategy,
    TableKey, TableStatus, UpsertOutcome,
};
use crate::{row::Value, source::SourceDialect};

/// In-memory catalog backend. Serves tests and the embedded single-process
/// mode; iteration order is deterministic by (schema, table, engine).
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    entries: Mutex<BTreeMap<TableKey, CatalogEntry>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<TableKey, CatalogEntry>>, CatalogError> {
        self.entries
            .lock()
            .map_err(|_| CatalogError::backend("catalog mutex poisoned"))
    }

    /// Seed an entry wholesale; test convenience.
    pub fn insert_entry(&self, entry: CatalogEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(entry.key(), entry);
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn list_connections(&self, engine: SourceDialect) -> Result<Vec<String>, CatalogError> {
        let entries = self.lock()?;
        let mut connections: Vec<String> = entries
            .values()
            .filter(|e| e.engine == engine)
            .map(|e| e.connection.clone())
            .collect();
        connections.sort();
        connections.dedup();
        Ok(connections)
    }

    async fn list_entries(
        &self,
        engine: SourceDialect,
        connection: &str,
    ) -> Result<Vec<CatalogEntry>, CatalogError> {
        if connection.trim().is_empty() {
            return Ok(Vec::new());
        }
        let entries = self.lock()?;
        Ok(entries
            .values()
            .filter(|e| e.engine == engine && e.connection == connection)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        Ok(self.lock()?.values().cloned().collect())
    }

    async fn list_active(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        Ok(self.lock()?.values().filter(|e| e.active).cloned().collect())
    }

    async fn get(&self, key: &TableKey) -> Result<Option<CatalogEntry>, CatalogError> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn upsert(
        &self,
        key: &TableKey,
        connection: &str,
        pk_columns: &[String],
        active: bool,
        size: i64,
    ) -> Result<UpsertOutcome, CatalogError> {
        require_non_empty(&key.schema, "schema")?;
        require_non_empty(&key.table, "table")?;
        require_non_empty(connection, "connection")?;

        let mut entries = self.lock()?;
        match entries.get_mut(key) {
            None => {
                entries.insert(
                    key.clone(),
                    CatalogEntry {
                        schema: key.schema.clone(),
                        table: key.table.clone(),
                        engine: key.engine,
                        connection: connection.to_string(),
                        status: TableStatus::FullLoad,
                        active,
                        cluster: None,
                        pk_columns: pk_columns.to_vec(),
                        pk_strategy: PkStrategy::Cdc,
                        size,
                        sync_metadata: serde_json::Map::new(),
                    },
                );
                Ok(UpsertOutcome::Inserted)
            }
            Some(entry) if entry.pk_columns == pk_columns => {
                entry.size = size;
                entry.active = active;
                Ok(UpsertOutcome::SizeUpdated)
            }
            Some(entry) => {
                entry.pk_columns = pk_columns.to_vec();
                entry.size = size;
                entry.active = active;
                entry.status = TableStatus::FullLoad;
                Ok(UpsertOutcome::PkChangedReset)
            }
        }
    }

    async fn update_cluster(
        &self,
        cluster: &str,
        connection: &str,
        engine: SourceDialect,
    ) -> Result<u64, CatalogError> {
        let mut entries = self.lock()?;
        let mut touched = 0;
        for entry in entries.values_mut() {
            if entry.engine == engine && entry.connection == connection {
                entry.cluster = Some(cluster.to_string());
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn delete(&self, filter: &DeleteFilter) -> Result<Vec<CatalogEntry>, CatalogError> {
        let mut entries = self.lock()?;
        let matching: Vec<TableKey> = entries
            .values()
            .filter(|e| {
                e.schema == filter.schema
                    && e.table == filter.table
                    && e.engine == filter.engine
                    && filter
                        .connection
                        .as_ref()
                        .is_none_or(|c| &e.connection == c)
            })
            .map(CatalogEntry::key)
            .collect();
        Ok(matching
            .iter()
            .filter_map(|key| entries.remove(key))
            .collect())
    }

    async fn set_status(&self, key: &TableKey, status: TableStatus) -> Result<(), CatalogError> {
        let mut entries = self.lock()?;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| CatalogError::NotFound(key.clone()))?;
        entry.status = status;
        Ok(())
    }

    async fn set_active(&self, key: &TableKey, active: bool) -> Result<(), CatalogError> {
        let mut entries = self.lock()?;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| CatalogError::NotFound(key.clone()))?;
        entry.active = active;
        Ok(())
    }

    async fn set_sync_metadata(
        &self,
        key: &TableKey,
        metadata: serde_json::Map<String, Value>,
    ) -> Result<(), CatalogError> {
        let mut entries = self.lock()?;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| CatalogError::NotFound(key.clone()))?;
        entry.sync_metadata = metadata;
        Ok(())
    }

    async fn advance_watermark(&self, key: &TableKey, change_id: i64) -> Result<(), CatalogError> {
        let mut entries = self.lock()?;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| CatalogError::NotFound(key.clone()))?;
        if change_id > entry.last_change_id() {
            entry.set_last_change_id(change_id);
        }
        Ok(())
    }

    async fn cleanup_pk_strategy(&self) -> Result<u64, CatalogError> {
        let mut entries = self.lock()?;
        let mut migrated = 0;
        for entry in entries.values_mut() {
            if entry.pk_strategy == PkStrategy::Offset {
                entry.pk_strategy = PkStrategy::Cdc;
                migrated += 1;
            }
        }
        Ok(migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(schema: &str, table: &str) -> TableKey {
        TableKey::new(schema, table, SourceDialect::Db2)
    }

    #[tokio::test]
    async fn test_upsert_inserts_with_full_load() {
        let catalog = MemoryCatalog::new();
        let outcome = catalog
            .upsert(&key("Sales", "Orders"), "DB2-A", &["ID".to_string()], true, 100)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Inserted);
        let entry = catalog.get(&key("Sales", "Orders")).await.unwrap().unwrap();
        assert_eq!(entry.status, TableStatus::FullLoad);
        assert_eq!(entry.pk_strategy, PkStrategy::Cdc);
    }

    #[tokio::test]
    async fn test_upsert_same_pk_only_updates_size() {
        let catalog = MemoryCatalog::new();
        let k = key("s", "t");
        catalog
            .upsert(&k, "c", &["id".to_string()], true, 1)
            .await
            .unwrap();
        catalog
            .set_status(&k, TableStatus::ListeningChanges)
            .await
            .unwrap();
        let outcome = catalog
            .upsert(&k, "c", &["id".to_string()], true, 42)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::SizeUpdated);
        let entry = catalog.get(&k).await.unwrap().unwrap();
        assert_eq!(entry.size, 42);
        assert_eq!(entry.status, TableStatus::ListeningChanges);
    }

    #[tokio::test]
    async fn test_upsert_pk_change_resets_status() {
        let catalog = MemoryCatalog::new();
        let k = key("s", "t");
        catalog
            .upsert(&k, "c", &["id".to_string()], true, 1)
            .await
            .unwrap();
        catalog
            .set_status(&k, TableStatus::ListeningChanges)
            .await
            .unwrap();
        let outcome = catalog
            .upsert(&k, "c", &["id".to_string(), "ver".to_string()], true, 1)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::PkChangedReset);
        let entry = catalog.get(&k).await.unwrap().unwrap();
        assert_eq!(entry.status, TableStatus::FullLoad);
    }

    #[tokio::test]
    async fn test_upsert_rejects_empty_identifiers() {
        let catalog = MemoryCatalog::new();
        let result = catalog
            .upsert(&key("", "t"), "c", &[], true, 0)
            .await;
        assert!(matches!(result, Err(CatalogError::EmptyIdentifier("schema"))));
        assert!(catalog.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_entries_ordered_and_scoped() {
        let catalog = MemoryCatalog::new();
        for (s, t) in [("b", "y"), ("a", "z"), ("a", "x")] {
            catalog.upsert(&key(s, t), "c1", &[], true, 0).await.unwrap();
        }
        catalog
            .upsert(&key("a", "other"), "c2", &[], true, 0)
            .await
            .unwrap();
        let entries = catalog
            .list_entries(SourceDialect::Db2, "c1")
            .await
            .unwrap();
        let names: Vec<(String, String)> = entries
            .iter()
            .map(|e| (e.schema.clone(), e.table.clone()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("a".to_string(), "x".to_string()),
                ("a".to_string(), "z".to_string()),
                ("b".to_string(), "y".to_string())
            ]
        );
        assert!(catalog
            .list_entries(SourceDialect::Db2, "")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_watermark_is_monotone() {
        let catalog = MemoryCatalog::new();
        let k = key("s", "t");
        catalog.upsert(&k, "c", &[], true, 0).await.unwrap();
        catalog.advance_watermark(&k, 10).await.unwrap();
        catalog.advance_watermark(&k, 5).await.unwrap();
        let entry = catalog.get(&k).await.unwrap().unwrap();
        assert_eq!(entry.last_change_id(), 10);
    }

    #[tokio::test]
    async fn test_cleanup_migrates_offset_rows() {
        let catalog = MemoryCatalog::new();
        let k = key("s", "t");
        catalog.upsert(&k, "c", &[], true, 0).await.unwrap();
        {
            let mut entry = catalog.get(&k).await.unwrap().unwrap();
            entry.pk_strategy = PkStrategy::Offset;
            catalog.insert_entry(entry);
        }
        assert_eq!(catalog.cleanup_pk_strategy().await.unwrap(), 1);
        let entry = catalog.get(&k).await.unwrap().unwrap();
        assert_eq!(entry.pk_strategy, PkStrategy::Cdc);
    }
}
