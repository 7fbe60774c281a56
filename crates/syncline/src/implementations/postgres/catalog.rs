use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row as SqlxRow};

use crate::{
    catalog::{
        require_non_empty, CatalogEntry, CatalogError, CatalogStore, DeleteFilter, PkStrategy,
        TableKey, TableStatus, UpsertOutcome,
    },
    row::Value,
    source::SourceDialect,
};

/// Catalog store over `metadata.catalog`. Every mutation runs in its own
/// transaction; concurrent upserts serialize on the primary-key conflict
/// clause.
#[derive(Debug, Clone)]
pub struct PostgresCatalog {
    pool: PgPool,
}

impl PostgresCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn entry_from_row(row: &PgRow) -> Result<CatalogEntry, CatalogError> {
        let status: String = row
            .try_get("status")
            .map_err(|e| CatalogError::backend_with_source("decode status", e))?;
        let engine: String = row
            .try_get("db_engine")
            .map_err(|e| CatalogError::backend_with_source("decode db_engine", e))?;
        let strategy: String = row
            .try_get("pk_strategy")
            .map_err(|e| CatalogError::backend_with_source("decode pk_strategy", e))?;
        let sync_metadata: Value = row
            .try_get("sync_metadata")
            .map_err(|e| CatalogError::backend_with_source("decode sync_metadata", e))?;

        Ok(CatalogEntry {
            schema: row
                .try_get("schema_name")
                .map_err(|e| CatalogError::backend_with_source("decode schema_name", e))?,
            table: row
                .try_get("table_name")
                .map_err(|e| CatalogError::backend_with_source("decode table_name", e))?,
            engine: engine
                .parse::<SourceDialect>()
                .map_err(|_| CatalogError::backend(format!("unknown db_engine: {engine}")))?,
            connection: row
                .try_get("connection_string")
                .map_err(|e| CatalogError::backend_with_source("decode connection_string", e))?,
            status: status
                .parse::<TableStatus>()
                .map_err(|_| CatalogError::backend(format!("unknown status: {status}")))?,
            active: row
                .try_get("active")
                .map_err(|e| CatalogError::backend_with_source("decode active", e))?,
            cluster: row
                .try_get("cluster_name")
                .map_err(|e| CatalogError::backend_with_source("decode cluster_name", e))?,
            pk_columns: row
                .try_get("pk_columns")
                .map_err(|e| CatalogError::backend_with_source("decode pk_columns", e))?,
            pk_strategy: strategy.parse::<PkStrategy>().unwrap_or_default(),
            size: row
                .try_get("table_size")
                .map_err(|e| CatalogError::backend_with_source("decode table_size", e))?,
            sync_metadata: sync_metadata.as_object().cloned().unwrap_or_default(),
        })
    }
}

const SELECT_COLUMNS: &str = "schema_name, table_name, db_engine, connection_string, status, \
                              active, cluster_name, pk_columns, pk_strategy, table_size, \
                              sync_metadata";

#[async_trait]
impl CatalogStore for PostgresCatalog {
    async fn list_connections(&self, engine: SourceDialect) -> Result<Vec<String>, CatalogError> {
        let rows = sqlx::query(
            "SELECT DISTINCT connection_string FROM metadata.catalog \
             WHERE db_engine = $1 ORDER BY connection_string",
        )
        .bind(engine.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CatalogError::backend_with_source("list connections", e))?;
        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("connection_string")
                    .map_err(|e| CatalogError::backend_with_source("decode connection_string", e))
            })
            .collect()
    }

    async fn list_entries(
        &self,
        engine: SourceDialect,
        connection: &str,
    ) -> Result<Vec<CatalogEntry>, CatalogError> {
        if connection.trim().is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM metadata.catalog \
             WHERE db_engine = $1 AND connection_string = $2 \
             ORDER BY schema_name, table_name"
        ))
        .bind(engine.to_string())
        .bind(connection)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CatalogError::backend_with_source("list entries", e))?;
        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn list_all(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM metadata.catalog ORDER BY schema_name, table_name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CatalogError::backend_with_source("list all", e))?;
        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn list_active(&self) -> Result<Vec<CatalogEntry>, CatalogError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM metadata.catalog WHERE active \
             ORDER BY schema_name, table_name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CatalogError::backend_with_source("list active", e))?;
        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn get(&self, key: &TableKey) -> Result<Option<CatalogEntry>, CatalogError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM metadata.catalog \
             WHERE schema_name = $1 AND table_name = $2 AND db_engine = $3"
        ))
        .bind(&key.schema)
        .bind(&key.table)
        .bind(key.engine.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CatalogError::backend_with_source("get entry", e))?;
        row.as_ref().map(Self::entry_from_row).transpose()
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

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CatalogError::backend_with_source("begin upsert", e))?;

        let existing: Option<Vec<String>> = sqlx::query_scalar(
            "SELECT pk_columns FROM metadata.catalog \
             WHERE schema_name = $1 AND table_name = $2 AND db_engine = $3 FOR UPDATE",
        )
        .bind(&key.schema)
        .bind(&key.table)
        .bind(key.engine.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| CatalogError::backend_with_source("read existing pk", e))?;

        let outcome = match &existing {
            None => UpsertOutcome::Inserted,
            Some(stored) if stored == pk_columns => UpsertOutcome::SizeUpdated,
            Some(_) => UpsertOutcome::PkChangedReset,
        };

        sqlx::query(
            "INSERT INTO metadata.catalog \
             (schema_name, table_name, db_engine, connection_string, status, active, \
              pk_columns, pk_strategy, table_size) \
             VALUES ($1, $2, $3, $4, 'FULL_LOAD', $5, $6, 'CDC', $7) \
             ON CONFLICT (schema_name, table_name, db_engine) DO UPDATE SET \
               connection_string = EXCLUDED.connection_string, \
               active = EXCLUDED.active, \
               table_size = EXCLUDED.table_size, \
               pk_columns = EXCLUDED.pk_columns, \
               status = CASE WHEN metadata.catalog.pk_columns = EXCLUDED.pk_columns \
                             THEN metadata.catalog.status ELSE 'FULL_LOAD' END, \
               updated_at = now()",
        )
        .bind(&key.schema)
        .bind(&key.table)
        .bind(key.engine.to_string())
        .bind(connection)
        .bind(active)
        .bind(pk_columns)
        .bind(size)
        .execute(&mut *tx)
        .await
        .map_err(|e| CatalogError::backend_with_source("upsert entry", e))?;

        tx.commit()
            .await
            .map_err(|e| CatalogError::backend_with_source("commit upsert", e))?;
        Ok(outcome)
    }

    async fn update_cluster(
        &self,
        cluster: &str,
        connection: &str,
        engine: SourceDialect,
    ) -> Result<u64, CatalogError> {
        let result = sqlx::query(
            "UPDATE metadata.catalog SET cluster_name = $1, updated_at = now() \
             WHERE connection_string = $2 AND db_engine = $3",
        )
        .bind(cluster)
        .bind(connection)
        .bind(engine.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| CatalogError::backend_with_source("update cluster", e))?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, filter: &DeleteFilter) -> Result<Vec<CatalogEntry>, CatalogError> {
        let rows = match &filter.connection {
            Some(connection) => {
                sqlx::query(&format!(
                    "DELETE FROM metadata.catalog \
                     WHERE schema_name = $1 AND table_name = $2 AND db_engine = $3 \
                     AND connection_string = $4 RETURNING {SELECT_COLUMNS}"
                ))
                .bind(&filter.schema)
                .bind(&filter.table)
                .bind(filter.engine.to_string())
                .bind(connection)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "DELETE FROM metadata.catalog \
                     WHERE schema_name = $1 AND table_name = $2 AND db_engine = $3 \
                     RETURNING {SELECT_COLUMNS}"
                ))
                .bind(&filter.schema)
                .bind(&filter.table)
                .bind(filter.engine.to_string())
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| CatalogError::backend_with_source("delete entries", e))?;
        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn set_status(&self, key: &TableKey, status: TableStatus) -> Result<(), CatalogError> {
        let result = sqlx::query(
            "UPDATE metadata.catalog SET status = $1, updated_at = now() \
             WHERE schema_name = $2 AND table_name = $3 AND db_engine = $4",
        )
        .bind(status.to_string())
        .bind(&key.schema)
        .bind(&key.table)
        .bind(key.engine.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| CatalogError::backend_with_source("set status", e))?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(key.clone()));
        }
        Ok(())
    }

    async fn set_active(&self, key: &TableKey, active: bool) -> Result<(), CatalogError> {
        let result = sqlx::query(
            "UPDATE metadata.catalog SET active = $1, updated_at = now() \
             WHERE schema_name = $2 AND table_name = $3 AND db_engine = $4",
        )
        .bind(active)
        .bind(&key.schema)
        .bind(&key.table)
        .bind(key.engine.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| CatalogError::backend_with_source("set active", e))?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(key.clone()));
        }
        Ok(())
    }

    async fn set_sync_metadata(
        &self,
        key: &TableKey,
        metadata: serde_json::Map<String, Value>,
    ) -> Result<(), CatalogError> {
        let result = sqlx::query(
            "UPDATE metadata.catalog SET sync_metadata = $1, updated_at = now() \
             WHERE schema_name = $2 AND table_name = $3 AND db_engine = $4",
        )
        .bind(Value::Object(metadata))
        .bind(&key.schema)
        .bind(&key.table)
        .bind(key.engine.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| CatalogError::backend_with_source("set sync_metadata", e))?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(key.clone()));
        }
        Ok(())
    }

    async fn advance_watermark(&self, key: &TableKey, change_id: i64) -> Result<(), CatalogError> {
        // Monotone guard and advance in one statement: the watermark commits
        // atomically with the surrounding batch apply.
        sqlx::query(
            "UPDATE metadata.catalog \
             SET sync_metadata = jsonb_set(sync_metadata, '{last_change_id}', to_jsonb($1::TEXT)), \
                 updated_at = now() \
             WHERE schema_name = $2 AND table_name = $3 AND db_engine = $4 \
             AND COALESCE(NULLIF(sync_metadata->>'last_change_id', '')::BIGINT, 0) < $5",
        )
        .bind(change_id.to_string())
        .bind(&key.schema)
        .bind(&key.table)
        .bind(key.engine.to_string())
        .bind(change_id)
        .execute(&self.pool)
        .await
        .map_err(|e| CatalogError::backend_with_source("advance watermark", e))?;
        Ok(())
    }

    async fn cleanup_pk_strategy(&self) -> Result<u64, CatalogError> {
        let result = sqlx::query(
            "UPDATE metadata.catalog SET pk_strategy = 'CDC', updated_at = now() \
             WHERE pk_strategy = 'OFFSET'",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CatalogError::backend_with_source("cleanup pk strategy", e))?;
        Ok(result.rows_affected())
    }
}
