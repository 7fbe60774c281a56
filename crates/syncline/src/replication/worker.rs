//! Per-table replication: the full-load path and the incremental CDC state
//! machine (read → partition → delete → upsert → advance watermark).

use std::{collections::HashMap, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{cleanse::clean_row_values, ReplicationError};
use crate::{
    alerting::{Alert, AlertSeverity, AlertSink, AlertType},
    catalog::{CatalogEntry, CatalogStore, TableKey, TableStatus},
    digest::row_image_hash,
    row::{value_text, Row, Value},
    schema::{ColumnInfo, SchemaSynchronizer, SyncOutcome},
    source::{ChangeLogRecord, Operation, SourceEngine, ROW_HASH_KEY},
    warehouse::WarehouseEngine,
};

/// What a single table job did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOutcome {
    FullLoaded { rows: u64 },
    ChangesApplied { deletes: u64, upserts: u64 },
    /// A breaking schema change dropped the target; the next cycle rebuilds.
    ResetForFullLoad,
    Skipped,
}

/// Executes one catalog entry against one source and one target. The caller
/// owns connection lifetimes; a replicator instance is cheap and per-job.
#[derive(Debug)]
pub struct Replicator {
    store: Arc<dyn CatalogStore>,
    target: Arc<dyn WarehouseEngine>,
    alerts: Option<Arc<dyn AlertSink>>,
    chunk_size: usize,
}

impl Replicator {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        target: Arc<dyn WarehouseEngine>,
        alerts: Option<Arc<dyn AlertSink>>,
        chunk_size: usize,
    ) -> Self {
        Self {
            store,
            target,
            alerts,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Run the appropriate path for the entry's status. On permanent errors
    /// the entry is marked ERROR and a CRITICAL alert raised; transient
    /// errors leave status untouched for the next cycle.
    pub async fn run_table(
        &self,
        source: &dyn SourceEngine,
        entry: &CatalogEntry,
        cancel: &CancellationToken,
    ) -> Result<TableOutcome, ReplicationError> {
        let key = entry.key();
        let result = match entry.status {
            TableStatus::Pending | TableStatus::FullLoad => {
                self.full_load(source, entry, cancel).await
            }
            TableStatus::ListeningChanges => self.apply_changes(source, entry, cancel).await,
            TableStatus::NoData | TableStatus::Skip | TableStatus::Error => {
                debug!(table = %key, status = %entry.status, "skipping entry");
                Ok(TableOutcome::Skipped)
            }
        };

        if let Err(e) = &result {
            if e.is_transient() {
                warn!(table = %key, error = %e, "transient failure, will retry next cycle");
            } else {
                self.store.set_status(&key, TableStatus::Error).await?;
                self.raise(
                    Alert::new(
                        AlertType::Replication,
                        AlertSeverity::Critical,
                        format!("Replication failed for {key}"),
                        e.to_string(),
                    )
                    .scoped(entry.schema.clone(), entry.table.clone()),
                )
                .await;
            }
        }
        result
    }

    /// Initial materialization: reconcile or create the target table, stream
    /// the source in chunks through cleansing, then install change capture
    /// and flip to LISTENING_CHANGES.
    async fn full_load(
        &self,
        source: &dyn SourceEngine,
        entry: &CatalogEntry,
        cancel: &CancellationToken,
    ) -> Result<TableOutcome, ReplicationError> {
        let key = entry.key();
        let source_columns = source
            .get_columns(&entry.schema, &entry.table)
            .await
            .map_err(|source| ReplicationError::Source {
                table: key.clone(),
                source,
            })?;
        if source_columns.is_empty() {
            return Err(ReplicationError::NoColumns(key));
        }

        let target_columns = target_column_set(&source_columns, entry.has_primary_key());
        let key_columns = key_column_names(entry);

        let synchronizer = SchemaSynchronizer::new(self.target.as_ref());
        let outcome = synchronizer
            .sync(&target_columns, &key.target_schema(), &key.target_table())
            .await
            .map_err(|source| ReplicationError::Schema {
                table: key.clone(),
                source,
            })?;
        if outcome == SyncOutcome::RequiresFullLoad {
            self.target
                .drop_table(&key.target_schema(), &key.target_table())
                .await
                .map_err(|source| ReplicationError::Target {
                    table: key.clone(),
                    source,
                })?;
        }

        if !self
            .target
            .table_exists(&key.target_schema(), &key.target_table())
            .await
            .map_err(|source| ReplicationError::Target {
                table: key.clone(),
                source,
            })?
        {
            self.target
                .create_schema(&key.target_schema())
                .await
                .map_err(|source| ReplicationError::Target {
                    table: key.clone(),
                    source,
                })?;
            self.target
                .create_table(
                    &key.target_schema(),
                    &key.target_table(),
                    &target_columns,
                    &key_columns,
                )
                .await
                .map_err(|source| ReplicationError::Target {
                    table: key.clone(),
                    source,
                })?;
        }

        let insert_columns: Vec<String> =
            target_columns.iter().map(|c| c.name.clone()).collect();
        let source_order: Vec<String> =
            source_columns.iter().map(|c| c.name.clone()).collect();

        let mut offset = 0i64;
        let mut total = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(ReplicationError::Cancelled(key));
            }
            let rows = source
                .read_rows(&entry.schema, &entry.table, offset, self.chunk_size)
                .await
                .map_err(|source| ReplicationError::Source {
                    table: key.clone(),
                    source,
                })?;
            if rows.is_empty() {
                break;
            }
            let batch_len = rows.len();

            let values: Vec<Vec<Value>> = rows
                .iter()
                .map(|row| {
                    let mut cleaned = clean_row_values(row, &source_columns);
                    if !entry.has_primary_key() {
                        cleaned.push(Value::String(row_image_hash(row, &source_order)));
                    }
                    cleaned
                })
                .collect();

            self.target
                .insert_rows(
                    &key.target_schema(),
                    &key.target_table(),
                    &insert_columns,
                    &values,
                )
                .await
                .map_err(|source| ReplicationError::Target {
                    table: key.clone(),
                    source,
                })?;

            total += batch_len as u64;
            offset += batch_len as i64;
            if batch_len < self.chunk_size {
                break;
            }
        }

        let watermark = source
            .install_change_capture(&entry.schema, &entry.table)
            .await
            .map_err(|source| ReplicationError::Source {
                table: key.clone(),
                source,
            })?;
        self.store.advance_watermark(&key, watermark).await?;
        self.store
            .set_status(&key, TableStatus::ListeningChanges)
            .await?;

        info!(table = %key, rows = total, watermark, "full load complete");
        Ok(TableOutcome::FullLoaded { rows: total })
    }

    /// Incremental path: pull change-log batches in change_id order, apply
    /// deletes then upserts, advance the watermark to the batch maximum, and
    /// loop until the log is drained.
    async fn apply_changes(
        &self,
        source: &dyn SourceEngine,
        entry: &CatalogEntry,
        cancel: &CancellationToken,
    ) -> Result<TableOutcome, ReplicationError> {
        let key = entry.key();
        let source_columns = source
            .get_columns(&entry.schema, &entry.table)
            .await
            .map_err(|source| ReplicationError::Source {
                table: key.clone(),
                source,
            })?;
        if source_columns.is_empty() {
            return Err(ReplicationError::NoColumns(key));
        }

        let target_columns = target_column_set(&source_columns, entry.has_primary_key());
        let upsert_columns: Vec<String> =
            target_columns.iter().map(|c| c.name.clone()).collect();
        let key_columns = key_column_names(entry);
        let source_order: Vec<String> =
            source_columns.iter().map(|c| c.name.clone()).collect();

        // Source schema may have drifted since the last cycle; reconcile
        // the target before touching rows. A change that hits a primary-key
        // column cannot be applied in place.
        let synchronizer = SchemaSynchronizer::new(self.target.as_ref());
        let outcome = synchronizer
            .sync(&target_columns, &key.target_schema(), &key.target_table())
            .await
            .map_err(|source| ReplicationError::Schema {
                table: key.clone(),
                source,
            })?;
        if outcome == SyncOutcome::RequiresFullLoad {
            self.target
                .drop_table(&key.target_schema(), &key.target_table())
                .await
                .map_err(|source| ReplicationError::Target {
                    table: key.clone(),
                    source,
                })?;
            self.store.set_status(&key, TableStatus::FullLoad).await?;
            self.raise(
                Alert::new(
                    AlertType::SchemaChange,
                    AlertSeverity::Critical,
                    format!("Breaking schema change on {key}"),
                    "Primary-key column added or dropped on the source; target was dropped \
                     and the table reset to FULL_LOAD",
                )
                .scoped(entry.schema.clone(), entry.table.clone()),
            )
            .await;
            return Ok(TableOutcome::ResetForFullLoad);
        }

        let mut last = entry.last_change_id();
        let mut total_deletes = 0u64;
        let mut total_upserts = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(ReplicationError::Cancelled(key));
            }
            let records = source
                .read_changes(&entry.schema, &entry.table, last, self.chunk_size)
                .await
                .map_err(|source| ReplicationError::Source {
                    table: key.clone(),
                    source,
                })?;
            if records.is_empty() {
                break;
            }
            let batch_len = records.len();

            let batch = partition_batch(&records, entry, &key);
            let deletes = batch.delete_keys();
            let upserts: Vec<Vec<Value>> = batch
                .upserts
                .values()
                .map(|(row, hash)| {
                    let mut cleaned = clean_row_values(row, &source_columns);
                    if let Some(hash) = hash {
                        cleaned.push(Value::String(hash.clone()));
                    } else if !entry.has_primary_key() {
                        cleaned.push(Value::String(row_image_hash(row, &source_order)));
                    }
                    cleaned
                })
                .collect();

            if !deletes.is_empty() {
                total_deletes += self
                    .target
                    .delete_rows(
                        &key.target_schema(),
                        &key.target_table(),
                        &key_columns,
                        &deletes,
                    )
                    .await
                    .map_err(|source| ReplicationError::Target {
                        table: key.clone(),
                        source,
                    })?;
            }
            if !upserts.is_empty() {
                total_upserts += self
                    .target
                    .upsert_rows(
                        &key.target_schema(),
                        &key.target_table(),
                        &upsert_columns,
                        &key_columns,
                        &upserts,
                    )
                    .await
                    .map_err(|source| ReplicationError::Target {
                        table: key.clone(),
                        source,
                    })?;
            }

            // The apply above either fully succeeded or returned before this
            // point, so the watermark only ever covers applied records.
            self.store.advance_watermark(&key, batch.max_change_id).await?;
            last = batch.max_change_id;

            if batch_len < self.chunk_size {
                break;
            }
        }

        if total_deletes + total_upserts > 0 {
            info!(
                table = %key,
                deletes = total_deletes,
                upserts = total_upserts,
                watermark = last,
                "changes applied"
            );
        }
        Ok(TableOutcome::ChangesApplied {
            deletes: total_deletes,
            upserts: total_upserts,
        })
    }

    async fn raise(&self, alert: Alert) {
        if let Some(sink) = &self.alerts {
            if let Err(e) = sink.raise(alert).await {
                warn!(error = %e, "failed to record alert");
            }
        }
    }
}

fn key_column_names(entry: &CatalogEntry) -> Vec<String> {
    if entry.has_primary_key() {
        entry.pk_columns.iter().map(|c| c.to_lowercase()).collect()
    } else {
        vec![ROW_HASH_KEY.to_string()]
    }
}

/// Target columns are the source columns lowercased, plus the surrogate
/// hash column for key-less tables.
fn target_column_set(source_columns: &[ColumnInfo], has_pk: bool) -> Vec<ColumnInfo> {
    let mut columns: Vec<ColumnInfo> = source_columns
        .iter()
        .map(|c| {
            let mut col = c.clone();
            col.name = col.name.to_lowercase();
            col
        })
        .collect();
    if !has_pk {
        let mut hash = ColumnInfo::new(ROW_HASH_KEY, "VARCHAR(64)", false);
        hash.is_primary_key = true;
        columns.push(hash);
    }
    columns
}

/// One parsed change-log batch: delete key tuples in arrival order and
/// post-image upserts deduplicated last-wins per key.
#[derive(Debug, Default)]
struct ParsedBatch {
    max_change_id: i64,
    deletes: Vec<Vec<Value>>,
    /// key string → (post-image row, explicit row hash for key-less tables)
    upserts: HashMap<String, (Row, Option<String>)>,
}

impl ParsedBatch {
    fn delete_keys(&self) -> Vec<Vec<Value>> {
        self.deletes.clone()
    }
}

fn partition_batch(records: &[ChangeLogRecord], entry: &CatalogEntry, key: &TableKey) -> ParsedBatch {
    let mut batch = ParsedBatch {
        max_change_id: entry.last_change_id(),
        ..ParsedBatch::default()
    };

    for record in records {
        if record.change_id > batch.max_change_id {
            batch.max_change_id = record.change_id;
        }

        if entry.has_primary_key() {
            let mut pk_values = Vec::with_capacity(entry.pk_columns.len());
            let mut key_string = String::new();
            for column in &entry.pk_columns {
                let value = record
                    .pk_values
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(column))
                    .map(|(_, v)| v.clone())
                    .unwrap_or(Value::Null);
                key_string.push_str(&value_text(&value));
                key_string.push('|');
                pk_values.push(value);
            }

            match record.operation {
                Operation::Delete => batch.deletes.push(pk_values),
                Operation::Insert | Operation::Update => match &record.row_data {
                    Some(row) => {
                        batch.upserts.insert(key_string, (row.clone(), None));
                    }
                    None => warn!(
                        table = %key,
                        change_id = record.change_id,
                        "change record has no row image, skipping"
                    ),
                },
            }
        } else {
            let Some(hash) = record.row_hash() else {
                warn!(
                    table = %key,
                    change_id = record.change_id,
                    "key-less table change without _hash, skipping"
                );
                continue;
            };
            match record.operation {
                Operation::Delete => batch.deletes.push(vec![Value::String(hash.to_string())]),
                Operation::Insert | Operation::Update => match &record.row_data {
                    Some(row) => {
                        batch
                            .upserts
                            .insert(hash.to_string(), (row.clone(), Some(hash.to_string())));
                    }
                    None => warn!(
                        table = %key,
                        change_id = record.change_id,
                        "key-less change without row image, skipping"
                    ),
                },
            }
        }
    }
    batch
}
