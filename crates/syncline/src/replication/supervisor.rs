//! Root supervisor: enumerates active catalog entries and fans per-table
//! jobs out to a bounded worker pool. Each worker opens its own source
//! connection for the duration of a job; a slow table never blocks others.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use super::{Replicator, ReplicationError, TableOutcome};
use crate::{
    alerting::AlertSink,
    catalog::{CatalogEntry, CatalogStore, TableKey},
    source::{SourceDialect, SourceEngine, SourceError},
    warehouse::WarehouseEngine,
};

/// Opens source connections per job. Implementations typically pool or
/// construct dialect drivers from the connection descriptor.
#[async_trait]
pub trait SourceFactory: Send + Sync + Debug {
    async fn open(
        &self,
        dialect: SourceDialect,
        connection: &str,
    ) -> Result<Arc<dyn SourceEngine>, SourceError>;
}

/// Aggregate result of one sync pass.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    pub attempted: usize,
    pub full_loads: usize,
    pub rows_loaded: u64,
    pub deletes_applied: u64,
    pub upserts_applied: u64,
    pub failures: Vec<(TableKey, String)>,
}

impl RunSummary {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    fn absorb(&mut self, key: &TableKey, result: &Result<TableOutcome, ReplicationError>) {
        self.attempted += 1;
        match result {
            Ok(TableOutcome::FullLoaded { rows }) => {
                self.full_loads += 1;
                self.rows_loaded += rows;
            }
            Ok(TableOutcome::ChangesApplied { deletes, upserts }) => {
                self.deletes_applied += deletes;
                self.upserts_applied += upserts;
            }
            Ok(TableOutcome::ResetForFullLoad | TableOutcome::Skipped) => {}
            Err(e) => self.failures.push((key.clone(), e.to_string())),
        }
    }
}

#[derive(Debug)]
pub struct Supervisor {
    store: Arc<dyn CatalogStore>,
    target: Arc<dyn WarehouseEngine>,
    sources: Arc<dyn SourceFactory>,
    alerts: Option<Arc<dyn AlertSink>>,
    pool_size: usize,
    queue_depth: usize,
    chunk_size: usize,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        target: Arc<dyn WarehouseEngine>,
        sources: Arc<dyn SourceFactory>,
        alerts: Option<Arc<dyn AlertSink>>,
    ) -> Self {
        let config = &*crate::CONFIG;
        Self {
            store,
            target,
            sources,
            alerts,
            pool_size: config.worker_pool_size.max(1),
            queue_depth: config.job_queue_depth.max(1),
            chunk_size: config.chunk_size,
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// One full pass over every active catalog entry. Per-table failures are
    /// collected into the summary; only catalog-store unavailability is
    /// fatal.
    pub async fn run_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, ReplicationError> {
        let entries = self.store.list_active().await?;
        info!(tables = entries.len(), workers = self.pool_size, "starting sync pass");

        let (job_tx, job_rx) = mpsc::channel::<CatalogEntry>(self.queue_depth);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) =
            mpsc::channel::<(TableKey, Result<TableOutcome, ReplicationError>)>(self.queue_depth);

        let mut workers = Vec::with_capacity(self.pool_size);
        for worker_id in 0..self.pool_size {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let sources = self.sources.clone();
            let cancel = cancel.clone();
            let replicator = Replicator::new(
                self.store.clone(),
                self.target.clone(),
                self.alerts.clone(),
                self.chunk_size,
            );

            workers.push(tokio::spawn(
                async move {
                    loop {
                        let entry = {
                            let mut rx = job_rx.lock().await;
                            rx.recv().await
                        };
                        let Some(entry) = entry else { break };
                        let key = entry.key();

                        let result = match sources.open(entry.engine, &entry.connection).await {
                            Ok(source) => {
                                replicator.run_table(source.as_ref(), &entry, &cancel).await
                            }
                            Err(e) => Err(ReplicationError::Source {
                                table: key.clone(),
                                source: e,
                            }),
                        };
                        if result_tx.send((key, result)).await.is_err() {
                            break;
                        }
                    }
                }
                .instrument(tracing::debug_span!("replication_worker", worker_id)),
            ));
        }
        drop(result_tx);

        let feeder = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for entry in entries {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if job_tx.send(entry).await.is_err() {
                        break;
                    }
                }
            })
        };

        let mut summary = RunSummary::default();
        while let Some((key, result)) = result_rx.recv().await {
            if let Err(e) = &result {
                warn!(table = %key, error = %e, "table job failed");
            }
            summary.absorb(&key, &result);
        }

        let _ = feeder.await;
        futures::future::join_all(workers).await;

        info!(
            attempted = summary.attempted,
            full_loads = summary.full_loads,
            rows = summary.rows_loaded,
            failures = summary.failures.len(),
            "sync pass finished"
        );
        Ok(summary)
    }
}
