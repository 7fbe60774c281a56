//! Cross-module scenarios exercising replication, schema evolution and the
//! builders against the in-memory backends.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{
    catalog::{CatalogStore, MemoryCatalog, TableKey, TableStatus},
    replication::{Replicator, TableOutcome},
    row::row_of,
    schema::ColumnInfo,
    source::{MemorySource, MemoryTableSpec, Operation, SourceDialect},
    warehouse::{RecordingEngine, WarehouseEngine},
};

struct Scenario {
    store: Arc<MemoryCatalog>,
    engine: Arc<RecordingEngine>,
    source: MemorySource,
    replicator: Replicator,
    key: TableKey,
}

async fn scenario() -> Scenario {
    let store = Arc::new(MemoryCatalog::new());
    let engine = RecordingEngine::new();
    let source = MemorySource::new(SourceDialect::MariaDb, "maria://erp");
    source.add_table(
        "erp",
        "customers",
        MemoryTableSpec {
            columns: vec![
                ColumnInfo::new("id", "BIGINT", false).primary_key(),
                ColumnInfo::new("v", "VARCHAR(20)", true),
            ],
            primary_key: vec!["id".to_string()],
            rows: vec![row_of(&[("id", json!(1)), ("v", json!("a"))])],
            ..MemoryTableSpec::default()
        },
    );
    let key = TableKey::new("erp", "customers", SourceDialect::MariaDb);
    store
        .upsert(&key, "maria://erp", &["id".to_string()], true, 1)
        .await
        .unwrap();
    let replicator = Replicator::new(store.clone(), engine.clone(), None, 100);
    Scenario {
        store,
        engine,
        source,
        replicator,
        key,
    }
}

impl Scenario {
    async fn entry(&self) -> crate::catalog::CatalogEntry {
        self.store.get(&self.key).await.unwrap().unwrap()
    }

    async fn run(&self) -> TableOutcome {
        self.replicator
            .run_table(&self.source, &self.entry().await, &CancellationToken::new())
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_compatible_schema_evolution_during_cdc() {
    let scenario = scenario().await;
    scenario.run().await;
    assert_eq!(scenario.entry().await.status, TableStatus::ListeningChanges);

    // The source gains a nullable email column.
    scenario.source.add_table(
        "erp",
        "customers",
        MemoryTableSpec {
            columns: vec![
                ColumnInfo::new("id", "BIGINT", false).primary_key(),
                ColumnInfo::new("v", "VARCHAR(20)", true),
                ColumnInfo::new("email", "VARCHAR(200)", true),
            ],
            primary_key: vec!["id".to_string()],
            rows: vec![row_of(&[("id", json!(1)), ("v", json!("a"))])],
            ..MemoryTableSpec::default()
        },
    );

    scenario.run().await;

    let columns = scenario.engine.table_columns("erp", "customers").await.unwrap();
    assert!(columns.iter().any(|c| c.name == "email"));
    // Existing rows read null for the new column.
    let rows = scenario.engine.rows("erp", "customers");
    assert_eq!(rows[0]["email"], crate::row::Value::Null);
    assert_eq!(scenario.entry().await.status, TableStatus::ListeningChanges);
}

#[tokio::test]
async fn test_breaking_schema_evolution_resets_to_full_load() {
    let scenario = scenario().await;
    scenario.run().await;

    // The source drops the primary-key column entirely.
    scenario.source.add_table(
        "erp",
        "customers",
        MemoryTableSpec {
            columns: vec![ColumnInfo::new("v", "VARCHAR(20)", true)],
            primary_key: vec!["id".to_string()],
            rows: vec![row_of(&[("v", json!("a"))])],
            ..MemoryTableSpec::default()
        },
    );

    let outcome = scenario.run().await;
    assert_eq!(outcome, TableOutcome::ResetForFullLoad);
    assert!(!scenario.engine.table_exists("erp", "customers").await.unwrap());
    let entry = scenario.entry().await;
    assert_eq!(entry.status, TableStatus::FullLoad);
    // Primary-key metadata survives the reset.
    assert_eq!(entry.pk_columns, vec!["id".to_string()]);

    // The next cycle rebuilds from scratch.
    let outcome = scenario.run().await;
    assert!(matches!(outcome, TableOutcome::FullLoaded { .. }));
    assert!(scenario.engine.table_exists("erp", "customers").await.unwrap());
}

#[tokio::test]
async fn test_full_load_then_empty_cdc_batch_is_bit_identical() {
    let scenario = scenario().await;
    scenario.run().await;
    let after_load = scenario.engine.rows("erp", "customers");
    let watermark = scenario.entry().await.last_change_id();

    let outcome = scenario.run().await;
    assert_eq!(
        outcome,
        TableOutcome::ChangesApplied {
            deletes: 0,
            upserts: 0
        }
    );
    assert_eq!(scenario.engine.rows("erp", "customers"), after_load);
    assert_eq!(scenario.entry().await.last_change_id(), watermark);
}

#[tokio::test]
async fn test_cdc_updates_produce_last_image_and_watermark() {
    let scenario = scenario().await;
    scenario.run().await;

    for v in ["b", "c", "b"] {
        scenario.source.push_change(
            "erp",
            "customers",
            Operation::Update,
            row_of(&[("id", json!(1))]),
            Some(row_of(&[("id", json!(1)), ("v", json!(v))])),
        );
    }
    scenario.run().await;

    let rows = scenario.engine.rows("erp", "customers");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["v"], json!("b"));
    assert_eq!(scenario.entry().await.last_change_id(), 3);
}
