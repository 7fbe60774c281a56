#![warn(rust_2018_idioms, unreachable_pub, clippy::pedantic)]
#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use syncline::{
    alerting::AlertSink,
    builders::{VaultBuilder, WarehouseBuilder},
    catalog::{CatalogMaintenance, CatalogStore, TableKey},
    implementations::postgres::{
        get_pool, migrate, PostgresAlertStore, PostgresCatalog, PostgresExecutor, PostgresLineage,
        PostgresModelStore, PostgresProcessLog, PostgresSource,
    },
    replication::{SourceFactory, Supervisor},
    source::{SourceDialect, SourceEngine, SourceError},
    tokio,
    tracing,
    transform::{TransformationEngine, TransformationRegistry},
    warehouse::{new_engine, SqlExecutor, WarehouseDialect},
    CancellationToken,
};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "syncline", version, about = "Replication and warehouse build engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply catalog-store migrations
    Migrate {},
    /// Run replication over the active catalog entries
    Sync {
        /// Run one pass and exit
        #[clap(long, conflicts_with = "loop_")]
        once: bool,
        /// Keep running passes until interrupted
        #[clap(long = "loop")]
        loop_: bool,
        /// Seconds between passes in loop mode
        #[clap(long, default_value_t = 60)]
        interval: u64,
    },
    /// Build one warehouse model
    BuildWarehouse { name: String },
    /// Build one vault model
    BuildVault { name: String },
    /// Drop the target table and reset the entry to FULL_LOAD
    ResetTable {
        /// Qualified as schema.table
        table: String,
        #[clap(long, default_value = "POSTGRES")]
        engine: String,
    },
    /// Migrate deprecated OFFSET pk-strategy rows to CDC
    CleanupOffsets {},
    /// Print the version
    Version {},
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}

/// Exit codes: 0 success, 1 generic failure, 2 misconfiguration,
/// 3 unrecoverable source/target error.
async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Version {} => {
            println!("{VERSION}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Migrate {} => {
            let pool = connect().await?;
            migrate(&pool).await?;
            println!("catalog store migrated");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sync {
            once,
            loop_,
            interval,
        } => sync(once || !loop_, interval).await,
        Commands::BuildWarehouse { name } => build_warehouse(&name).await,
        Commands::BuildVault { name } => build_vault(&name).await,
        Commands::ResetTable { table, engine } => reset_table(&table, &engine).await,
        Commands::CleanupOffsets {} => {
            let pool = connect().await?;
            let store = PostgresCatalog::new(pool);
            let migrated = store.cleanup_pk_strategy().await?;
            println!("{migrated} entries migrated to CDC");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn connect() -> anyhow::Result<sqlx::PgPool> {
    get_pool().await.map_err(|e| {
        anyhow::anyhow!("catalog store unreachable: {e}")
    })
}

/// Opens postgres sources per connection descriptor. The commercial source
/// dialects plug in through their own factories.
#[derive(Debug)]
struct PostgresSourceFactory;

#[syncline::async_trait::async_trait]
impl SourceFactory for PostgresSourceFactory {
    async fn open(
        &self,
        dialect: SourceDialect,
        connection: &str,
    ) -> Result<Arc<dyn SourceEngine>, SourceError> {
        if dialect != SourceDialect::Postgres {
            return Err(SourceError::Connection(format!(
                "no driver registered for source dialect {dialect}"
            )));
        }
        let connection_owned = connection.to_string();
        let pool = syncline::source::retry_connect(|| {
            let url = connection_owned.clone();
            async move {
                sqlx::postgres::PgPoolOptions::new()
                    .max_connections(2)
                    .connect(&url)
                    .await
                    .map_err(|e| SourceError::Connection(e.to_string()))
            }
        })
        .await?;
        Ok(Arc::new(PostgresSource::new(pool, connection)))
    }
}

async fn sync(once: bool, interval: u64) -> anyhow::Result<ExitCode> {
    let pool = match connect().await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!(error = %e, "cannot reach catalog store");
            return Ok(ExitCode::from(3));
        }
    };
    let store = Arc::new(PostgresCatalog::new(pool.clone()));
    let executor = Arc::new(PostgresExecutor::new(pool.clone())) as Arc<dyn SqlExecutor>;
    let target = new_engine(WarehouseDialect::Postgres, executor);
    let alerts = Arc::new(PostgresAlertStore::new(pool)) as Arc<dyn AlertSink>;
    let supervisor = Supervisor::new(store, target, Arc::new(PostgresSourceFactory), Some(alerts));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            shutdown.cancel();
        }
    });

    let mut any_failure = false;
    loop {
        let summary = supervisor.run_once(&cancel).await?;
        any_failure |= !summary.succeeded();
        if once || cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(Duration::from_secs(interval)) => {}
        }
    }

    Ok(if any_failure {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

async fn build_warehouse(name: &str) -> anyhow::Result<ExitCode> {
    let pool = connect().await?;
    let executor = Arc::new(PostgresExecutor::new(pool.clone())) as Arc<dyn SqlExecutor>;
    let engine = new_engine(WarehouseDialect::Postgres, executor);
    let transforms = Arc::new(
        TransformationEngine::new(TransformationRegistry::builtin())
            .with_lineage(Arc::new(PostgresLineage::new(pool.clone()))),
    );
    let models = Arc::new(PostgresModelStore::new(pool.clone()));
    let process_log = Arc::new(PostgresProcessLog::new(pool));
    let builder = WarehouseBuilder::new(models, engine, transforms, process_log);
    let report = builder.build(name).await?;
    println!(
        "warehouse {} built: {} tables, {} rows",
        report.entity, report.tables_built, report.rows_processed
    );
    Ok(ExitCode::SUCCESS)
}

async fn build_vault(name: &str) -> anyhow::Result<ExitCode> {
    let pool = connect().await?;
    let executor = Arc::new(PostgresExecutor::new(pool.clone())) as Arc<dyn SqlExecutor>;
    let engine = new_engine(WarehouseDialect::Postgres, executor);
    let models = Arc::new(PostgresModelStore::new(pool.clone()));
    let process_log = Arc::new(PostgresProcessLog::new(pool));
    let builder = VaultBuilder::new(models, engine, process_log);
    let report = builder.build(name).await?;
    println!(
        "vault {} built: {} tables, {} rows",
        report.entity, report.tables_built, report.rows_processed
    );
    Ok(ExitCode::SUCCESS)
}

async fn reset_table(table: &str, engine: &str) -> anyhow::Result<ExitCode> {
    let Some((schema, table_name)) = table.split_once('.') else {
        eprintln!("expected schema.table, got {table}");
        return Ok(ExitCode::from(2));
    };
    let Ok(dialect) = engine.parse::<SourceDialect>() else {
        eprintln!("unknown source engine {engine}");
        return Ok(ExitCode::from(2));
    };

    let pool = connect().await?;
    let store = PostgresCatalog::new(pool.clone());
    let executor = Arc::new(PostgresExecutor::new(pool)) as Arc<dyn SqlExecutor>;
    let target = new_engine(WarehouseDialect::Postgres, executor);
    let maintenance = CatalogMaintenance::new(&store, target.as_ref());
    maintenance
        .reset_table(&TableKey::new(schema, table_name, dialect))
        .await?;
    println!("{table} reset to FULL_LOAD");
    Ok(ExitCode::SUCCESS)
}
