//! Postgres-backed implementations: the metadata catalog store, the target
//! SQL executor, a postgres source adapter and the governance stores.

mod catalog;
mod executor;
mod source;
mod stores;

pub use catalog::PostgresCatalog;
pub use executor::{decode_pg_row, PostgresExecutor};
pub use source::PostgresSource;
use sqlx::{postgres::PgPoolOptions, PgPool};
pub use stores::{
    PostgresAlertStore, PostgresLineage, PostgresModelStore, PostgresProcessLog,
    PostgresWebhookStore,
};

use crate::CONFIG;

/// Connection options derived from config: pool sizing plus per-session
/// statement and lock timeouts.
pub fn pool_options() -> PgPoolOptions {
    let statement_timeout = CONFIG.statement_timeout().as_millis();
    let lock_timeout = CONFIG.lock_timeout().as_millis();
    PgPoolOptions::new()
        .max_connections(CONFIG.postgres.pool_size)
        .acquire_timeout(std::time::Duration::from_secs(
            CONFIG.postgres.acquire_timeout_secs,
        ))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                use sqlx::Executor;
                let session_setup = format!(
                    "SET statement_timeout = {statement_timeout}; SET lock_timeout = {lock_timeout}"
                );
                conn.execute(session_setup.as_str()).await?;
                Ok(())
            })
        })
}

pub fn connect_url() -> String {
    let pg = &CONFIG.postgres;
    format!(
        "postgres://{}:{}@{}:{}/{}",
        pg.user, pg.password, pg.host, pg.port, pg.database
    )
}

pub async fn get_pool() -> Result<PgPool, sqlx::Error> {
    pool_options().connect(&connect_url()).await
}

/// Apply the embedded migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
