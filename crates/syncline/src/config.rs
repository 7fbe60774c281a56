use std::{path::PathBuf, sync::LazyLock, time::Duration};

use serde::{Deserialize, Serialize};

/// Process-wide configuration, resolved once from `SYNCLINE__`-prefixed
/// environment variables merged over serialized defaults.
pub static CONFIG: LazyLock<Config> = LazyLock::new(get_config);

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Rows fetched from a source (and written to the target) per batch.
    pub chunk_size: usize,
    /// Number of replication workers draining the per-table job queue.
    pub worker_pool_size: usize,
    /// Capacity of the bounded job queue between supervisor and workers.
    pub job_queue_depth: usize,
    /// Statement timeout applied to catalog-store sessions, seconds.
    pub statement_timeout_secs: u64,
    /// Lock timeout applied to catalog-store sessions, seconds.
    pub lock_timeout_secs: u64,
    /// Schema on the source side that carries the change-log table.
    pub source_metadata_schema: String,
    /// Webhook delivery timeout, seconds.
    pub webhook_timeout_secs: u64,
    pub memory: MemoryConfig,
    pub distributed: DistributedConfig,
    #[cfg(feature = "sqlx")]
    pub postgres: PostgresConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// Upper bound for tracked allocations in bytes. 0 disables the limit.
    pub max_bytes: u64,
    pub warning_threshold_pct: u8,
    pub critical_threshold_pct: u8,
    pub enable_spill: bool,
    pub spill_directory: PathBuf,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DistributedConfig {
    /// Delegate a pipeline to the distributed backend above this many steps.
    pub pipeline_step_threshold: usize,
    /// Broadcast the smaller join side below this size.
    pub broadcast_threshold_mb: u64,
}

#[cfg(feature = "sqlx")]
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub pool_size: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            worker_pool_size: 4,
            job_queue_depth: 64,
            statement_timeout_secs: 30,
            lock_timeout_secs: 10,
            source_metadata_schema: "syncline_metadata".to_string(),
            webhook_timeout_secs: 10,
            memory: MemoryConfig::default(),
            distributed: DistributedConfig::default(),
            #[cfg(feature = "sqlx")]
            postgres: PostgresConfig::default(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_bytes: 2 * 1024 * 1024 * 1024,
            warning_threshold_pct: 75,
            critical_threshold_pct: 90,
            enable_spill: true,
            spill_directory: std::env::temp_dir().join("syncline-spill"),
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            pipeline_step_threshold: 5,
            broadcast_threshold_mb: 10,
        }
    }
}

#[cfg(feature = "sqlx")]
impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "syncline".to_string(),
            password: String::new(),
            database: "syncline".to_string(),
            pool_size: 8,
            acquire_timeout_secs: 5,
        }
    }
}

impl Config {
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

fn get_config() -> Config {
    let defaults = figment::providers::Serialized::defaults(Config::default());

    #[cfg(not(test))]
    let prefix = "SYNCLINE__";
    #[cfg(test)]
    let prefix = "SYNCLINE_TEST__";

    let env = figment::providers::Env::prefixed(prefix).split("__");
    match figment::Figment::from(defaults).merge(env).extract() {
        Ok(c) => c,
        Err(e) => panic!("Failed to extract syncline config: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = get_config();
            assert_eq!(config.chunk_size, 10_000);
            assert_eq!(config.memory.warning_threshold_pct, 75);
            assert_eq!(config.memory.critical_threshold_pct, 90);
            Ok(())
        });
    }

    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SYNCLINE_TEST__CHUNK_SIZE", "500");
            jail.set_env("SYNCLINE_TEST__MEMORY__ENABLE_SPILL", "false");
            let config = get_config();
            assert_eq!(config.chunk_size, 500);
            assert!(!config.memory.enable_spill);
            Ok(())
        });
    }
}
