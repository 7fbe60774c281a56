#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::pedantic
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::large_enum_variant,
    clippy::missing_errors_doc
)]
#![forbid(unsafe_code)]
mod config;
pub use config::{Config, DistributedConfig, MemoryConfig, CONFIG};
#[cfg(feature = "sqlx")]
pub use config::PostgresConfig;

pub mod alerting;
pub mod builders;
pub mod catalog;
pub mod digest;
pub mod join;
pub mod memory;
pub mod process_log;
pub mod replication;
pub mod row;
pub mod schema;
pub mod source;
pub mod transform;
pub mod warehouse;

#[cfg(feature = "sqlx")]
pub mod implementations;

pub use async_trait;
pub use row::{Row, Value};
#[cfg(feature = "sqlx")]
pub use sqlx;
pub use tokio;
pub use tokio_util::sync::CancellationToken;
pub use tracing;

#[cfg(test)]
pub(crate) mod tests;
