//! Warehouse and Data Vault builders: a second pass that treats replicated
//! tables as sources and materializes dimensional or vault models.

pub mod model;
mod repository;
mod scd;
mod validate;
mod vault;
mod warehouse;

pub use model::{VaultModel, WarehouseModel};
pub use repository::{MemoryModelStore, ModelStore};
pub use scd::{scd1_plan, scd2_plan, scd3_plan, Scd1Plan, Scd2Plan, Scd3Plan};
pub use validate::{validate_vault_model, validate_warehouse_model};
pub use vault::VaultBuilder;
pub use warehouse::{BuildReport, WarehouseBuilder};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("model store error: {0}")]
    Store(String),
    #[error("target engine error: {0}")]
    Engine(#[from] crate::warehouse::EngineError),
    #[error("transformation error: {0}")]
    Transform(#[from] crate::transform::TransformError),
    #[error("process log error: {0}")]
    ProcessLog(#[from] crate::process_log::ProcessLogError),
}
