use std::{fmt::Debug, sync::Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{model::VaultModel, model::WarehouseModel, BuildError};

/// Registry of declarative build models.
#[async_trait]
pub trait ModelStore: Send + Sync + Debug {
    async fn list_active_warehouses(&self) -> Result<Vec<WarehouseModel>, BuildError>;
    async fn get_warehouse(&self, name: &str) -> Result<Option<WarehouseModel>, BuildError>;
    async fn upsert_warehouse(&self, model: WarehouseModel) -> Result<(), BuildError>;
    async fn set_warehouse_active(&self, name: &str, active: bool) -> Result<(), BuildError>;
    async fn update_warehouse_build_status(
        &self,
        name: &str,
        status: &str,
        build_time: DateTime<Utc>,
    ) -> Result<(), BuildError>;

    async fn list_active_vaults(&self) -> Result<Vec<VaultModel>, BuildError>;
    async fn get_vault(&self, name: &str) -> Result<Option<VaultModel>, BuildError>;
    async fn upsert_vault(&self, model: VaultModel) -> Result<(), BuildError>;
    async fn set_vault_active(&self, name: &str, active: bool) -> Result<(), BuildError>;
    async fn update_vault_build_status(
        &self,
        name: &str,
        status: &str,
        build_time: DateTime<Utc>,
    ) -> Result<(), BuildError>;
}

/// In-memory model registry.
#[derive(Debug, Default)]
pub struct MemoryModelStore {
    inner: Mutex<(Vec<WarehouseModel>, Vec<VaultModel>)>,
}

impl MemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> BuildError {
    BuildError::Store("model store mutex poisoned".to_string())
}

#[async_trait]
impl ModelStore for MemoryModelStore {
    async fn list_active_warehouses(&self) -> Result<Vec<WarehouseModel>, BuildError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| poisoned())?
            .0
            .iter()
            .filter(|m| m.active && m.enabled)
            .cloned()
            .collect())
    }

    async fn get_warehouse(&self, name: &str) -> Result<Option<WarehouseModel>, BuildError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| poisoned())?
            .0
            .iter()
            .find(|m| m.warehouse_name == name)
            .cloned())
    }

    async fn upsert_warehouse(&self, model: WarehouseModel) -> Result<(), BuildError> {
        let mut guard = self.inner.lock().map_err(|_| poisoned())?;
        match guard
            .0
            .iter_mut()
            .find(|m| m.warehouse_name == model.warehouse_name)
        {
            Some(existing) => *existing = model,
            None => guard.0.push(model),
        }
        Ok(())
    }

    async fn set_warehouse_active(&self, name: &str, active: bool) -> Result<(), BuildError> {
        let mut guard = self.inner.lock().map_err(|_| poisoned())?;
        let model = guard
            .0
            .iter_mut()
            .find(|m| m.warehouse_name == name)
            .ok_or_else(|| BuildError::UnknownModel(name.to_string()))?;
        model.active = active;
        Ok(())
    }

    async fn update_warehouse_build_status(
        &self,
        name: &str,
        status: &str,
        build_time: DateTime<Utc>,
    ) -> Result<(), BuildError> {
        let mut guard = self.inner.lock().map_err(|_| poisoned())?;
        let model = guard
            .0
            .iter_mut()
            .find(|m| m.warehouse_name == name)
            .ok_or_else(|| BuildError::UnknownModel(name.to_string()))?;
        model.last_build_status = Some(status.to_string());
        model.last_build_time = Some(build_time);
        Ok(())
    }

    async fn list_active_vaults(&self) -> Result<Vec<VaultModel>, BuildError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| poisoned())?
            .1
            .iter()
            .filter(|m| m.active && m.enabled)
            .cloned()
            .collect())
    }

    async fn get_vault(&self, name: &str) -> Result<Option<VaultModel>, BuildError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| poisoned())?
            .1
            .iter()
            .find(|m| m.vault_name == name)
            .cloned())
    }

    async fn upsert_vault(&self, model: VaultModel) -> Result<(), BuildError> {
        let mut guard = self.inner.lock().map_err(|_| poisoned())?;
        match guard.1.iter_mut().find(|m| m.vault_name == model.vault_name) {
            Some(existing) => *existing = model,
            None => guard.1.push(model),
        }
        Ok(())
    }

    async fn set_vault_active(&self, name: &str, active: bool) -> Result<(), BuildError> {
        let mut guard = self.inner.lock().map_err(|_| poisoned())?;
        let model = guard
            .1
            .iter_mut()
            .find(|m| m.vault_name == name)
            .ok_or_else(|| BuildError::UnknownModel(name.to_string()))?;
        model.active = active;
        Ok(())
    }

    async fn update_vault_build_status(
        &self,
        name: &str,
        status: &str,
        build_time: DateTime<Utc>,
    ) -> Result<(), BuildError> {
        let mut guard = self.inner.lock().map_err(|_| poisoned())?;
        let model = guard
            .1
            .iter_mut()
            .find(|m| m.vault_name == name)
            .ok_or_else(|| BuildError::UnknownModel(name.to_string()))?;
        model.last_build_status = Some(status.to_string());
        model.last_build_time = Some(build_time);
        Ok(())
    }
}
