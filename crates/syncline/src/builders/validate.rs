use std::collections::HashSet;

use super::{
    model::{VaultModel, WarehouseModel},
    BuildError,
};

/// Structural checks on a warehouse model before any DDL runs.
pub fn validate_warehouse_model(model: &WarehouseModel) -> Result<(), BuildError> {
    if model.warehouse_name.trim().is_empty() {
        return Err(BuildError::InvalidModel("warehouse_name is empty".to_string()));
    }
    if model.target_schema.trim().is_empty() {
        return Err(BuildError::InvalidModel("target_schema is empty".to_string()));
    }
    if model.dimensions.is_empty() && model.facts.is_empty() {
        return Err(BuildError::InvalidModel(
            "model defines neither dimensions nor facts".to_string(),
        ));
    }

    let mut names: HashSet<&str> = HashSet::new();
    for dimension in &model.dimensions {
        if !names.insert(&dimension.dimension_name) {
            return Err(BuildError::InvalidModel(format!(
                "duplicate dimension name: {}",
                dimension.dimension_name
            )));
        }
        if dimension.business_keys.is_empty() {
            return Err(BuildError::InvalidModel(format!(
                "dimension {} has no business keys",
                dimension.dimension_name
            )));
        }
    }
    for fact in &model.facts {
        if !names.insert(&fact.fact_name) {
            return Err(BuildError::InvalidModel(format!(
                "duplicate fact name: {}",
                fact.fact_name
            )));
        }
    }
    Ok(())
}

/// Reference validation for a vault model. Valid configurations form a DAG
/// by construction order (hubs → links → satellites → PITs/bridges); any
/// reference to an entity outside that order is rejected before execution.
pub fn validate_vault_model(model: &VaultModel) -> Result<(), BuildError> {
    if model.vault_name.trim().is_empty() {
        return Err(BuildError::InvalidModel("vault_name is empty".to_string()));
    }
    if model.hubs.is_empty() {
        return Err(BuildError::InvalidModel("vault defines no hubs".to_string()));
    }

    let hub_names: HashSet<&str> = model.hubs.iter().map(|h| h.hub_name.as_str()).collect();
    if hub_names.len() != model.hubs.len() {
        return Err(BuildError::InvalidModel("duplicate hub names".to_string()));
    }
    let link_names: HashSet<&str> = model.links.iter().map(|l| l.link_name.as_str()).collect();
    let satellite_names: HashSet<&str> = model
        .satellites
        .iter()
        .map(|s| s.satellite_name.as_str())
        .collect();

    for hub in &model.hubs {
        if hub.business_keys.is_empty() {
            return Err(BuildError::InvalidModel(format!(
                "hub {} has no business keys",
                hub.hub_name
            )));
        }
    }

    for link in &model.links {
        if link.hub_references.len() < 2 {
            return Err(BuildError::InvalidModel(format!(
                "link {} must reference at least two hubs",
                link.link_name
            )));
        }
        for reference in &link.hub_references {
            if !hub_names.contains(reference.as_str()) {
                return Err(BuildError::InvalidModel(format!(
                    "link {} references unknown hub {reference}",
                    link.link_name
                )));
            }
        }
    }

    for satellite in &model.satellites {
        match (&satellite.parent_hub, &satellite.parent_link) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(BuildError::InvalidModel(format!(
                    "satellite {} must reference exactly one of hub or link",
                    satellite.satellite_name
                )));
            }
            (Some(hub), None) if !hub_names.contains(hub.as_str()) => {
                return Err(BuildError::InvalidModel(format!(
                    "satellite {} references unknown hub {hub}",
                    satellite.satellite_name
                )));
            }
            (None, Some(link)) if !link_names.contains(link.as_str()) => {
                return Err(BuildError::InvalidModel(format!(
                    "satellite {} references unknown link {link}",
                    satellite.satellite_name
                )));
            }
            _ => {}
        }
    }

    for pit in &model.point_in_time_tables {
        if !hub_names.contains(pit.hub_name.as_str()) {
            return Err(BuildError::InvalidModel(format!(
                "PIT {} references unknown hub {}",
                pit.pit_name, pit.hub_name
            )));
        }
        for satellite in &pit.satellite_names {
            if !satellite_names.contains(satellite.as_str()) {
                return Err(BuildError::InvalidModel(format!(
                    "PIT {} references unknown satellite {satellite}",
                    pit.pit_name
                )));
            }
        }
    }

    for bridge in &model.bridge_tables {
        if !hub_names.contains(bridge.hub_name.as_str()) {
            return Err(BuildError::InvalidModel(format!(
                "bridge {} references unknown hub {}",
                bridge.bridge_name, bridge.hub_name
            )));
        }
        for link in &bridge.link_names {
            if !link_names.contains(link.as_str()) {
                return Err(BuildError::InvalidModel(format!(
                    "bridge {} references unknown link {link}",
                    bridge.bridge_name
                )));
            }
        }
    }

    Ok(())
}
