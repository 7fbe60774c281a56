//! Declarative build models: medallion warehouses (dimensions + facts with
//! SCD strategies) and Data Vaults (hubs, links, satellites, PITs,
//! bridges).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum DataLayer {
    Bronze,
    Silver,
    Gold,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaShape {
    StarSchema,
    SnowflakeSchema,
}

/// Slowly-changing-dimension strategy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
pub enum ScdType {
    #[serde(rename = "TYPE_1")]
    #[strum(serialize = "TYPE_1")]
    Type1,
    #[serde(rename = "TYPE_2")]
    #[strum(serialize = "TYPE_2")]
    Type2,
    #[serde(rename = "TYPE_3")]
    #[strum(serialize = "TYPE_3")]
    Type3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionTable {
    pub dimension_name: String,
    pub target_table: String,
    pub scd_type: ScdType,
    pub source_query: String,
    pub business_keys: Vec<String>,
    /// Descriptive attributes compared for change detection.
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default = "default_valid_from")]
    pub valid_from_column: String,
    #[serde(default = "default_valid_to")]
    pub valid_to_column: String,
    #[serde(default = "default_is_current")]
    pub is_current_column: String,
    #[serde(default)]
    pub index_columns: Vec<String>,
    #[serde(default)]
    pub partition_column: Option<String>,
}

fn default_valid_from() -> String {
    "valid_from".to_string()
}

fn default_valid_to() -> String {
    "valid_to".to_string()
}

fn default_is_current() -> String {
    "is_current".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactTable {
    pub fact_name: String,
    pub target_table: String,
    pub source_query: String,
    /// Columns resolved against the current rows of referenced dimensions.
    #[serde(default)]
    pub dimension_keys: Vec<String>,
    #[serde(default)]
    pub measures: Vec<String>,
    #[serde(default)]
    pub index_columns: Vec<String>,
    #[serde(default)]
    pub partition_column: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseModel {
    pub warehouse_name: String,
    #[serde(default)]
    pub description: String,
    pub schema_shape: SchemaShape,
    pub target_layer: DataLayer,
    pub target_schema: String,
    #[serde(default)]
    pub dimensions: Vec<DimensionTable>,
    #[serde(default)]
    pub facts: Vec<FactTable>,
    #[serde(default)]
    pub schedule_cron: Option<String>,
    pub active: bool,
    pub enabled: bool,
    #[serde(default)]
    pub last_build_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_build_status: Option<String>,
}

impl WarehouseModel {
    pub fn bronze_schema(&self) -> String {
        format!("{}_bronze", self.target_schema.to_lowercase())
    }

    pub fn silver_schema(&self) -> String {
        format!("{}_silver", self.target_schema.to_lowercase())
    }

    pub fn gold_schema(&self) -> String {
        self.target_schema.to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubTable {
    pub hub_name: String,
    pub target_table: String,
    pub source_query: String,
    pub business_keys: Vec<String>,
    #[serde(default = "default_hub_key")]
    pub hub_key_column: String,
    #[serde(default = "default_load_date")]
    pub load_date_column: String,
    #[serde(default = "default_record_source")]
    pub record_source_column: String,
    #[serde(default)]
    pub index_columns: Vec<String>,
}

fn default_hub_key() -> String {
    "hub_key".to_string()
}

fn default_load_date() -> String {
    "load_date".to_string()
}

fn default_record_source() -> String {
    "record_source".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkTable {
    pub link_name: String,
    pub target_table: String,
    pub source_query: String,
    /// Hub names this link relates; all must exist in the model.
    pub hub_references: Vec<String>,
    #[serde(default = "default_link_key")]
    pub link_key_column: String,
    #[serde(default = "default_load_date")]
    pub load_date_column: String,
    #[serde(default = "default_record_source")]
    pub record_source_column: String,
    #[serde(default)]
    pub index_columns: Vec<String>,
}

fn default_link_key() -> String {
    "link_key".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatelliteTable {
    pub satellite_name: String,
    pub target_table: String,
    pub source_query: String,
    /// Exactly one of these must be set.
    #[serde(default)]
    pub parent_hub: Option<String>,
    #[serde(default)]
    pub parent_link: Option<String>,
    #[serde(default = "default_parent_key")]
    pub parent_key_column: String,
    #[serde(default = "default_load_date")]
    pub load_date_column: String,
    #[serde(default = "default_record_source")]
    pub record_source_column: String,
    pub descriptive_attributes: Vec<String>,
    #[serde(default)]
    pub index_columns: Vec<String>,
    /// Historized satellites append a new version only when the
    /// descriptive attributes changed.
    #[serde(default = "default_true")]
    pub is_historized: bool,
}

fn default_parent_key() -> String {
    "parent_key".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointInTimeTable {
    pub pit_name: String,
    pub target_table: String,
    pub hub_name: String,
    pub satellite_names: Vec<String>,
    #[serde(default = "default_snapshot_date")]
    pub snapshot_date_column: String,
    #[serde(default)]
    pub index_columns: Vec<String>,
}

fn default_snapshot_date() -> String {
    "snapshot_date".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeTable {
    pub bridge_name: String,
    pub target_table: String,
    pub hub_name: String,
    pub link_names: Vec<String>,
    #[serde(default = "default_snapshot_date")]
    pub snapshot_date_column: String,
    #[serde(default)]
    pub index_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultModel {
    pub vault_name: String,
    #[serde(default)]
    pub description: String,
    pub target_schema: String,
    /// Stamped into every record_source column.
    #[serde(default)]
    pub record_source: String,
    #[serde(default)]
    pub hubs: Vec<HubTable>,
    #[serde(default)]
    pub links: Vec<LinkTable>,
    #[serde(default)]
    pub satellites: Vec<SatelliteTable>,
    #[serde(default)]
    pub point_in_time_tables: Vec<PointInTimeTable>,
    #[serde(default)]
    pub bridge_tables: Vec<BridgeTable>,
    #[serde(default)]
    pub schedule_cron: Option<String>,
    pub active: bool,
    pub enabled: bool,
    #[serde(default)]
    pub last_build_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_build_status: Option<String>,
}

impl VaultModel {
    pub fn hub(&self, name: &str) -> Option<&HubTable> {
        self.hubs.iter().find(|h| h.hub_name == name)
    }

    pub fn link(&self, name: &str) -> Option<&LinkTable> {
        self.links.iter().find(|l| l.link_name == name)
    }

    pub fn satellite(&self, name: &str) -> Option<&SatelliteTable> {
        self.satellites.iter().find(|s| s.satellite_name == name)
    }
}
