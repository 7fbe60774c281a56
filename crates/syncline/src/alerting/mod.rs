//! Alerting: append-only alerts with separately recorded status
//! transitions, rule-driven governance checks and webhook fan-out.

mod checks;
mod webhook;

use std::{fmt::Debug, sync::Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use checks::{run_governance_checks, GovernanceSnapshot, TableGovernance};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
pub use webhook::{
    EventType, LogEvent, MemoryWebhookStore, WebhookConfig, WebhookDispatcher, WebhookEvent,
    WebhookStore, WebhookType,
};

use crate::row::Value;

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("alert not found: {0}")]
    NotFound(Uuid),
    #[error("alert store error: {0}")]
    Store(String),
    #[error("webhook delivery failed: {0}")]
    Delivery(String),
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
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
pub enum AlertStatus {
    Open,
    Acknowledged,
    Resolved,
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
pub enum AlertType {
    DataQuality,
    PiiProtection,
    AccessAnomaly,
    RetentionExpired,
    SchemaChange,
    Freshness,
    Fragmentation,
    Compliance,
    Replication,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    pub status: AlertStatus,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            alert_type,
            severity,
            title: title.into(),
            message: message.into(),
            schema: None,
            table: None,
            column: None,
            source: None,
            status: AlertStatus::Open,
            assigned_to: None,
            resolved_at: None,
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn scoped(mut self, schema: impl Into<String>, table: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self.table = Some(table.into());
        self
    }
}

/// Recorded whenever an alert changes status; the alert row itself is
/// append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertTransition {
    pub alert_id: Uuid,
    pub from: AlertStatus,
    pub to: AlertStatus,
    pub changed_by: Option<String>,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: Uuid,
    pub name: String,
    pub rule_type: AlertType,
    pub severity: AlertSeverity,
    /// Boolean condition of the form `<metric> <op> <value>`; empty falls
    /// back to the rule type's default predicate over `threshold`.
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub threshold: f64,
    pub enabled: bool,
    #[serde(default)]
    pub channels: Vec<String>,
}

/// Where workers and checks deliver alerts.
#[async_trait]
pub trait AlertSink: Send + Sync + Debug {
    async fn raise(&self, alert: Alert) -> Result<(), AlertError>;
}

/// Persistent alert store: append-only rows plus a transition log.
#[async_trait]
pub trait AlertStore: AlertSink {
    async fn list_open(&self) -> Result<Vec<Alert>, AlertError>;
    async fn transition(
        &self,
        alert_id: Uuid,
        to: AlertStatus,
        changed_by: Option<String>,
    ) -> Result<(), AlertError>;
    async fn transitions(&self, alert_id: Uuid) -> Result<Vec<AlertTransition>, AlertError>;
}

/// In-memory alert store for tests and the embedded mode.
#[derive(Debug, Default)]
pub struct MemoryAlertStore {
    inner: Mutex<(Vec<Alert>, Vec<AlertTransition>)>,
}

impl MemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.inner.lock().map(|g| g.0.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertStore {
    async fn raise(&self, alert: Alert) -> Result<(), AlertError> {
        self.inner
            .lock()
            .map_err(|_| AlertError::Store("alert mutex poisoned".to_string()))?
            .0
            .push(alert);
        Ok(())
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn list_open(&self) -> Result<Vec<Alert>, AlertError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| AlertError::Store("alert mutex poisoned".to_string()))?
            .0
            .iter()
            .filter(|a| a.status == AlertStatus::Open)
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        alert_id: Uuid,
        to: AlertStatus,
        changed_by: Option<String>,
    ) -> Result<(), AlertError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| AlertError::Store("alert mutex poisoned".to_string()))?;
        let (alerts, transitions) = &mut *guard;
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or(AlertError::NotFound(alert_id))?;
        let from = alert.status;
        alert.status = to;
        alert.updated_at = Utc::now();
        if to == AlertStatus::Resolved {
            alert.resolved_at = Some(alert.updated_at);
        }
        transitions.push(AlertTransition {
            alert_id,
            from,
            to,
            changed_by,
            changed_at: alert.updated_at,
        });
        Ok(())
    }

    async fn transitions(&self, alert_id: Uuid) -> Result<Vec<AlertTransition>, AlertError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| AlertError::Store("alert mutex poisoned".to_string()))?
            .1
            .iter()
            .filter(|t| t.alert_id == alert_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_are_recorded_separately() {
        let store = MemoryAlertStore::new();
        let alert = Alert::new(
            AlertType::Replication,
            AlertSeverity::Critical,
            "sync failed",
            "boom",
        );
        let id = alert.id;
        store.raise(alert).await.unwrap();
        store
            .transition(id, AlertStatus::Acknowledged, Some("oncall".to_string()))
            .await
            .unwrap();
        store.transition(id, AlertStatus::Resolved, None).await.unwrap();

        let transitions = store.transitions(id).await.unwrap();
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].from, AlertStatus::Open);
        assert_eq!(transitions[1].to, AlertStatus::Resolved);
        assert!(store.list_open().await.unwrap().is_empty());

        let resolved = &store.alerts()[0];
        assert!(resolved.resolved_at.is_some());
    }
}
