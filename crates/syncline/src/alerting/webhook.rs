//! Webhook fan-out: subscribers filtered by level and category, channel
//! adapters for Slack / Teams / Telegram / plain HTTP, best-effort delivery
//! with a fixed per-call timeout and no retry queue.

use std::{fmt::Debug, sync::Mutex, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use super::{Alert, AlertError, AlertSeverity};
use crate::row::Value;

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
pub enum WebhookType {
    Http,
    Slack,
    Teams,
    Telegram,
    Email,
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
pub enum EventType {
    SyncStarted,
    SyncCompleted,
    SyncError,
    AlertCreated,
    AlertResolved,
    DataQualityIssue,
    SchemaChange,
    PerformanceDegraded,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub id: Uuid,
    pub name: String,
    pub webhook_type: WebhookType,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Severities this subscriber wants; empty means all.
    #[serde(default)]
    pub log_levels: Vec<String>,
    /// Event categories this subscriber wants; empty means all.
    #[serde(default)]
    pub log_categories: Vec<String>,
    pub enabled: bool,
}

/// Subscriber registry with the CRUD surface the governance layer exposes.
#[async_trait]
pub trait WebhookStore: Send + Sync + Debug {
    async fn create(&self, config: WebhookConfig) -> Result<Uuid, AlertError>;
    async fn update(&self, config: WebhookConfig) -> Result<(), AlertError>;
    async fn delete(&self, id: Uuid) -> Result<(), AlertError>;
    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), AlertError>;
    async fn list_all(&self) -> Result<Vec<WebhookConfig>, AlertError>;
    async fn list_enabled(&self) -> Result<Vec<WebhookConfig>, AlertError>;
}

/// In-memory webhook registry.
#[derive(Debug, Default)]
pub struct MemoryWebhookStore {
    inner: Mutex<Vec<WebhookConfig>>,
}

impl MemoryWebhookStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookStore for MemoryWebhookStore {
    async fn create(&self, config: WebhookConfig) -> Result<Uuid, AlertError> {
        let id = config.id;
        self.inner
            .lock()
            .map_err(|_| AlertError::Store("webhook mutex poisoned".to_string()))?
            .push(config);
        Ok(id)
    }

    async fn update(&self, config: WebhookConfig) -> Result<(), AlertError> {
        let mut hooks = self
            .inner
            .lock()
            .map_err(|_| AlertError::Store("webhook mutex poisoned".to_string()))?;
        match hooks.iter_mut().find(|w| w.id == config.id) {
            Some(existing) => {
                *existing = config;
                Ok(())
            }
            None => Err(AlertError::NotFound(config.id)),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<(), AlertError> {
        self.inner
            .lock()
            .map_err(|_| AlertError::Store("webhook mutex poisoned".to_string()))?
            .retain(|w| w.id != id);
        Ok(())
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), AlertError> {
        let mut hooks = self
            .inner
            .lock()
            .map_err(|_| AlertError::Store("webhook mutex poisoned".to_string()))?;
        match hooks.iter_mut().find(|w| w.id == id) {
            Some(hook) => {
                hook.enabled = enabled;
                Ok(())
            }
            None => Err(AlertError::NotFound(id)),
        }
    }

    async fn list_all(&self) -> Result<Vec<WebhookConfig>, AlertError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| AlertError::Store("webhook mutex poisoned".to_string()))?
            .clone())
    }

    async fn list_enabled(&self) -> Result<Vec<WebhookConfig>, AlertError> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| AlertError::Store("webhook mutex poisoned".to_string()))?
            .iter()
            .filter(|w| w.enabled)
            .cloned()
            .collect())
    }
}

/// A structured log event forwarded to subscribers by the log monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: chrono::DateTime<Utc>,
    /// INFO / WARNING / ERROR, matched against subscriber log_levels.
    pub level: String,
    /// TRANSFER / GOVERNANCE / SYSTEM, matched against log_categories.
    pub category: String,
    pub scope: String,
    pub message: String,
}

impl LogEvent {
    fn severity(&self) -> AlertSeverity {
        match self.level.to_uppercase().as_str() {
            "ERROR" | "CRITICAL" => AlertSeverity::Critical,
            "WARN" | "WARNING" => AlertSeverity::Warning,
            _ => AlertSeverity::Info,
        }
    }
}

/// One event flowing out to subscribers.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub event_type: EventType,
    pub title: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub category: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub db_engine: Option<String>,
    pub status: Option<String>,
    pub error_message: Option<String>,
}

impl WebhookEvent {
    pub fn sync_event(
        event_type: EventType,
        schema: impl Into<String>,
        table: impl Into<String>,
        db_engine: impl Into<String>,
        status: impl Into<String>,
        error_message: Option<String>,
    ) -> Self {
        let schema = schema.into();
        let table = table.into();
        Self {
            event_type,
            title: format!("Sync {}.{table}", schema),
            message: format!("Replication event for {schema}.{table}"),
            severity: if error_message.is_some() {
                AlertSeverity::Critical
            } else {
                AlertSeverity::Info
            },
            category: Some("TRANSFER".to_string()),
            schema: Some(schema),
            table: Some(table),
            db_engine: Some(db_engine.into()),
            status: Some(status.into()),
            error_message,
        }
    }

    pub fn from_alert(alert: &Alert) -> Self {
        Self {
            event_type: EventType::AlertCreated,
            title: alert.title.clone(),
            message: alert.message.clone(),
            severity: alert.severity,
            category: Some(alert.alert_type.to_string()),
            schema: alert.schema.clone(),
            table: alert.table.clone(),
            db_engine: None,
            status: Some(alert.status.to_string()),
            error_message: None,
        }
    }

    /// The dialect-neutral JSON envelope delivered to plain HTTP endpoints
    /// and reshaped by the channel adapters.
    pub fn envelope(&self) -> Value {
        let mut payload = json!({
            "event_type": self.event_type.to_string(),
            "title": self.title,
            "message": self.message,
            "severity": self.severity.to_string(),
            "timestamp": Utc::now().timestamp(),
        });
        let object = payload.as_object_mut().expect("envelope is an object");
        if let Some(schema) = &self.schema {
            object.insert("schema_name".to_string(), json!(schema));
        }
        if let Some(table) = &self.table {
            object.insert("table_name".to_string(), json!(table));
        }
        if let Some(engine) = &self.db_engine {
            object.insert("db_engine".to_string(), json!(engine));
        }
        if let Some(status) = &self.status {
            object.insert("status".to_string(), json!(status));
        }
        if let Some(error) = &self.error_message {
            object.insert("error_message".to_string(), json!(error));
        }
        payload
    }
}

/// Fan-out dispatcher. Delivery is lossy by contract: failures are logged
/// and counted, never queued.
#[derive(Debug)]
pub struct WebhookDispatcher<S> {
    store: S,
    client: reqwest::Client,
}

impl<S: WebhookStore> WebhookDispatcher<S> {
    pub fn new(store: S, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { store, client }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Forward a structured log event to matching subscribers. Feeds the
    /// same fan-out path as governance events; the monitor tailing the
    /// process log calls this per entry.
    pub async fn forward_log_event(&self, log: &LogEvent) -> Result<usize, AlertError> {
        let event = WebhookEvent {
            event_type: EventType::Custom,
            title: format!("[{}] {}", log.level.to_uppercase(), log.scope),
            message: log.message.clone(),
            severity: log.severity(),
            category: Some(log.category.clone()),
            schema: None,
            table: None,
            db_engine: None,
            status: None,
            error_message: None,
        };
        self.dispatch(&event).await
    }

    /// Deliver the event to every enabled, matching subscriber. Returns how
    /// many deliveries succeeded.
    pub async fn dispatch(&self, event: &WebhookEvent) -> Result<usize, AlertError> {
        let mut delivered = 0;
        for hook in self.store.list_enabled().await? {
            if !subscriber_matches(&hook, event) {
                continue;
            }
            match self.deliver(&hook, event).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(webhook = %hook.name, error = %e, "webhook delivery failed"),
            }
        }
        Ok(delivered)
    }

    async fn deliver(&self, hook: &WebhookConfig, event: &WebhookEvent) -> Result<(), AlertError> {
        let (url, body) = match hook.webhook_type {
            WebhookType::Http => (required_url(hook)?, event.envelope()),
            WebhookType::Slack => (required_url(hook)?, slack_payload(event)),
            WebhookType::Teams => (required_url(hook)?, teams_payload(event)),
            WebhookType::Telegram => telegram_request(hook, event)?,
            WebhookType::Email => {
                // Mail relays receive the plain envelope over their HTTP
                // ingestion endpoint.
                (required_url(hook)?, event.envelope())
            }
        };

        let mut request = self.client.post(url).json(&body);
        if let Some(api_key) = &hook.api_key {
            request = request.header("Authorization", format!("Bearer {api_key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| AlertError::Delivery(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AlertError::Delivery(format!(
                "endpoint returned {}",
                response.status()
            )))
        }
    }
}

fn required_url(hook: &WebhookConfig) -> Result<String, AlertError> {
    let raw = hook
        .url
        .clone()
        .ok_or_else(|| AlertError::Delivery(format!("webhook {} has no url", hook.name)))?;
    url::Url::parse(&raw)
        .map_err(|e| AlertError::Delivery(format!("webhook {} url invalid: {e}", hook.name)))?;
    Ok(raw)
}

fn subscriber_matches(hook: &WebhookConfig, event: &WebhookEvent) -> bool {
    let level_ok = hook.log_levels.is_empty()
        || hook
            .log_levels
            .iter()
            .any(|l| l.eq_ignore_ascii_case(&event.severity.to_string()));
    let category_ok = hook.log_categories.is_empty()
        || event.category.as_ref().is_some_and(|c| {
            hook.log_categories.iter().any(|h| h.eq_ignore_ascii_case(c))
        });
    level_ok && category_ok
}

fn severity_color(severity: AlertSeverity) -> (&'static str, &'static str) {
    match severity {
        AlertSeverity::Critical => ("danger", "FF0000"),
        AlertSeverity::Warning => ("warning", "FFA500"),
        AlertSeverity::Info => ("good", "00FF00"),
    }
}

fn slack_payload(event: &WebhookEvent) -> Value {
    let (color, _) = severity_color(event.severity);
    let mut fields = vec![json!({"title": "Message", "value": event.message, "short": false})];
    if let Some(category) = &event.category {
        fields.push(json!({"title": "Category", "value": category, "short": true}));
    }
    fields.push(json!({
        "title": "Severity",
        "value": event.severity.to_string(),
        "short": true
    }));
    json!({
        "text": event.title,
        "attachments": [{ "color": color, "fields": fields }]
    })
}

fn teams_payload(event: &WebhookEvent) -> Value {
    let (_, theme) = severity_color(event.severity);
    let mut facts = vec![json!({"name": "Severity", "value": event.severity.to_string()})];
    if let Some(category) = &event.category {
        facts.push(json!({"name": "Category", "value": category}));
    }
    json!({
        "@type": "MessageCard",
        "@context": "https://schema.org/extensions",
        "summary": event.title,
        "themeColor": theme,
        "sections": [{
            "activityTitle": event.title,
            "text": event.message,
            "facts": facts
        }]
    })
}

fn telegram_request(
    hook: &WebhookConfig,
    event: &WebhookEvent,
) -> Result<(String, Value), AlertError> {
    let bot_token = hook
        .bot_token
        .as_ref()
        .ok_or_else(|| AlertError::Delivery("telegram webhook missing bot_token".to_string()))?;
    let chat_id = hook
        .chat_id
        .as_ref()
        .ok_or_else(|| AlertError::Delivery("telegram webhook missing chat_id".to_string()))?;

    let emoji = match event.severity {
        AlertSeverity::Critical => "\u{274c}",
        AlertSeverity::Warning => "\u{26a0}\u{fe0f}",
        AlertSeverity::Info => "\u{2139}\u{fe0f}",
    };
    let text = format!("{emoji} *{}*\n\n{}", event.title, event.message);
    Ok((
        format!("https://api.telegram.org/bot{bot_token}/sendMessage"),
        json!({ "chat_id": chat_id, "text": text, "parse_mode": "Markdown" }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(webhook_type: WebhookType) -> WebhookConfig {
        WebhookConfig {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            webhook_type,
            url: Some("https://example.invalid/hook".to_string()),
            api_key: None,
            bot_token: Some("token".to_string()),
            chat_id: Some("42".to_string()),
            email: None,
            log_levels: Vec::new(),
            log_categories: Vec::new(),
            enabled: true,
        }
    }

    fn event(severity: AlertSeverity) -> WebhookEvent {
        WebhookEvent {
            event_type: EventType::SyncError,
            title: "Sync sales.orders".to_string(),
            message: "connection refused".to_string(),
            severity,
            category: Some("TRANSFER".to_string()),
            schema: Some("sales".to_string()),
            table: Some("orders".to_string()),
            db_engine: Some("DB2".to_string()),
            status: Some("FAILED".to_string()),
            error_message: Some("connection refused".to_string()),
        }
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = event(AlertSeverity::Critical).envelope();
        assert_eq!(envelope["event_type"], "SYNC_ERROR");
        assert_eq!(envelope["schema_name"], "sales");
        assert_eq!(envelope["table_name"], "orders");
        assert_eq!(envelope["db_engine"], "DB2");
        assert_eq!(envelope["severity"], "CRITICAL");
        assert!(envelope["timestamp"].is_number());
    }

    #[test]
    fn test_slack_payload_colors_by_severity() {
        let payload = slack_payload(&event(AlertSeverity::Critical));
        assert_eq!(payload["attachments"][0]["color"], "danger");
        let payload = slack_payload(&event(AlertSeverity::Info));
        assert_eq!(payload["attachments"][0]["color"], "good");
    }

    #[test]
    fn test_teams_payload_is_a_message_card() {
        let payload = teams_payload(&event(AlertSeverity::Warning));
        assert_eq!(payload["@type"], "MessageCard");
        assert_eq!(payload["themeColor"], "FFA500");
        assert_eq!(payload["sections"][0]["text"], "connection refused");
    }

    #[test]
    fn test_telegram_request_targets_bot_api() {
        let (url, body) = telegram_request(&hook(WebhookType::Telegram), &event(AlertSeverity::Info))
            .unwrap();
        assert_eq!(url, "https://api.telegram.org/bottoken/sendMessage");
        assert_eq!(body["chat_id"], "42");
        assert_eq!(body["parse_mode"], "Markdown");
    }

    #[test]
    fn test_log_event_severity_mapping() {
        let log = LogEvent {
            timestamp: Utc::now(),
            level: "error".to_string(),
            category: "TRANSFER".to_string(),
            scope: "sync".to_string(),
            message: "boom".to_string(),
        };
        assert_eq!(log.severity(), AlertSeverity::Critical);
        let info = LogEvent {
            level: "debug".to_string(),
            ..log
        };
        assert_eq!(info.severity(), AlertSeverity::Info);
    }

    #[test]
    fn test_subscriber_filtering() {
        let mut h = hook(WebhookType::Http);
        h.log_levels = vec!["CRITICAL".to_string()];
        assert!(subscriber_matches(&h, &event(AlertSeverity::Critical)));
        assert!(!subscriber_matches(&h, &event(AlertSeverity::Info)));

        let mut h = hook(WebhookType::Http);
        h.log_categories = vec!["GOVERNANCE".to_string()];
        assert!(!subscriber_matches(&h, &event(AlertSeverity::Info)));
    }

    #[tokio::test]
    async fn test_store_crud() {
        let store = MemoryWebhookStore::new();
        let mut config = hook(WebhookType::Http);
        let id = store.create(config.clone()).await.unwrap();
        assert_eq!(store.list_enabled().await.unwrap().len(), 1);

        store.set_enabled(id, false).await.unwrap();
        assert!(store.list_enabled().await.unwrap().is_empty());

        config.name = "renamed".to_string();
        config.enabled = false;
        store.update(config).await.unwrap();
        assert_eq!(store.list_all().await.unwrap()[0].name, "renamed");

        store.delete(id).await.unwrap();
        assert!(store.list_all().await.unwrap().is_empty());
    }
}
