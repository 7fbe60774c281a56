//! Postgres-backed governance stores: transformation lineage, the process
//! log, alerts with their transition log, webhook subscribers and the
//! model registry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row as SqlxRow};
use uuid::Uuid;

use crate::{
    alerting::{
        Alert, AlertError, AlertRule, AlertSink, AlertStatus, AlertStore, AlertTransition,
        WebhookConfig, WebhookStore,
    },
    builders::{BuildError, ModelStore, VaultModel, WarehouseModel},
    process_log::{ProcessLog, ProcessLogError, ProcessLogRecord, RunStatus},
    row::Value,
    transform::{LineageSink, TransformError, TransformationRecord},
};

/// Append-only lineage sink over `metadata.transformation_lineage`.
#[derive(Debug, Clone)]
pub struct PostgresLineage {
    pool: PgPool,
}

impl PostgresLineage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LineageSink for PostgresLineage {
    async fn record(&self, record: TransformationRecord) -> Result<(), TransformError> {
        sqlx::query(
            "INSERT INTO metadata.transformation_lineage \
             (transformation_id, transformation_type, config, workflow_name, task_name, \
              workflow_execution_id, task_execution_id, input_schemas, input_tables, \
              input_columns, output_schemas, output_tables, output_columns, executed_at, \
              rows_processed, duration_ms, success, error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)",
        )
        .bind(record.transformation_id)
        .bind(&record.transformation_type)
        .bind(&record.config)
        .bind(&record.workflow_name)
        .bind(&record.task_name)
        .bind(record.workflow_execution_id)
        .bind(record.task_execution_id)
        .bind(&record.input_schemas)
        .bind(&record.input_tables)
        .bind(&record.input_columns)
        .bind(&record.output_schemas)
        .bind(&record.output_tables)
        .bind(&record.output_columns)
        .bind(record.executed_at)
        .bind(record.rows_processed as i64)
        .bind(record.duration_ms as i64)
        .bind(record.success)
        .bind(&record.error)
        .execute(&self.pool)
        .await
        .map_err(|e| TransformError::execution("lineage", e.to_string()))?;
        Ok(())
    }
}

/// Process log over `metadata.process_log`.
#[derive(Debug, Clone)]
pub struct PostgresProcessLog {
    pool: PgPool,
}

impl PostgresProcessLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<ProcessLogRecord, ProcessLogError> {
        let status: String = row
            .try_get("status")
            .map_err(|e| ProcessLogError::Store(e.to_string()))?;
        let metadata: Value = row
            .try_get("metadata")
            .map_err(|e| ProcessLogError::Store(e.to_string()))?;
        Ok(ProcessLogRecord {
            run_id: row
                .try_get("run_id")
                .map_err(|e| ProcessLogError::Store(e.to_string()))?,
            entity: row
                .try_get("entity")
                .map_err(|e| ProcessLogError::Store(e.to_string()))?,
            status: status
                .parse()
                .map_err(|_| ProcessLogError::Store(format!("unknown status: {status}")))?,
            rows_processed: row
                .try_get("rows_processed")
                .map_err(|e| ProcessLogError::Store(e.to_string()))?,
            error: row
                .try_get("error")
                .map_err(|e| ProcessLogError::Store(e.to_string()))?,
            metadata: metadata.as_object().cloned().unwrap_or_default(),
            started_at: row
                .try_get::<DateTime<Utc>, _>("started_at")
                .map_err(|e| ProcessLogError::Store(e.to_string()))?,
            finished_at: row
                .try_get("finished_at")
                .map_err(|e| ProcessLogError::Store(e.to_string()))?,
        })
    }
}

#[async_trait]
impl ProcessLog for PostgresProcessLog {
    async fn start(&self, entity: &str) -> Result<Uuid, ProcessLogError> {
        let run_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO metadata.process_log (run_id, entity, status) VALUES ($1, $2, 'STARTED')",
        )
        .bind(run_id)
        .bind(entity)
        .execute(&self.pool)
        .await
        .map_err(|e| ProcessLogError::Store(e.to_string()))?;
        Ok(run_id)
    }

    async fn finish(
        &self,
        run_id: Uuid,
        status: RunStatus,
        rows_processed: i64,
        error: Option<String>,
    ) -> Result<(), ProcessLogError> {
        let result = sqlx::query(
            "UPDATE metadata.process_log \
             SET status = $1, rows_processed = $2, error = $3, finished_at = now() \
             WHERE run_id = $4",
        )
        .bind(status.to_string())
        .bind(rows_processed)
        .bind(&error)
        .bind(run_id)
        .execute(&self.pool)
        .await
        .map_err(|e| ProcessLogError::Store(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(ProcessLogError::NotFound(run_id));
        }
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<ProcessLogRecord>, ProcessLogError> {
        let rows = sqlx::query(
            "SELECT run_id, entity, status, rows_processed, error, metadata, started_at, \
             finished_at FROM metadata.process_log ORDER BY started_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ProcessLogError::Store(e.to_string()))?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn last_run(&self, entity: &str) -> Result<Option<ProcessLogRecord>, ProcessLogError> {
        let row = sqlx::query(
            "SELECT run_id, entity, status, rows_processed, error, metadata, started_at, \
             finished_at FROM metadata.process_log WHERE entity = $1 \
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(entity)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ProcessLogError::Store(e.to_string()))?;
        row.as_ref().map(Self::record_from_row).transpose()
    }
}

/// Model registry over `metadata.warehouse_models` / `metadata.vault_models`;
/// definitions round-trip as JSONB.
#[derive(Debug, Clone)]
pub struct PostgresModelStore {
    pool: PgPool,
}

impl PostgresModelStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, BuildError> {
        serde_json::from_value(value).map_err(|e| BuildError::Store(e.to_string()))
    }
}

#[async_trait]
impl ModelStore for PostgresModelStore {
    async fn list_active_warehouses(&self) -> Result<Vec<WarehouseModel>, BuildError> {
        let rows: Vec<Value> = sqlx::query_scalar(
            "SELECT definition FROM metadata.warehouse_models WHERE active AND enabled \
             ORDER BY warehouse_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BuildError::Store(e.to_string()))?;
        rows.into_iter().map(Self::decode).collect()
    }

    async fn get_warehouse(&self, name: &str) -> Result<Option<WarehouseModel>, BuildError> {
        let row: Option<Value> = sqlx::query_scalar(
            "SELECT definition FROM metadata.warehouse_models WHERE warehouse_name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BuildError::Store(e.to_string()))?;
        row.map(Self::decode).transpose()
    }

    async fn upsert_warehouse(&self, model: WarehouseModel) -> Result<(), BuildError> {
        let definition =
            serde_json::to_value(&model).map_err(|e| BuildError::Store(e.to_string()))?;
        sqlx::query(
            "INSERT INTO metadata.warehouse_models (warehouse_name, definition, active, enabled) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (warehouse_name) DO UPDATE SET \
               definition = EXCLUDED.definition, active = EXCLUDED.active, \
               enabled = EXCLUDED.enabled",
        )
        .bind(&model.warehouse_name)
        .bind(definition)
        .bind(model.active)
        .bind(model.enabled)
        .execute(&self.pool)
        .await
        .map_err(|e| BuildError::Store(e.to_string()))?;
        Ok(())
    }

    async fn set_warehouse_active(&self, name: &str, active: bool) -> Result<(), BuildError> {
        let result = sqlx::query(
            "UPDATE metadata.warehouse_models SET active = $1, \
             definition = jsonb_set(definition, '{active}', to_jsonb($1::BOOLEAN)) \
             WHERE warehouse_name = $2",
        )
        .bind(active)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| BuildError::Store(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(BuildError::UnknownModel(name.to_string()));
        }
        Ok(())
    }

    async fn update_warehouse_build_status(
        &self,
        name: &str,
        status: &str,
        build_time: DateTime<Utc>,
    ) -> Result<(), BuildError> {
        let result = sqlx::query(
            "UPDATE metadata.warehouse_models \
             SET last_build_status = $1, last_build_time = $2 WHERE warehouse_name = $3",
        )
        .bind(status)
        .bind(build_time)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| BuildError::Store(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(BuildError::UnknownModel(name.to_string()));
        }
        Ok(())
    }

    async fn list_active_vaults(&self) -> Result<Vec<VaultModel>, BuildError> {
        let rows: Vec<Value> = sqlx::query_scalar(
            "SELECT definition FROM metadata.vault_models WHERE active AND enabled \
             ORDER BY vault_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BuildError::Store(e.to_string()))?;
        rows.into_iter().map(Self::decode).collect()
    }

    async fn get_vault(&self, name: &str) -> Result<Option<VaultModel>, BuildError> {
        let row: Option<Value> = sqlx::query_scalar(
            "SELECT definition FROM metadata.vault_models WHERE vault_name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BuildError::Store(e.to_string()))?;
        row.map(Self::decode).transpose()
    }

    async fn upsert_vault(&self, model: VaultModel) -> Result<(), BuildError> {
        let definition =
            serde_json::to_value(&model).map_err(|e| BuildError::Store(e.to_string()))?;
        sqlx::query(
            "INSERT INTO metadata.vault_models (vault_name, definition, active, enabled) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (vault_name) DO UPDATE SET \
               definition = EXCLUDED.definition, active = EXCLUDED.active, \
               enabled = EXCLUDED.enabled",
        )
        .bind(&model.vault_name)
        .bind(definition)
        .bind(model.active)
        .bind(model.enabled)
        .execute(&self.pool)
        .await
        .map_err(|e| BuildError::Store(e.to_string()))?;
        Ok(())
    }

    async fn set_vault_active(&self, name: &str, active: bool) -> Result<(), BuildError> {
        let result = sqlx::query(
            "UPDATE metadata.vault_models SET active = $1, \
             definition = jsonb_set(definition, '{active}', to_jsonb($1::BOOLEAN)) \
             WHERE vault_name = $2",
        )
        .bind(active)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| BuildError::Store(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(BuildError::UnknownModel(name.to_string()));
        }
        Ok(())
    }

    async fn update_vault_build_status(
        &self,
        name: &str,
        status: &str,
        build_time: DateTime<Utc>,
    ) -> Result<(), BuildError> {
        let result = sqlx::query(
            "UPDATE metadata.vault_models \
             SET last_build_status = $1, last_build_time = $2 WHERE vault_name = $3",
        )
        .bind(status)
        .bind(build_time)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(|e| BuildError::Store(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(BuildError::UnknownModel(name.to_string()));
        }
        Ok(())
    }
}

/// Append-only alert store over `metadata.alerts`; status transitions land
/// in `metadata.alert_transitions`.
#[derive(Debug, Clone)]
pub struct PostgresAlertStore {
    pool: PgPool,
}

impl PostgresAlertStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list_rules(&self) -> Result<Vec<AlertRule>, AlertError> {
        let rows = sqlx::query(
            "SELECT id, name, rule_type, severity, condition, threshold, enabled, channels \
             FROM metadata.alert_rules ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AlertError::Store(e.to_string()))?;
        rows.iter()
            .map(|row| {
                let rule_type: String = row
                    .try_get("rule_type")
                    .map_err(|e| AlertError::Store(e.to_string()))?;
                let severity: String = row
                    .try_get("severity")
                    .map_err(|e| AlertError::Store(e.to_string()))?;
                Ok(AlertRule {
                    id: row.try_get("id").map_err(|e| AlertError::Store(e.to_string()))?,
                    name: row
                        .try_get("name")
                        .map_err(|e| AlertError::Store(e.to_string()))?,
                    rule_type: rule_type
                        .parse()
                        .map_err(|_| AlertError::Store(format!("unknown rule type {rule_type}")))?,
                    severity: severity
                        .parse()
                        .map_err(|_| AlertError::Store(format!("unknown severity {severity}")))?,
                    condition: row
                        .try_get("condition")
                        .map_err(|e| AlertError::Store(e.to_string()))?,
                    threshold: row
                        .try_get("threshold")
                        .map_err(|e| AlertError::Store(e.to_string()))?,
                    enabled: row
                        .try_get("enabled")
                        .map_err(|e| AlertError::Store(e.to_string()))?,
                    channels: row
                        .try_get("channels")
                        .map_err(|e| AlertError::Store(e.to_string()))?,
                })
            })
            .collect()
    }

    pub async fn upsert_rule(&self, rule: &AlertRule) -> Result<(), AlertError> {
        sqlx::query(
            "INSERT INTO metadata.alert_rules \
             (id, name, rule_type, severity, condition, threshold, enabled, channels) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (name) DO UPDATE SET \
               rule_type = EXCLUDED.rule_type, severity = EXCLUDED.severity, \
               condition = EXCLUDED.condition, threshold = EXCLUDED.threshold, \
               enabled = EXCLUDED.enabled, channels = EXCLUDED.channels",
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(rule.rule_type.to_string())
        .bind(rule.severity.to_string())
        .bind(&rule.condition)
        .bind(rule.threshold)
        .bind(rule.enabled)
        .bind(&rule.channels)
        .execute(&self.pool)
        .await
        .map_err(|e| AlertError::Store(e.to_string()))?;
        Ok(())
    }

    fn alert_from_row(row: &sqlx::postgres::PgRow) -> Result<Alert, AlertError> {
        let alert_type: String = row
            .try_get("alert_type")
            .map_err(|e| AlertError::Store(e.to_string()))?;
        let severity: String = row
            .try_get("severity")
            .map_err(|e| AlertError::Store(e.to_string()))?;
        let status: String = row
            .try_get("status")
            .map_err(|e| AlertError::Store(e.to_string()))?;
        let metadata: Value = row
            .try_get("metadata")
            .map_err(|e| AlertError::Store(e.to_string()))?;
        Ok(Alert {
            id: row.try_get("id").map_err(|e| AlertError::Store(e.to_string()))?,
            alert_type: alert_type
                .parse()
                .map_err(|_| AlertError::Store(format!("unknown alert type {alert_type}")))?,
            severity: severity
                .parse()
                .map_err(|_| AlertError::Store(format!("unknown severity {severity}")))?,
            title: row
                .try_get("title")
                .map_err(|e| AlertError::Store(e.to_string()))?,
            message: row
                .try_get("message")
                .map_err(|e| AlertError::Store(e.to_string()))?,
            schema: row
                .try_get("schema_name")
                .map_err(|e| AlertError::Store(e.to_string()))?,
            table: row
                .try_get("table_name")
                .map_err(|e| AlertError::Store(e.to_string()))?,
            column: row
                .try_get("column_name")
                .map_err(|e| AlertError::Store(e.to_string()))?,
            source: row
                .try_get("source")
                .map_err(|e| AlertError::Store(e.to_string()))?,
            status: status
                .parse()
                .map_err(|_| AlertError::Store(format!("unknown status {status}")))?,
            assigned_to: row
                .try_get("assigned_to")
                .map_err(|e| AlertError::Store(e.to_string()))?,
            resolved_at: row
                .try_get("resolved_at")
                .map_err(|e| AlertError::Store(e.to_string()))?,
            metadata: metadata.as_object().cloned().unwrap_or_default(),
            created_at: row
                .try_get("created_at")
                .map_err(|e| AlertError::Store(e.to_string()))?,
            updated_at: row
                .try_get("updated_at")
                .map_err(|e| AlertError::Store(e.to_string()))?,
        })
    }
}

#[async_trait]
impl AlertSink for PostgresAlertStore {
    async fn raise(&self, alert: Alert) -> Result<(), AlertError> {
        sqlx::query(
            "INSERT INTO metadata.alerts \
             (id, alert_type, severity, title, message, schema_name, table_name, column_name, \
              source, status, assigned_to, resolved_at, metadata, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(alert.id)
        .bind(alert.alert_type.to_string())
        .bind(alert.severity.to_string())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(&alert.schema)
        .bind(&alert.table)
        .bind(&alert.column)
        .bind(&alert.source)
        .bind(alert.status.to_string())
        .bind(&alert.assigned_to)
        .bind(alert.resolved_at)
        .bind(Value::Object(alert.metadata.clone()))
        .bind(alert.created_at)
        .bind(alert.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AlertError::Store(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl AlertStore for PostgresAlertStore {
    async fn list_open(&self) -> Result<Vec<Alert>, AlertError> {
        let rows = sqlx::query(
            "SELECT id, alert_type, severity, title, message, schema_name, table_name, \
             column_name, source, status, assigned_to, resolved_at, metadata, created_at, \
             updated_at FROM metadata.alerts WHERE status = 'OPEN' ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AlertError::Store(e.to_string()))?;
        rows.iter().map(Self::alert_from_row).collect()
    }

    async fn transition(
        &self,
        alert_id: Uuid,
        to: AlertStatus,
        changed_by: Option<String>,
    ) -> Result<(), AlertError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AlertError::Store(e.to_string()))?;
        let from: Option<String> =
            sqlx::query_scalar("SELECT status FROM metadata.alerts WHERE id = $1 FOR UPDATE")
                .bind(alert_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| AlertError::Store(e.to_string()))?;
        let Some(from) = from else {
            return Err(AlertError::NotFound(alert_id));
        };

        sqlx::query(
            "UPDATE metadata.alerts SET status = $1, updated_at = now(), \
             resolved_at = CASE WHEN $1 = 'RESOLVED' THEN now() ELSE resolved_at END \
             WHERE id = $2",
        )
        .bind(to.to_string())
        .bind(alert_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AlertError::Store(e.to_string()))?;

        sqlx::query(
            "INSERT INTO metadata.alert_transitions (alert_id, from_status, to_status, changed_by) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(alert_id)
        .bind(from)
        .bind(to.to_string())
        .bind(changed_by)
        .execute(&mut *tx)
        .await
        .map_err(|e| AlertError::Store(e.to_string()))?;

        tx.commit().await.map_err(|e| AlertError::Store(e.to_string()))?;
        Ok(())
    }

    async fn transitions(&self, alert_id: Uuid) -> Result<Vec<AlertTransition>, AlertError> {
        let rows = sqlx::query(
            "SELECT alert_id, from_status, to_status, changed_by, changed_at \
             FROM metadata.alert_transitions WHERE alert_id = $1 ORDER BY changed_at",
        )
        .bind(alert_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AlertError::Store(e.to_string()))?;
        rows.iter()
            .map(|row| {
                let from: String = row
                    .try_get("from_status")
                    .map_err(|e| AlertError::Store(e.to_string()))?;
                let to: String = row
                    .try_get("to_status")
                    .map_err(|e| AlertError::Store(e.to_string()))?;
                Ok(AlertTransition {
                    alert_id,
                    from: from
                        .parse()
                        .map_err(|_| AlertError::Store(format!("unknown status {from}")))?,
                    to: to
                        .parse()
                        .map_err(|_| AlertError::Store(format!("unknown status {to}")))?,
                    changed_by: row
                        .try_get("changed_by")
                        .map_err(|e| AlertError::Store(e.to_string()))?,
                    changed_at: row
                        .try_get("changed_at")
                        .map_err(|e| AlertError::Store(e.to_string()))?,
                })
            })
            .collect()
    }
}

/// Webhook subscriber registry over `metadata.webhooks`.
#[derive(Debug, Clone)]
pub struct PostgresWebhookStore {
    pool: PgPool,
}

impl PostgresWebhookStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn config_from_row(row: &sqlx::postgres::PgRow) -> Result<WebhookConfig, AlertError> {
        let webhook_type: String = row
            .try_get("webhook_type")
            .map_err(|e| AlertError::Store(e.to_string()))?;
        Ok(WebhookConfig {
            id: row.try_get("id").map_err(|e| AlertError::Store(e.to_string()))?,
            name: row
                .try_get("name")
                .map_err(|e| AlertError::Store(e.to_string()))?,
            webhook_type: webhook_type
                .parse()
                .map_err(|_| AlertError::Store(format!("unknown webhook type {webhook_type}")))?,
            url: row.try_get("url").map_err(|e| AlertError::Store(e.to_string()))?,
            api_key: row
                .try_get("api_key")
                .map_err(|e| AlertError::Store(e.to_string()))?,
            bot_token: row
                .try_get("bot_token")
                .map_err(|e| AlertError::Store(e.to_string()))?,
            chat_id: row
                .try_get("chat_id")
                .map_err(|e| AlertError::Store(e.to_string()))?,
            email: row
                .try_get("email")
                .map_err(|e| AlertError::Store(e.to_string()))?,
            log_levels: row
                .try_get("log_levels")
                .map_err(|e| AlertError::Store(e.to_string()))?,
            log_categories: row
                .try_get("log_categories")
                .map_err(|e| AlertError::Store(e.to_string()))?,
            enabled: row
                .try_get("enabled")
                .map_err(|e| AlertError::Store(e.to_string()))?,
        })
    }
}

const WEBHOOK_COLUMNS: &str = "id, name, webhook_type, url, api_key, bot_token, chat_id, email, \
                               log_levels, log_categories, enabled";

#[async_trait]
impl WebhookStore for PostgresWebhookStore {
    async fn create(&self, config: WebhookConfig) -> Result<Uuid, AlertError> {
        sqlx::query(
            "INSERT INTO metadata.webhooks \
             (id, name, webhook_type, url, api_key, bot_token, chat_id, email, log_levels, \
              log_categories, enabled) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(config.id)
        .bind(&config.name)
        .bind(config.webhook_type.to_string())
        .bind(&config.url)
        .bind(&config.api_key)
        .bind(&config.bot_token)
        .bind(&config.chat_id)
        .bind(&config.email)
        .bind(&config.log_levels)
        .bind(&config.log_categories)
        .bind(config.enabled)
        .execute(&self.pool)
        .await
        .map_err(|e| AlertError::Store(e.to_string()))?;
        Ok(config.id)
    }

    async fn update(&self, config: WebhookConfig) -> Result<(), AlertError> {
        let result = sqlx::query(
            "UPDATE metadata.webhooks SET name = $1, webhook_type = $2, url = $3, api_key = $4, \
             bot_token = $5, chat_id = $6, email = $7, log_levels = $8, log_categories = $9, \
             enabled = $10 WHERE id = $11",
        )
        .bind(&config.name)
        .bind(config.webhook_type.to_string())
        .bind(&config.url)
        .bind(&config.api_key)
        .bind(&config.bot_token)
        .bind(&config.chat_id)
        .bind(&config.email)
        .bind(&config.log_levels)
        .bind(&config.log_categories)
        .bind(config.enabled)
        .bind(config.id)
        .execute(&self.pool)
        .await
        .map_err(|e| AlertError::Store(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(AlertError::NotFound(config.id));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), AlertError> {
        sqlx::query("DELETE FROM metadata.webhooks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| AlertError::Store(e.to_string()))?;
        Ok(())
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<(), AlertError> {
        let result = sqlx::query("UPDATE metadata.webhooks SET enabled = $1 WHERE id = $2")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| AlertError::Store(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(AlertError::NotFound(id));
        }
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<WebhookConfig>, AlertError> {
        let rows = sqlx::query(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM metadata.webhooks ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AlertError::Store(e.to_string()))?;
        rows.iter().map(Self::config_from_row).collect()
    }

    async fn list_enabled(&self) -> Result<Vec<WebhookConfig>, AlertError> {
        let rows = sqlx::query(&format!(
            "SELECT {WEBHOOK_COLUMNS} FROM metadata.webhooks WHERE enabled ORDER BY name"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AlertError::Store(e.to_string()))?;
        rows.iter().map(Self::config_from_row).collect()
    }
}
