//! Periodic governance checks: each enabled rule is evaluated against the
//! per-table governance snapshot and fires at most one alert per table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Alert, AlertRule, AlertType};

/// Governance facts for one replicated table, gathered by the metadata
/// sweep that precedes a check run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableGovernance {
    pub schema: String,
    pub table: String,
    /// 0.0..=1.0 aggregate data-quality score.
    pub quality_score: f64,
    #[serde(default)]
    pub unprotected_pii_columns: Vec<String>,
    #[serde(default)]
    pub access_anomalies: u32,
    #[serde(default)]
    pub retention_expired: bool,
    #[serde(default)]
    pub schema_changed_recently: bool,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fragmentation_pct: f64,
    #[serde(default)]
    pub compliance_violations: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceSnapshot {
    pub tables: Vec<TableGovernance>,
    pub taken_at: Option<DateTime<Utc>>,
}

/// Evaluate every enabled rule over the snapshot. Returns the alerts to be
/// appended; delivery and persistence are the caller's concern.
pub fn run_governance_checks(snapshot: &GovernanceSnapshot, rules: &[AlertRule]) -> Vec<Alert> {
    let now = snapshot.taken_at.unwrap_or_else(Utc::now);
    let mut alerts = Vec::new();

    for rule in rules.iter().filter(|r| r.enabled) {
        for table in &snapshot.tables {
            if let Some(alert) = evaluate_rule(rule, table, now) {
                alerts.push(alert);
            }
        }
    }
    alerts
}

fn evaluate_rule(rule: &AlertRule, table: &TableGovernance, now: DateTime<Utc>) -> Option<Alert> {
    let fired = if rule.condition.trim().is_empty() {
        default_predicate(rule, table, now)
    } else {
        evaluate_condition(&rule.condition, table, now)?
    };
    if !fired {
        return None;
    }

    let (title, message) = describe(rule, table, now);
    Some(
        Alert::new(rule.rule_type, rule.severity, title, message)
            .scoped(table.schema.clone(), table.table.clone()),
    )
}

fn default_predicate(rule: &AlertRule, table: &TableGovernance, now: DateTime<Utc>) -> bool {
    match rule.rule_type {
        AlertType::DataQuality => table.quality_score < rule.threshold,
        AlertType::PiiProtection => !table.unprotected_pii_columns.is_empty(),
        AlertType::AccessAnomaly => f64::from(table.access_anomalies) > rule.threshold,
        AlertType::RetentionExpired => table.retention_expired,
        AlertType::SchemaChange => table.schema_changed_recently,
        AlertType::Freshness => staleness_hours(table, now) > rule.threshold,
        AlertType::Fragmentation => table.fragmentation_pct > rule.threshold,
        AlertType::Compliance => !table.compliance_violations.is_empty(),
        AlertType::Replication => false,
    }
}

fn staleness_hours(table: &TableGovernance, now: DateTime<Utc>) -> f64 {
    table.last_synced_at.map_or(f64::INFINITY, |t| {
        (now - t).num_minutes() as f64 / 60.0
    })
}

fn metric(name: &str, table: &TableGovernance, now: DateTime<Utc>) -> Option<f64> {
    match name {
        "quality_score" => Some(table.quality_score),
        "unprotected_pii_count" => Some(table.unprotected_pii_columns.len() as f64),
        "access_anomalies" => Some(f64::from(table.access_anomalies)),
        "staleness_hours" => Some(staleness_hours(table, now)),
        "fragmentation_pct" => Some(table.fragmentation_pct),
        "compliance_violations" => Some(table.compliance_violations.len() as f64),
        _ => None,
    }
}

/// Evaluate a `<metric> <op> <value>` condition. Unknown metrics or
/// malformed expressions evaluate to `None` and the rule is skipped.
fn evaluate_condition(condition: &str, table: &TableGovernance, now: DateTime<Utc>) -> Option<bool> {
    let mut parts = condition.split_whitespace();
    let left = metric(parts.next()?, table, now)?;
    let op = parts.next()?;
    let right: f64 = parts.next()?.parse().ok()?;
    let result = match op {
        "<" => left < right,
        "<=" => left <= right,
        ">" => left > right,
        ">=" => left >= right,
        "=" | "==" => (left - right).abs() < f64::EPSILON,
        "!=" => (left - right).abs() >= f64::EPSILON,
        _ => return None,
    };
    Some(result)
}

fn describe(rule: &AlertRule, table: &TableGovernance, now: DateTime<Utc>) -> (String, String) {
    let scope = format!("{}.{}", table.schema, table.table);
    match rule.rule_type {
        AlertType::DataQuality => (
            format!("Low data quality on {scope}"),
            format!(
                "Quality score {:.2} is below threshold {:.2}",
                table.quality_score, rule.threshold
            ),
        ),
        AlertType::PiiProtection => (
            format!("Unprotected PII on {scope}"),
            format!(
                "Columns without protection: {}",
                table.unprotected_pii_columns.join(", ")
            ),
        ),
        AlertType::AccessAnomaly => (
            format!("Access anomalies on {scope}"),
            format!("{} anomalous access events", table.access_anomalies),
        ),
        AlertType::RetentionExpired => (
            format!("Retention expired for {scope}"),
            "Data is past its retention window".to_string(),
        ),
        AlertType::SchemaChange => (
            format!("Recent schema change on {scope}"),
            "Source schema changed within the check window".to_string(),
        ),
        AlertType::Freshness => (
            format!("Stale data on {scope}"),
            format!(
                "Last sync {:.1}h ago exceeds {:.1}h",
                staleness_hours(table, now),
                rule.threshold
            ),
        ),
        AlertType::Fragmentation => (
            format!("Fragmentation on {scope}"),
            format!("{:.1}% fragmented", table.fragmentation_pct),
        ),
        AlertType::Compliance => (
            format!("Compliance violations on {scope}"),
            table.compliance_violations.join("; "),
        ),
        AlertType::Replication => (format!("Replication issue on {scope}"), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::alerting::AlertSeverity;

    fn rule(rule_type: AlertType, threshold: f64) -> AlertRule {
        AlertRule {
            id: Uuid::new_v4(),
            name: format!("{rule_type}"),
            rule_type,
            severity: AlertSeverity::Warning,
            condition: String::new(),
            threshold,
            enabled: true,
            channels: Vec::new(),
        }
    }

    fn table(quality: f64) -> TableGovernance {
        TableGovernance {
            schema: "sales".to_string(),
            table: "orders".to_string(),
            quality_score: quality,
            ..TableGovernance::default()
        }
    }

    #[test]
    fn test_quality_rule_fires_below_threshold() {
        let snapshot = GovernanceSnapshot {
            tables: vec![table(0.5), table(0.95)],
            taken_at: Some(Utc::now()),
        };
        let alerts = run_governance_checks(&snapshot, &[rule(AlertType::DataQuality, 0.8)]);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::DataQuality);
        assert_eq!(alerts[0].schema.as_deref(), Some("sales"));
    }

    #[test]
    fn test_disabled_rules_do_not_fire() {
        let mut r = rule(AlertType::DataQuality, 0.8);
        r.enabled = false;
        let snapshot = GovernanceSnapshot {
            tables: vec![table(0.1)],
            taken_at: Some(Utc::now()),
        };
        assert!(run_governance_checks(&snapshot, &[r]).is_empty());
    }

    #[test]
    fn test_explicit_condition_overrides_default() {
        let mut r = rule(AlertType::DataQuality, 0.2);
        r.condition = "quality_score < 0.9".to_string();
        let snapshot = GovernanceSnapshot {
            tables: vec![table(0.5)],
            taken_at: Some(Utc::now()),
        };
        assert_eq!(run_governance_checks(&snapshot, &[r]).len(), 1);
    }

    #[test]
    fn test_freshness_without_sync_is_stale() {
        let snapshot = GovernanceSnapshot {
            tables: vec![table(1.0)],
            taken_at: Some(Utc::now()),
        };
        let alerts = run_governance_checks(&snapshot, &[rule(AlertType::Freshness, 24.0)]);
        assert_eq!(alerts.len(), 1);
    }

    #[test]
    fn test_pii_rule() {
        let mut t = table(1.0);
        t.unprotected_pii_columns = vec!["ssn".to_string()];
        let snapshot = GovernanceSnapshot {
            tables: vec![t],
            taken_at: Some(Utc::now()),
        };
        let alerts = run_governance_checks(&snapshot, &[rule(AlertType::PiiProtection, 0.0)]);
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].message.contains("ssn"));
    }
}
