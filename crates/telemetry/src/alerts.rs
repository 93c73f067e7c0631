//! Threshold-triggered alerts with an acknowledge/resolve lifecycle.
//!
//! The [`AlertManager`] evaluates a [`MetricsReport`] against configurable
//! thresholds on every consolidation cycle. An alert of a given kind exists
//! at most once in the active set; re-crossing a threshold refreshes the
//! existing alert instead of duplicating it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::metrics::MetricsReport;

/// Maximum number of resolved alerts kept in history.
const HISTORY_CAP: usize = 100;

/// Unique identifier for each alert condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ErrorRate,
    Latency,
    AuthFailureRate,
    ConsecutiveFailures,
    SystemShutdown,
    BothInstancesDown,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ErrorRate => "error_rate",
            Self::Latency => "latency",
            Self::AuthFailureRate => "auth_failure_rate",
            Self::ConsecutiveFailures => "consecutive_failures",
            Self::SystemShutdown => "system_shutdown",
            Self::BothInstancesDown => "both_instances_down",
        }
    }
}

/// Alert severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// A raised alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    fn new(kind: AlertKind, severity: AlertSeverity, message: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            message,
            created_at: now,
            updated_at: now,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
        }
    }
}

/// Delivery channels for alert notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    /// Push to connected real-time observers.
    Websocket,
    /// Append to the audit action log.
    ActionLog,
}

/// Evaluation thresholds, each with independent warning and critical levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Master switch; when false, evaluation raises nothing.
    pub enabled: bool,
    /// Where newly raised alerts are delivered.
    #[serde(default = "default_channels")]
    pub channels: Vec<NotificationChannel>,
    pub error_rate_warning: f64,
    pub error_rate_critical: f64,
    pub average_latency_warning_ms: f64,
    pub average_latency_critical_ms: f64,
    pub p95_latency_warning_ms: f64,
    pub p95_latency_critical_ms: f64,
    pub auth_failure_rate_warning: f64,
    pub auth_failure_rate_critical: f64,
    pub consecutive_failures_warning: u32,
    pub consecutive_failures_critical: u32,
}

fn default_channels() -> Vec<NotificationChannel> {
    vec![NotificationChannel::Websocket, NotificationChannel::ActionLog]
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            enabled: true,
            channels: default_channels(),
            error_rate_warning: 0.10,
            error_rate_critical: 0.25,
            average_latency_warning_ms: 1_000.0,
            average_latency_critical_ms: 3_000.0,
            p95_latency_warning_ms: 2_000.0,
            p95_latency_critical_ms: 5_000.0,
            auth_failure_rate_warning: 0.05,
            auth_failure_rate_critical: 0.20,
            consecutive_failures_warning: 3,
            consecutive_failures_critical: 5,
        }
    }
}

/// Errors from operator-facing alert operations.
#[derive(Debug, Error)]
pub enum AlertError {
    #[error("no active alert with id {0}")]
    NotFound(Uuid),
}

#[derive(Debug)]
struct AlertState {
    thresholds: AlertThresholds,
    active: BTreeMap<AlertKind, Alert>,
    history: VecDeque<Alert>,
}

/// Concurrency-safe alert manager.
#[derive(Debug)]
pub struct AlertManager {
    inner: Mutex<AlertState>,
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(AlertThresholds::default())
    }
}

impl AlertManager {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            inner: Mutex::new(AlertState {
                thresholds,
                active: BTreeMap::new(),
                history: VecDeque::new(),
            }),
        }
    }

    /// Evaluate a metrics report against the current thresholds.
    ///
    /// Returns alerts newly created by this evaluation (refreshed alerts are
    /// not returned; they were already visible). Conditions that have
    /// cleared are auto-resolved with `resolved_by = "system"`.
    ///
    /// # Panics
    ///
    /// Panics if the interior lock is poisoned.
    pub fn evaluate(&self, report: &MetricsReport) -> Vec<Alert> {
        let mut state = self.inner.lock().expect("alert manager lock poisoned");
        if !state.thresholds.enabled {
            return Vec::new();
        }

        let t = state.thresholds.clone();
        let conditions = [
            (
                AlertKind::ErrorRate,
                crossed(
                    report.error_rate,
                    t.error_rate_warning,
                    t.error_rate_critical,
                ),
                format!("error rate at {:.1}%", report.error_rate * 100.0),
            ),
            (
                AlertKind::Latency,
                crossed(
                    report.average_latency_ms,
                    t.average_latency_warning_ms,
                    t.average_latency_critical_ms,
                )
                .max(crossed(
                    report.p95_latency_ms,
                    t.p95_latency_warning_ms,
                    t.p95_latency_critical_ms,
                )),
                format!(
                    "latency avg {:.0}ms / p95 {:.0}ms",
                    report.average_latency_ms, report.p95_latency_ms
                ),
            ),
            (
                AlertKind::AuthFailureRate,
                crossed(
                    1.0 - report.auth_success_rate,
                    t.auth_failure_rate_warning,
                    t.auth_failure_rate_critical,
                ),
                format!(
                    "auth failure rate at {:.1}%",
                    (1.0 - report.auth_success_rate) * 100.0
                ),
            ),
            (
                AlertKind::ConsecutiveFailures,
                crossed(
                    f64::from(report.connection.consecutive_failures),
                    f64::from(t.consecutive_failures_warning),
                    f64::from(t.consecutive_failures_critical),
                ),
                format!(
                    "{} consecutive request failures",
                    report.connection.consecutive_failures
                ),
            ),
        ];

        let mut created = Vec::new();
        for (kind, severity, message) in conditions {
            match severity {
                Some(severity) => {
                    if let Some(existing) = state.active.get_mut(&kind) {
                        existing.severity = severity;
                        existing.message = message;
                        existing.updated_at = Utc::now();
                    } else {
                        let alert = Alert::new(kind, severity, message);
                        state.active.insert(kind, alert.clone());
                        created.push(alert);
                    }
                }
                None => {
                    // Condition cleared: system-resolve any active alert.
                    if let Some(mut alert) = state.active.remove(&kind) {
                        alert.resolved_by = Some("system".to_string());
                        alert.resolved_at = Some(Utc::now());
                        push_history(&mut state.history, alert);
                    }
                }
            }
        }

        created
    }

    /// Raise an alert directly, outside threshold evaluation.
    ///
    /// Used for lifecycle conditions such as shutdown. Deduplicated per kind
    /// like evaluated alerts.
    ///
    /// # Panics
    ///
    /// Panics if the interior lock is poisoned.
    pub fn raise(&self, kind: AlertKind, severity: AlertSeverity, message: &str) -> Alert {
        let mut state = self.inner.lock().expect("alert manager lock poisoned");
        if let Some(existing) = state.active.get_mut(&kind) {
            existing.severity = severity;
            existing.message = message.to_string();
            existing.updated_at = Utc::now();
            return existing.clone();
        }
        let alert = Alert::new(kind, severity, message.to_string());
        state.active.insert(kind, alert.clone());
        alert
    }

    /// Acknowledge an active alert. The alert stays in the active set.
    ///
    /// # Panics
    ///
    /// Panics if the interior lock is poisoned.
    pub fn acknowledge(&self, id: Uuid, by: &str) -> Result<Alert, AlertError> {
        let mut state = self.inner.lock().expect("alert manager lock poisoned");
        let alert = state
            .active
            .values_mut()
            .find(|a| a.id == id)
            .ok_or(AlertError::NotFound(id))?;
        alert.acknowledged_by = Some(by.to_string());
        alert.acknowledged_at = Some(Utc::now());
        alert.updated_at = Utc::now();
        Ok(alert.clone())
    }

    /// Resolve an active alert, moving it from the active set to history.
    ///
    /// # Panics
    ///
    /// Panics if the interior lock is poisoned.
    pub fn resolve(&self, id: Uuid, by: &str) -> Result<Alert, AlertError> {
        let mut state = self.inner.lock().expect("alert manager lock poisoned");
        let kind = state
            .active
            .values()
            .find(|a| a.id == id)
            .map(|a| a.kind)
            .ok_or(AlertError::NotFound(id))?;
        let mut alert = state.active.remove(&kind).expect("kind just found");
        alert.resolved_by = Some(by.to_string());
        alert.resolved_at = Some(Utc::now());
        alert.updated_at = Utc::now();
        push_history(&mut state.history, alert.clone());
        Ok(alert)
    }

    /// Resolve the active alert of a kind, if one exists.
    ///
    /// Counterpart to [`AlertManager::raise`] for callers that track
    /// conditions rather than alert ids.
    ///
    /// # Panics
    ///
    /// Panics if the interior lock is poisoned.
    pub fn resolve_kind(&self, kind: AlertKind, by: &str) -> Option<Alert> {
        let mut state = self.inner.lock().expect("alert manager lock poisoned");
        let mut alert = state.active.remove(&kind)?;
        alert.resolved_by = Some(by.to_string());
        alert.resolved_at = Some(Utc::now());
        alert.updated_at = Utc::now();
        push_history(&mut state.history, alert.clone());
        Some(alert)
    }

    /// Replace the evaluation thresholds; takes effect on the next cycle.
    ///
    /// # Panics
    ///
    /// Panics if the interior lock is poisoned.
    pub fn update_thresholds(&self, thresholds: AlertThresholds) {
        let mut state = self.inner.lock().expect("alert manager lock poisoned");
        state.thresholds = thresholds;
    }

    /// # Panics
    ///
    /// Panics if the interior lock is poisoned.
    pub fn thresholds(&self) -> AlertThresholds {
        self.inner
            .lock()
            .expect("alert manager lock poisoned")
            .thresholds
            .clone()
    }

    /// # Panics
    ///
    /// Panics if the interior lock is poisoned.
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.inner
            .lock()
            .expect("alert manager lock poisoned")
            .active
            .values()
            .cloned()
            .collect()
    }

    /// Resolved alerts, most recent last.
    ///
    /// # Panics
    ///
    /// Panics if the interior lock is poisoned.
    pub fn history(&self) -> Vec<Alert> {
        self.inner
            .lock()
            .expect("alert manager lock poisoned")
            .history
            .iter()
            .cloned()
            .collect()
    }
}

fn push_history(history: &mut VecDeque<Alert>, alert: Alert) {
    history.push_back(alert);
    while history.len() > HISTORY_CAP {
        history.pop_front();
    }
}

/// Severity crossed by `value`, if any. Critical dominates warning.
fn crossed(value: f64, warning: f64, critical: f64) -> Option<AlertSeverity> {
    if value >= critical {
        Some(AlertSeverity::Critical)
    } else if value >= warning {
        Some(AlertSeverity::Warning)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{ErrorCategory, EventKind, MetricStore, RequestOutcome};
    use std::time::Duration;

    /// 6 failures in 50 requests (12% error rate) with a trailing success so
    /// the consecutive-failure streak is reset and only the error-rate
    /// threshold is crossed.
    fn degraded_report() -> MetricsReport {
        let store = MetricStore::new();
        for _ in 0..43 {
            store.record(&RequestOutcome::success(
                Duration::from_millis(10),
                EventKind::Ping,
            ));
        }
        for _ in 0..6 {
            store.record(&RequestOutcome::failure(
                Duration::from_millis(10),
                EventKind::Other,
                ErrorCategory::Processing,
            ));
        }
        store.record(&RequestOutcome::success(
            Duration::from_millis(10),
            EventKind::Ping,
        ));
        store.report()
    }

    fn healthy_report() -> MetricsReport {
        let store = MetricStore::new();
        for _ in 0..50 {
            store.record(&RequestOutcome::success(
                Duration::from_millis(10),
                EventKind::Ping,
            ));
        }
        store.report()
    }

    #[test]
    fn test_threshold_crossing_creates_alert() {
        let manager = AlertManager::default();
        let created = manager.evaluate(&degraded_report());
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].kind, AlertKind::ErrorRate);
        assert_eq!(created[0].severity, AlertSeverity::Warning);
    }

    #[test]
    fn test_trailing_failure_streak_raises_both_alerts() {
        let store = MetricStore::new();
        for _ in 0..44 {
            store.record(&RequestOutcome::success(
                Duration::from_millis(10),
                EventKind::Ping,
            ));
        }
        for _ in 0..6 {
            store.record(&RequestOutcome::failure(
                Duration::from_millis(10),
                EventKind::Other,
                ErrorCategory::Processing,
            ));
        }

        let manager = AlertManager::default();
        let created = manager.evaluate(&store.report());
        let kinds: Vec<AlertKind> = created.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::ErrorRate, AlertKind::ConsecutiveFailures]);
        assert_eq!(created[1].severity, AlertSeverity::Critical);
    }

    #[test]
    fn test_repeated_crossing_does_not_duplicate() {
        let manager = AlertManager::default();
        let report = degraded_report();
        let first = manager.evaluate(&report);
        assert_eq!(first.len(), 1);
        let second = manager.evaluate(&report);
        assert!(second.is_empty());
        let active = manager.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, first[0].id);
    }

    #[test]
    fn test_cleared_condition_auto_resolves() {
        let manager = AlertManager::default();
        manager.evaluate(&degraded_report());
        assert_eq!(manager.active_alerts().len(), 1);

        manager.evaluate(&healthy_report());
        assert!(manager.active_alerts().is_empty());
        let history = manager.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].resolved_by.as_deref(), Some("system"));
    }

    #[test]
    fn test_acknowledge_keeps_alert_active() {
        let manager = AlertManager::default();
        let created = manager.evaluate(&degraded_report());
        let acked = manager.acknowledge(created[0].id, "operator").unwrap();
        assert_eq!(acked.acknowledged_by.as_deref(), Some("operator"));
        assert_eq!(manager.active_alerts().len(), 1);
    }

    #[test]
    fn test_resolve_moves_to_history() {
        let manager = AlertManager::default();
        let created = manager.evaluate(&degraded_report());
        let resolved = manager.resolve(created[0].id, "operator").unwrap();
        assert_eq!(resolved.resolved_by.as_deref(), Some("operator"));
        assert!(manager.active_alerts().is_empty());
        assert_eq!(manager.history().len(), 1);
    }

    #[test]
    fn test_unknown_id_rejected() {
        let manager = AlertManager::default();
        assert!(manager.acknowledge(Uuid::new_v4(), "op").is_err());
        assert!(manager.resolve(Uuid::new_v4(), "op").is_err());
    }

    #[test]
    fn test_disabled_thresholds_raise_nothing() {
        let manager = AlertManager::default();
        let mut thresholds = manager.thresholds();
        thresholds.enabled = false;
        manager.update_thresholds(thresholds);
        assert!(manager.evaluate(&degraded_report()).is_empty());
        assert!(manager.active_alerts().is_empty());
    }

    #[test]
    fn test_runtime_threshold_update_applies_next_cycle() {
        let manager = AlertManager::default();
        let mut thresholds = manager.thresholds();
        thresholds.error_rate_warning = 0.50;
        thresholds.error_rate_critical = 0.75;
        manager.update_thresholds(thresholds);
        // 12% error rate no longer crosses the raised warning level.
        assert!(manager.evaluate(&degraded_report()).is_empty());
    }

    #[test]
    fn test_channels_are_runtime_mutable() {
        let manager = AlertManager::default();
        assert_eq!(
            manager.thresholds().channels,
            vec![
                NotificationChannel::Websocket,
                NotificationChannel::ActionLog
            ]
        );

        let mut thresholds = manager.thresholds();
        thresholds.channels = vec![NotificationChannel::ActionLog];
        manager.update_thresholds(thresholds);
        assert_eq!(
            manager.thresholds().channels,
            vec![NotificationChannel::ActionLog]
        );

        // Older configs without the field deserialize to the default set.
        let parsed: AlertThresholds =
            serde_json::from_str(r#"{"enabled":true,"error_rate_warning":0.1,"error_rate_critical":0.25,"average_latency_warning_ms":1000.0,"average_latency_critical_ms":3000.0,"p95_latency_warning_ms":2000.0,"p95_latency_critical_ms":5000.0,"auth_failure_rate_warning":0.05,"auth_failure_rate_critical":0.2,"consecutive_failures_warning":3,"consecutive_failures_critical":5}"#)
                .unwrap();
        assert_eq!(parsed.channels, default_channels());
    }

    #[test]
    fn test_direct_raise_deduplicates() {
        let manager = AlertManager::default();
        let first = manager.raise(AlertKind::SystemShutdown, AlertSeverity::Warning, "bye");
        let second = manager.raise(AlertKind::SystemShutdown, AlertSeverity::Warning, "bye again");
        assert_eq!(first.id, second.id);
        assert_eq!(manager.active_alerts().len(), 1);
    }

    #[test]
    fn test_resolve_kind() {
        let manager = AlertManager::default();
        let raised = manager.raise(
            AlertKind::BothInstancesDown,
            AlertSeverity::Critical,
            "both relay instances down",
        );
        let resolved = manager
            .resolve_kind(AlertKind::BothInstancesDown, "system")
            .unwrap();
        assert_eq!(resolved.id, raised.id);
        assert!(manager.active_alerts().is_empty());
        assert!(manager
            .resolve_kind(AlertKind::BothInstancesDown, "system")
            .is_none());
    }
}
