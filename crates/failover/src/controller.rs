//! Active/standby failover decisions.
//!
//! The controller watches both relay instances and repoints the provider
//! webhook when the active one goes down. Probe observation and decision
//! making are separate steps: the probe loop feeds results into
//! [`Controller::observe`], then [`Controller::tick`] applies the transition
//! rules. The active instance only flips after the registry confirms the
//! endpoint change; an unconfirmed attempt is recorded and retried on the
//! next qualifying cycle.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use telemetry::{Alert, AlertKind, AlertManager, AlertSeverity};
use tracing::{error, info, warn};

use crate::health::{ProbeResult, ServerHealthRecord};
use crate::registry::WebhookEndpointRegistry;

/// Which relay instance currently receives webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveInstance {
    Primary,
    Backup,
}

/// Direction of a transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionDirection {
    /// Primary to backup.
    Failover,
    /// Backup to primary.
    Recovery,
}

/// One transition attempt, confirmed or not. Append-only history.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverEvent {
    pub direction: TransitionDirection,
    pub timestamp: DateTime<Utc>,
    /// Last observed latency of the instance being promoted.
    pub response_time_ms: Option<u64>,
    pub reason: String,
    pub success: bool,
}

/// Outcome of a manual transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualOutcome {
    /// The registry confirmed the change and the active instance flipped.
    Transitioned,
    /// The requested instance was already active; nothing was done.
    AlreadyActive,
    /// The registry rejected the update; the active instance is unchanged.
    Failed,
}

/// Transition thresholds and endpoint URLs.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Health endpoint of the primary relay.
    pub primary_health_url: String,
    /// Health endpoint of the backup relay.
    pub backup_health_url: String,
    /// Webhook target registered while primary is active.
    pub primary_webhook_url: String,
    /// Webhook target registered while backup is active.
    pub backup_webhook_url: String,
    /// Consecutive primary failures required before failover.
    pub failover_threshold: u32,
    /// Consecutive primary successes required before recovery.
    pub recovery_threshold: u32,
}

const EVENT_HISTORY_CAP: usize = 100;

#[derive(Debug)]
struct ControllerState {
    active: ActiveInstance,
    primary: ServerHealthRecord,
    backup: ServerHealthRecord,
    events: Vec<FailoverEvent>,
    both_down: bool,
}

/// Serializable status view for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub active: ActiveInstance,
    pub primary: ServerHealthRecord,
    pub backup: ServerHealthRecord,
    pub both_down: bool,
    pub alerts: Vec<Alert>,
    pub events: Vec<FailoverEvent>,
}

/// The failover decision engine.
pub struct Controller {
    config: ControllerConfig,
    registry: std::sync::Arc<dyn WebhookEndpointRegistry>,
    alerts: AlertManager,
    inner: Mutex<ControllerState>,
    events_path: Option<PathBuf>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        registry: std::sync::Arc<dyn WebhookEndpointRegistry>,
        events_path: Option<PathBuf>,
    ) -> Self {
        let primary = ServerHealthRecord::new(config.primary_health_url.clone());
        let backup = ServerHealthRecord::new(config.backup_health_url.clone());
        Self {
            config,
            registry,
            alerts: AlertManager::default(),
            inner: Mutex::new(ControllerState {
                active: ActiveInstance::Primary,
                primary,
                backup,
                events: Vec::new(),
                both_down: false,
            }),
            events_path,
        }
    }

    /// Fold one probe cycle's results into the health records.
    pub fn observe(&self, primary: ProbeResult, backup: ProbeResult) {
        let mut state = self.inner.lock().expect("controller lock poisoned");
        apply(&mut state.primary, primary);
        apply(&mut state.backup, backup);
    }

    /// Apply the transition rules to the current health records.
    ///
    /// Rules, in order:
    /// - both instances unhealthy: log critical, no transition
    /// - primary active and failed `failover_threshold` probes in a row,
    ///   backup healthy: fail over to backup
    /// - backup active and primary succeeded `recovery_threshold` probes in
    ///   a row: recover to primary
    pub async fn tick(&self) {
        let decision = {
            let mut state = self.inner.lock().expect("controller lock poisoned");

            let both_down = !state.primary.is_healthy() && !state.backup.is_healthy();
            if both_down && !state.both_down {
                error!(
                    primary_failures = state.primary.consecutive_failures,
                    backup_failures = state.backup.consecutive_failures,
                    "Both relay instances down; manual intervention required"
                );
                self.alerts.raise(
                    AlertKind::BothInstancesDown,
                    AlertSeverity::Critical,
                    "both relay instances failing health checks",
                );
            } else if !both_down && state.both_down {
                self.alerts
                    .resolve_kind(AlertKind::BothInstancesDown, "system");
            }
            state.both_down = both_down;
            if both_down {
                None
            } else {
                match state.active {
                    ActiveInstance::Primary
                        if state.primary.consecutive_failures
                            >= self.config.failover_threshold
                            && state.backup.is_healthy() =>
                    {
                        Some((
                            TransitionDirection::Failover,
                            format!(
                                "primary failed {} consecutive health checks",
                                state.primary.consecutive_failures
                            ),
                        ))
                    }
                    ActiveInstance::Backup
                        if state.primary.consecutive_successes
                            >= self.config.recovery_threshold =>
                    {
                        Some((
                            TransitionDirection::Recovery,
                            format!(
                                "primary healthy for {} consecutive checks",
                                state.primary.consecutive_successes
                            ),
                        ))
                    }
                    _ => None,
                }
            }
        };

        if let Some((direction, reason)) = decision {
            self.transition(direction, &reason).await;
        }
    }

    /// Manually fail over to the backup. Idempotent.
    pub async fn trigger_failover(&self, reason: &str) -> ManualOutcome {
        let active = self.inner.lock().expect("controller lock poisoned").active;
        if active == ActiveInstance::Backup {
            return ManualOutcome::AlreadyActive;
        }
        if self.transition(TransitionDirection::Failover, reason).await {
            ManualOutcome::Transitioned
        } else {
            ManualOutcome::Failed
        }
    }

    /// Manually recover to the primary. Idempotent.
    pub async fn trigger_recovery(&self, reason: &str) -> ManualOutcome {
        let active = self.inner.lock().expect("controller lock poisoned").active;
        if active == ActiveInstance::Primary {
            return ManualOutcome::AlreadyActive;
        }
        if self.transition(TransitionDirection::Recovery, reason).await {
            ManualOutcome::Transitioned
        } else {
            ManualOutcome::Failed
        }
    }

    /// Attempt a transition through the registry; the active instance only
    /// flips on confirmed success. Returns whether it flipped.
    async fn transition(&self, direction: TransitionDirection, reason: &str) -> bool {
        let (target_url, promoted_latency) = {
            let state = self.inner.lock().expect("controller lock poisoned");
            match direction {
                TransitionDirection::Failover => (
                    self.config.backup_webhook_url.clone(),
                    state.backup.last_latency_ms,
                ),
                TransitionDirection::Recovery => (
                    self.config.primary_webhook_url.clone(),
                    state.primary.last_latency_ms,
                ),
            }
        };

        let result = self.registry.set_target(&target_url).await;
        let success = result.is_ok();

        let event = FailoverEvent {
            direction,
            timestamp: Utc::now(),
            response_time_ms: promoted_latency,
            reason: reason.to_string(),
            success,
        };

        match &result {
            Ok(()) => {
                let mut state = self.inner.lock().expect("controller lock poisoned");
                state.active = match direction {
                    TransitionDirection::Failover => ActiveInstance::Backup,
                    TransitionDirection::Recovery => ActiveInstance::Primary,
                };
                info!(
                    direction = ?direction,
                    target = %target_url,
                    reason = %reason,
                    "Webhook endpoint transition confirmed"
                );
            }
            Err(e) => {
                warn!(
                    direction = ?direction,
                    target = %target_url,
                    error = %e,
                    "Webhook endpoint transition failed; will retry"
                );
            }
        }

        self.append_event(event).await;
        success
    }

    /// Record an event in memory and in the JSON-lines file.
    async fn append_event(&self, event: FailoverEvent) {
        if let Some(path) = &self.events_path {
            match serde_json::to_string(&event) {
                Ok(line) => {
                    if let Err(e) = append_line(path, &line).await {
                        error!(path = %path.display(), error = %e, "Failed to append failover event");
                    }
                }
                Err(e) => error!(error = %e, "Failed to serialize failover event"),
            }
        }

        let mut state = self.inner.lock().expect("controller lock poisoned");
        state.events.push(event);
        let overflow = state.events.len().saturating_sub(EVENT_HISTORY_CAP);
        if overflow > 0 {
            state.events.drain(..overflow);
        }
    }

    /// Point-in-time status view.
    pub fn status(&self) -> ControllerStatus {
        let state = self.inner.lock().expect("controller lock poisoned");
        ControllerStatus {
            active: state.active,
            primary: state.primary.clone(),
            backup: state.backup.clone(),
            both_down: state.both_down,
            alerts: self.alerts.active_alerts(),
            events: state.events.clone(),
        }
    }
}

fn apply(record: &mut ServerHealthRecord, result: ProbeResult) {
    if result.healthy {
        record.record_success(result.latency_ms);
    } else {
        record.record_failure();
    }
}

async fn append_line(path: &PathBuf, line: &str) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    fn ok() -> ProbeResult {
        ProbeResult {
            healthy: true,
            latency_ms: 10,
        }
    }

    fn down() -> ProbeResult {
        ProbeResult {
            healthy: false,
            latency_ms: 4000,
        }
    }

    struct FakeRegistry {
        targets: Mutex<Vec<String>>,
        fail: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeRegistry {
        fn new() -> Self {
            Self {
                targets: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl WebhookEndpointRegistry for FakeRegistry {
        async fn set_target(&self, url: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("registry unavailable");
            }
            self.targets.lock().unwrap().push(url.to_string());
            Ok(())
        }
    }

    fn controller(registry: Arc<FakeRegistry>) -> Controller {
        Controller::new(
            ControllerConfig {
                primary_health_url: "http://primary/health".into(),
                backup_health_url: "http://backup/health".into(),
                primary_webhook_url: "http://primary/webhook/deploy".into(),
                backup_webhook_url: "http://backup/webhook/deploy".into(),
                failover_threshold: 3,
                recovery_threshold: 5,
            },
            registry,
            None,
        )
    }

    #[tokio::test]
    async fn test_failover_after_threshold_failures() {
        let registry = Arc::new(FakeRegistry::new());
        let ctl = controller(Arc::clone(&registry));

        for _ in 0..2 {
            ctl.observe(down(), ok());
            ctl.tick().await;
            assert_eq!(ctl.status().active, ActiveInstance::Primary);
        }

        // Third consecutive failure crosses the threshold.
        ctl.observe(down(), ok());
        ctl.tick().await;

        let status = ctl.status();
        assert_eq!(status.active, ActiveInstance::Backup);
        assert_eq!(
            registry.targets.lock().unwrap().as_slice(),
            ["http://backup/webhook/deploy"]
        );
        assert_eq!(status.events.len(), 1);
        assert!(status.events[0].success);
        assert_eq!(status.events[0].direction, TransitionDirection::Failover);
    }

    #[tokio::test]
    async fn test_no_failover_when_backup_unhealthy() {
        let registry = Arc::new(FakeRegistry::new());
        let ctl = controller(Arc::clone(&registry));

        for _ in 0..6 {
            ctl.observe(down(), down());
            ctl.tick().await;
        }

        let status = ctl.status();
        assert_eq!(status.active, ActiveInstance::Primary);
        assert!(status.both_down);
        assert_eq!(registry.calls.load(Ordering::SeqCst), 0);
        assert!(status
            .alerts
            .iter()
            .any(|a| a.kind == AlertKind::BothInstancesDown));

        // Backup comes back; the alert clears and failover proceeds.
        ctl.observe(down(), ok());
        ctl.tick().await;
        let status = ctl.status();
        assert!(!status.both_down);
        assert!(status.alerts.is_empty());
        assert_eq!(status.active, ActiveInstance::Backup);
    }

    #[tokio::test]
    async fn test_recovery_needs_five_consecutive_successes() {
        let registry = Arc::new(FakeRegistry::new());
        let ctl = controller(Arc::clone(&registry));

        for _ in 0..3 {
            ctl.observe(down(), ok());
            ctl.tick().await;
        }
        assert_eq!(ctl.status().active, ActiveInstance::Backup);

        // Four successes are not enough; a relapse resets the streak.
        for _ in 0..4 {
            ctl.observe(ok(), ok());
            ctl.tick().await;
        }
        assert_eq!(ctl.status().active, ActiveInstance::Backup);
        ctl.observe(down(), ok());
        ctl.tick().await;
        assert_eq!(ctl.status().active, ActiveInstance::Backup);

        for _ in 0..5 {
            ctl.observe(ok(), ok());
            ctl.tick().await;
        }
        let status = ctl.status();
        assert_eq!(status.active, ActiveInstance::Primary);
        assert_eq!(
            status.events.last().unwrap().direction,
            TransitionDirection::Recovery
        );
    }

    #[tokio::test]
    async fn test_failed_registry_update_keeps_active_and_retries() {
        let registry = Arc::new(FakeRegistry::new());
        registry.fail.store(true, Ordering::SeqCst);
        let ctl = controller(Arc::clone(&registry));

        for _ in 0..3 {
            ctl.observe(down(), ok());
            ctl.tick().await;
        }

        let status = ctl.status();
        assert_eq!(status.active, ActiveInstance::Primary);
        assert!(!status.events.is_empty());
        assert!(status.events.iter().all(|e| !e.success));

        // Registry comes back; the next qualifying cycle completes it.
        registry.fail.store(false, Ordering::SeqCst);
        ctl.observe(down(), ok());
        ctl.tick().await;
        assert_eq!(ctl.status().active, ActiveInstance::Backup);
    }

    #[tokio::test]
    async fn test_manual_trigger_idempotent() {
        let registry = Arc::new(FakeRegistry::new());
        let ctl = controller(Arc::clone(&registry));

        assert_eq!(
            ctl.trigger_failover("maintenance").await,
            ManualOutcome::Transitioned
        );
        assert_eq!(ctl.status().active, ActiveInstance::Backup);

        // Triggering again while backup is active changes nothing.
        assert_eq!(
            ctl.trigger_failover("maintenance").await,
            ManualOutcome::AlreadyActive
        );
        assert_eq!(registry.calls.load(Ordering::SeqCst), 1);

        assert_eq!(
            ctl.trigger_recovery("maintenance over").await,
            ManualOutcome::Transitioned
        );
        assert_eq!(ctl.status().active, ActiveInstance::Primary);
        assert_eq!(
            ctl.trigger_recovery("maintenance over").await,
            ManualOutcome::AlreadyActive
        );
    }

    #[tokio::test]
    async fn test_event_log_written_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let registry = Arc::new(FakeRegistry::new());
        let ctl = Controller::new(
            ControllerConfig {
                primary_health_url: "http://primary/health".into(),
                backup_health_url: "http://backup/health".into(),
                primary_webhook_url: "http://primary/webhook/deploy".into(),
                backup_webhook_url: "http://backup/webhook/deploy".into(),
                failover_threshold: 3,
                recovery_threshold: 5,
            },
            registry,
            Some(path.clone()),
        );

        ctl.trigger_failover("drill").await;
        ctl.trigger_recovery("drill over").await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["direction"], "failover");
        assert_eq!(first["reason"], "drill");
        assert_eq!(first["success"], true);
    }
}
