//! Background maintenance loops and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use telemetry::{Alert, AlertKind, AlertSeverity, MetricSnapshot, NotificationChannel, SystemProbe};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::actions::{kinds, ActionLog};
use crate::broadcast::{Broadcaster, NotificationMessage};
use crate::config::Config;
use crate::deploy::{DeployState, Orchestrator};
use crate::server::AppState;

/// Maximum time shutdown waits for an in-flight deployment to finish.
const DEPLOY_DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

/// Spawn the periodic consolidation, snapshot, and persistence loops.
pub fn spawn_background_tasks(
    state: &AppState,
    config: &Config,
    probe: Arc<SystemProbe>,
    actions: Arc<dyn ActionLog>,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_consolidation(state.clone(), actions, config.consolidation_interval),
        spawn_snapshots(state.clone(), probe, config.snapshot_interval),
        spawn_persistence(state.clone(), config.persist_interval),
    ]
}

/// Evaluate alert conditions against current metrics and deliver any newly
/// raised alerts over the configured notification channels.
fn spawn_consolidation(
    state: AppState,
    actions: Arc<dyn ActionLog>,
    period: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = state.metrics.report();
            let raised = state.alerts.evaluate(&report);
            let channels = state.alerts.thresholds().channels;
            notify_alerts(&raised, &channels, &state.broadcaster, actions.as_ref()).await;
            debug!(
                total_requests = report.total_requests,
                error_rate = report.error_rate,
                status = ?report.service_status,
                new_alerts = raised.len(),
                "Consolidation cycle complete"
            );
        }
    })
}

/// Deliver newly raised alerts over each configured channel.
async fn notify_alerts(
    raised: &[Alert],
    channels: &[NotificationChannel],
    broadcaster: &Broadcaster,
    actions: &dyn ActionLog,
) {
    for alert in raised {
        warn!(
            kind = ?alert.kind,
            severity = ?alert.severity,
            message = %alert.message,
            "Alert raised"
        );
        if channels.contains(&NotificationChannel::Websocket) {
            let notification = match alert.severity {
                AlertSeverity::Critical => NotificationMessage::error(alert.message.as_str()),
                AlertSeverity::Warning => NotificationMessage::warning(alert.message.as_str()),
            };
            broadcaster.broadcast(&notification);
        }
        if channels.contains(&NotificationChannel::ActionLog) {
            actions
                .append(
                    kinds::ALERT_RAISED,
                    json!({
                        "kind": alert.kind,
                        "severity": alert.severity,
                        "message": alert.message,
                    }),
                )
                .await;
        }
    }
}

/// Capture periodic snapshots of metrics and host resource usage.
fn spawn_snapshots(
    state: AppState,
    probe: Arc<SystemProbe>,
    period: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            state.history.record(MetricSnapshot {
                captured_at: Utc::now(),
                metrics: state.metrics.report(),
                system: probe.read(),
            });
        }
    })
}

/// Flush snapshot history to disk on a slow cadence.
fn spawn_persistence(state: AppState, period: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = state.history.persist().await {
                error!(error = %e, "Failed to persist metric history");
            }
        }
    })
}

/// Resolves when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Wait for an in-flight deployment to return the state machine to idle.
///
/// Returns `true` once the machine is idle, `false` if `timeout` elapsed
/// with the run still going.
pub async fn drain_deployment(orchestrator: &Orchestrator, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while orchestrator.status().0 != DeployState::Idle {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    true
}

/// Orderly shutdown: raise a shutdown alert, tell connected observers,
/// let any in-flight deployment run to completion, flush history, and
/// record the event in the action log.
pub async fn run_shutdown(state: &AppState, actions: &dyn ActionLog) {
    info!("Shutdown signal received; draining");

    state.alerts.raise(
        AlertKind::SystemShutdown,
        AlertSeverity::Warning,
        "relay service shutting down",
    );
    state
        .broadcaster
        .broadcast(&NotificationMessage::warning("service shutting down"));

    if !drain_deployment(&state.orchestrator, DEPLOY_DRAIN_TIMEOUT).await {
        warn!(
            timeout_secs = DEPLOY_DRAIN_TIMEOUT.as_secs(),
            "In-flight deployment did not finish before the shutdown timeout"
        );
    }

    if let Err(e) = state.history.persist().await {
        error!(error = %e, "Final history persist failed");
    }

    actions
        .append(
            kinds::SERVER_SHUTDOWN,
            serde_json::json!({ "uptime_secs": (Utc::now() - state.started_at).num_seconds() }),
        )
        .await;

    info!("Shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::NoopActionLog;
    use crate::deploy::ContainerOrchestrator;
    use crate::error::RelayError;
    use async_trait::async_trait;

    struct SlowContainers {
        pull_delay: Duration,
    }

    #[async_trait]
    impl ContainerOrchestrator for SlowContainers {
        async fn stop(&self) -> Result<(), RelayError> {
            Ok(())
        }

        async fn pull(&self) -> Result<(), RelayError> {
            tokio::time::sleep(self.pull_delay).await;
            Ok(())
        }

        async fn start(&self) -> Result<(), RelayError> {
            Ok(())
        }

        async fn health_check(&self) -> Result<(), RelayError> {
            Ok(())
        }
    }

    fn slow_orchestrator(pull_delay: Duration) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(
            Arc::new(SlowContainers { pull_delay }),
            Arc::new(Broadcaster::new()),
            Arc::new(NoopActionLog),
            Duration::ZERO,
            Duration::ZERO,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_lets_inflight_deployment_finish() {
        let orchestrator = slow_orchestrator(Duration::from_secs(30));
        orchestrator.trigger("a1b2c3d");

        assert!(drain_deployment(&orchestrator, Duration::from_secs(120)).await);
        let (state, current, last) = orchestrator.status();
        assert_eq!(state, DeployState::Idle);
        assert!(current.is_none());
        assert_eq!(last.unwrap().state, DeployState::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_timeout() {
        let orchestrator = slow_orchestrator(Duration::from_secs(600));
        orchestrator.trigger("a1b2c3d");

        assert!(!drain_deployment(&orchestrator, Duration::from_secs(5)).await);
        assert_ne!(orchestrator.status().0, DeployState::Idle);
    }

    #[derive(Default)]
    struct RecordingLog {
        kinds: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ActionLog for RecordingLog {
        async fn append(&self, kind: &str, _fields: serde_json::Value) {
            self.kinds.lock().unwrap().push(kind.to_string());
        }
    }

    fn sample_alert() -> Alert {
        telemetry::AlertManager::default().raise(
            AlertKind::ErrorRate,
            AlertSeverity::Warning,
            "error rate at 12.0%",
        )
    }

    #[tokio::test]
    async fn test_notify_respects_configured_channels() {
        let broadcaster = Broadcaster::new();
        let (id, mut rx) = broadcaster.subscribe();
        let log = RecordingLog::default();

        notify_alerts(
            &[sample_alert()],
            &[NotificationChannel::ActionLog],
            &broadcaster,
            &log,
        )
        .await;
        assert!(rx.try_recv().is_err());
        assert_eq!(*log.kinds.lock().unwrap(), [kinds::ALERT_RAISED]);

        notify_alerts(
            &[sample_alert()],
            &[NotificationChannel::Websocket],
            &broadcaster,
            &log,
        )
        .await;
        let delivered = rx.try_recv().unwrap();
        assert!(delivered.contains("error rate"));
        assert_eq!(log.kinds.lock().unwrap().len(), 1);

        broadcaster.unsubscribe(id);
    }
}
