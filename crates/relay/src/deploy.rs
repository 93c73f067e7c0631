//! Deployment orchestration state machine.
//!
//! At most one deployment is in flight at a time: the trigger path reserves
//! the state machine under its lock, so a trigger arriving while a
//! deployment runs is accepted but recorded as a no-op. Each phase is
//! broadcast to observers, and failures roll back to the previous container
//! set best-effort.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::process::Command;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::actions::{kinds, ActionLog};
use crate::broadcast::{Broadcaster, NotificationMessage};
use crate::error::RelayError;

/// Deployment state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    Idle,
    Notifying,
    Stopping,
    Pulling,
    Starting,
    HealthChecking,
    Succeeded,
    Failed,
    RollingBack,
}

/// One deployment attempt. Terminal runs are immutable history.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentRun {
    pub id: Uuid,
    pub version: String,
    pub state: DeployState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

/// Container operations the state machine depends on. The production
/// implementation shells out to the compose CLI; tests script it.
#[async_trait]
pub trait ContainerOrchestrator: Send + Sync {
    async fn stop(&self) -> Result<(), RelayError>;
    async fn pull(&self) -> Result<(), RelayError>;
    async fn start(&self) -> Result<(), RelayError>;
    async fn health_check(&self) -> Result<(), RelayError>;
}

/// Docker compose driven container operations.
pub struct ComposeOrchestrator {
    compose_file: String,
    project: String,
    health_url: String,
    client: reqwest::Client,
}

impl ComposeOrchestrator {
    pub fn new(compose_file: &str, project: &str, health_url: &str) -> Self {
        Self {
            compose_file: compose_file.to_string(),
            project: project.to_string(),
            health_url: health_url.to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn compose(&self, args: &[&str]) -> Result<(), RelayError> {
        let output = Command::new("docker")
            .arg("compose")
            .args(["-f", &self.compose_file, "-p", &self.project])
            .args(args)
            .output()
            .await
            .map_err(|e| RelayError::Processing(format!("failed to run docker compose: {e}")))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(RelayError::Deployment(format!(
                "docker compose {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl ContainerOrchestrator for ComposeOrchestrator {
    async fn stop(&self) -> Result<(), RelayError> {
        self.compose(&["down"]).await
    }

    async fn pull(&self) -> Result<(), RelayError> {
        self.compose(&["pull"]).await
    }

    async fn start(&self) -> Result<(), RelayError> {
        self.compose(&["up", "-d"]).await
    }

    async fn health_check(&self) -> Result<(), RelayError> {
        let response = self
            .client
            .get(&self.health_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(RelayError::Deployment(format!(
                "application health check returned {}",
                response.status()
            )))
        }
    }
}

/// Result of a deployment trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Deployment accepted and running in the background.
    Initiated { id: Uuid, version: String },
    /// A deployment is already in flight; this trigger is a no-op.
    AlreadyInFlight,
}

#[derive(Debug)]
struct OrchestratorState {
    state: DeployState,
    current: Option<DeploymentRun>,
    last: Option<DeploymentRun>,
}

/// The redeploy state machine.
pub struct Orchestrator {
    inner: Mutex<OrchestratorState>,
    containers: Arc<dyn ContainerOrchestrator>,
    broadcaster: Arc<Broadcaster>,
    actions: Arc<dyn ActionLog>,
    pre_stop_grace: Duration,
    post_start_grace: Duration,
}

impl Orchestrator {
    pub fn new(
        containers: Arc<dyn ContainerOrchestrator>,
        broadcaster: Arc<Broadcaster>,
        actions: Arc<dyn ActionLog>,
        pre_stop_grace: Duration,
        post_start_grace: Duration,
    ) -> Self {
        Self {
            inner: Mutex::new(OrchestratorState {
                state: DeployState::Idle,
                current: None,
                last: None,
            }),
            containers,
            broadcaster,
            actions,
            pre_stop_grace,
            post_start_grace,
        }
    }

    /// Try to start a deployment for `version`.
    ///
    /// Reserves the state machine synchronously; the deployment itself runs
    /// in a background task and reports through notifications and the
    /// action log.
    ///
    /// # Panics
    ///
    /// Panics if the state lock is poisoned.
    pub fn trigger(self: &Arc<Self>, version: &str) -> TriggerOutcome {
        let run = {
            let mut inner = self.inner.lock().expect("orchestrator lock poisoned");
            if inner.state != DeployState::Idle {
                info!(
                    version,
                    state = ?inner.state,
                    "Deployment already in flight; trigger is a no-op"
                );
                return TriggerOutcome::AlreadyInFlight;
            }
            let run = DeploymentRun {
                id: Uuid::new_v4(),
                version: version.to_string(),
                state: DeployState::Notifying,
                started_at: Utc::now(),
                ended_at: None,
                failure_reason: None,
            };
            inner.state = DeployState::Notifying;
            inner.current = Some(run.clone());
            run
        };

        info!(version = %run.version, deployment_id = %run.id, "Deployment initiated");
        let this = Arc::clone(self);
        let version = run.version.clone();
        let id = run.id;
        tokio::spawn(async move {
            this.run_once(&version).await;
        });

        TriggerOutcome::Initiated {
            id,
            version: run.version,
        }
    }

    /// Run one full deployment to completion, including failure handling
    /// and rollback. Assumes the state machine was already reserved by
    /// [`Orchestrator::trigger`] (or reserves it itself when called
    /// directly with the machine idle).
    pub async fn run_once(&self, version: &str) {
        // Direct callers (tests, manual tooling) may not have reserved.
        {
            let mut inner = self.inner.lock().expect("orchestrator lock poisoned");
            if inner.state == DeployState::Idle {
                inner.state = DeployState::Notifying;
                inner.current = Some(DeploymentRun {
                    id: Uuid::new_v4(),
                    version: version.to_string(),
                    state: DeployState::Notifying,
                    started_at: Utc::now(),
                    ended_at: None,
                    failure_reason: None,
                });
            }
        }

        match self.execute(version).await {
            Ok(()) => {
                self.set_state(DeployState::Succeeded);
                self.broadcaster.broadcast(&NotificationMessage::success(
                    format!("Update to {version} completed"),
                ));
                self.actions
                    .append(kinds::DEPLOYMENT_SUCCESS, json!({ "version": version }))
                    .await;
                info!(version, "Deployment succeeded");
                self.finish(None);
            }
            Err(e) => {
                self.set_state(DeployState::Failed);
                error!(version, error = %e, "Deployment failed");
                self.actions
                    .append(
                        kinds::DEPLOYMENT_FAILED,
                        json!({ "version": version, "reason": e.to_string() }),
                    )
                    .await;
                self.broadcaster.broadcast(&NotificationMessage::error(
                    format!("Deployment of {version} failed: {e}"),
                ));

                // Best-effort restart of the previous container set.
                self.set_state(DeployState::RollingBack);
                if let Err(rollback_err) = self.containers.start().await {
                    error!(
                        version,
                        error = %rollback_err,
                        "Rollback failed; operator intervention required"
                    );
                    self.actions
                        .append(
                            kinds::ROLLBACK_FAILED,
                            json!({ "version": version, "reason": rollback_err.to_string() }),
                        )
                        .await;
                }
                self.finish(Some(e.to_string()));
            }
        }
    }

    async fn execute(&self, version: &str) -> Result<(), RelayError> {
        self.broadcaster.broadcast(&NotificationMessage::warning(
            format!("Maintenance starting: updating to {version}"),
        ));
        tokio::time::sleep(self.pre_stop_grace).await;

        self.set_state(DeployState::Stopping);
        if let Err(e) = self.containers.stop().await {
            // Nothing running is not fatal; the old set may already be gone.
            warn!(version, error = %e, "Stop failed; continuing with deployment");
        }

        self.set_state(DeployState::Pulling);
        self.containers.pull().await?;

        self.set_state(DeployState::Starting);
        self.containers.start().await?;
        tokio::time::sleep(self.post_start_grace).await;

        self.set_state(DeployState::HealthChecking);
        self.containers.health_check().await?;

        Ok(())
    }

    fn set_state(&self, state: DeployState) {
        let mut inner = self.inner.lock().expect("orchestrator lock poisoned");
        inner.state = state;
        if let Some(run) = inner.current.as_mut() {
            run.state = state;
        }
    }

    /// Move the finished run into history and return to idle.
    fn finish(&self, failure_reason: Option<String>) {
        let mut inner = self.inner.lock().expect("orchestrator lock poisoned");
        if let Some(mut run) = inner.current.take() {
            run.ended_at = Some(Utc::now());
            run.failure_reason = failure_reason;
            run.state = inner.state;
            inner.last = Some(run);
        }
        inner.state = DeployState::Idle;
    }

    /// Consistent snapshot of the state machine for status endpoints.
    ///
    /// # Panics
    ///
    /// Panics if the state lock is poisoned.
    pub fn status(&self) -> (DeployState, Option<DeploymentRun>, Option<DeploymentRun>) {
        let inner = self.inner.lock().expect("orchestrator lock poisoned");
        (inner.state, inner.current.clone(), inner.last.clone())
    }
}
