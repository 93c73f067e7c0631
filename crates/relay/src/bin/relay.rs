//! Deployment webhook relay server.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use relay::actions::{kinds, ActionLog, FileActionLog};
use relay::broadcast::Broadcaster;
use relay::config::Config;
use relay::deploy::{ComposeOrchestrator, Orchestrator};
use relay::server::{build_router, AppState};
use relay::tasks::{run_shutdown, shutdown_signal, spawn_background_tasks};
use relay::ws::ws_router;
use telemetry::{AlertManager, AlertThresholds, MetricStore, SnapshotStore, SystemProbe};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=info,telemetry=info,tower_http=info".into()),
        )
        .init();

    let config = Config::default();

    let webhook_secret = config
        .webhook_secret
        .clone()
        .context("RELAY_WEBHOOK_SECRET must be set; refusing to accept unsigned webhooks")?;

    let metrics = Arc::new(MetricStore::new());
    let alerts = Arc::new(AlertManager::new(AlertThresholds::default()));
    let history = Arc::new(SnapshotStore::new(
        config.history_path.clone(),
        telemetry::history::DEFAULT_CAPACITY,
    ));
    match history.load().await {
        Ok(count) => info!(snapshots = count, "Loaded metric history"),
        Err(e) => warn!(error = %e, "Could not load metric history; starting fresh"),
    }

    let broadcaster = Arc::new(Broadcaster::new());
    let actions: Arc<dyn ActionLog> = Arc::new(FileActionLog::new(config.action_log_path.clone()));
    let containers = Arc::new(ComposeOrchestrator::new(
        &config.compose_file,
        &config.compose_project,
        &config.app_health_url,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        containers,
        Arc::clone(&broadcaster),
        Arc::clone(&actions),
        config.pre_stop_grace,
        config.post_start_grace,
    ));

    let state = AppState {
        webhook_secret,
        metrics,
        alerts,
        history,
        broadcaster: Arc::clone(&broadcaster),
        orchestrator,
        started_at: Utc::now(),
    };

    actions
        .append(
            kinds::SERVER_START,
            serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }),
        )
        .await;

    let probe = Arc::new(SystemProbe::new());
    let background = spawn_background_tasks(&state, &config, probe, Arc::clone(&actions));

    let http_addr = format!("0.0.0.0:{}", config.port);
    let http_listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("failed to bind {http_addr}"))?;
    info!(addr = %http_addr, "Webhook relay listening");

    let ws_addr = format!("0.0.0.0:{}", config.ws_port);
    let ws_listener = tokio::net::TcpListener::bind(&ws_addr)
        .await
        .with_context(|| format!("failed to bind {ws_addr}"))?;
    info!(addr = %ws_addr, "Notification listener on /ws");

    let http_router = build_router(state.clone());
    let ws = ws_router(Arc::clone(&broadcaster));

    tokio::select! {
        result = axum::serve(http_listener, http_router) => {
            result.context("webhook server exited")?;
        }
        result = axum::serve(ws_listener, ws) => {
            result.context("notification server exited")?;
        }
        () = shutdown_signal() => {}
    }

    for handle in background {
        handle.abort();
    }
    run_shutdown(&state, actions.as_ref()).await;

    Ok(())
}
