//! Failover controller for the deploy relay.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use failover::controller::{Controller, ControllerConfig};
use failover::health::HealthProbe;
use failover::registry::GitHubWebhookRegistry;
use failover::server::admin_router;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Active/standby failover controller: probes both relay instances and
/// repoints the provider webhook at whichever one is healthy.
#[derive(Parser)]
#[command(name = "failover")]
#[command(about = "Relay failover controller - health probing and webhook endpoint repointing")]
#[command(version)]
struct Cli {
    /// Health endpoint of the primary relay
    #[arg(long, env = "FAILOVER_PRIMARY_HEALTH_URL")]
    primary_health_url: String,

    /// Health endpoint of the backup relay
    #[arg(long, env = "FAILOVER_BACKUP_HEALTH_URL")]
    backup_health_url: String,

    /// Webhook target registered while primary is active
    #[arg(long, env = "FAILOVER_PRIMARY_WEBHOOK_URL")]
    primary_webhook_url: String,

    /// Webhook target registered while backup is active
    #[arg(long, env = "FAILOVER_BACKUP_WEBHOOK_URL")]
    backup_webhook_url: String,

    /// GitHub token used to manage the repository webhook
    #[arg(long, env = "FAILOVER_GITHUB_TOKEN")]
    github_token: String,

    /// Repository whose webhook is managed (owner/repo)
    #[arg(long, env = "FAILOVER_GITHUB_REPO")]
    github_repo: String,

    /// Probe interval in seconds
    #[arg(long, env = "FAILOVER_PROBE_INTERVAL_SECS", default_value = "2")]
    probe_interval: u64,

    /// Per-probe timeout in seconds
    #[arg(long, env = "FAILOVER_PROBE_TIMEOUT_SECS", default_value = "4")]
    probe_timeout: u64,

    /// Consecutive primary failures before failover
    #[arg(long, env = "FAILOVER_THRESHOLD", default_value = "3")]
    failover_threshold: u32,

    /// Consecutive primary successes before recovery
    #[arg(long, env = "FAILOVER_RECOVERY_THRESHOLD", default_value = "5")]
    recovery_threshold: u32,

    /// Admin HTTP port
    #[arg(long, env = "FAILOVER_ADMIN_PORT", default_value = "8747")]
    admin_port: u16,

    /// JSON-lines file for failover events
    #[arg(long, env = "FAILOVER_EVENTS_FILE", default_value = "data/failover-events.jsonl")]
    events_file: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "failover=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let registry = GitHubWebhookRegistry::new(&cli.github_token, &cli.github_repo)
        .context("failed to create webhook registry")?;
    let controller = Arc::new(Controller::new(
        ControllerConfig {
            primary_health_url: cli.primary_health_url.clone(),
            backup_health_url: cli.backup_health_url.clone(),
            primary_webhook_url: cli.primary_webhook_url,
            backup_webhook_url: cli.backup_webhook_url,
            failover_threshold: cli.failover_threshold,
            recovery_threshold: cli.recovery_threshold,
        },
        Arc::new(registry),
        Some(cli.events_file),
    ));

    let probe = HealthProbe::new(Duration::from_secs(cli.probe_timeout))
        .context("failed to create health probe")?;

    let admin_addr = format!("0.0.0.0:{}", cli.admin_port);
    let listener = tokio::net::TcpListener::bind(&admin_addr)
        .await
        .with_context(|| format!("failed to bind {admin_addr}"))?;
    info!(addr = %admin_addr, "Failover admin surface listening");

    let admin = admin_router(Arc::clone(&controller));
    let admin_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, admin).await {
            error!(error = %e, "Admin server exited");
        }
    });

    info!(
        primary = %cli.primary_health_url,
        backup = %cli.backup_health_url,
        interval_secs = cli.probe_interval,
        "Probe loop starting"
    );

    // Sequential loop: a probe outliving the cadence delays the next tick
    // rather than stacking concurrent probes.
    let mut ticker = tokio::time::interval(Duration::from_secs(cli.probe_interval));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (primary, backup) = tokio::join!(
                    probe.probe(&cli.primary_health_url),
                    probe.probe(&cli.backup_health_url),
                );
                controller.observe(primary, backup);
                controller.tick().await;
            }
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for shutdown signal")?;
                break;
            }
        }
    }

    info!("Shutting down");
    admin_task.abort();
    Ok(())
}
