//! Configuration for the relay, sourced from the environment.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,
    /// WebSocket notification port.
    pub ws_port: u16,
    /// Webhook signing secret for signature verification.
    pub webhook_secret: Option<String>,
    /// Grace period before stopping containers (clients get to prepare).
    pub pre_stop_grace: Duration,
    /// Grace period after starting containers before the health check.
    pub post_start_grace: Duration,
    /// Docker compose file driving the deployment.
    pub compose_file: String,
    /// Docker compose project name.
    pub compose_project: String,
    /// The application's own health endpoint, polled after restart.
    pub app_health_url: String,
    /// Metrics consolidation interval.
    pub consolidation_interval: Duration,
    /// Snapshot capture interval.
    pub snapshot_interval: Duration,
    /// Snapshot persistence interval.
    pub persist_interval: Duration,
    /// Snapshot history file.
    pub history_path: PathBuf,
    /// Action log file.
    pub action_log_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: env_parse("RELAY_PORT", 8745),
            ws_port: env_parse("RELAY_WS_PORT", 8746),
            webhook_secret: env::var("RELAY_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            pre_stop_grace: Duration::from_secs(env_parse("RELAY_PRE_STOP_GRACE_SECS", 5)),
            post_start_grace: Duration::from_secs(env_parse("RELAY_POST_START_GRACE_SECS", 10)),
            compose_file: env::var("RELAY_COMPOSE_FILE")
                .unwrap_or_else(|_| "docker-compose.yml".to_string()),
            compose_project: env::var("RELAY_COMPOSE_PROJECT")
                .unwrap_or_else(|_| "app".to_string()),
            app_health_url: env::var("RELAY_APP_HEALTH_URL")
                .unwrap_or_else(|_| "http://localhost:8080/health".to_string()),
            consolidation_interval: Duration::from_secs(env_parse(
                "RELAY_CONSOLIDATION_INTERVAL_SECS",
                30,
            )),
            snapshot_interval: Duration::from_secs(env_parse("RELAY_SNAPSHOT_INTERVAL_SECS", 60)),
            persist_interval: Duration::from_secs(env_parse("RELAY_PERSIST_INTERVAL_SECS", 300)),
            history_path: env::var("RELAY_HISTORY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/metrics-history.json")),
            action_log_path: env::var("RELAY_ACTION_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/actions.jsonl")),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
