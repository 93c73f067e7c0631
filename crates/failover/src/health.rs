//! Relay instance health probing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

/// Last-known status of one relay instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// No probe has completed yet.
    Unknown,
    Healthy,
    Unhealthy,
}

/// Rolling health record for a single relay instance.
#[derive(Debug, Clone, Serialize)]
pub struct ServerHealthRecord {
    pub url: String,
    pub status: InstanceStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<u64>,
}

impl ServerHealthRecord {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: InstanceStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_check_at: None,
            last_failure_at: None,
            last_latency_ms: None,
        }
    }

    /// Record a successful probe with its observed latency.
    pub fn record_success(&mut self, latency_ms: u64) {
        self.status = InstanceStatus::Healthy;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
        self.last_check_at = Some(Utc::now());
        self.last_latency_ms = Some(latency_ms);
    }

    /// Record a failed probe (non-2xx, timeout, or connection error).
    pub fn record_failure(&mut self) {
        self.status = InstanceStatus::Unhealthy;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        let now = Utc::now();
        self.last_check_at = Some(now);
        self.last_failure_at = Some(now);
        self.last_latency_ms = None;
    }

    pub fn is_healthy(&self) -> bool {
        self.status == InstanceStatus::Healthy
    }
}

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub healthy: bool,
    pub latency_ms: u64,
}

/// HTTP health prober with a hard per-probe timeout.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: Client,
}

impl HealthProbe {
    /// Create a prober; `timeout` bounds every individual probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create probe client: {e}"))?;
        Ok(Self { client })
    }

    /// Probe one instance's health endpoint. Any transport error or non-2xx
    /// response counts as a failure.
    pub async fn probe(&self, url: &str) -> ProbeResult {
        let started = std::time::Instant::now();
        let healthy = match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(url = %url, error = %e, "Health probe failed");
                false
            }
        };
        ProbeResult {
            healthy,
            latency_ms: started.elapsed().as_millis() as u64,
        }
    }
}
