//! Rolling request metrics.
//!
//! The [`MetricStore`] is the single concurrency-safe owner of all request
//! counters. Request handlers and the periodic consolidation task call
//! [`MetricStore::record`]; status endpoints call [`MetricStore::report`]
//! to take a consistent point-in-time view.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of request durations kept in the sliding window.
const DURATION_WINDOW: usize = 100;

/// Event-type buckets for per-event counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Provider ping event.
    Ping,
    /// Upstream build completed (the deployment trigger).
    WorkflowCompletion,
    /// Any other event type; accepted but unsupported.
    Other,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::WorkflowCompletion => "workflow_completion",
            Self::Other => "other",
        }
    }
}

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Authentication,
    MalformedPayload,
    Processing,
    Network,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::MalformedPayload => "malformed_payload",
            Self::Processing => "processing",
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

/// One completed request, as seen by the metrics collector.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    /// Processing duration.
    pub duration: Duration,
    /// Whether the request was handled successfully.
    pub success: bool,
    /// Whether signature verification passed.
    pub auth_ok: bool,
    /// Event-type bucket.
    pub event_kind: EventKind,
    /// Failure category, present when `success` is false.
    pub error_category: Option<ErrorCategory>,
}

impl RequestOutcome {
    /// Outcome for a successfully handled request.
    pub fn success(duration: Duration, event_kind: EventKind) -> Self {
        Self {
            duration,
            success: true,
            auth_ok: true,
            event_kind,
            error_category: None,
        }
    }

    /// Outcome for a failed request.
    pub fn failure(duration: Duration, event_kind: EventKind, category: ErrorCategory) -> Self {
        Self {
            duration,
            success: false,
            auth_ok: !matches!(category, ErrorCategory::Authentication),
            event_kind,
            error_category: Some(category),
        }
    }
}

/// Overall service status derived from error and auth rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Connectivity classification for the upstream provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Connection-health view of the upstream provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub status: ConnectivityStatus,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Immutable point-in-time view of the metric window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub generated_at: DateTime<Utc>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub auth_failures: u64,
    /// Fraction of requests that failed, 0.0..=1.0.
    pub error_rate: f64,
    /// Fraction of requests that passed signature verification, 0.0..=1.0.
    pub auth_success_rate: f64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub requests_by_event: BTreeMap<String, u64>,
    pub errors_by_category: BTreeMap<String, u64>,
    pub connection: ConnectionReport,
    pub service_status: ServiceStatus,
}

#[derive(Debug, Default)]
struct MetricWindow {
    durations: VecDeque<Duration>,
    total: u64,
    successful: u64,
    failed: u64,
    auth_failures: u64,
    by_event: BTreeMap<EventKind, u64>,
    by_category: BTreeMap<ErrorCategory, u64>,
    consecutive_failures: u32,
    last_success_at: Option<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
}

/// Concurrency-safe request metrics store.
#[derive(Debug, Default)]
pub struct MetricStore {
    inner: Mutex<MetricWindow>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed request.
    ///
    /// # Panics
    ///
    /// Panics if the interior lock is poisoned.
    pub fn record(&self, outcome: &RequestOutcome) {
        let mut w = self.inner.lock().expect("metric store lock poisoned");

        w.total += 1;
        if outcome.success {
            w.successful += 1;
            w.consecutive_failures = 0;
            w.last_success_at = Some(Utc::now());
        } else {
            w.failed += 1;
            w.consecutive_failures += 1;
            w.last_failure_at = Some(Utc::now());
        }
        if !outcome.auth_ok {
            w.auth_failures += 1;
        }

        *w.by_event.entry(outcome.event_kind).or_insert(0) += 1;
        if let Some(category) = outcome.error_category {
            *w.by_category.entry(category).or_insert(0) += 1;
        }

        w.durations.push_back(outcome.duration);
        while w.durations.len() > DURATION_WINDOW {
            w.durations.pop_front();
        }
    }

    /// Take a consistent snapshot of the window.
    ///
    /// # Panics
    ///
    /// Panics if the interior lock is poisoned.
    pub fn report(&self) -> MetricsReport {
        let w = self.inner.lock().expect("metric store lock poisoned");

        let error_rate = if w.total == 0 {
            0.0
        } else {
            w.failed as f64 / w.total as f64
        };
        let auth_success_rate = if w.total == 0 {
            1.0
        } else {
            (w.total - w.auth_failures) as f64 / w.total as f64
        };

        let mut sorted_ms: Vec<f64> = w
            .durations
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        sorted_ms.sort_by(|a, b| a.total_cmp(b));

        let average_latency_ms = if sorted_ms.is_empty() {
            0.0
        } else {
            sorted_ms.iter().sum::<f64>() / sorted_ms.len() as f64
        };
        let p95_latency_ms = nearest_rank_p95(&sorted_ms);

        MetricsReport {
            generated_at: Utc::now(),
            total_requests: w.total,
            successful_requests: w.successful,
            failed_requests: w.failed,
            auth_failures: w.auth_failures,
            error_rate,
            auth_success_rate,
            average_latency_ms,
            p95_latency_ms,
            requests_by_event: w
                .by_event
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
            errors_by_category: w
                .by_category
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
            connection: ConnectionReport {
                status: connectivity_status(w.consecutive_failures),
                consecutive_failures: w.consecutive_failures,
                last_success_at: w.last_success_at,
                last_failure_at: w.last_failure_at,
            },
            service_status: service_status(error_rate, auth_success_rate, w.total),
        }
    }
}

/// Nearest-rank 95th percentile over a sorted sample: index
/// `floor(0.95 * len)`, no interpolation.
pub(crate) fn nearest_rank_p95(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * 0.95).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Connectivity bucketing: healthy at 0-2 consecutive failures, degraded
/// at 3-4, unhealthy at 5 or more.
fn connectivity_status(consecutive_failures: u32) -> ConnectivityStatus {
    match consecutive_failures {
        0..=2 => ConnectivityStatus::Healthy,
        3 | 4 => ConnectivityStatus::Degraded,
        _ => ConnectivityStatus::Unhealthy,
    }
}

/// Derive overall status from error rate and auth success rate; the worse
/// of the two dominates.
fn service_status(error_rate: f64, auth_success_rate: f64, total: u64) -> ServiceStatus {
    if total == 0 {
        return ServiceStatus::Healthy;
    }

    let from_errors = if error_rate > 0.25 {
        ServiceStatus::Unhealthy
    } else if error_rate > 0.10 {
        ServiceStatus::Degraded
    } else {
        ServiceStatus::Healthy
    };

    let from_auth = if auth_success_rate < 0.80 {
        ServiceStatus::Unhealthy
    } else if auth_success_rate < 0.95 {
        ServiceStatus::Degraded
    } else {
        ServiceStatus::Healthy
    };

    from_errors.max(from_auth)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(ms: u64) -> RequestOutcome {
        RequestOutcome::success(Duration::from_millis(ms), EventKind::Ping)
    }

    fn failed(category: ErrorCategory) -> RequestOutcome {
        RequestOutcome::failure(Duration::from_millis(10), EventKind::Other, category)
    }

    #[test]
    fn test_p95_nearest_rank() {
        let store = MetricStore::new();
        for ms in [120, 150, 89, 203, 156, 134, 98, 167, 178, 142] {
            store.record(&ok(ms));
        }
        let report = store.report();
        // index floor(10 * 0.95) = 9 of the sorted sample, i.e. the maximum
        assert!((report.p95_latency_ms - 203.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_average_latency() {
        let store = MetricStore::new();
        store.record(&ok(100));
        store.record(&ok(200));
        let report = store.report();
        assert!((report.average_latency_ms - 150.0).abs() < 0.001);
    }

    #[test]
    fn test_duration_window_bounded() {
        let store = MetricStore::new();
        for _ in 0..250 {
            store.record(&ok(10));
        }
        let w = store.inner.lock().unwrap();
        assert_eq!(w.durations.len(), DURATION_WINDOW);
        assert_eq!(w.total, 250);
    }

    #[test]
    fn test_error_rate_healthy_at_two_percent() {
        let store = MetricStore::new();
        for _ in 0..98 {
            store.record(&ok(10));
        }
        for _ in 0..2 {
            store.record(&failed(ErrorCategory::Processing));
        }
        assert_eq!(store.report().service_status, ServiceStatus::Healthy);
    }

    #[test]
    fn test_error_rate_degraded_at_twelve_percent() {
        let store = MetricStore::new();
        for _ in 0..44 {
            store.record(&ok(10));
        }
        for _ in 0..6 {
            store.record(&failed(ErrorCategory::Processing));
        }
        assert_eq!(store.report().service_status, ServiceStatus::Degraded);
    }

    #[test]
    fn test_error_rate_unhealthy_at_thirty_percent() {
        let store = MetricStore::new();
        for _ in 0..35 {
            store.record(&ok(10));
        }
        for _ in 0..15 {
            store.record(&failed(ErrorCategory::Processing));
        }
        assert_eq!(store.report().service_status, ServiceStatus::Unhealthy);
    }

    #[test]
    fn test_auth_rate_dominates_when_worse() {
        let store = MetricStore::new();
        // 10/50 auth failures: auth success rate 0.80 exactly is degraded,
        // error rate 20% is also degraded; push auth below 0.80.
        for _ in 0..38 {
            store.record(&ok(10));
        }
        for _ in 0..12 {
            store.record(&failed(ErrorCategory::Authentication));
        }
        let report = store.report();
        assert!(report.auth_success_rate < 0.80);
        assert_eq!(report.service_status, ServiceStatus::Unhealthy);
    }

    #[test]
    fn test_connection_health_buckets() {
        assert_eq!(connectivity_status(0), ConnectivityStatus::Healthy);
        assert_eq!(connectivity_status(2), ConnectivityStatus::Healthy);
        assert_eq!(connectivity_status(3), ConnectivityStatus::Degraded);
        assert_eq!(connectivity_status(4), ConnectivityStatus::Degraded);
        assert_eq!(connectivity_status(5), ConnectivityStatus::Unhealthy);
    }

    #[test]
    fn test_consecutive_failures_reset_on_success() {
        let store = MetricStore::new();
        store.record(&failed(ErrorCategory::Network));
        store.record(&failed(ErrorCategory::Network));
        assert_eq!(store.report().connection.consecutive_failures, 2);
        store.record(&ok(10));
        assert_eq!(store.report().connection.consecutive_failures, 0);
    }

    #[test]
    fn test_per_event_and_category_counters() {
        let store = MetricStore::new();
        store.record(&RequestOutcome::success(
            Duration::from_millis(5),
            EventKind::WorkflowCompletion,
        ));
        store.record(&ok(5));
        store.record(&failed(ErrorCategory::MalformedPayload));
        let report = store.report();
        assert_eq!(report.requests_by_event.get("ping"), Some(&1));
        assert_eq!(report.requests_by_event.get("workflow_completion"), Some(&1));
        assert_eq!(report.requests_by_event.get("other"), Some(&1));
        assert_eq!(report.errors_by_category.get("malformed_payload"), Some(&1));
    }

    #[test]
    fn test_empty_store_reports_healthy() {
        let report = MetricStore::new().report();
        assert_eq!(report.service_status, ServiceStatus::Healthy);
        assert!((report.auth_success_rate - 1.0).abs() < f64::EPSILON);
        assert!(report.p95_latency_ms.abs() < f64::EPSILON);
    }
}
