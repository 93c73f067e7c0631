//! HTTP server for deployment webhooks and observability endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use telemetry::{
    AlertManager, AlertThresholds, EventKind, MetricStore, RequestOutcome, SnapshotStore,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broadcast::Broadcaster;
use crate::deploy::{Orchestrator, TriggerOutcome};
use crate::error::RelayError;
use crate::webhooks::{classify_event, verify_signature, WebhookHeaders, WorkflowRunEvent};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Webhook signing secret.
    pub webhook_secret: String,
    /// Request metrics store.
    pub metrics: Arc<MetricStore>,
    /// Alert manager.
    pub alerts: Arc<AlertManager>,
    /// Snapshot history.
    pub history: Arc<SnapshotStore>,
    /// Observer fan-out.
    pub broadcaster: Arc<Broadcaster>,
    /// Deployment state machine.
    pub orchestrator: Arc<Orchestrator>,
    /// Server start time, for uptime reporting.
    pub started_at: chrono::DateTime<Utc>,
}

/// Build the HTTP router for the relay service.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook/deploy", post(deploy_webhook_handler))
        .route("/health", get(health_check))
        .route("/webhook/health", get(webhook_health))
        .route("/webhook/metrics", get(webhook_metrics))
        .route("/webhook/alerts", get(webhook_alerts))
        .route(
            "/webhook/alerts/{id}/acknowledge",
            post(acknowledge_alert),
        )
        .route("/webhook/alerts/{id}/resolve", post(resolve_alert))
        .route("/webhook/alerts/config", post(update_alert_config))
        .route("/webhook/analytics/historical", get(historical_analytics))
        .route(
            "/webhook/analytics/usage-patterns",
            get(usage_pattern_analytics),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Structured webhook response body.
fn respond(status: StatusCode, kind: &str, message: &str) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({
            "message": message,
            "status": if status.is_success() { "ok" } else { "error" },
            "type": kind,
            "timestamp": Utc::now(),
        })),
    )
}

/// Record a rejected webhook attempt and produce its error response, with
/// status, category, and message all taken from the error itself.
fn reject(
    state: &AppState,
    elapsed: std::time::Duration,
    kind: EventKind,
    err: &RelayError,
) -> (StatusCode, Json<Value>) {
    state
        .metrics
        .record(&RequestOutcome::failure(elapsed, kind, err.category()));
    respond(err.status_code(), err.category().as_str(), &err.to_string())
}

/// Handle an inbound deployment webhook.
///
/// Order matters: the signature is verified over the exact raw bytes before
/// any payload parsing, and every attempt — including rejected ones — is
/// recorded as a metrics data point.
pub async fn deploy_webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let started = Instant::now();

    let parsed = WebhookHeaders::from_header_map(|name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    });
    let event_type = parsed.event_type.as_deref().unwrap_or("unknown");
    let delivery_id = parsed.delivery_id.as_deref().unwrap_or("unknown");
    let kind = classify_event(event_type);

    info!(
        event_type = %event_type,
        delivery_id = %delivery_id,
        "Received deployment webhook"
    );

    let signature_ok = parsed
        .signature
        .as_deref()
        .is_some_and(|sig| verify_signature(&body, sig, &state.webhook_secret));
    if !signature_ok {
        warn!(delivery_id = %delivery_id, "Webhook signature invalid or missing");
        let err = RelayError::Authentication("invalid or missing signature".to_string());
        return reject(&state, started.elapsed(), kind, &err);
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v @ Value::Object(_)) => v,
        _ => {
            warn!(delivery_id = %delivery_id, "Webhook body is not a JSON object");
            let err = RelayError::MalformedPayload("body must be a JSON object".to_string());
            return reject(&state, started.elapsed(), kind, &err);
        }
    };

    let response = match kind {
        EventKind::Ping => respond(StatusCode::OK, "pong", "pong"),
        EventKind::Other => {
            // Unrecognized event types are accepted, never rejected.
            info!(event_type = %event_type, "Unsupported event type; no action taken");
            respond(StatusCode::OK, "unsupported", "event type not supported")
        }
        EventKind::WorkflowCompletion => {
            let event: WorkflowRunEvent = match serde_json::from_value(payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(delivery_id = %delivery_id, error = %e, "Workflow payload missing required fields");
                    let err = RelayError::MalformedPayload(
                        "workflow payload missing run object or commit SHA".to_string(),
                    );
                    return reject(&state, started.elapsed(), kind, &err);
                }
            };

            if event.is_successful_completion() {
                let version = event.version();
                match state.orchestrator.trigger(&version) {
                    TriggerOutcome::Initiated { id, .. } => {
                        info!(version = %version, deployment_id = %id, "Deployment initiated from webhook");
                        respond(StatusCode::OK, "initiated", "deployment initiated")
                    }
                    TriggerOutcome::AlreadyInFlight => respond(
                        StatusCode::OK,
                        "in_progress",
                        "deployment already in progress",
                    ),
                }
            } else {
                respond(
                    StatusCode::OK,
                    "ignored",
                    "workflow run did not conclude successfully",
                )
            }
        }
    };

    state
        .metrics
        .record(&RequestOutcome::success(started.elapsed(), kind));
    response
}

/// Overall status plus per-service health.
async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let report = state.metrics.report();
    let (deploy_state, current, last) = state.orchestrator.status();

    Json(json!({
        "status": report.service_status,
        "services": {
            "webhook": {
                "status": report.service_status,
                "connection": report.connection,
            },
            "deployment": {
                "state": deploy_state,
                "current": current,
                "last": last,
            },
            "notifications": {
                "active_connections": state.broadcaster.active_count(),
                "connections_total": state.broadcaster.connections_total(),
                "messages_delivered": state.broadcaster.delivered_total(),
            },
            "history": {
                "snapshots": state.history.len(),
            },
        },
        "metrics": {
            "total_requests": report.total_requests,
            "error_rate": report.error_rate,
            "average_latency_ms": report.average_latency_ms,
            "p95_latency_ms": report.p95_latency_ms,
        },
        "timestamp": Utc::now(),
    }))
}

/// Health with environment/runtime detail.
async fn webhook_health(State(state): State<AppState>) -> Json<Value> {
    let report = state.metrics.report();
    let uptime_secs = (Utc::now() - state.started_at).num_seconds();

    Json(json!({
        "status": report.service_status,
        "metrics": report,
        "runtime": {
            "version": env!("CARGO_PKG_VERSION"),
            "started_at": state.started_at,
            "uptime_secs": uptime_secs,
        },
        "timestamp": Utc::now(),
    }))
}

/// Full metrics report with trend data.
async fn webhook_metrics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "metrics": state.metrics.report(),
        "trends": state.history.trends(),
        "timestamp": Utc::now(),
    }))
}

/// Active alerts, thresholds, and recent history.
async fn webhook_alerts(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "active": state.alerts.active_alerts(),
        "thresholds": state.alerts.thresholds(),
        "history": state.alerts.history(),
        "timestamp": Utc::now(),
    }))
}

#[derive(Debug, Deserialize)]
struct OperatorAction {
    /// Operator attribution.
    #[serde(default)]
    by: Option<String>,
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(action): Json<OperatorAction>,
) -> (StatusCode, Json<Value>) {
    let by = action.by.as_deref().unwrap_or("operator");
    match state.alerts.acknowledge(id, by) {
        Ok(alert) => (StatusCode::OK, Json(json!({ "alert": alert }))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn resolve_alert(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(action): Json<OperatorAction>,
) -> (StatusCode, Json<Value>) {
    let by = action.by.as_deref().unwrap_or("operator");
    match state.alerts.resolve(id, by) {
        Ok(alert) => (StatusCode::OK, Json(json!({ "alert": alert }))),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// Replace alert thresholds; applies on the next evaluation cycle.
async fn update_alert_config(
    State(state): State<AppState>,
    Json(thresholds): Json<AlertThresholds>,
) -> Json<Value> {
    info!("Alert thresholds updated via admin endpoint");
    state.alerts.update_thresholds(thresholds);
    Json(json!({
        "thresholds": state.alerts.thresholds(),
        "timestamp": Utc::now(),
    }))
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    /// Time range such as "30m", "24h", or "7d"; defaults to 24h.
    #[serde(default)]
    range: Option<String>,
}

/// Parse a range parameter into a duration. Anything unparseable, including
/// out-of-bounds magnitudes, falls back to 24 hours.
fn parse_range(range: Option<&str>) -> chrono::Duration {
    let fallback = chrono::Duration::hours(24);
    let Some(range) = range else {
        return fallback;
    };
    if let Some(v) = range.strip_suffix('m') {
        return v
            .parse()
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or(fallback);
    }
    if let Some(v) = range.strip_suffix('d') {
        return v
            .parse()
            .ok()
            .and_then(chrono::Duration::try_days)
            .unwrap_or(fallback);
    }
    range
        .strip_suffix('h')
        .unwrap_or(range)
        .parse()
        .ok()
        .and_then(chrono::Duration::try_hours)
        .unwrap_or(fallback)
}

async fn historical_analytics(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> Json<Value> {
    let range = parse_range(params.range.as_deref());
    let since = Utc::now() - range;

    Json(json!({
        "since": since,
        "snapshots": state.history.snapshots_since(since),
        "daily": state.history.daily_aggregates(),
        "timestamp": Utc::now(),
    }))
}

async fn usage_pattern_analytics(
    State(state): State<AppState>,
    Query(params): Query<RangeParams>,
) -> Json<Value> {
    let range = parse_range(params.range.as_deref());
    let since = Utc::now() - range;

    Json(json!({
        "since": since,
        "patterns": state.history.usage_patterns(Some(since)),
        "timestamp": Utc::now(),
    }))
}
