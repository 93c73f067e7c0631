//! Admin HTTP surface for the failover controller.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::controller::{Controller, ManualOutcome};

/// Build the admin router.
pub fn admin_router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/failover/status", get(status))
        .route("/failover/trigger", post(trigger))
        .route("/failover/recover", post(recover))
        .layer(TraceLayer::new_for_http())
        .with_state(controller)
}

async fn status(State(controller): State<Arc<Controller>>) -> Json<Value> {
    Json(json!({
        "failover": controller.status(),
        "timestamp": Utc::now(),
    }))
}

#[derive(Debug, Deserialize)]
struct ManualRequest {
    #[serde(default)]
    reason: Option<String>,
}

fn manual_response(outcome: ManualOutcome) -> (StatusCode, Json<Value>) {
    let (status, message) = match outcome {
        ManualOutcome::Transitioned => (StatusCode::OK, "transition confirmed"),
        ManualOutcome::AlreadyActive => (StatusCode::OK, "already active; no change"),
        ManualOutcome::Failed => (
            StatusCode::BAD_GATEWAY,
            "registry update failed; active instance unchanged",
        ),
    };
    (
        status,
        Json(json!({
            "outcome": outcome,
            "message": message,
            "timestamp": Utc::now(),
        })),
    )
}

async fn trigger(
    State(controller): State<Arc<Controller>>,
    Json(request): Json<ManualRequest>,
) -> (StatusCode, Json<Value>) {
    let reason = request.reason.as_deref().unwrap_or("manual trigger");
    manual_response(controller.trigger_failover(reason).await)
}

async fn recover(
    State(controller): State<Arc<Controller>>,
    Json(request): Json<ManualRequest>,
) -> (StatusCode, Json<Value>) {
    let reason = request.reason.as_deref().unwrap_or("manual recovery");
    manual_response(controller.trigger_recovery(reason).await)
}
