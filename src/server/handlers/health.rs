use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::sync::Arc;

use crate::state::AppState;

pub async fn health(State(_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Aggregate health across the durable store and the secret-resilience
/// breaker, plus a snapshot of scheduler load — the operator-facing view
/// spec.md §4.B/§4.C describe `health()` as returning individually.
pub async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let persistence = state.persistence.health().await;
    let secrets = state.secrets.health().await;
    let registry = state.registry.stats().await;

    Json(json!({
        "status": "ok",
        "persistence": persistence,
        "secrets": secrets,
        "registry": registry,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
