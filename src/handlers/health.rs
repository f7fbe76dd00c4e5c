use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use uuid::Uuid;

use crate::AppState;

/// Liveness plus a cheap store probe.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_checkout(Uuid::nil()).await {
        Ok(_) => (StatusCode::OK, Json(json!({"status": "healthy"}))),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded", "store": "unreachable"})),
        ),
    }
}
