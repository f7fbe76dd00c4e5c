//! Out-of-band job triggers, gated by the service token.

use axum::{
    extract::State,
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};

use crate::errors::ServiceError;
use crate::services::expiration::{ReconcileReport, SweepReport};
use crate::AppState;

pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs/expire-holds", post(expire_holds))
        .route("/jobs/reconcile-reservations", post(reconcile_reservations))
        .route("/jobs/reap-records", post(reap_records))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ServiceError> {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    if presented != state.config.job_auth_token {
        return Err(ServiceError::Unauthorized(
            "job endpoints require the service token".to_string(),
        ));
    }
    Ok(())
}

#[utoipa::path(
    post,
    path = "/jobs/expire-holds",
    responses(
        (status = 200, description = "Sweep finished", body = SweepReport),
        (status = 401, description = "Bad service token", body = crate::errors::ErrorResponse)
    ),
    tag = "Jobs"
)]
pub(crate) async fn expire_holds(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SweepReport>, ServiceError> {
    authorize(&state, &headers)?;
    Ok(Json(state.expiration.sweep().await?))
}

#[utoipa::path(
    post,
    path = "/jobs/reconcile-reservations",
    responses(
        (status = 200, description = "Orphaned reservations released", body = ReconcileReport),
        (status = 401, description = "Bad service token", body = crate::errors::ErrorResponse)
    ),
    tag = "Jobs"
)]
pub(crate) async fn reconcile_reservations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ReconcileReport>, ServiceError> {
    authorize(&state, &headers)?;
    Ok(Json(state.expiration.reconcile().await?))
}

#[utoipa::path(
    post,
    path = "/jobs/reap-records",
    responses(
        (status = 200, description = "Expired records dropped"),
        (status = 401, description = "Bad service token", body = crate::errors::ErrorResponse)
    ),
    tag = "Jobs"
)]
pub(crate) async fn reap_records(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ServiceError> {
    authorize(&state, &headers)?;
    let (idempotency, webhook_events) = state.idempotency.reap_expired().await?;
    Ok(Json(json!({
        "idempotencyReaped": idempotency,
        "webhookEventsReaped": webhook_events,
    })))
}
