//! Request-level idempotency layer.
//!
//! Mutating endpoints that take an `Idempotency-Key` header run through here:
//! the first execution is captured in the document store and identical
//! retries replay it, across every process behind the load balancer. Keys are
//! scoped per `(method, path)`.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use http_body_util::BodyExt as _;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::errors::ServiceError;
use crate::services::idempotency::RequestIdempotency;
use crate::AppState;

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// How long a duplicate waits for the first execution's response before
/// conceding with 409
const IN_PROGRESS_WAIT: Duration = Duration::from_secs(2);

/// Endpoints where the header is REQUIRED (hold, payment-intent)
pub async fn require_idempotency(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    handle(state, req, next, true).await
}

/// Endpoints where the header is honored when present (initialize)
pub async fn optional_idempotency(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    handle(state, req, next, false).await
}

async fn handle(state: AppState, req: Request, next: Next, required: bool) -> Response {
    let key = req
        .headers()
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let Some(key) = key else {
        if required {
            return ServiceError::IdempotencyKeyRequired.into_response();
        }
        return next.run(req).await;
    };

    let endpoint = format!("{} {}", req.method(), req.uri().path());
    let idempotency = state.idempotency.clone();

    match idempotency.begin_request(&endpoint, &key).await {
        Err(e) => e.into_response(),
        Ok(RequestIdempotency::Replay { status, body }) => replay(status, body),
        Ok(RequestIdempotency::InProgress) => {
            match idempotency
                .await_captured(&endpoint, &key, IN_PROGRESS_WAIT)
                .await
            {
                Ok(Some((status, body))) => replay(status, body),
                Ok(None) => ServiceError::Conflict(
                    "a request with this idempotency key is still executing".to_string(),
                )
                .into_response(),
                Err(e) => e.into_response(),
            }
        }
        Ok(RequestIdempotency::Execute(guard)) => {
            let response = next.run(req).await;
            let (parts, body) = response.into_parts();

            let bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    // nothing captured; the retry will re-execute
                    warn!(endpoint, error = %e, "failed to buffer response for capture");
                    guard.finish(500, &Value::Null).await;
                    return Response::from_parts(parts, axum::body::Body::empty());
                }
            };

            let body_value: Value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(Value::Null)
            };
            guard.finish(parts.status.as_u16(), &body_value).await;

            Response::from_parts(parts, axum::body::Body::from(bytes))
        }
    }
}

fn replay(status: u16, body: Value) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    (status, Json(body)).into_response()
}
