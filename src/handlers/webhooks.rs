//! PSP webhook ingress: verify over raw bytes, dedup, dispatch, then mark
//! processed. Handler failures surface as 5xx so the PSP retries; the event
//! record is only written after the handler returns.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde_json::json;
use tracing::{info, warn};

use crate::adapters::psp::{verify_webhook, PspEvent};
use crate::errors::ServiceError;
use crate::AppState;

const SIGNATURE_HEADER: &str = "psp-signature";

pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/webhooks/psp", post(psp_webhook))
}

#[utoipa::path(
    post,
    path = "/webhooks/psp",
    request_body = String,
    responses(
        (status = 200, description = "Event handled or already processed"),
        (status = 400, description = "Signature verification failed", body = crate::errors::ErrorResponse),
        (status = 502, description = "Downstream failure; the PSP should retry", body = crate::errors::ErrorResponse)
    ),
    tag = "Webhooks"
)]
pub(crate) async fn psp_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ServiceError::PspSignature(format!("missing {} header", SIGNATURE_HEADER))
        })?;

    // verification runs over the exact bytes on the wire
    let event = verify_webhook(
        &body,
        signature,
        &state.config.psp.webhook_secret,
        state.config.psp.webhook_tolerance_secs,
    )?;

    if state.idempotency.webhook_seen(&event.id).await? {
        info!(event_id = %event.id, "webhook already processed");
        return Ok((
            StatusCode::OK,
            Json(json!({"received": true, "status": "already_processed"})),
        ));
    }

    dispatch(&state, &event).await?;

    // only after the handler returned cleanly
    state.idempotency.mark_webhook_processed(&event.id).await?;
    Ok((StatusCode::OK, Json(json!({"received": true}))))
}

async fn dispatch(state: &AppState, event: &PspEvent) -> Result<(), ServiceError> {
    match event.event_type.as_str() {
        "payment_intent.succeeded" => {
            let (Some(checkout_id), Some(intent_id)) =
                (event.checkout_id(), event.payment_intent_id())
            else {
                warn!(event_id = %event.id, "succeeded event without checkout metadata; ignoring");
                return Ok(());
            };
            match state
                .checkout
                .handle_payment_succeeded(checkout_id, intent_id)
                .await
            {
                Ok(()) => Ok(()),
                // an unknown checkout can never become processable; ack it
                Err(ServiceError::NotFound(msg)) => {
                    warn!(event_id = %event.id, "{}", msg);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        "payment_intent.payment_failed" => {
            let Some(checkout_id) = event.checkout_id() else {
                warn!(event_id = %event.id, "failed event without checkout metadata; ignoring");
                return Ok(());
            };
            state
                .checkout
                .handle_payment_failed(checkout_id, event.failure_message())
                .await
        }
        "charge.refunded" => {
            // refund orchestration is out of scope; the event record is kept
            info!(event_id = %event.id, "refund received and recorded");
            Ok(())
        }
        other => {
            info!(event_id = %event.id, event_type = other, "ignoring unhandled event type");
            Ok(())
        }
    }
}
