//! Checkout HTTP surface.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::middleware::idempotency::{optional_idempotency, require_idempotency};
use crate::models::{Checkout, CheckoutState, Guest};
use crate::services::checkout::InitializeCheckout;
use crate::AppState;

/// Creates the router for checkout endpoints. The hold and payment-intent
/// routes refuse requests without an idempotency key.
pub fn checkout_routes(state: AppState) -> Router<AppState> {
    let required = from_fn_with_state(state.clone(), require_idempotency);
    let optional = from_fn_with_state(state, optional_idempotency);

    Router::new()
        .route(
            "/checkout/initialize",
            post(initialize_checkout).layer(optional),
        )
        .route("/checkout/{id}", get(get_checkout))
        .route("/checkout/{id}/guest", patch(update_guest))
        .route(
            "/checkout/{id}/hold",
            post(create_hold).layer(required.clone()),
        )
        .route(
            "/checkout/{id}/payment-intent",
            post(create_payment_intent).layer(required),
        )
        .route("/checkout/{id}/finalize", post(finalize_checkout))
        .route("/checkout/{id}/cancel", post(cancel_checkout))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HoldResponse {
    pub checkout_id: Uuid,
    pub state: CheckoutState,
    pub pms_reservation_id: Option<String>,
    pub hold_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentResponse {
    pub checkout_id: Uuid,
    /// Ephemeral; returned to the caller only, never persisted
    pub client_secret: String,
    pub state: CheckoutState,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub max_wait_ms: Option<u64>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<bool>,
    pub checkout: Checkout,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[utoipa::path(
    post,
    path = "/checkout/initialize",
    request_body = InitializeCheckout,
    responses(
        (status = 201, description = "Checkout created", body = Checkout),
        (status = 400, description = "Validation failed", body = crate::errors::ErrorResponse),
        (status = 502, description = "PMS failure", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
pub(crate) async fn initialize_checkout(
    State(state): State<AppState>,
    Json(input): Json<InitializeCheckout>,
) -> Result<impl IntoResponse, ServiceError> {
    let checkout = state.checkout.initialize_checkout(input).await?;
    Ok((StatusCode::CREATED, Json(checkout)))
}

#[utoipa::path(
    get,
    path = "/checkout/{id}",
    params(("id" = Uuid, Path, description = "Checkout id")),
    responses(
        (status = 200, description = "Current checkout", body = Checkout),
        (status = 404, description = "Unknown checkout", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
pub(crate) async fn get_checkout(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Checkout>, ServiceError> {
    Ok(Json(state.checkout.get_checkout(id).await?))
}

#[utoipa::path(
    patch,
    path = "/checkout/{id}/guest",
    params(("id" = Uuid, Path, description = "Checkout id")),
    request_body = Guest,
    responses(
        (status = 200, description = "Guest stored", body = Checkout),
        (status = 409, description = "State no longer accepts guest edits", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
pub(crate) async fn update_guest(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(guest): Json<Guest>,
) -> Result<Json<Checkout>, ServiceError> {
    Ok(Json(state.checkout.update_guest_info(id, guest).await?))
}

#[utoipa::path(
    post,
    path = "/checkout/{id}/hold",
    params(("id" = Uuid, Path, description = "Checkout id")),
    responses(
        (status = 200, description = "Hold taken (or already held)", body = HoldResponse),
        (status = 400, description = "Guest or idempotency key missing", body = crate::errors::ErrorResponse),
        (status = 409, description = "Not in a holdable state", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
pub(crate) async fn create_hold(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<HoldResponse>, ServiceError> {
    let checkout = state.checkout.create_hold(id).await?;
    Ok(Json(HoldResponse {
        checkout_id: checkout.checkout_id,
        state: checkout.state,
        pms_reservation_id: checkout.pms_reservation_id,
        hold_expires_at: checkout.hold_expires_at,
    }))
}

#[utoipa::path(
    post,
    path = "/checkout/{id}/payment-intent",
    params(("id" = Uuid, Path, description = "Checkout id")),
    responses(
        (status = 200, description = "Intent ready", body = PaymentIntentResponse),
        (status = 409, description = "Not in a payable state", body = crate::errors::ErrorResponse),
        (status = 502, description = "PSP failure", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
pub(crate) async fn create_payment_intent(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentIntentResponse>, ServiceError> {
    let (checkout, client_secret) = state.checkout.create_payment_intent(id).await?;
    Ok(Json(PaymentIntentResponse {
        checkout_id: checkout.checkout_id,
        client_secret,
        state: checkout.state,
    }))
}

#[utoipa::path(
    post,
    path = "/checkout/{id}/finalize",
    params(("id" = Uuid, Path, description = "Checkout id")),
    request_body = FinalizeRequest,
    responses(
        (status = 200, description = "Settled or still pending", body = FinalizeResponse)
    ),
    tag = "Checkout"
)]
pub(crate) async fn finalize_checkout(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<FinalizeRequest>>,
) -> Result<Json<FinalizeResponse>, ServiceError> {
    let max_wait_ms = body
        .map(|Json(req)| req.max_wait_ms.unwrap_or(30_000))
        .unwrap_or(30_000);
    let checkout = state.checkout.wait_for_confirmation(id, max_wait_ms).await?;

    let success = checkout.state == CheckoutState::Booked;
    let settled = matches!(
        checkout.state,
        CheckoutState::Booked | CheckoutState::Failed | CheckoutState::Expired
    );
    Ok(Json(FinalizeResponse {
        success,
        booking_code: checkout.pms_booking_code.clone(),
        pending: if settled { None } else { Some(true) },
        checkout,
    }))
}

#[utoipa::path(
    post,
    path = "/checkout/{id}/cancel",
    params(("id" = Uuid, Path, description = "Checkout id")),
    request_body = CancelRequest,
    responses(
        (status = 200, description = "Checkout canceled", body = Checkout),
        (status = 409, description = "Not cancelable from the current state", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
pub(crate) async fn cancel_checkout(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> Result<Json<Checkout>, ServiceError> {
    let reason = body.and_then(|Json(req)| req.reason);
    Ok(Json(state.checkout.cancel_checkout(id, reason).await?))
}
