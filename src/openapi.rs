use axum::Json;
use utoipa::OpenApi;

use crate::errors::ErrorResponse;
use crate::handlers::checkout::{
    CancelRequest, FinalizeRequest, FinalizeResponse, HoldResponse, PaymentIntentResponse,
};
use crate::models::{
    Actor, Checkout, CheckoutState, Guest, GuestCount, Quote, QuoteBreakdown, StateTransition,
};
use crate::services::checkout::InitializeCheckout;
use crate::services::expiration::{ReconcileReport, SweepReport};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "StayKit Checkout API",
        description = "Transactional checkout core for short-stay bookings"
    ),
    paths(
        crate::handlers::checkout::initialize_checkout,
        crate::handlers::checkout::get_checkout,
        crate::handlers::checkout::update_guest,
        crate::handlers::checkout::create_hold,
        crate::handlers::checkout::create_payment_intent,
        crate::handlers::checkout::finalize_checkout,
        crate::handlers::checkout::cancel_checkout,
        crate::handlers::webhooks::psp_webhook,
        crate::handlers::jobs::expire_holds,
        crate::handlers::jobs::reconcile_reservations,
        crate::handlers::jobs::reap_records,
    ),
    components(schemas(
        Checkout,
        CheckoutState,
        StateTransition,
        Actor,
        Quote,
        QuoteBreakdown,
        Guest,
        GuestCount,
        InitializeCheckout,
        HoldResponse,
        PaymentIntentResponse,
        FinalizeRequest,
        FinalizeResponse,
        CancelRequest,
        SweepReport,
        ReconcileReport,
        ErrorResponse,
    )),
    tags(
        (name = "Checkout", description = "Checkout lifecycle"),
        (name = "Webhooks", description = "PSP event ingress"),
        (name = "Jobs", description = "Service-authenticated maintenance")
    )
)]
pub struct ApiDoc;

pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
