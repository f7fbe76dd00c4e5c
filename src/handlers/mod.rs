pub mod checkout;
pub mod health;
pub mod jobs;
pub mod webhooks;

use axum::{routing::get, Router};

use crate::AppState;

/// Composes the public surface: checkout operations, webhook ingress, job
/// triggers and the health/docs endpoints.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .merge(checkout::checkout_routes(state.clone()))
        .merge(webhooks::webhook_routes())
        .merge(jobs::job_routes())
        .route("/health", get(health::health))
        .route("/api-docs/openapi.json", get(crate::openapi::openapi_json))
        .with_state(state)
}
