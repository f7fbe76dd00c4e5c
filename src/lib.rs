//! StayKit Checkout API Library
//!
//! Transactional core of the short-stay booking checkout: it walks a shopper
//! from quote to hold to captured payment to a confirmed booking across a
//! property-management system and a payment processor that share no
//! transaction, without overselling inventory or double-charging.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod adapters;
pub mod config;
pub mod entities;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod migrator;
pub mod models;
pub mod openapi;
pub mod services;
pub mod state_machine;
pub mod store;

use std::sync::Arc;

use crate::adapters::pms::PmsApi;
use crate::adapters::psp::PspApi;
use crate::services::checkout::CheckoutService;
use crate::services::expiration::HoldExpirationService;
use crate::services::idempotency::IdempotencyService;
use crate::store::DocumentStore;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub config: config::AppConfig,
    pub store: Arc<dyn DocumentStore>,
    pub checkout: Arc<CheckoutService>,
    pub idempotency: Arc<IdempotencyService>,
    pub expiration: Arc<HoldExpirationService>,
}

impl AppState {
    /// Wires the service graph once: one store gateway, one adapter per
    /// upstream, threaded into the orchestrator and background services.
    pub fn build(
        config: config::AppConfig,
        store: Arc<dyn DocumentStore>,
        pms: Arc<dyn PmsApi>,
        psp: Arc<dyn PspApi>,
    ) -> Self {
        let checkout = Arc::new(CheckoutService::new(
            store.clone(),
            pms.clone(),
            psp,
            config.currency.clone(),
            config.hold_ttl(),
            config.quote_ttl(),
        ));
        let idempotency = Arc::new(IdempotencyService::new(
            store.clone(),
            config.idempotency_ttl(),
            config.webhook_dedup_ttl(),
        ));
        // one hold TTL of grace keeps the reconciler away from in-flight holds
        let expiration = Arc::new(HoldExpirationService::new(
            store.clone(),
            pms,
            config.hold_ttl(),
        ));

        Self {
            config,
            store,
            checkout,
            idempotency,
            expiration,
        }
    }
}
