//! Checkout orchestrator: sequences quote, hold, payment intent, payment
//! confirmation and booking across the PMS and the PSP, with the document
//! store as the only shared state.

use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::adapters::pms::{
    CreateReservation, PaymentRegistration, PmsApi, Reservation, ReservationPatch, ReservationType,
};
use crate::adapters::psp::{CreatePaymentIntent, PspApi};
use crate::errors::ServiceError;
use crate::models::{
    quote_hash, Actor, Checkout, CheckoutPatch, CheckoutState, Guest, GuestCount, Quote,
    QuoteBreakdown, StateTransition,
};
use crate::state_machine::{apply_transition, StateMachine, TransitionCommand};
use crate::store::{run_checkout_txn, DocumentStore, StoreError, TxnOutcome};

/// Hard ceiling for the finalize long-poll
const MAX_WAIT_CAP_MS: u64 = 30_000;
const WAIT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Bounded CAS retries for the hold commit; the PMS side effect happens once
const HOLD_COMMIT_RETRIES: u32 = 3;

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitializeCheckout {
    #[validate(length(min = 1, message = "listingId must not be empty"))]
    pub listing_id: String,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    #[validate(nested)]
    pub guests: GuestCount,
    #[serde(default)]
    pub coupon_code: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn DocumentStore>,
    pms: Arc<dyn PmsApi>,
    psp: Arc<dyn PspApi>,
    machine: StateMachine,
    currency: String,
    hold_ttl: chrono::Duration,
    quote_ttl: chrono::Duration,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        pms: Arc<dyn PmsApi>,
        psp: Arc<dyn PspApi>,
        currency: String,
        hold_ttl: chrono::Duration,
        quote_ttl: chrono::Duration,
    ) -> Self {
        Self {
            machine: StateMachine::new(store.clone()),
            store,
            pms,
            psp,
            currency,
            hold_ttl,
            quote_ttl,
        }
    }

    /// Quotes the stay and opens a checkout in INITIATED.
    #[instrument(skip(self, input), fields(listing_id = %input.listing_id))]
    pub async fn initialize_checkout(
        &self,
        input: InitializeCheckout,
    ) -> Result<Checkout, ServiceError> {
        input.validate()?;

        let today = Utc::now().date_naive();
        if input.check_in < today {
            return Err(ServiceError::validation_field(
                "checkIn",
                "check-in must be today or later",
            ));
        }
        if input.check_out <= input.check_in {
            return Err(ServiceError::validation_field(
                "checkOut",
                "check-out must be after check-in",
            ));
        }

        let listing = self.pms.get_listing_detail(&input.listing_id).await?;
        let price = self
            .pms
            .calculate_price(
                &input.listing_id,
                input.check_in,
                input.check_out,
                &input.guests,
                input.coupon_code.as_deref(),
            )
            .await?;
        if !price.currency.eq_ignore_ascii_case(&self.currency) {
            return Err(ServiceError::UnsupportedCurrency(price.currency));
        }

        let now = Utc::now();
        let quote = Quote {
            total: price.total,
            currency: price.currency,
            breakdown: QuoteBreakdown {
                subtotal: price.subtotal,
                cleaning_fee: price.cleaning_fee,
                service_fee: price.service_fee,
                taxes: price.taxes,
            },
            hash: quote_hash(
                &input.listing_id,
                input.check_in,
                input.check_out,
                &input.guests,
                input.coupon_code.as_deref(),
            ),
            expires_at: now + self.quote_ttl,
        };

        let checkout = Checkout {
            checkout_id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            state: CheckoutState::Initiated,
            // seed entry: the audit anchor for the lifetime of the document
            state_history: vec![StateTransition {
                from: CheckoutState::Initiated,
                to: CheckoutState::Initiated,
                at: now,
                reason: Some("initialized".to_string()),
                actor: Actor::User,
            }],
            listing_id: input.listing_id,
            listing_name: Some(listing.name),
            check_in: input.check_in,
            check_out: input.check_out,
            guests: input.guests,
            coupon_code: input.coupon_code,
            quote,
            guest: None,
            pms_reservation_id: None,
            pms_booking_code: None,
            psp_payment_intent_id: None,
            hold_expires_at: None,
            retry_count: 0,
            refund_required: false,
            metadata: input.metadata,
        };

        self.store.insert_checkout(&checkout).await?;
        info!(checkout_id = %checkout.checkout_id, total = checkout.quote.total, "checkout initialized");
        Ok(checkout)
    }

    pub async fn get_checkout(&self, checkout_id: Uuid) -> Result<Checkout, ServiceError> {
        self.store
            .get_checkout(checkout_id)
            .await?
            .map(|v| v.checkout)
            .ok_or_else(|| ServiceError::NotFound(format!("Checkout {} not found", checkout_id)))
    }

    /// Writes guest contact details. Legal from INITIATED, HOLD_CREATED or
    /// PAYMENT_CREATED; never a state transition.
    #[instrument(skip(self, guest), fields(checkout_id = %checkout_id))]
    pub async fn update_guest_info(
        &self,
        checkout_id: Uuid,
        guest: Guest,
    ) -> Result<Checkout, ServiceError> {
        guest.validate()?;

        let guest = Arc::new(guest);
        run_checkout_txn(self.store.as_ref(), checkout_id, |versioned| {
            let guest = guest.clone();
            async move {
                let mut doc = versioned.checkout;
                if !matches!(
                    doc.state,
                    CheckoutState::Initiated
                        | CheckoutState::HoldCreated
                        | CheckoutState::PaymentCreated
                ) {
                    return Err(ServiceError::InvalidStateForUpdate(format!(
                        "guest info cannot change in state {}",
                        doc.state
                    )));
                }
                doc.guest = Some((*guest).clone());
                doc.updated_at = Utc::now();
                Ok(TxnOutcome::Commit(doc.clone(), doc))
            }
        })
        .await
        .map_err(map_txn_not_found(checkout_id))
    }

    /// Takes the inventory hold: creates the PMS reservation inside the
    /// transaction window and commits HOLD_CREATED with the reservation id.
    /// A reservation whose commit never lands is released by the
    /// reconciliation pass, which scans the PMS side for unowned holds.
    #[instrument(skip(self), fields(checkout_id = %checkout_id))]
    pub async fn create_hold(&self, checkout_id: Uuid) -> Result<Checkout, ServiceError> {
        // The reservation is created at most once; CAS retries reuse it.
        let mut reservation: Option<Reservation> = None;

        let mut attempt = 0;
        loop {
            let versioned = self
                .store
                .get_checkout(checkout_id)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Checkout {} not found", checkout_id))
                })?;
            let mut doc = versioned.checkout;
            let revision = versioned.revision;

            // idempotent fast path
            if doc.state == CheckoutState::HoldCreated || doc.pms_reservation_id.is_some() {
                self.release_duplicate_reservation(&doc, reservation.as_ref())
                    .await;
                return Ok(doc);
            }

            if doc.state != CheckoutState::Initiated {
                return Err(ServiceError::InvalidTransition(format!(
                    "cannot create hold from state {}",
                    doc.state
                )));
            }

            let guest = doc
                .guest
                .clone()
                .filter(|g| g.validate().is_ok())
                .ok_or_else(|| {
                    ServiceError::GuestRequired(
                        "guest contact with a valid email must be set before holding".to_string(),
                    )
                })?;

            if doc.expected_quote_hash() != doc.quote.hash {
                return Err(ServiceError::QuoteMismatch(
                    "stored quote does not match the booking inputs".to_string(),
                ));
            }

            // Clocked before the PMS call so the TTL window stays
            // conservative even when the create is slow.
            let hold_expires_at = Utc::now() + self.hold_ttl;

            let reservation_id = match &reservation {
                Some(existing) => existing.id.clone(),
                None => {
                    let created = self
                        .pms
                        .create_reservation(&CreateReservation {
                            listing_id: doc.listing_id.clone(),
                            reservation_type: ReservationType::Reserved,
                            guest,
                            check_in: doc.check_in,
                            check_out: doc.check_out,
                            guests: doc.guests,
                            total_price: doc.quote.total,
                            currency: doc.quote.currency.clone(),
                        })
                        .await?;
                    info!(checkout_id = %checkout_id, reservation_id = %created.id, "PMS reservation created");
                    let id = created.id.clone();
                    reservation = Some(created);
                    id
                }
            };

            apply_transition(
                &mut doc,
                CheckoutState::HoldCreated,
                &TransitionCommand {
                    actor: Actor::User,
                    reason: None,
                    patch: Some(CheckoutPatch {
                        pms_reservation_id: Some(reservation_id),
                        hold_expires_at: Some(hold_expires_at),
                        ..Default::default()
                    }),
                },
            )?;

            match self.store.commit_checkout(&doc, revision).await {
                Ok(_) => return Ok(doc),
                Err(StoreError::Conflict(_)) if attempt < HOLD_COMMIT_RETRIES => {
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// A concurrent hold beat us after our PMS create; undo ours.
    async fn release_duplicate_reservation(
        &self,
        doc: &Checkout,
        ours: Option<&Reservation>,
    ) {
        let Some(ours) = ours else { return };
        if doc.pms_reservation_id.as_deref() == Some(ours.id.as_str()) {
            return;
        }
        warn!(
            checkout_id = %doc.checkout_id,
            reservation_id = %ours.id,
            "canceling duplicate PMS reservation from lost hold race"
        );
        if let Err(e) = self.pms.cancel_reservation(&ours.id).await {
            if !e.is_not_found() {
                error!(reservation_id = %ours.id, error = %e, "failed to cancel duplicate reservation");
            }
        }
    }

    /// Creates (or re-retrieves) the PaymentIntent for the locked quote and
    /// returns its client secret. The secret is never written to the store.
    #[instrument(skip(self), fields(checkout_id = %checkout_id))]
    pub async fn create_payment_intent(
        &self,
        checkout_id: Uuid,
    ) -> Result<(Checkout, String), ServiceError> {
        let doc = self.get_checkout(checkout_id).await?;

        // idempotent fast path: hand back the existing intent's secret
        if let Some(intent_id) = &doc.psp_payment_intent_id {
            let intent = self.psp.retrieve_payment_intent(intent_id).await?;
            return Ok((doc, intent.client_secret));
        }

        if doc.state != CheckoutState::HoldCreated {
            return Err(ServiceError::InvalidTransition(format!(
                "cannot create payment intent from state {}",
                doc.state
            )));
        }
        let reservation_id = doc.pms_reservation_id.clone().ok_or_else(|| {
            ServiceError::Internal("HOLD_CREATED checkout without a reservation id".to_string())
        })?;

        let mut metadata = HashMap::new();
        metadata.insert("checkoutId".to_string(), checkout_id.to_string());
        metadata.insert("pmsReservationId".to_string(), reservation_id);

        let intent = self
            .psp
            .create_payment_intent(&CreatePaymentIntent {
                amount: doc.quote.total,
                currency: doc.quote.currency.clone(),
                metadata,
                receipt_email: doc.guest.as_ref().map(|g| g.email.clone()),
                description: doc
                    .listing_name
                    .as_ref()
                    .map(|name| format!("Stay at {}", name)),
            })
            .await?;

        let updated = self
            .machine
            .transition(
                checkout_id,
                CheckoutState::PaymentCreated,
                TransitionCommand {
                    actor: Actor::User,
                    reason: None,
                    patch: Some(CheckoutPatch {
                        psp_payment_intent_id: Some(intent.id.clone()),
                        ..Default::default()
                    }),
                },
            )
            .await?;

        info!(checkout_id = %checkout_id, intent_id = %intent.id, "payment intent created");
        Ok((updated, intent.client_secret))
    }

    /// Webhook-driven: confirms payment, books the reservation in the PMS and
    /// lands on BOOKED. Every step tolerates replay; on failure the checkout
    /// stays PAID and the PSP's retry re-enters here.
    #[instrument(skip(self), fields(checkout_id = %checkout_id, payment_intent_id = %payment_intent_id))]
    pub async fn handle_payment_succeeded(
        &self,
        checkout_id: Uuid,
        payment_intent_id: &str,
    ) -> Result<(), ServiceError> {
        let before = self.get_checkout(checkout_id).await?;
        let was_paid = before.state == CheckoutState::Paid;

        let paid = self
            .machine
            .try_transition(
                checkout_id,
                CheckoutState::Paid,
                TransitionCommand {
                    actor: Actor::Webhook,
                    reason: Some("payment_intent.succeeded".to_string()),
                    patch: Some(CheckoutPatch {
                        psp_payment_intent_id: Some(payment_intent_id.to_string()),
                        ..Default::default()
                    }),
                },
            )
            .await?;

        let doc = match paid {
            Some(doc) => doc,
            // the transition graph refused PAID: settle the race by state
            None => {
                let current = self.get_checkout(checkout_id).await?;
                return self.handle_unplaceable_payment(current).await;
            }
        };

        if doc.state == CheckoutState::Booked {
            return Ok(());
        }
        if was_paid {
            // recoverable re-entry of the booking leg
            self.bump_retry_count(checkout_id).await?;
        }

        let reservation_id = doc.pms_reservation_id.clone().ok_or_else(|| {
            ServiceError::Internal("PAID checkout without a reservation id".to_string())
        })?;

        self.pms
            .update_reservation(
                &reservation_id,
                &ReservationPatch {
                    reservation_type: Some(ReservationType::Booked),
                },
            )
            .await?;

        self.pms
            .register_payment(
                &reservation_id,
                &PaymentRegistration {
                    amount: doc.quote.total,
                    currency: doc.quote.currency.clone(),
                    method: "credit_card".to_string(),
                    // the PMS treats the reference as a dedup key
                    reference: payment_intent_id.to_string(),
                },
            )
            .await?;

        let reservation = self.pms.get_reservation(&reservation_id).await?;
        let booking_code = reservation.booking_code.ok_or_else(|| {
            ServiceError::Internal(format!(
                "booked reservation {} has no booking code yet",
                reservation_id
            ))
        })?;

        self.machine
            .transition(
                checkout_id,
                CheckoutState::Booked,
                TransitionCommand {
                    actor: Actor::System,
                    reason: None,
                    patch: Some(CheckoutPatch {
                        pms_booking_code: Some(booking_code.clone()),
                        ..Default::default()
                    }),
                },
            )
            .await?;

        info!(checkout_id = %checkout_id, booking_code = %booking_code, "checkout booked");
        Ok(())
    }

    /// Funds were captured for a checkout that can no longer advance to PAID.
    /// BOOKED means a replayed event; terminal losses flag a refund.
    async fn handle_unplaceable_payment(&self, doc: Checkout) -> Result<(), ServiceError> {
        match doc.state {
            CheckoutState::Booked => Ok(()),
            CheckoutState::Expired | CheckoutState::Canceled | CheckoutState::Failed => {
                error!(
                    checkout_id = %doc.checkout_id,
                    state = %doc.state,
                    "payment captured after hold was released; flagging refund"
                );
                self.flag_refund_required(doc.checkout_id).await
            }
            other => {
                warn!(
                    checkout_id = %doc.checkout_id,
                    state = %other,
                    "ignoring payment_intent.succeeded in unexpected state"
                );
                Ok(())
            }
        }
    }

    async fn flag_refund_required(&self, checkout_id: Uuid) -> Result<(), ServiceError> {
        run_checkout_txn(self.store.as_ref(), checkout_id, |versioned| async move {
            let mut doc = versioned.checkout;
            if doc.refund_required {
                return Ok(TxnOutcome::ReadOnly(()));
            }
            doc.refund_required = true;
            doc.updated_at = Utc::now();
            Ok(TxnOutcome::Commit(doc, ()))
        })
        .await
        .map_err(map_txn_not_found(checkout_id))
    }

    async fn bump_retry_count(&self, checkout_id: Uuid) -> Result<(), ServiceError> {
        run_checkout_txn(self.store.as_ref(), checkout_id, |versioned| async move {
            let mut doc = versioned.checkout;
            doc.retry_count += 1;
            doc.updated_at = Utc::now();
            Ok(TxnOutcome::Commit(doc, ()))
        })
        .await
        .map_err(map_txn_not_found(checkout_id))
    }

    /// Failed payments never transition; the hold TTL is the authoritative
    /// timeout and the shopper may retry payment meanwhile.
    #[instrument(skip(self), fields(checkout_id = %checkout_id))]
    pub async fn handle_payment_failed(
        &self,
        checkout_id: Uuid,
        reason: Option<&str>,
    ) -> Result<(), ServiceError> {
        info!(
            checkout_id = %checkout_id,
            reason = reason.unwrap_or("unknown"),
            "payment failed; leaving checkout for retry or expiry"
        );
        Ok(())
    }

    /// Collapses the "payment confirmed, webhook in flight" gap by polling the
    /// store until the checkout settles or the deadline passes.
    #[instrument(skip(self), fields(checkout_id = %checkout_id))]
    pub async fn wait_for_confirmation(
        &self,
        checkout_id: Uuid,
        max_wait_ms: u64,
    ) -> Result<Checkout, ServiceError> {
        let wait = std::time::Duration::from_millis(max_wait_ms.min(MAX_WAIT_CAP_MS));
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let doc = self.get_checkout(checkout_id).await?;
            if matches!(
                doc.state,
                CheckoutState::Booked | CheckoutState::Failed | CheckoutState::Expired
            ) {
                return Ok(doc);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(doc);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Cancels the checkout; from BOOKED this is the post-booking
    /// cancellation. The PMS release tolerates an already-gone reservation.
    #[instrument(skip(self), fields(checkout_id = %checkout_id))]
    pub async fn cancel_checkout(
        &self,
        checkout_id: Uuid,
        reason: Option<String>,
    ) -> Result<Checkout, ServiceError> {
        let doc = self.get_checkout(checkout_id).await?;

        if let Some(reservation_id) = &doc.pms_reservation_id {
            match self.pms.cancel_reservation(reservation_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    info!(reservation_id = %reservation_id, "PMS reservation already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.machine
            .transition(
                checkout_id,
                CheckoutState::Canceled,
                TransitionCommand {
                    actor: Actor::User,
                    reason: reason.or_else(|| Some("canceled by user".to_string())),
                    patch: None,
                },
            )
            .await
    }
}

/// NotFound from the txn loader carries the raw id; rewrap it consistently.
fn map_txn_not_found(checkout_id: Uuid) -> impl FnOnce(ServiceError) -> ServiceError {
    move |e| match e {
        ServiceError::Store(StoreError::NotFound(_)) => {
            ServiceError::NotFound(format!("Checkout {} not found", checkout_id))
        }
        other => other,
    }
}
