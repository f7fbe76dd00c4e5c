//! Hold expiration engine: releases abandoned inventory holds with bounded
//! latency, and reconciles PMS reservations that lost their checkout.
//! Triggered out of band (POST /jobs/expire-holds, /jobs/reconcile-reservations)
//! every few minutes; each run is independent and per-item failures never
//! abort the batch.

use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::adapters::pms::{PmsApi, ReservationType};
use crate::errors::ServiceError;
use crate::models::{Actor, CheckoutState};
use crate::state_machine::{StateMachine, TransitionCommand};
use crate::store::DocumentStore;

/// Batch ceiling per expirable state per sweep
const SWEEP_BATCH_LIMIT: u64 = 100;

const EXPIRY_REASON: &str = "Hold TTL exceeded";

#[derive(Debug, Default, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub expired_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Default, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub orphans_canceled: u64,
    pub error_count: u64,
}

#[derive(Clone)]
pub struct HoldExpirationService {
    store: Arc<dyn DocumentStore>,
    pms: Arc<dyn PmsApi>,
    machine: StateMachine,
    /// Reservations younger than this are never reconciled away; a hold whose
    /// commit is still in flight is at most seconds old.
    reconcile_grace: Duration,
}

impl HoldExpirationService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        pms: Arc<dyn PmsApi>,
        reconcile_grace: Duration,
    ) -> Self {
        Self {
            machine: StateMachine::new(store.clone()),
            store,
            pms,
            reconcile_grace,
        }
    }

    /// One sweep over every expirable state.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport, ServiceError> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        for state in CheckoutState::EXPIRABLE {
            let ids = self
                .store
                .list_expired_holds(state, now, SWEEP_BATCH_LIMIT)
                .await?;
            for checkout_id in ids {
                match self.expire_one(checkout_id).await {
                    Ok(true) => report.expired_count += 1,
                    // the checkout advanced past expirable while we worked
                    Ok(false) => {}
                    Err(e) => {
                        error!(checkout_id = %checkout_id, error = %e, "failed to expire hold");
                        report.error_count += 1;
                    }
                }
            }
        }

        info!(
            expired = report.expired_count,
            errors = report.error_count,
            "hold expiration sweep finished"
        );
        Ok(report)
    }

    /// Cancels the PMS reservation, then tries the EXPIRED transition.
    /// A failed cancellation leaves the record for the next sweep.
    async fn expire_one(&self, checkout_id: Uuid) -> Result<bool, ServiceError> {
        let Some(versioned) = self.store.get_checkout(checkout_id).await? else {
            return Ok(false);
        };
        let doc = versioned.checkout;

        if let Some(reservation_id) = &doc.pms_reservation_id {
            match self.pms.cancel_reservation(reservation_id).await {
                Ok(()) => {}
                // already canceled upstream is the same outcome
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        let expired = self
            .machine
            .try_transition(
                checkout_id,
                CheckoutState::Expired,
                TransitionCommand {
                    actor: Actor::System,
                    reason: Some(EXPIRY_REASON.to_string()),
                    patch: None,
                },
            )
            .await?;

        Ok(expired.is_some())
    }

    /// Cancels PMS `reserved` entries no checkout references.
    ///
    /// A hold create that succeeded on the PMS but lost its store commit
    /// leaves a reservation the expiry sweep can never see, since the
    /// document never learned the reservation id. This pass closes that gap
    /// from the PMS side. Reservations inside the grace window, or whose age
    /// the PMS does not report, are left for a later run.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport, ServiceError> {
        let now = Utc::now();
        let mut report = ReconcileReport::default();

        let reserved = self.pms.list_reservations(ReservationType::Reserved).await?;
        for reservation in reserved {
            let Some(created_at) = reservation.created_at else {
                warn!(reservation_id = %reservation.id, "reservation has no creation time; skipping");
                continue;
            };
            if created_at + self.reconcile_grace > now {
                continue;
            }

            match self.store.find_checkout_by_reservation(&reservation.id).await {
                // owned by a checkout: the expiry sweep governs it
                Ok(Some(_)) => {}
                Ok(None) => match self.pms.cancel_reservation(&reservation.id).await {
                    Ok(()) => {
                        info!(reservation_id = %reservation.id, "canceled orphaned PMS reservation");
                        report.orphans_canceled += 1;
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        error!(reservation_id = %reservation.id, error = %e, "failed to cancel orphan");
                        report.error_count += 1;
                    }
                },
                Err(e) => {
                    error!(reservation_id = %reservation.id, error = %e, "ownership lookup failed");
                    report.error_count += 1;
                }
            }
        }

        info!(
            orphans = report.orphans_canceled,
            errors = report.error_count,
            "reservation reconciliation finished"
        );
        Ok(report)
    }
}
