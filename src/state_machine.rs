//! Validated, atomic transitions over the checkout record.
//!
//! Every call loads the document, validates the move against the transition
//! graph, appends exactly one history entry, and commits with optimistic
//! concurrency. A same-state call is an idempotent no-op and appends nothing.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::models::{Actor, Checkout, CheckoutPatch, CheckoutState, StateTransition};
use crate::store::{run_checkout_txn, DocumentStore, TxnOutcome};

/// Permitted moves out of each state. Terminal states are absent except for
/// the post-booking cancellation.
pub fn allowed(from: CheckoutState) -> &'static [CheckoutState] {
    use CheckoutState::*;
    match from {
        Initiated => &[HoldCreated, Canceled, Failed],
        HoldCreated => &[PaymentCreated, Expired, Canceled, Failed],
        PaymentCreated => &[Paid, Expired, Canceled, Failed],
        Paid => &[Booked, Failed],
        Booked => &[Canceled],
        Canceled | Expired | Failed => &[],
    }
}

pub fn can_transition(from: CheckoutState, to: CheckoutState) -> bool {
    allowed(from).contains(&to)
}

/// Everything a transition carries besides the target state
#[derive(Debug, Default)]
pub struct TransitionCommand {
    pub actor: Actor,
    pub reason: Option<String>,
    pub patch: Option<CheckoutPatch>,
}

/// Whether [`apply_transition`] changed the document
#[derive(Debug, PartialEq, Eq)]
pub enum Applied {
    Changed,
    NoOp,
}

/// Pure transition step: validates, merges the patch, flips the state and
/// appends the history entry. Callers own loading and committing.
pub fn apply_transition(
    checkout: &mut Checkout,
    target: CheckoutState,
    command: &TransitionCommand,
) -> Result<Applied, ServiceError> {
    let current = checkout.state;

    if current == target {
        return Ok(Applied::NoOp);
    }

    if !can_transition(current, target) {
        return Err(ServiceError::InvalidTransition(format!(
            "cannot transition checkout from {} to {}",
            current, target
        )));
    }

    if let Some(patch) = &command.patch {
        patch
            .apply(checkout)
            .map_err(|e| ServiceError::Conflict(e.to_string()))?;
    }

    let now = Utc::now();
    checkout.state = target;
    checkout.state_history.push(StateTransition {
        from: current,
        to: target,
        at: now,
        reason: command.reason.clone(),
        actor: command.actor,
    });
    checkout.updated_at = now;

    Ok(Applied::Changed)
}

#[derive(Clone)]
pub struct StateMachine {
    store: Arc<dyn DocumentStore>,
}

impl StateMachine {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Transitions the checkout to `target` inside a document transaction.
    #[instrument(skip(self, command), fields(checkout_id = %checkout_id, target = %target))]
    pub async fn transition(
        &self,
        checkout_id: Uuid,
        target: CheckoutState,
        command: TransitionCommand,
    ) -> Result<Checkout, ServiceError> {
        let command = Arc::new(command);
        let result: Checkout = run_checkout_txn(self.store.as_ref(), checkout_id, |versioned| {
            let command = command.clone();
            async move {
                let mut doc = versioned.checkout;
                match apply_transition(&mut doc, target, &command)? {
                    Applied::NoOp => Ok(TxnOutcome::ReadOnly(doc)),
                    Applied::Changed => Ok(TxnOutcome::Commit(doc.clone(), doc)),
                }
            }
        })
        .await
        .map_err(|e: ServiceError| match e {
            ServiceError::Store(crate::store::StoreError::NotFound(id)) => {
                ServiceError::NotFound(format!("Checkout {} not found", id))
            }
            other => other,
        })?;

        if result.state == target {
            info!(
                checkout_id = %checkout_id,
                state = %target,
                "checkout transitioned"
            );
        }
        Ok(result)
    }

    /// Like [`transition`], but an invalid move returns `Ok(None)` so callers
    /// can detect races (a webhook landing after expiry) without unwinding.
    pub async fn try_transition(
        &self,
        checkout_id: Uuid,
        target: CheckoutState,
        command: TransitionCommand,
    ) -> Result<Option<Checkout>, ServiceError> {
        match self.transition(checkout_id, target, command).await {
            Ok(checkout) => Ok(Some(checkout)),
            Err(ServiceError::InvalidTransition(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
