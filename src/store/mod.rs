//! Document store gateway.
//!
//! Three logical collections back the whole system: `checkouts`,
//! `idempotency_keys` and `webhook_events`. Checkout documents carry a
//! revision used for compare-and-swap commits; every state-machine mutation
//! goes through [`run_checkout_txn`].

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::future::Future;
use uuid::Uuid;

use crate::models::{Checkout, CheckoutState, IdempotencyRecord, WebhookEventRecord};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Monotonic per-document commit counter
pub type Revision = i64;

/// Bounded retries for optimistic-concurrency conflicts
const TXN_MAX_RETRIES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("revision conflict on {0}")]
    Conflict(String),

    #[error("document already exists: {0}")]
    AlreadyExists(String),

    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

/// A checkout document together with the revision it was read at
#[derive(Clone, Debug)]
pub struct VersionedCheckout {
    pub checkout: Checkout,
    pub revision: Revision,
}

/// Outcome of reserving an idempotency key
#[derive(Clone, Debug)]
pub enum ReserveOutcome {
    /// This caller owns the first execution
    Reserved,
    /// Another request already holds the key; the record may or may not have
    /// a captured response yet
    Existing(IdempotencyRecord),
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    // --- checkouts ---

    async fn insert_checkout(&self, checkout: &Checkout) -> Result<(), StoreError>;

    async fn get_checkout(&self, id: Uuid) -> Result<Option<VersionedCheckout>, StoreError>;

    /// Compare-and-swap write of the full document. Fails with
    /// [`StoreError::Conflict`] when the stored revision no longer matches.
    async fn commit_checkout(
        &self,
        checkout: &Checkout,
        expected: Revision,
    ) -> Result<Revision, StoreError>;

    /// Ids of checkouts in `state` whose `hold_expires_at` is in the past,
    /// oldest first.
    async fn list_expired_holds(
        &self,
        state: CheckoutState,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// The checkout owning a PMS reservation, if any. The reconciliation
    /// task uses this to tell live holds from orphans.
    async fn find_checkout_by_reservation(
        &self,
        reservation_id: &str,
    ) -> Result<Option<Uuid>, StoreError>;

    // --- idempotency_keys ---

    /// Inserts an in-flight reservation unless one already exists. An expired
    /// existing record is reclaimed and replaced.
    async fn reserve_idempotency_key(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<ReserveOutcome, StoreError>;

    async fn get_idempotency_record(
        &self,
        endpoint: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    async fn capture_idempotency_response(
        &self,
        endpoint: &str,
        key: &str,
        status: u16,
        body: &Value,
    ) -> Result<(), StoreError>;

    async fn delete_idempotency_record(&self, endpoint: &str, key: &str)
        -> Result<(), StoreError>;

    async fn reap_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    // --- webhook_events ---

    async fn get_webhook_event(
        &self,
        event_id: &str,
    ) -> Result<Option<WebhookEventRecord>, StoreError>;

    /// Records the event id as processed. Idempotent; the first processing
    /// timestamp wins.
    async fn mark_webhook_processed(
        &self,
        record: &WebhookEventRecord,
    ) -> Result<(), StoreError>;

    async fn reap_expired_webhook_events(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Document id for the idempotency collection: `{endpoint}:{key}` where
/// endpoint is `METHOD path`.
pub fn idempotency_doc_id(endpoint: &str, key: &str) -> String {
    format!("{}:{}", endpoint, key)
}

/// What a transactional mutator decided to do with the loaded document
pub enum TxnOutcome<T> {
    /// Write the mutated document back (CAS against the read revision)
    Commit(Checkout, T),
    /// Nothing to write
    ReadOnly(T),
}

/// Loads a checkout, runs `f` on it, and commits the result with optimistic
/// concurrency. On a revision conflict the whole read-mutate-commit cycle is
/// retried, so `f` must be safe to re-run; mutators with external side effects
/// manage their own commit loop instead.
pub async fn run_checkout_txn<T, E, F, Fut>(
    store: &dyn DocumentStore,
    id: Uuid,
    f: F,
) -> Result<T, E>
where
    E: From<StoreError>,
    F: Fn(VersionedCheckout) -> Fut,
    Fut: Future<Output = Result<TxnOutcome<T>, E>>,
{
    let mut attempt = 0;
    loop {
        let versioned = store
            .get_checkout(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let revision = versioned.revision;

        match f(versioned).await? {
            TxnOutcome::ReadOnly(value) => return Ok(value),
            TxnOutcome::Commit(doc, value) => {
                match store.commit_checkout(&doc, revision).await {
                    Ok(_) => return Ok(value),
                    Err(StoreError::Conflict(_)) if attempt < TXN_MAX_RETRIES => {
                        attempt += 1;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}
