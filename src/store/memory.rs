//! In-memory store backend.
//!
//! Mirrors the Postgres backend's semantics closely enough to drive the full
//! orchestrator in tests and local runs: per-document revisions, CAS commits,
//! reservation-style idempotency keys.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::models::{Checkout, CheckoutState, IdempotencyRecord, WebhookEventRecord};

use super::{
    idempotency_doc_id, DocumentStore, ReserveOutcome, Revision, StoreError, VersionedCheckout,
};

#[derive(Default)]
pub struct MemoryStore {
    checkouts: DashMap<Uuid, (Checkout, Revision)>,
    idempotency: DashMap<String, IdempotencyRecord>,
    webhooks: DashMap<String, WebhookEventRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_checkout(&self, checkout: &Checkout) -> Result<(), StoreError> {
        match self.checkouts.entry(checkout.checkout_id) {
            Entry::Occupied(_) => {
                Err(StoreError::AlreadyExists(checkout.checkout_id.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert((checkout.clone(), 1));
                Ok(())
            }
        }
    }

    async fn get_checkout(&self, id: Uuid) -> Result<Option<VersionedCheckout>, StoreError> {
        Ok(self.checkouts.get(&id).map(|entry| {
            let (checkout, revision) = entry.value();
            VersionedCheckout {
                checkout: checkout.clone(),
                revision: *revision,
            }
        }))
    }

    async fn commit_checkout(
        &self,
        checkout: &Checkout,
        expected: Revision,
    ) -> Result<Revision, StoreError> {
        match self.checkouts.entry(checkout.checkout_id) {
            Entry::Vacant(_) => {
                Err(StoreError::NotFound(checkout.checkout_id.to_string()))
            }
            Entry::Occupied(mut slot) => {
                if slot.get().1 != expected {
                    return Err(StoreError::Conflict(checkout.checkout_id.to_string()));
                }
                let next = expected + 1;
                slot.insert((checkout.clone(), next));
                Ok(next)
            }
        }
    }

    async fn list_expired_holds(
        &self,
        state: CheckoutState,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut hits: Vec<(DateTime<Utc>, Uuid)> = self
            .checkouts
            .iter()
            .filter(|entry| entry.value().0.state == state)
            .filter_map(|entry| {
                let doc = &entry.value().0;
                doc.hold_expires_at
                    .filter(|at| *at < now)
                    .map(|at| (at, doc.checkout_id))
            })
            .collect();
        hits.sort_by_key(|(at, _)| *at);
        hits.truncate(limit as usize);
        Ok(hits.into_iter().map(|(_, id)| id).collect())
    }

    async fn find_checkout_by_reservation(
        &self,
        reservation_id: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .checkouts
            .iter()
            .find(|entry| {
                entry.value().0.pms_reservation_id.as_deref() == Some(reservation_id)
            })
            .map(|entry| entry.value().0.checkout_id))
    }

    async fn reserve_idempotency_key(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<ReserveOutcome, StoreError> {
        let doc_id = idempotency_doc_id(&record.endpoint, &record.key);
        match self.idempotency.entry(doc_id) {
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(ReserveOutcome::Reserved)
            }
            Entry::Occupied(mut slot) => {
                if slot.get().is_expired(record.created_at) {
                    slot.insert(record.clone());
                    Ok(ReserveOutcome::Reserved)
                } else {
                    Ok(ReserveOutcome::Existing(slot.get().clone()))
                }
            }
        }
    }

    async fn get_idempotency_record(
        &self,
        endpoint: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self
            .idempotency
            .get(&idempotency_doc_id(endpoint, key))
            .map(|r| r.value().clone()))
    }

    async fn capture_idempotency_response(
        &self,
        endpoint: &str,
        key: &str,
        status: u16,
        body: &Value,
    ) -> Result<(), StoreError> {
        let doc_id = idempotency_doc_id(endpoint, key);
        if let Some(mut record) = self.idempotency.get_mut(&doc_id) {
            record.status = Some(status);
            record.body = Some(body.clone());
        }
        Ok(())
    }

    async fn delete_idempotency_record(
        &self,
        endpoint: &str,
        key: &str,
    ) -> Result<(), StoreError> {
        self.idempotency.remove(&idempotency_doc_id(endpoint, key));
        Ok(())
    }

    async fn reap_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let before = self.idempotency.len();
        self.idempotency.retain(|_, record| !record.is_expired(now));
        Ok((before - self.idempotency.len()) as u64)
    }

    async fn get_webhook_event(
        &self,
        event_id: &str,
    ) -> Result<Option<WebhookEventRecord>, StoreError> {
        Ok(self.webhooks.get(event_id).map(|r| r.value().clone()))
    }

    async fn mark_webhook_processed(
        &self,
        record: &WebhookEventRecord,
    ) -> Result<(), StoreError> {
        match self.webhooks.entry(record.event_id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
            Entry::Occupied(mut slot) => {
                // first processing timestamp wins
                if slot.get().processed_at.is_none() {
                    slot.get_mut().processed_at = record.processed_at;
                }
            }
        }
        Ok(())
    }

    async fn reap_expired_webhook_events(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let before = self.webhooks.len();
        self.webhooks.retain(|_, record| record.expires_at > now);
        Ok((before - self.webhooks.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Actor, GuestCount, Quote, QuoteBreakdown, StateTransition};
    use chrono::Duration;

    fn checkout(state: CheckoutState, hold_expires_at: Option<DateTime<Utc>>) -> Checkout {
        let now = Utc::now();
        Checkout {
            checkout_id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            state,
            state_history: vec![StateTransition {
                from: CheckoutState::Initiated,
                to: CheckoutState::Initiated,
                at: now,
                reason: Some("initialized".to_string()),
                actor: Actor::User,
            }],
            listing_id: "L1".to_string(),
            listing_name: None,
            check_in: now.date_naive() + Duration::days(10),
            check_out: now.date_naive() + Duration::days(13),
            guests: GuestCount {
                adults: 2,
                children: 0,
                infants: 0,
            },
            coupon_code: None,
            quote: Quote {
                total: 120_000,
                currency: "BRL".to_string(),
                breakdown: QuoteBreakdown {
                    subtotal: 100_000,
                    cleaning_fee: 10_000,
                    service_fee: 5_000,
                    taxes: 5_000,
                },
                hash: "0".repeat(64),
                expires_at: now + Duration::minutes(30),
            },
            guest: None,
            pms_reservation_id: None,
            pms_booking_code: None,
            psp_payment_intent_id: None,
            hold_expires_at,
            retry_count: 0,
            refund_required: false,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn cas_commit_detects_stale_revision() {
        let store = MemoryStore::new();
        let doc = checkout(CheckoutState::Initiated, None);
        store.insert_checkout(&doc).await.unwrap();

        let read = store.get_checkout(doc.checkout_id).await.unwrap().unwrap();
        assert_eq!(read.revision, 1);

        store.commit_checkout(&doc, 1).await.unwrap();
        let stale = store.commit_checkout(&doc, 1).await;
        assert!(matches!(stale, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let store = MemoryStore::new();
        let doc = checkout(CheckoutState::Initiated, None);
        store.insert_checkout(&doc).await.unwrap();
        assert!(matches!(
            store.insert_checkout(&doc).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn expired_holds_ordered_and_limited() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let mut ids = Vec::new();
        for minutes in [30, 10, 20] {
            let doc = checkout(
                CheckoutState::HoldCreated,
                Some(now - Duration::minutes(minutes)),
            );
            ids.push((minutes, doc.checkout_id));
            store.insert_checkout(&doc).await.unwrap();
        }
        // one alive hold and one in a non-expirable state stay out
        store
            .insert_checkout(&checkout(
                CheckoutState::HoldCreated,
                Some(now + Duration::minutes(5)),
            ))
            .await
            .unwrap();
        store
            .insert_checkout(&checkout(CheckoutState::Paid, Some(now - Duration::minutes(60))))
            .await
            .unwrap();

        let hits = store
            .list_expired_holds(CheckoutState::HoldCreated, now, 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        // oldest expiry first
        let oldest = ids.iter().find(|(m, _)| *m == 30).unwrap().1;
        assert_eq!(hits[0], oldest);
    }

    #[tokio::test]
    async fn idempotency_reservation_and_replay() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = IdempotencyRecord {
            endpoint: "POST /checkout/abc/hold".to_string(),
            key: "K1".to_string(),
            status: None,
            body: None,
            created_at: now,
            expires_at: now + Duration::hours(24),
        };

        assert!(matches!(
            store.reserve_idempotency_key(&record).await.unwrap(),
            ReserveOutcome::Reserved
        ));
        assert!(matches!(
            store.reserve_idempotency_key(&record).await.unwrap(),
            ReserveOutcome::Existing(_)
        ));

        store
            .capture_idempotency_response(
                &record.endpoint,
                &record.key,
                200,
                &serde_json::json!({"ok": true}),
            )
            .await
            .unwrap();

        match store.reserve_idempotency_key(&record).await.unwrap() {
            ReserveOutcome::Existing(existing) => {
                assert_eq!(existing.status, Some(200));
                assert_eq!(existing.body.unwrap()["ok"], true);
            }
            ReserveOutcome::Reserved => panic!("expected existing record"),
        }
    }

    #[tokio::test]
    async fn expired_idempotency_record_is_reclaimed() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let stale = IdempotencyRecord {
            endpoint: "POST /checkout/abc/hold".to_string(),
            key: "K1".to_string(),
            status: Some(200),
            body: Some(serde_json::json!({})),
            created_at: now - Duration::hours(48),
            expires_at: now - Duration::hours(24),
        };
        store.reserve_idempotency_key(&stale).await.unwrap();

        let fresh = IdempotencyRecord {
            status: None,
            body: None,
            created_at: now,
            expires_at: now + Duration::hours(24),
            ..stale.clone()
        };
        assert!(matches!(
            store.reserve_idempotency_key(&fresh).await.unwrap(),
            ReserveOutcome::Reserved
        ));
    }

    #[tokio::test]
    async fn webhook_mark_processed_keeps_first_timestamp() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = WebhookEventRecord {
            event_id: "evt_1".to_string(),
            processed_at: Some(now),
            expires_at: now + Duration::days(7),
        };
        store.mark_webhook_processed(&first).await.unwrap();

        let later = WebhookEventRecord {
            processed_at: Some(now + Duration::minutes(10)),
            ..first.clone()
        };
        store.mark_webhook_processed(&later).await.unwrap();

        let stored = store.get_webhook_event("evt_1").await.unwrap().unwrap();
        assert_eq!(stored.processed_at, Some(now));
    }

    #[tokio::test]
    async fn reaper_drops_only_expired_records() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for (id, offset) in [("evt_old", -1), ("evt_new", 1)] {
            store
                .mark_webhook_processed(&WebhookEventRecord {
                    event_id: id.to_string(),
                    processed_at: Some(now),
                    expires_at: now + Duration::days(offset),
                })
                .await
                .unwrap();
        }
        let reaped = store.reap_expired_webhook_events(now).await.unwrap();
        assert_eq!(reaped, 1);
        assert!(store.get_webhook_event("evt_new").await.unwrap().is_some());
        assert!(store.get_webhook_event("evt_old").await.unwrap().is_none());
    }
}
