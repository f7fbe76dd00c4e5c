//! Request replay suppression and webhook deduplication (the idempotency
//! store). Both live in the document store so every process behind the load
//! balancer shares them.

use chrono::{Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::ServiceError;
use crate::models::{IdempotencyRecord, WebhookEventRecord};
use crate::store::{DocumentStore, ReserveOutcome};

/// How a request with an idempotency key proceeds
pub enum RequestIdempotency {
    /// A previous execution finished; serve its captured response
    Replay { status: u16, body: Value },
    /// This caller owns the first execution
    Execute(CaptureGuard),
    /// Another execution holds the key but has not captured a response yet
    InProgress,
}

/// Continuation that records the eventual response under the reserved key
pub struct CaptureGuard {
    store: Arc<dyn DocumentStore>,
    endpoint: String,
    key: String,
}

impl CaptureGuard {
    /// Records the outcome. 5xx responses are not replayable; their
    /// reservation is released so the caller's retry re-executes. Storage
    /// failures are logged and swallowed: a missed cache entry merely permits
    /// a retry to run again.
    pub async fn finish(self, status: u16, body: &Value) {
        let result = if status >= 500 {
            self.store
                .delete_idempotency_record(&self.endpoint, &self.key)
                .await
        } else {
            self.store
                .capture_idempotency_response(&self.endpoint, &self.key, status, body)
                .await
        };
        if let Err(e) = result {
            warn!(
                endpoint = %self.endpoint,
                error = %e,
                "failed to record idempotent response"
            );
        }
    }
}

#[derive(Clone)]
pub struct IdempotencyService {
    store: Arc<dyn DocumentStore>,
    request_ttl: Duration,
    webhook_ttl: Duration,
}

impl IdempotencyService {
    pub fn new(store: Arc<dyn DocumentStore>, request_ttl: Duration, webhook_ttl: Duration) -> Self {
        Self {
            store,
            request_ttl,
            webhook_ttl,
        }
    }

    /// Reserves `(endpoint, key)` or resolves what an earlier execution left
    /// behind. Expired records are reclaimed by the store on reservation.
    pub async fn begin_request(
        &self,
        endpoint: &str,
        key: &str,
    ) -> Result<RequestIdempotency, ServiceError> {
        let now = Utc::now();
        let record = IdempotencyRecord {
            endpoint: endpoint.to_string(),
            key: key.to_string(),
            status: None,
            body: None,
            created_at: now,
            expires_at: now + self.request_ttl,
        };

        match self.store.reserve_idempotency_key(&record).await? {
            ReserveOutcome::Reserved => Ok(RequestIdempotency::Execute(CaptureGuard {
                store: self.store.clone(),
                endpoint: endpoint.to_string(),
                key: key.to_string(),
            })),
            ReserveOutcome::Existing(existing) => match existing.status {
                Some(status) => {
                    debug!(endpoint, key, "replaying idempotent response");
                    Ok(RequestIdempotency::Replay {
                        status,
                        body: existing.body.unwrap_or(Value::Null),
                    })
                }
                None => Ok(RequestIdempotency::InProgress),
            },
        }
    }

    /// Short-polls for the response a concurrent execution is about to
    /// capture. Returns `None` when the window closes first.
    pub async fn await_captured(
        &self,
        endpoint: &str,
        key: &str,
        max_wait: std::time::Duration,
    ) -> Result<Option<(u16, Value)>, ServiceError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            if let Some(record) = self.store.get_idempotency_record(endpoint, key).await? {
                if let Some(status) = record.status {
                    return Ok(Some((status, record.body.unwrap_or(Value::Null))));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    }

    /// True when this PSP event id has already been fully processed
    pub async fn webhook_seen(&self, event_id: &str) -> Result<bool, ServiceError> {
        let now = Utc::now();
        Ok(self
            .store
            .get_webhook_event(event_id)
            .await?
            .map(|record| record.processed_at.is_some() && record.expires_at > now)
            .unwrap_or(false))
    }

    /// Marks the event processed; idempotent, first timestamp wins
    pub async fn mark_webhook_processed(&self, event_id: &str) -> Result<(), ServiceError> {
        let now = Utc::now();
        self.store
            .mark_webhook_processed(&WebhookEventRecord {
                event_id: event_id.to_string(),
                processed_at: Some(now),
                expires_at: now + self.webhook_ttl,
            })
            .await?;
        Ok(())
    }

    /// The daily reaper: drops expired idempotency and webhook records
    pub async fn reap_expired(&self) -> Result<(u64, u64), ServiceError> {
        let now = Utc::now();
        let requests = self.store.reap_expired_idempotency(now).await?;
        let webhooks = self.store.reap_expired_webhook_events(now).await?;
        Ok((requests, webhooks))
    }
}
