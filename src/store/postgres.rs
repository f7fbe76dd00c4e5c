//! sea-orm backed store. Postgres in production; the same code runs the
//! SQLite backend in integration environments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, Database, DatabaseConnection, DbErr,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr,
};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::entities::{checkout, idempotency_key, webhook_event};
use crate::models::{Checkout, CheckoutState, IdempotencyRecord, WebhookEventRecord};

use super::{
    idempotency_doc_id, DocumentStore, ReserveOutcome, Revision, StoreError, VersionedCheckout,
};

/// Establishes the database connection pool
pub async fn connect(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    debug!("connecting to document store at {}", database_url);
    let mut opt = ConnectOptions::new(database_url.to_owned());
    opt.max_connections(16)
        .min_connections(2)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(8))
        .idle_timeout(Duration::from_secs(600))
        .sqlx_logging(false);
    Database::connect(opt).await
}

#[derive(Clone)]
pub struct PostgresStore {
    db: DatabaseConnection,
}

impl PostgresStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn record_from_model(model: idempotency_key::Model) -> IdempotencyRecord {
        IdempotencyRecord {
            endpoint: model.endpoint,
            key: model.idempotency_key,
            status: model.status.map(|s| s as u16),
            body: model.body,
            created_at: model.created_at,
            expires_at: model.expires_at,
        }
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn insert_checkout(&self, doc: &Checkout) -> Result<(), StoreError> {
        let model = checkout::ActiveModel {
            id: Set(doc.checkout_id),
            state: Set(doc.state.to_string()),
            pms_reservation_id: Set(doc.pms_reservation_id.clone()),
            hold_expires_at: Set(doc.hold_expires_at),
            updated_at: Set(doc.updated_at),
            revision: Set(1),
            doc: Set(serde_json::to_value(doc)?),
        };
        match model.insert(&self.db).await {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Err(StoreError::AlreadyExists(doc.checkout_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_checkout(&self, id: Uuid) -> Result<Option<VersionedCheckout>, StoreError> {
        let Some(model) = checkout::Entity::find_by_id(id).one(&self.db).await? else {
            return Ok(None);
        };
        let doc: Checkout = serde_json::from_value(model.doc)?;
        Ok(Some(VersionedCheckout {
            checkout: doc,
            revision: model.revision,
        }))
    }

    async fn commit_checkout(
        &self,
        doc: &Checkout,
        expected: Revision,
    ) -> Result<Revision, StoreError> {
        let next = expected + 1;
        let result = checkout::Entity::update_many()
            .col_expr(checkout::Column::State, Expr::value(doc.state.to_string()))
            .col_expr(
                checkout::Column::PmsReservationId,
                Expr::value(doc.pms_reservation_id.clone()),
            )
            .col_expr(
                checkout::Column::HoldExpiresAt,
                Expr::value(doc.hold_expires_at),
            )
            .col_expr(checkout::Column::UpdatedAt, Expr::value(doc.updated_at))
            .col_expr(checkout::Column::Revision, Expr::value(next))
            .col_expr(checkout::Column::Doc, Expr::value(serde_json::to_value(doc)?))
            .filter(checkout::Column::Id.eq(doc.checkout_id))
            .filter(checkout::Column::Revision.eq(expected))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::Conflict(doc.checkout_id.to_string()));
        }
        Ok(next)
    }

    async fn list_expired_holds(
        &self,
        state: CheckoutState,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<Uuid>, StoreError> {
        let models = checkout::Entity::find()
            .filter(checkout::Column::State.eq(state.to_string()))
            .filter(checkout::Column::HoldExpiresAt.lt(now))
            .order_by_asc(checkout::Column::HoldExpiresAt)
            .limit(limit)
            .all(&self.db)
            .await?;
        Ok(models.into_iter().map(|m| m.id).collect())
    }

    async fn find_checkout_by_reservation(
        &self,
        reservation_id: &str,
    ) -> Result<Option<Uuid>, StoreError> {
        let model = checkout::Entity::find()
            .filter(checkout::Column::PmsReservationId.eq(reservation_id))
            .one(&self.db)
            .await?;
        Ok(model.map(|m| m.id))
    }

    async fn reserve_idempotency_key(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<ReserveOutcome, StoreError> {
        let doc_id = idempotency_doc_id(&record.endpoint, &record.key);
        let model = idempotency_key::ActiveModel {
            id: Set(doc_id.clone()),
            endpoint: Set(record.endpoint.clone()),
            idempotency_key: Set(record.key.clone()),
            status: Set(None),
            body: Set(None),
            created_at: Set(record.created_at),
            expires_at: Set(record.expires_at),
        };

        let inserted = idempotency_key::Entity::insert(model)
            .on_conflict(
                OnConflict::column(idempotency_key::Column::Id)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        if inserted == 1 {
            return Ok(ReserveOutcome::Reserved);
        }

        // Key exists. Reclaim it if the record has expired; the expires_at
        // filter keeps concurrent reclaimers from both winning.
        let reclaimed = idempotency_key::Entity::update_many()
            .col_expr(idempotency_key::Column::Status, Expr::value(None::<i16>))
            .col_expr(idempotency_key::Column::Body, Expr::value(None::<Value>))
            .col_expr(
                idempotency_key::Column::CreatedAt,
                Expr::value(record.created_at),
            )
            .col_expr(
                idempotency_key::Column::ExpiresAt,
                Expr::value(record.expires_at),
            )
            .filter(idempotency_key::Column::Id.eq(doc_id.clone()))
            .filter(idempotency_key::Column::ExpiresAt.lte(record.created_at))
            .exec(&self.db)
            .await?;
        if reclaimed.rows_affected == 1 {
            return Ok(ReserveOutcome::Reserved);
        }

        match idempotency_key::Entity::find_by_id(doc_id).one(&self.db).await? {
            Some(existing) => Ok(ReserveOutcome::Existing(Self::record_from_model(existing))),
            // deleted between the insert attempt and the read; treat as ours
            None => Ok(ReserveOutcome::Reserved),
        }
    }

    async fn get_idempotency_record(
        &self,
        endpoint: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let model = idempotency_key::Entity::find_by_id(idempotency_doc_id(endpoint, key))
            .one(&self.db)
            .await?;
        Ok(model.map(Self::record_from_model))
    }

    async fn capture_idempotency_response(
        &self,
        endpoint: &str,
        key: &str,
        status: u16,
        body: &Value,
    ) -> Result<(), StoreError> {
        idempotency_key::Entity::update_many()
            .col_expr(
                idempotency_key::Column::Status,
                Expr::value(Some(status as i16)),
            )
            .col_expr(idempotency_key::Column::Body, Expr::value(Some(body.clone())))
            .filter(idempotency_key::Column::Id.eq(idempotency_doc_id(endpoint, key)))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_idempotency_record(
        &self,
        endpoint: &str,
        key: &str,
    ) -> Result<(), StoreError> {
        idempotency_key::Entity::delete_many()
            .filter(idempotency_key::Column::Id.eq(idempotency_doc_id(endpoint, key)))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn reap_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = idempotency_key::Entity::delete_many()
            .filter(idempotency_key::Column::ExpiresAt.lte(now))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    async fn get_webhook_event(
        &self,
        event_id: &str,
    ) -> Result<Option<WebhookEventRecord>, StoreError> {
        let model = webhook_event::Entity::find_by_id(event_id.to_owned())
            .one(&self.db)
            .await?;
        Ok(model.map(|m| WebhookEventRecord {
            event_id: m.id,
            processed_at: m.processed_at,
            expires_at: m.expires_at,
        }))
    }

    async fn mark_webhook_processed(
        &self,
        record: &WebhookEventRecord,
    ) -> Result<(), StoreError> {
        let model = webhook_event::ActiveModel {
            id: Set(record.event_id.clone()),
            processed_at: Set(record.processed_at),
            expires_at: Set(record.expires_at),
        };
        webhook_event::Entity::insert(model)
            .on_conflict(
                OnConflict::column(webhook_event::Column::Id)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        // first processing timestamp wins
        webhook_event::Entity::update_many()
            .col_expr(
                webhook_event::Column::ProcessedAt,
                Expr::value(record.processed_at),
            )
            .filter(webhook_event::Column::Id.eq(record.event_id.clone()))
            .filter(webhook_event::Column::ProcessedAt.is_null())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn reap_expired_webhook_events(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = webhook_event::Entity::delete_many()
            .filter(webhook_event::Column::ExpiresAt.lte(now))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}
