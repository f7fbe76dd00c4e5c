use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Captured response for one `(endpoint, idempotency key)` pair.
/// `status` stays NULL while the first execution is in flight.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "idempotency_keys")]
pub struct Model {
    /// `METHOD path:key`
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub endpoint: String,
    pub idempotency_key: String,
    pub status: Option<i16>,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub body: Option<Json>,
    pub created_at: DateTimeUtc,
    pub expires_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
