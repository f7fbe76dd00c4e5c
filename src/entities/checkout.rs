use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// One row per checkout document. The full aggregate lives in `doc`; the
/// extracted columns exist for the sweeper query and for CAS commits.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "checkouts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub state: String,
    pub pms_reservation_id: Option<String>,
    pub hold_expires_at: Option<DateTimeUtc>,
    pub updated_at: DateTimeUtc,
    pub revision: i64,

    #[sea_orm(column_type = "JsonBinary")]
    pub doc: Json,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
