//! Refresh lock entity model
//!
//! Lease row behind the distributed refresh lock. `lock_key` is the
//! connection natural key (`env:config-key:connection-id`); an expired lease
//! may be stolen by another owner.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "refresh_locks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub lock_key: String,

    /// Holder's lease token
    pub owner: Uuid,

    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
