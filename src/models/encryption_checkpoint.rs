//! Encryption checkpoint entity model
//!
//! Single-row bookkeeping for the encrypt-in-place migration. `key_hash` is
//! the SHA-256 fingerprint of the active key; once set it may never change.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "encryption_checkpoints")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// SHA-256 hex fingerprint of the encryption key
    pub key_hash: String,

    /// True once every stored credential is encrypted under this key
    pub complete: bool,

    pub created_at: chrono::DateTime<chrono::Utc>,

    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
