//! Connection entity model
//!
//! A connection is one stored credential: environment-scoped, addressed by
//! the natural key `(connection_id, provider_config_key, environment_id)`.
//! Rows are soft-deleted; uniqueness holds over live rows only.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Connection entity holding an encrypted (or plaintext-mode) credential
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    /// Surrogate primary key
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Caller-chosen identifier for the end user or account
    pub connection_id: String,

    /// Key of the provider configuration this credential was issued under
    pub provider_config_key: String,

    /// Provider template name (e.g. "github", "twitter")
    pub provider: String,

    /// Owning environment
    pub environment_id: Uuid,

    /// Serialized credential union; ciphertext (base64) when iv/tag are set
    #[sea_orm(column_type = "JsonBinary")]
    pub credentials: JsonValue,

    /// Envelope IV, base64; NULL means the row is plaintext
    pub credentials_iv: Option<String>,

    /// Envelope authentication tag, base64
    pub credentials_tag: Option<String>,

    /// Per-connection configuration captured during the flow
    #[sea_orm(column_type = "JsonBinary")]
    pub connection_config: JsonValue,

    /// Caller-supplied opaque metadata
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Option<JsonValue>,

    /// Soft-delete flag; deleted rows are invisible to lookups and upserts
    pub deleted: bool,

    pub deleted_at: Option<chrono::DateTime<chrono::Utc>>,

    /// Last time the credential was read through the API
    pub last_fetched_at: Option<chrono::DateTime<chrono::Utc>>,

    pub created_at: chrono::DateTime<chrono::Utc>,

    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
