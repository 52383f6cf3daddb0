//! Provider configuration entity model
//!
//! Tenant-supplied half of a flow: client credentials and scopes registered
//! for one provider inside one environment. Rows are never mutated by flows.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Per-environment provider registration
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "provider_configs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub environment_id: Uuid,

    /// Lookup key used in authorize URLs (unique per environment)
    pub unique_key: String,

    /// Provider template name
    pub provider: String,

    pub oauth_client_id: String,

    pub oauth_client_secret: String,

    /// Scopes as a single separator-joined string
    pub oauth_scopes: Option<String>,

    /// Public install link for app-install providers
    pub app_link: Option<String>,

    /// Provider-specific extras (app id, private key, ...)
    #[sea_orm(column_type = "JsonBinary")]
    pub custom: Option<JsonValue>,

    pub created_at: chrono::DateTime<chrono::Utc>,

    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
