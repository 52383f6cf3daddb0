//! OAuth session entity model
//!
//! One row per in-flight redirect-based flow. The row id doubles as the
//! `state` value round-tripped through the provider; rows are consumed
//! exactly once by the callback and swept by TTL at startup.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Pending authorization session keyed by the `state` correlation id
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "oauth_sessions")]
pub struct Model {
    /// Session id; also the `state` parameter (UUIDv4 string)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub provider_config_key: String,

    pub provider: String,

    pub connection_id: String,

    /// Redirect URI registered with the provider for this flow
    pub callback_url: String,

    /// Auth mode string, parsed back on callback
    pub auth_mode: String,

    /// PKCE code verifier (hex), absent when PKCE is disabled
    pub code_verifier: Option<String>,

    /// Connection config snapshot from the stored provider config
    #[sea_orm(column_type = "JsonBinary")]
    pub connection_config: JsonValue,

    /// Request-scoped overrides, re-applied on the callback leg
    #[sea_orm(column_type = "JsonBinary")]
    pub request_overrides: JsonValue,

    pub environment_id: Uuid,

    /// Client channel to notify on completion
    pub ws_client_id: Option<String>,

    /// OAuth 1.0a temporary token secret, held between the two legs
    pub request_token_secret: Option<String>,

    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
