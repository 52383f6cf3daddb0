//! Provider configuration repository

use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::AuthError;
use crate::models::provider_config::{self, Entity as ProviderConfig};

/// Repository for environment-scoped provider registrations.
#[derive(Clone)]
pub struct ProviderConfigRepository {
    db: Arc<DatabaseConnection>,
}

impl ProviderConfigRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Look up a config by its environment-scoped key. Unknown keys are a
    /// configuration error naming the key.
    pub async fn find_by_key(
        &self,
        environment_id: &Uuid,
        unique_key: &str,
    ) -> Result<provider_config::Model, AuthError> {
        ProviderConfig::find()
            .filter(provider_config::Column::EnvironmentId.eq(*environment_id))
            .filter(provider_config::Column::UniqueKey.eq(unique_key))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| AuthError::UnknownProviderConfig(unique_key.to_string()))
    }

    /// Register a provider config (administrative path).
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        environment_id: &Uuid,
        unique_key: &str,
        provider: &str,
        oauth_client_id: &str,
        oauth_client_secret: &str,
        oauth_scopes: Option<String>,
        app_link: Option<String>,
        custom: Option<JsonValue>,
    ) -> Result<provider_config::Model, AuthError> {
        let now = Utc::now();
        let model = provider_config::ActiveModel {
            id: Set(Uuid::new_v4()),
            environment_id: Set(*environment_id),
            unique_key: Set(unique_key.to_string()),
            provider: Set(provider.to_string()),
            oauth_client_id: Set(oauth_client_id.to_string()),
            oauth_client_secret: Set(oauth_client_secret.to_string()),
            oauth_scopes: Set(oauth_scopes),
            app_link: Set(app_link),
            custom: Set(custom),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await?;
        Ok(model)
    }
}
