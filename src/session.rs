//! Pending authorization sessions
//!
//! A session carries everything the callback leg needs to finish a flow. Its
//! id is the `state` value round-tripped through the provider, so possession
//! of a valid `state` is the only credential the callback endpoint requires.
//! Sessions are single-use: the callback deletes the row before dispatching.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::credentials::AuthMode;
use crate::error::AuthError;
use crate::models::oauth_session;

/// In-flight flow state, keyed by the `state` correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub provider_config_key: String,
    pub provider: String,
    pub connection_id: String,
    pub callback_url: String,
    pub auth_mode: AuthMode,
    pub code_verifier: Option<String>,
    pub connection_config: BTreeMap<String, JsonValue>,
    /// Request-scoped overrides, re-applied on the callback leg and winning
    /// over anything the provider sends back
    pub request_overrides: BTreeMap<String, JsonValue>,
    pub environment_id: Uuid,
    pub ws_client_id: Option<String>,
    pub request_token_secret: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Fresh session with a UUIDv4 id.
    pub fn new(
        provider_config_key: String,
        provider: String,
        connection_id: String,
        callback_url: String,
        auth_mode: AuthMode,
        environment_id: Uuid,
    ) -> Self {
        Session {
            id: Uuid::new_v4().to_string(),
            provider_config_key,
            provider,
            connection_id,
            callback_url,
            auth_mode,
            code_verifier: None,
            connection_config: BTreeMap::new(),
            request_overrides: BTreeMap::new(),
            environment_id,
            ws_client_id: None,
            request_token_secret: None,
            created_at: Utc::now(),
        }
    }
}

/// Pluggable session persistence. The DB implementation gives cross-instance
/// visibility; the in-memory one serves single-process deployments and tests.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session. A colliding id is a [`AuthError::DuplicateSession`].
    async fn create(&self, session: &Session) -> Result<(), AuthError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Session>, AuthError>;

    /// Remove a session. Deleting an absent id is not an error.
    async fn delete(&self, id: &str) -> Result<(), AuthError>;

    /// Drop sessions older than `ttl_minutes`, returning how many were removed.
    async fn clear_stale(&self, ttl_minutes: i64) -> Result<u64, AuthError>;
}

/// SeaORM-backed session store.
pub struct DbSessionStore {
    db: Arc<DatabaseConnection>,
}

impl DbSessionStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    fn map_to_json(map: &BTreeMap<String, JsonValue>) -> JsonValue {
        JsonValue::Object(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    fn json_to_map(value: &JsonValue) -> BTreeMap<String, JsonValue> {
        value
            .as_object()
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    fn to_model(session: &Session) -> oauth_session::ActiveModel {
        oauth_session::ActiveModel {
            id: Set(session.id.clone()),
            provider_config_key: Set(session.provider_config_key.clone()),
            provider: Set(session.provider.clone()),
            connection_id: Set(session.connection_id.clone()),
            callback_url: Set(session.callback_url.clone()),
            auth_mode: Set(session.auth_mode.as_str().to_string()),
            code_verifier: Set(session.code_verifier.clone()),
            connection_config: Set(Self::map_to_json(&session.connection_config)),
            request_overrides: Set(Self::map_to_json(&session.request_overrides)),
            environment_id: Set(session.environment_id),
            ws_client_id: Set(session.ws_client_id.clone()),
            request_token_secret: Set(session.request_token_secret.clone()),
            created_at: Set(session.created_at),
        }
    }

    fn from_model(model: oauth_session::Model) -> Result<Session, AuthError> {
        let auth_mode: AuthMode = model.auth_mode.parse()?;
        let connection_config = Self::json_to_map(&model.connection_config);
        let request_overrides = Self::json_to_map(&model.request_overrides);

        Ok(Session {
            id: model.id,
            provider_config_key: model.provider_config_key,
            provider: model.provider,
            connection_id: model.connection_id,
            callback_url: model.callback_url,
            auth_mode,
            code_verifier: model.code_verifier,
            connection_config,
            request_overrides,
            environment_id: model.environment_id,
            ws_client_id: model.ws_client_id,
            request_token_secret: model.request_token_secret,
            created_at: model.created_at,
        })
    }
}

#[async_trait]
impl SessionStore for DbSessionStore {
    async fn create(&self, session: &Session) -> Result<(), AuthError> {
        if oauth_session::Entity::find_by_id(&session.id)
            .one(self.db.as_ref())
            .await?
            .is_some()
        {
            return Err(AuthError::DuplicateSession(session.id.clone()));
        }

        Self::to_model(session).insert(self.db.as_ref()).await?;
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Session>, AuthError> {
        let model = oauth_session::Entity::find_by_id(id)
            .one(self.db.as_ref())
            .await?;
        model.map(Self::from_model).transpose()
    }

    async fn delete(&self, id: &str) -> Result<(), AuthError> {
        oauth_session::Entity::delete_by_id(id)
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    async fn clear_stale(&self, ttl_minutes: i64) -> Result<u64, AuthError> {
        let cutoff = Utc::now() - Duration::minutes(ttl_minutes);
        let result = oauth_session::Entity::delete_many()
            .filter(oauth_session::Column::CreatedAt.lt(cutoff))
            .exec(self.db.as_ref())
            .await?;
        if result.rows_affected > 0 {
            tracing::info!(count = result.rows_affected, "swept stale sessions");
        }
        Ok(result.rows_affected)
    }
}

/// In-memory session store for single-instance deployments and tests.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: tokio::sync::Mutex<BTreeMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &Session) -> Result<(), AuthError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session.id) {
            return Err(AuthError::DuplicateSession(session.id.clone()));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Session>, AuthError> {
        Ok(self.sessions.lock().await.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<(), AuthError> {
        self.sessions.lock().await.remove(id);
        Ok(())
    }

    async fn clear_stale(&self, ttl_minutes: i64) -> Result<u64, AuthError> {
        let cutoff = Utc::now() - Duration::minutes(ttl_minutes);
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.created_at >= cutoff);
        Ok((before - sessions.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_session() -> Session {
        Session::new(
            "github-prod".to_string(),
            "github".to_string(),
            "user-1".to_string(),
            "https://bridge.example.com/oauth/callback".to_string(),
            AuthMode::OAuth2,
            Uuid::new_v4(),
        )
    }

    #[tokio::test]
    async fn memory_store_create_find_delete() {
        let store = MemorySessionStore::new();
        let session = sample_session();

        store.create(&session).await.unwrap();
        let found = store.find_by_id(&session.id).await.unwrap().unwrap();
        assert_eq!(found, session);

        store.delete(&session.id).await.unwrap();
        assert!(store.find_by_id(&session.id).await.unwrap().is_none());

        // deleting again is a no-op
        store.delete(&session.id).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_session_id_is_rejected() {
        let store = MemorySessionStore::new();
        let session = sample_session();

        store.create(&session).await.unwrap();
        let err = store.create(&session).await.unwrap_err();
        assert!(matches!(err, AuthError::DuplicateSession(_)));
    }

    #[tokio::test]
    async fn clear_stale_only_removes_expired() {
        let store = MemorySessionStore::new();

        let mut old = sample_session();
        old.created_at = Utc::now() - Duration::minutes(45);
        let fresh = sample_session();

        store.create(&old).await.unwrap();
        store.create(&fresh).await.unwrap();

        let removed = store.clear_stale(30).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.find_by_id(&old.id).await.unwrap().is_none());
        assert!(store.find_by_id(&fresh.id).await.unwrap().is_some());
    }
}
