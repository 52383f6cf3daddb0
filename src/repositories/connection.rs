//! Connection repository
//!
//! Encapsulates connection persistence: natural-key lookup over live rows,
//! upsert with metadata merge, envelope encryption on the way in, fail-closed
//! decryption on the way out, and the one-time encrypt-in-place migration.

use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::credentials::AuthCredentials;
use crate::crypto::{self, CryptoKey, EncryptedEnvelope};
use crate::error::AuthError;
use crate::models::connection::{self, Entity as Connection};
use crate::models::encryption_checkpoint::{self, Entity as EncryptionCheckpoint};

/// A connection with its credentials already decrypted.
#[derive(Debug, Clone)]
pub struct StoredConnection {
    pub id: Uuid,
    pub connection_id: String,
    pub provider_config_key: String,
    pub provider: String,
    pub environment_id: Uuid,
    pub credentials: AuthCredentials,
    pub connection_config: JsonValue,
    pub metadata: Option<JsonValue>,
    pub last_fetched_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOperation {
    Created,
    Updated,
}

#[derive(Debug, Clone)]
pub struct UpsertResult {
    pub id: Uuid,
    pub operation: UpsertOperation,
}

/// Repository for connection rows. Encryption is conditional: without a key
/// the service runs in plaintext mode and iv/tag stay NULL.
#[derive(Clone)]
pub struct ConnectionRepository {
    db: Arc<DatabaseConnection>,
    encryption_key: Option<CryptoKey>,
}

impl ConnectionRepository {
    pub fn new(db: Arc<DatabaseConnection>, encryption_key: Option<CryptoKey>) -> Self {
        Self { db, encryption_key }
    }

    /// Serialize and (conditionally) encrypt a credential union into the
    /// three column values.
    fn seal(
        &self,
        credentials: &AuthCredentials,
    ) -> Result<(JsonValue, Option<String>, Option<String>), AuthError> {
        let plain = serde_json::to_value(credentials).map_err(|e| {
            AuthError::InvalidProviderConfig(format!("credential serialization failed: {}", e))
        })?;

        match &self.encryption_key {
            Some(key) => {
                let envelope = crypto::encrypt_value(key, &plain)?;
                Ok((
                    JsonValue::String(envelope.ciphertext),
                    Some(envelope.iv),
                    Some(envelope.auth_tag),
                ))
            }
            None => Ok((plain, None, None)),
        }
    }

    /// Decrypt (or pass through) the stored credential columns. A row with
    /// iv/tag but no configured key fails closed.
    fn unseal(&self, model: &connection::Model) -> Result<AuthCredentials, AuthError> {
        let plain = match (&model.credentials_iv, &model.credentials_tag) {
            (Some(iv), Some(tag)) => {
                let key = self.encryption_key.as_ref().ok_or_else(|| {
                    AuthError::Crypto(crypto::CryptoError::InvalidKey(
                        "row is encrypted but no encryption key is configured".to_string(),
                    ))
                })?;
                let ciphertext = model.credentials.as_str().ok_or_else(|| {
                    AuthError::Crypto(crypto::CryptoError::InvalidFormat(
                        "encrypted credentials column is not a string".to_string(),
                    ))
                })?;
                let envelope = EncryptedEnvelope {
                    ciphertext: ciphertext.to_string(),
                    iv: iv.clone(),
                    auth_tag: tag.clone(),
                };
                crypto::decrypt_value(key, &envelope)?
            }
            _ => model.credentials.clone(),
        };

        serde_json::from_value(plain).map_err(|e| {
            AuthError::Crypto(crypto::CryptoError::InvalidFormat(format!(
                "stored credentials do not deserialize: {}",
                e
            )))
        })
    }

    fn to_stored(
        &self,
        model: connection::Model,
    ) -> Result<StoredConnection, AuthError> {
        let credentials = self.unseal(&model)?;
        Ok(StoredConnection {
            id: model.id,
            connection_id: model.connection_id,
            provider_config_key: model.provider_config_key,
            provider: model.provider,
            environment_id: model.environment_id,
            credentials,
            connection_config: model.connection_config,
            metadata: model.metadata,
            last_fetched_at: model.last_fetched_at,
            created_at: model.created_at,
            updated_at: model.updated_at,
        })
    }

    fn live_row_filter(
        environment_id: &Uuid,
        provider_config_key: &str,
        connection_id: &str,
    ) -> sea_orm::Select<Connection> {
        Connection::find()
            .filter(connection::Column::EnvironmentId.eq(*environment_id))
            .filter(connection::Column::ProviderConfigKey.eq(provider_config_key))
            .filter(connection::Column::ConnectionId.eq(connection_id))
            .filter(connection::Column::Deleted.eq(false))
    }

    /// Look up a live connection by its natural key.
    pub async fn find_by_natural_key(
        &self,
        environment_id: &Uuid,
        provider_config_key: &str,
        connection_id: &str,
    ) -> Result<Option<StoredConnection>, AuthError> {
        let model = Self::live_row_filter(environment_id, provider_config_key, connection_id)
            .one(self.db.as_ref())
            .await?;
        model.map(|m| self.to_stored(m)).transpose()
    }

    /// Insert or update by natural key. Existing metadata is kept unless the
    /// caller passes replacement metadata, which wins key-by-key.
    pub async fn upsert(
        &self,
        environment_id: &Uuid,
        provider_config_key: &str,
        provider: &str,
        connection_id: &str,
        credentials: &AuthCredentials,
        connection_config: JsonValue,
        metadata: Option<JsonValue>,
    ) -> Result<UpsertResult, AuthError> {
        let (sealed, iv, tag) = self.seal(credentials)?;
        let now = Utc::now();

        let existing = Self::live_row_filter(environment_id, provider_config_key, connection_id)
            .one(self.db.as_ref())
            .await?;

        match existing {
            Some(row) => {
                let merged_metadata = merge_metadata(row.metadata.clone(), metadata);
                let mut active: connection::ActiveModel = row.clone().into();
                active.provider = Set(provider.to_string());
                active.credentials = Set(sealed);
                active.credentials_iv = Set(iv);
                active.credentials_tag = Set(tag);
                active.connection_config = Set(connection_config);
                active.metadata = Set(merged_metadata);
                active.updated_at = Set(now);
                active.update(self.db.as_ref()).await?;
                Ok(UpsertResult {
                    id: row.id,
                    operation: UpsertOperation::Updated,
                })
            }
            None => {
                let id = Uuid::new_v4();
                connection::ActiveModel {
                    id: Set(id),
                    connection_id: Set(connection_id.to_string()),
                    provider_config_key: Set(provider_config_key.to_string()),
                    provider: Set(provider.to_string()),
                    environment_id: Set(*environment_id),
                    credentials: Set(sealed),
                    credentials_iv: Set(iv),
                    credentials_tag: Set(tag),
                    connection_config: Set(connection_config),
                    metadata: Set(metadata),
                    deleted: Set(false),
                    deleted_at: Set(None),
                    last_fetched_at: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(self.db.as_ref())
                .await?;
                Ok(UpsertResult {
                    id,
                    operation: UpsertOperation::Created,
                })
            }
        }
    }

    /// Replace the stored credentials of an existing row (refresh path).
    pub async fn update_credentials(
        &self,
        id: &Uuid,
        credentials: &AuthCredentials,
    ) -> Result<(), AuthError> {
        let (sealed, iv, tag) = self.seal(credentials)?;

        let row = Connection::find_by_id(*id)
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| AuthError::Storage(sea_orm::DbErr::RecordNotFound(id.to_string())))?;

        let mut active: connection::ActiveModel = row.into();
        active.credentials = Set(sealed);
        active.credentials_iv = Set(iv);
        active.credentials_tag = Set(tag);
        active.updated_at = Set(Utc::now());
        active.update(self.db.as_ref()).await?;
        Ok(())
    }

    /// Soft-delete a live connection. The row stays for audit; the natural
    /// key becomes free again.
    pub async fn soft_delete(
        &self,
        environment_id: &Uuid,
        provider_config_key: &str,
        connection_id: &str,
    ) -> Result<bool, AuthError> {
        let now = Utc::now();
        let result = Connection::update_many()
            .col_expr(connection::Column::Deleted, Expr::value(true))
            .col_expr(connection::Column::DeletedAt, Expr::value(Some(now)))
            .col_expr(connection::Column::UpdatedAt, Expr::value(now))
            .filter(connection::Column::EnvironmentId.eq(*environment_id))
            .filter(connection::Column::ProviderConfigKey.eq(provider_config_key))
            .filter(connection::Column::ConnectionId.eq(connection_id))
            .filter(connection::Column::Deleted.eq(false))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected > 0)
    }

    /// Record a credential read.
    pub async fn touch_last_fetched(&self, id: &Uuid) -> Result<(), AuthError> {
        Connection::update_many()
            .col_expr(connection::Column::LastFetchedAt, Expr::value(Some(Utc::now())))
            .filter(connection::Column::Id.eq(*id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// One-time, batched, idempotent encrypt-in-place migration.
    ///
    /// Rows that already carry an iv/tag are skipped, so an interrupted run
    /// resumes where it stopped. Once every row is sealed a checkpoint marks
    /// the key fingerprint; a later start with a different key is refused.
    pub async fn encrypt_database_if_needed(&self, batch_size: u64) -> Result<(), AuthError> {
        let Some(key) = self.encryption_key.clone() else {
            return Ok(());
        };
        let key_hash = key.fingerprint();

        let checkpoint = EncryptionCheckpoint::find().one(self.db.as_ref()).await?;
        if let Some(ref cp) = checkpoint {
            if cp.key_hash != key_hash {
                return Err(AuthError::EncryptionKeyImmutable);
            }
            if cp.complete {
                return Ok(());
            }
        }

        let mut migrated: u64 = 0;
        loop {
            let batch = Connection::find()
                .filter(connection::Column::CredentialsIv.is_null())
                .order_by_asc(connection::Column::CreatedAt)
                .limit(batch_size)
                .all(self.db.as_ref())
                .await?;
            if batch.is_empty() {
                break;
            }

            for row in batch {
                let envelope = crypto::encrypt_value(&key, &row.credentials)?;
                let mut active: connection::ActiveModel = row.into();
                active.credentials = Set(JsonValue::String(envelope.ciphertext));
                active.credentials_iv = Set(Some(envelope.iv));
                active.credentials_tag = Set(Some(envelope.auth_tag));
                active.updated_at = Set(Utc::now());
                active.update(self.db.as_ref()).await?;
                migrated += 1;
            }
        }

        let remaining = Connection::find()
            .filter(connection::Column::CredentialsIv.is_null())
            .count(self.db.as_ref())
            .await?;
        let complete = remaining == 0;

        let now = Utc::now();
        match checkpoint {
            Some(cp) => {
                let mut active: encryption_checkpoint::ActiveModel = cp.into();
                active.complete = Set(complete);
                active.updated_at = Set(now);
                active.update(self.db.as_ref()).await?;
            }
            None => {
                encryption_checkpoint::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    key_hash: Set(key_hash),
                    complete: Set(complete),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(self.db.as_ref())
                .await?;
            }
        }

        if migrated > 0 {
            tracing::info!(count = migrated, "encrypted stored credentials in place");
        }
        Ok(())
    }
}

/// Merge metadata objects: replacement keys win, untouched keys survive.
fn merge_metadata(
    existing: Option<JsonValue>,
    replacement: Option<JsonValue>,
) -> Option<JsonValue> {
    match (existing, replacement) {
        (current, None) => current,
        (None, incoming) => incoming,
        (Some(JsonValue::Object(mut base)), Some(JsonValue::Object(incoming))) => {
            for (k, v) in incoming {
                base.insert(k, v);
            }
            Some(JsonValue::Object(base))
        }
        // Non-object replacement wins wholesale
        (_, incoming) => incoming,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_merge_precedence() {
        let merged = merge_metadata(
            Some(json!({"a": 1, "b": 2})),
            Some(json!({"b": 3, "c": 4})),
        );
        assert_eq!(merged, Some(json!({"a": 1, "b": 3, "c": 4})));

        assert_eq!(
            merge_metadata(Some(json!({"a": 1})), None),
            Some(json!({"a": 1}))
        );
        assert_eq!(merge_metadata(None, Some(json!({"x": 1}))), Some(json!({"x": 1})));
        assert_eq!(merge_metadata(None, None), None);
    }
}
