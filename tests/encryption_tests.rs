//! Encrypt-in-place migration tests: idempotence, key pinning, fail-closed
//! reads.

use std::sync::Arc;

use sea_orm::{ConnectOptions, Database, DatabaseConnection, EntityTrait};
use serde_json::json;
use uuid::Uuid;

use keybridge::credentials::AuthCredentials;
use keybridge::crypto::CryptoKey;
use keybridge::db::ensure_schema;
use keybridge::error::AuthError;
use keybridge::models::connection;
use keybridge::repositories::ConnectionRepository;

async fn test_db() -> Arc<DatabaseConnection> {
    let mut opts = ConnectOptions::new("sqlite::memory:".to_string());
    opts.max_connections(1);
    let db = Database::connect(opts).await.expect("sqlite connect");
    ensure_schema(&db).await.expect("schema");
    Arc::new(db)
}

fn key(byte: u8) -> CryptoKey {
    CryptoKey::new(vec![byte; 32]).expect("32-byte key")
}

async fn seed_plaintext_rows(repo: &ConnectionRepository, environment_id: &Uuid, count: usize) {
    for i in 0..count {
        let credentials = AuthCredentials::ApiKey {
            api_key: format!("sk-{}", i),
            raw: json!({"api_key": format!("sk-{}", i)}),
        };
        repo.upsert(
            environment_id,
            "keyed-prod",
            "api-key",
            &format!("user-{}", i),
            &credentials,
            json!({}),
            None,
        )
        .await
        .expect("seed row");
    }
}

#[tokio::test]
async fn migration_seals_every_row_and_is_idempotent() {
    let db = test_db().await;
    let environment_id = Uuid::new_v4();

    let plain_repo = ConnectionRepository::new(Arc::clone(&db), None);
    seed_plaintext_rows(&plain_repo, &environment_id, 5).await;

    let sealed_repo = ConnectionRepository::new(Arc::clone(&db), Some(key(9)));
    // batch smaller than the row count to exercise the loop
    sealed_repo.encrypt_database_if_needed(2).await.expect("migration");

    let rows = connection::Entity::find().all(db.as_ref()).await.unwrap();
    assert_eq!(rows.len(), 5);
    for row in &rows {
        assert!(row.credentials_iv.is_some());
        assert!(row.credentials_tag.is_some());
        assert!(row.credentials.is_string(), "ciphertext column is a string");
    }

    // decrypts back to the original values
    let stored = sealed_repo
        .find_by_natural_key(&environment_id, "keyed-prod", "user-3")
        .await
        .unwrap()
        .expect("row");
    assert!(matches!(
        stored.credentials,
        AuthCredentials::ApiKey { ref api_key, .. } if api_key == "sk-3"
    ));

    // a second run is a no-op
    sealed_repo.encrypt_database_if_needed(2).await.expect("re-run");
    let stored = sealed_repo
        .find_by_natural_key(&environment_id, "keyed-prod", "user-0")
        .await
        .unwrap()
        .expect("row");
    assert!(matches!(
        stored.credentials,
        AuthCredentials::ApiKey { ref api_key, .. } if api_key == "sk-0"
    ));
}

#[tokio::test]
async fn a_different_key_is_refused_after_migration() {
    let db = test_db().await;
    let environment_id = Uuid::new_v4();

    let plain_repo = ConnectionRepository::new(Arc::clone(&db), None);
    seed_plaintext_rows(&plain_repo, &environment_id, 2).await;

    ConnectionRepository::new(Arc::clone(&db), Some(key(9)))
        .encrypt_database_if_needed(100)
        .await
        .expect("migration");

    let err = ConnectionRepository::new(Arc::clone(&db), Some(key(1)))
        .encrypt_database_if_needed(100)
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::EncryptionKeyImmutable));
}

#[tokio::test]
async fn encrypted_rows_fail_closed_without_a_key() {
    let db = test_db().await;
    let environment_id = Uuid::new_v4();

    let sealed_repo = ConnectionRepository::new(Arc::clone(&db), Some(key(9)));
    seed_plaintext_rows(&sealed_repo, &environment_id, 1).await;

    // reading through a keyless repository must not fall back to plaintext
    let plain_repo = ConnectionRepository::new(Arc::clone(&db), None);
    let err = plain_repo
        .find_by_natural_key(&environment_id, "keyed-prod", "user-0")
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Crypto(_)));
}

#[tokio::test]
async fn new_writes_are_sealed_once_a_key_is_configured() {
    let db = test_db().await;
    let environment_id = Uuid::new_v4();

    let sealed_repo = ConnectionRepository::new(Arc::clone(&db), Some(key(9)));
    sealed_repo.encrypt_database_if_needed(100).await.expect("checkpoint");
    seed_plaintext_rows(&sealed_repo, &environment_id, 1).await;

    let row = connection::Entity::find()
        .one(db.as_ref())
        .await
        .unwrap()
        .expect("row");
    assert!(row.credentials_iv.is_some());
    assert!(row.credentials_tag.is_some());
    assert_ne!(row.credentials, json!({"type": "api_key"}));

    let stored = sealed_repo
        .find_by_natural_key(&environment_id, "keyed-prod", "user-0")
        .await
        .unwrap()
        .expect("row");
    assert!(matches!(stored.credentials, AuthCredentials::ApiKey { .. }));
}
