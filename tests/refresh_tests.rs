//! Refresh coordination tests: staleness decisions and single-flight refresh.

use std::io::Write;
use std::sync::Arc;

use chrono::{Duration, Utc};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use keybridge::config::FlowConfig;
use keybridge::credentials::AuthCredentials;
use keybridge::db::ensure_schema;
use keybridge::flows::{FlowServices, ProviderExtensions};
use keybridge::hooks::{HmacGate, LogNotifier, NoopHooks};
use keybridge::lock::MemoryRefreshLock;
use keybridge::providers::TemplateRegistry;
use keybridge::refresh::RefreshCoordinator;
use keybridge::repositories::{ConnectionRepository, ProviderConfigRepository, StoredConnection};
use keybridge::session::MemorySessionStore;

async fn test_db() -> Arc<DatabaseConnection> {
    let mut opts = ConnectOptions::new("sqlite::memory:".to_string());
    opts.max_connections(1);
    let db = Database::connect(opts).await.expect("sqlite connect");
    ensure_schema(&db).await.expect("schema");
    Arc::new(db)
}

fn registry_for(base: &str) -> Arc<TemplateRegistry> {
    let templates = json!({
        "mockoauth": {
            "auth_mode": "oauth2",
            "authorization_url": format!("{base}/oauth/authorize"),
            "token_url": format!("{base}/oauth/token"),
        }
    });
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(file, "{templates}").expect("write templates");
    Arc::new(TemplateRegistry::from_file(file.path()).expect("parse templates"))
}

struct Harness {
    services: Arc<FlowServices>,
    refresher: Arc<RefreshCoordinator>,
    environment_id: Uuid,
}

async fn harness(server: &MockServer) -> Harness {
    let db = test_db().await;
    let environment_id = Uuid::new_v4();

    let provider_configs = ProviderConfigRepository::new(Arc::clone(&db));
    provider_configs
        .create(
            &environment_id,
            "mock-prod",
            "mockoauth",
            "cid",
            "csecret",
            None,
            None,
            None,
        )
        .await
        .expect("provider config");

    let services = Arc::new(FlowServices {
        sessions: Arc::new(MemorySessionStore::new()),
        connections: ConnectionRepository::new(Arc::clone(&db), None),
        provider_configs,
        hmac_gate: HmacGate::disabled(),
        notifier: Arc::new(LogNotifier),
        hooks: Arc::new(NoopHooks),
        http: reqwest::Client::new(),
        extensions: ProviderExtensions::default(),
        callback_url: "https://bridge.example.com/oauth/callback".to_string(),
    });

    let refresher = Arc::new(RefreshCoordinator::new(
        Arc::clone(&services),
        registry_for(&server.uri()),
        Arc::new(MemoryRefreshLock::new()),
        FlowConfig::default(),
    ));

    Harness {
        services,
        refresher,
        environment_id,
    }
}

async fn seed_connection(
    h: &Harness,
    refresh_token: Option<&str>,
    expires_in_seconds: i64,
) -> StoredConnection {
    let credentials = AuthCredentials::OAuth2 {
        access_token: "old-at".to_string(),
        refresh_token: refresh_token.map(str::to_string),
        expires_at: Some(Utc::now() + Duration::seconds(expires_in_seconds)),
        raw: json!({}),
    };
    h.services
        .connections
        .upsert(
            &h.environment_id,
            "mock-prod",
            "mockoauth",
            "user-1",
            &credentials,
            json!({}),
            None,
        )
        .await
        .expect("seed");

    h.services
        .connections
        .find_by_natural_key(&h.environment_id, "mock-prod", "user-1")
        .await
        .unwrap()
        .expect("seeded connection")
}

fn access_token(connection: &StoredConnection) -> &str {
    match &connection.credentials {
        AuthCredentials::OAuth2 { access_token, .. } => access_token,
        other => panic!("unexpected credentials: {:?}", other),
    }
}

#[tokio::test]
async fn concurrent_reads_trigger_exactly_one_refresh() {
    let server = MockServer::start().await;
    let h = harness(&server).await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=rt-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-at",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    // expires inside the 15 minute buffer
    let stale = seed_connection(&h, Some("rt-1"), 60).await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let refresher = Arc::clone(&h.refresher);
        let snapshot = stale.clone();
        tasks.push(tokio::spawn(async move {
            refresher.ensure_fresh(snapshot, false).await
        }));
    }

    for task in tasks {
        let refreshed = task.await.unwrap().expect("refresh");
        assert_eq!(access_token(&refreshed), "new-at");
        // the provider omitted the refresh token, the stored one survives
        assert_eq!(refreshed.credentials.refresh_token(), Some("rt-1"));
    }

    // persisted too
    let stored = h
        .services
        .connections
        .find_by_natural_key(&h.environment_id, "mock-prod", "user-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(access_token(&stored), "new-at");
}

#[tokio::test]
async fn fresh_credentials_are_returned_without_a_provider_call() {
    let server = MockServer::start().await;
    let h = harness(&server).await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let fresh = seed_connection(&h, Some("rt-1"), 2 * 3600).await;
    let result = h.refresher.ensure_fresh(fresh, false).await.unwrap();
    assert_eq!(access_token(&result), "old-at");
}

#[tokio::test]
async fn missing_refresh_token_skips_refresh_even_when_expired() {
    let server = MockServer::start().await;
    let h = harness(&server).await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&server)
        .await;

    let expired = seed_connection(&h, None, -60).await;
    let result = h.refresher.ensure_fresh(expired, false).await.unwrap();
    assert_eq!(access_token(&result), "old-at");
}

#[tokio::test]
async fn force_refresh_ignores_expiry() {
    let server = MockServer::start().await;
    let h = harness(&server).await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "forced-at",
            "refresh_token": "rt-2",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fresh = seed_connection(&h, Some("rt-1"), 2 * 3600).await;
    let result = h.refresher.ensure_fresh(fresh, true).await.unwrap();
    assert_eq!(access_token(&result), "forced-at");
    // rotated refresh token replaces the stored one
    assert_eq!(result.credentials.refresh_token(), Some("rt-2"));
}

#[tokio::test]
async fn provider_rejection_surfaces_as_refresh_error() {
    let server = MockServer::start().await;
    let h = harness(&server).await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let stale = seed_connection(&h, Some("rt-1"), 60).await;
    let err = h.refresher.ensure_fresh(stale, false).await.unwrap_err();
    assert!(matches!(
        err,
        keybridge::error::AuthError::TokenRetrievalFailed { .. }
    ));

    // stored credentials are untouched on failure
    let stored = h
        .services
        .connections
        .find_by_natural_key(&h.environment_id, "mock-prod", "user-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(access_token(&stored), "old-at");
}
