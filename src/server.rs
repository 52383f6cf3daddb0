//! # Server Configuration
//!
//! Router assembly, shared state wiring, and the OpenAPI document.

use std::sync::Arc;

use axum::extract::FromRef;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::crypto::CryptoKey;
use crate::error::AuthError;
use crate::flows::{FlowDispatcher, FlowServices, ProviderExtensions};
use crate::handlers;
use crate::hooks::{HmacGate, LogNotifier, NoopHooks};
use crate::lock::DbRefreshLock;
use crate::providers::TemplateRegistry;
use crate::refresh::RefreshCoordinator;
use crate::repositories::{ConnectionRepository, ProviderConfigRepository};
use crate::session::DbSessionStore;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub dispatcher: Arc<FlowDispatcher>,
    pub refresher: Arc<RefreshCoordinator>,
}

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

/// Wire repositories, stores, and flow machinery into shared state.
pub fn build_state(
    config: Arc<AppConfig>,
    db: Arc<DatabaseConnection>,
) -> Result<AppState, AuthError> {
    let encryption_key = config
        .encryption_key
        .as_ref()
        .map(|bytes| CryptoKey::new(bytes.clone()))
        .transpose()?;

    let registry = match &config.templates_path {
        Some(path) => TemplateRegistry::from_file(path)?,
        None => TemplateRegistry::builtin(),
    };

    let services = Arc::new(FlowServices {
        sessions: Arc::new(DbSessionStore::new(Arc::clone(&db))),
        connections: ConnectionRepository::new(Arc::clone(&db), encryption_key),
        provider_configs: ProviderConfigRepository::new(Arc::clone(&db)),
        hmac_gate: HmacGate::new(config.hmac_key.clone()),
        notifier: Arc::new(LogNotifier),
        hooks: Arc::new(NoopHooks),
        http: reqwest::Client::new(),
        extensions: ProviderExtensions::default(),
        callback_url: config.callback_url(),
    });

    let registry = Arc::new(registry);
    let dispatcher = Arc::new(FlowDispatcher::new(
        Arc::clone(&services),
        Arc::clone(&registry),
    ));
    let refresher = Arc::new(RefreshCoordinator::new(
        services,
        registry,
        Arc::new(DbRefreshLock::new(db)),
        config.flow.clone(),
    ));

    Ok(AppState {
        config,
        dispatcher,
        refresher,
    })
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/authorize/{provider_config_key}",
            get(handlers::authorize::authorize),
        )
        .route(
            "/oauth2/client-credentials/{provider_config_key}",
            post(handlers::client_credentials::client_credentials),
        )
        .route(
            "/connections/{connection_id}",
            get(handlers::connections::get_connection)
                .delete(handlers::connections::delete_connection),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/oauth/callback", get(handlers::callback::callback))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Starts the server with the given state
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let addr: std::net::SocketAddr = state.config.api_bind_addr.parse()?;
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::authorize::authorize,
        crate::handlers::callback::callback,
        crate::handlers::client_credentials::client_credentials,
        crate::handlers::connections::get_connection,
        crate::handlers::connections::delete_connection,
    ),
    components(
        schemas(
            crate::handlers::ServiceInfo,
            crate::handlers::authorize::AuthorizeResponse,
            crate::handlers::callback::CallbackResponse,
            crate::handlers::client_credentials::ClientCredentialsBody,
            crate::handlers::client_credentials::ClientCredentialsResponse,
            crate::handlers::connections::ConnectionResponse,
            crate::error::ApiError,
        )
    ),
    modifiers(&SecurityAddon),
    info(
        title = "Keybridge API",
        description = "Third-party API credential broker",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .build(),
                ),
            );
        }
    }
}
