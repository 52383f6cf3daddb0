//! Authorization flows
//!
//! The dispatcher owns the ordered begin/callback pipelines; per-protocol
//! behavior lives in one [`AuthFlowHandler`] per redirect-based mode, selected
//! by table lookup. Synchronous modes (client credentials and the import
//! modes) complete inside `begin_authorization` without a session.

pub mod app_install;
pub mod client_credentials;
pub mod oauth1;
pub mod oauth2;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use url::Url;
use uuid::Uuid;

use crate::credentials::{self, AuthCredentials, AuthMode};
use crate::error::AuthError;
use crate::hooks::{ClientNotifier, ConnectionHooks, HmacGate};
use crate::interpolation;
use crate::models::provider_config;
use crate::providers::{ProviderTemplate, TemplateRegistry};
use crate::repositories::{ConnectionRepository, ProviderConfigRepository, UpsertOperation};
use crate::session::{Session, SessionStore};

/// Request-scoped overrides carried from the authorize request into the
/// callback leg. They always win over stored configuration and over anything
/// the provider sends back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOverrides {
    /// `params[...]` connection config entries
    #[serde(default)]
    pub params: BTreeMap<String, JsonValue>,
    /// `authorization_params[...]`; an empty value removes a template default
    #[serde(default)]
    pub authorization_params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_scopes: Option<String>,
}

impl RequestOverrides {
    pub fn to_map(&self) -> BTreeMap<String, JsonValue> {
        match serde_json::to_value(self) {
            Ok(JsonValue::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    }

    pub fn from_map(map: &BTreeMap<String, JsonValue>) -> Self {
        serde_json::from_value(JsonValue::Object(
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        ))
        .unwrap_or_default()
    }
}

/// Parsed authorize request.
#[derive(Debug, Clone, Default)]
pub struct AuthorizeRequest {
    pub connection_id: String,
    pub ws_client_id: Option<String>,
    pub hmac: Option<String>,
    pub overrides: RequestOverrides,
    /// `credentials[...]` payload for the import modes
    pub credentials: BTreeMap<String, String>,
}

/// Raw provider callback query parameters.
#[derive(Debug, Clone, Default)]
pub struct CallbackParams {
    params: BTreeMap<String, String>,
}

impl CallbackParams {
    pub fn new(params: BTreeMap<String, String>) -> Self {
        Self { params }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Everything except the correlation and artifact parameters, kept as
    /// provider metadata.
    pub fn metadata(&self) -> BTreeMap<String, JsonValue> {
        self.params
            .iter()
            .filter(|(k, _)| {
                !matches!(
                    k.as_str(),
                    "state" | "code" | "oauth_token" | "oauth_verifier" | "scope"
                )
            })
            .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
            .collect()
    }
}

/// Immutable per-request configuration built by layered merge:
/// template defaults, then the stored provider config, then request
/// overrides. The stored row is never mutated.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub provider: String,
    pub provider_config_key: String,
    pub environment_id: Uuid,
    pub template: ProviderTemplate,
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    pub scopes: Option<String>,
    pub app_link: Option<String>,
    pub custom: BTreeMap<String, JsonValue>,
    /// Template authorization params with request edits applied
    pub authorization_params: BTreeMap<String, String>,
    /// Connection config entries from `params[...]`
    pub connection_config: BTreeMap<String, JsonValue>,
}

impl RequestConfig {
    pub fn build(
        environment_id: Uuid,
        template: &ProviderTemplate,
        stored: &provider_config::Model,
        overrides: &RequestOverrides,
    ) -> Self {
        let mut authorization_params = template.authorization_params.clone();
        for (key, value) in &overrides.authorization_params {
            if value.is_empty() {
                authorization_params.remove(key);
            } else {
                authorization_params.insert(key.clone(), value.clone());
            }
        }

        let custom = stored
            .custom
            .as_ref()
            .and_then(|v| v.as_object())
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        RequestConfig {
            provider: stored.provider.clone(),
            provider_config_key: stored.unique_key.clone(),
            environment_id,
            template: template.clone(),
            oauth_client_id: overrides
                .oauth_client_id
                .clone()
                .unwrap_or_else(|| stored.oauth_client_id.clone()),
            oauth_client_secret: overrides
                .oauth_client_secret
                .clone()
                .unwrap_or_else(|| stored.oauth_client_secret.clone()),
            scopes: overrides
                .oauth_scopes
                .clone()
                .or_else(|| stored.oauth_scopes.clone()),
            app_link: stored.app_link.clone(),
            custom,
            authorization_params,
            connection_config: overrides.params.clone(),
        }
    }

    /// Values available to `{{placeholder}}` interpolation: connection config
    /// entries, stored custom values, and the app link.
    pub fn interpolation_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        for (k, v) in &self.custom {
            if let Some(s) = v.as_str() {
                params.insert(k.clone(), s.to_string());
            }
        }
        for (k, v) in &self.connection_config {
            if let Some(s) = v.as_str() {
                params.insert(k.clone(), s.to_string());
            }
        }
        if let Some(link) = &self.app_link {
            params.insert("app_public_link".to_string(), link.clone());
        }
        params
    }

    /// Scopes joined with the template's separator, if any are configured.
    pub fn joined_scopes(&self) -> Option<String> {
        let scopes = self.scopes.as_deref()?.trim();
        if scopes.is_empty() {
            return None;
        }
        let parts: Vec<&str> = scopes
            .split([' ', ','])
            .filter(|s| !s.is_empty())
            .collect();
        Some(parts.join(&self.template.scope_separator))
    }
}

/// Merge connection config for persistence. Precedence, strongest last:
/// session config, then provider callback metadata, then request overrides.
pub fn merge_connection_config(
    session_config: &BTreeMap<String, JsonValue>,
    callback_metadata: &BTreeMap<String, JsonValue>,
    request_overrides: &BTreeMap<String, JsonValue>,
) -> BTreeMap<String, JsonValue> {
    let mut merged = session_config.clone();
    for (k, v) in callback_metadata {
        merged.insert(k.clone(), v.clone());
    }
    for (k, v) in request_overrides {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Result of `begin_authorization`.
#[derive(Debug, Clone)]
pub enum BeginOutcome {
    /// Redirect the end user to the provider; the flow completes later
    /// through the callback.
    Redirect { url: Url, session_id: String },
    /// Synchronous mode; the credential is already stored.
    Connected {
        connection_id: String,
        provider_config_key: String,
        operation: UpsertOperation,
    },
}

/// Result of `handle_callback`.
#[derive(Debug, Clone)]
pub enum CallbackOutcome {
    Completed {
        connection_id: String,
        provider_config_key: String,
        operation: UpsertOperation,
        /// Two-step install stored without its install id; the connection
        /// finalizes when the provider delivers one.
        pending: bool,
    },
    /// Second exchange leg continues in a background task (OAuth 1.0a);
    /// outcome is delivered over the notifier.
    Deferred,
    /// Install notification without a pending flow; acknowledged only.
    InstallUpdate,
}

/// Provider-specific token exchange, replacing the generic code exchange.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(
        &self,
        services: &FlowServices,
        cfg: &RequestConfig,
        session: &Session,
        params: &CallbackParams,
    ) -> Result<JsonValue, AuthError>;
}

/// Provider-specific staleness probe consulted by the refresh decision.
#[async_trait]
pub trait TokenIntrospector: Send + Sync {
    async fn is_stale(&self, credentials: &AuthCredentials) -> Result<bool, AuthError>;
}

/// Optional per-provider behavior, keyed by provider template name.
#[derive(Default, Clone)]
pub struct ProviderExtensions {
    exchangers: HashMap<String, Arc<dyn TokenExchanger>>,
    introspectors: HashMap<String, Arc<dyn TokenIntrospector>>,
}

impl ProviderExtensions {
    pub fn register_exchanger(&mut self, provider: &str, exchanger: Arc<dyn TokenExchanger>) {
        self.exchangers.insert(provider.to_string(), exchanger);
    }

    pub fn register_introspector(
        &mut self,
        provider: &str,
        introspector: Arc<dyn TokenIntrospector>,
    ) {
        self.introspectors.insert(provider.to_string(), introspector);
    }

    pub fn exchanger(&self, provider: &str) -> Option<&Arc<dyn TokenExchanger>> {
        self.exchangers.get(provider)
    }

    pub fn introspector(&self, provider: &str) -> Option<&Arc<dyn TokenIntrospector>> {
        self.introspectors.get(provider)
    }
}

/// Shared services handed to every flow handler.
pub struct FlowServices {
    pub sessions: Arc<dyn SessionStore>,
    pub connections: ConnectionRepository,
    pub provider_configs: ProviderConfigRepository,
    pub hmac_gate: HmacGate,
    pub notifier: Arc<dyn ClientNotifier>,
    pub hooks: Arc<dyn ConnectionHooks>,
    pub http: reqwest::Client,
    pub extensions: ProviderExtensions,
    /// Redirect URI registered with providers
    pub callback_url: String,
}

/// One redirect-based protocol.
#[async_trait]
pub trait AuthFlowHandler: Send + Sync {
    /// Prepare the session (verifier, request token secret) and build the
    /// provider redirect URL. The session is persisted by the dispatcher
    /// after this returns.
    async fn begin(
        &self,
        services: &FlowServices,
        cfg: &RequestConfig,
        session: &mut Session,
    ) -> Result<Url, AuthError>;

    /// Finish the flow from the provider callback. The session has already
    /// been consumed.
    async fn callback(
        &self,
        services: &Arc<FlowServices>,
        cfg: &RequestConfig,
        session: Session,
        params: &CallbackParams,
    ) -> Result<CallbackOutcome, AuthError>;
}

/// Entry point for both flow legs.
pub struct FlowDispatcher {
    services: Arc<FlowServices>,
    registry: Arc<TemplateRegistry>,
    handlers: HashMap<AuthMode, Arc<dyn AuthFlowHandler>>,
}

impl FlowDispatcher {
    pub fn new(services: Arc<FlowServices>, registry: Arc<TemplateRegistry>) -> Self {
        let mut handlers: HashMap<AuthMode, Arc<dyn AuthFlowHandler>> = HashMap::new();
        handlers.insert(AuthMode::OAuth2, Arc::new(oauth2::OAuth2Flow));
        handlers.insert(AuthMode::OAuth1, Arc::new(oauth1::OAuth1Flow));
        let app = Arc::new(app_install::AppInstallFlow);
        handlers.insert(AuthMode::App, app.clone());
        handlers.insert(AuthMode::Custom, app);

        Self {
            services,
            registry,
            handlers,
        }
    }

    pub fn services(&self) -> &Arc<FlowServices> {
        &self.services
    }

    pub fn registry(&self) -> &Arc<TemplateRegistry> {
        &self.registry
    }

    /// Start a flow. Ordered steps: input validation, HMAC gate, stored
    /// config, template, override merge, mode validation, dispatch.
    pub async fn begin_authorization(
        &self,
        environment_id: Uuid,
        provider_config_key: &str,
        request: AuthorizeRequest,
    ) -> Result<BeginOutcome, AuthError> {
        if request.connection_id.trim().is_empty() {
            return Err(AuthError::MissingParam("connection_id"));
        }
        if provider_config_key.trim().is_empty() {
            return Err(AuthError::MissingParam("provider_config_key"));
        }

        self.services.hmac_gate.verify(
            &environment_id.to_string(),
            provider_config_key,
            &request.connection_id,
            request.hmac.as_deref(),
        )?;

        // Everything past the gate reports failures to the client channel.
        match self
            .begin_inner(environment_id, provider_config_key, &request)
            .await
        {
            Ok(outcome) => {
                metrics::counter!(
                    "keybridge_flows_started_total",
                    "provider_config_key" => provider_config_key.to_string()
                )
                .increment(1);
                Ok(outcome)
            }
            Err(error) => {
                self.services
                    .notifier
                    .notify_err(
                        request.ws_client_id.as_deref(),
                        provider_config_key,
                        &request.connection_id,
                        &error,
                    )
                    .await;
                Err(error)
            }
        }
    }

    async fn begin_inner(
        &self,
        environment_id: Uuid,
        provider_config_key: &str,
        request: &AuthorizeRequest,
    ) -> Result<BeginOutcome, AuthError> {
        let stored = self
            .services
            .provider_configs
            .find_by_key(&environment_id, provider_config_key)
            .await?;
        let template = self.registry.get(&stored.provider)?;
        let cfg = RequestConfig::build(environment_id, template, &stored, &request.overrides);

        validate_mode_requirements(&cfg, request)?;

        match cfg.template.auth_mode {
            AuthMode::ApiKey | AuthMode::Basic | AuthMode::None => {
                self.connect_import(&cfg, request).await
            }
            AuthMode::OAuth2Cc => {
                client_credentials::issue(&self.services, &cfg, request).await
            }
            AuthMode::AppStore => {
                app_install::issue_store_credential(&self.services, &cfg, request).await
            }
            mode => {
                let handler = self.handlers.get(&mode).ok_or_else(|| {
                    AuthError::InvalidProviderConfig(format!(
                        "auth mode '{}' cannot start a redirect flow",
                        mode
                    ))
                })?;

                let mut session = Session::new(
                    cfg.provider_config_key.clone(),
                    cfg.provider.clone(),
                    request.connection_id.clone(),
                    self.services.callback_url.clone(),
                    mode,
                    environment_id,
                );
                session.ws_client_id = request.ws_client_id.clone();
                session.connection_config = cfg.connection_config.clone();
                session.request_overrides = request.overrides.to_map();

                let url = handler.begin(&self.services, &cfg, &mut session).await?;
                self.services.sessions.create(&session).await?;

                Ok(BeginOutcome::Redirect {
                    url,
                    session_id: session.id,
                })
            }
        }
    }

    /// Synchronous key/secret import: parse and store in one step.
    async fn connect_import(
        &self,
        cfg: &RequestConfig,
        request: &AuthorizeRequest,
    ) -> Result<BeginOutcome, AuthError> {
        let raw = JsonValue::Object(
            request
                .credentials
                .iter()
                .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
                .collect(),
        );
        let parsed = credentials::parse(&raw, cfg.template.auth_mode)?;

        let connection_config = JsonValue::Object(
            cfg.connection_config
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );

        let result = self
            .services
            .connections
            .upsert(
                &cfg.environment_id,
                &cfg.provider_config_key,
                &cfg.provider,
                &request.connection_id,
                &parsed,
                connection_config,
                None,
            )
            .await?;

        self.services
            .notifier
            .notify_success(
                request.ws_client_id.as_deref(),
                &cfg.provider_config_key,
                &request.connection_id,
                false,
            )
            .await;
        self.services
            .hooks
            .on_connection_created(
                &cfg.environment_id,
                &cfg.provider_config_key,
                &request.connection_id,
            )
            .await;

        Ok(BeginOutcome::Connected {
            connection_id: request.connection_id.clone(),
            provider_config_key: cfg.provider_config_key.clone(),
            operation: result.operation,
        })
    }

    /// Finish a flow from the shared callback endpoint. The session is
    /// consumed exactly once, before any provider call.
    pub async fn handle_callback(
        &self,
        params: CallbackParams,
    ) -> Result<CallbackOutcome, AuthError> {
        let Some(state) = params.get("state") else {
            // App installs can hit the callback outside any flow, e.g. an
            // install from the provider's marketplace page.
            if params.get("installation_id").is_some() {
                tracing::info!("install notification without a pending flow, acknowledged");
                return Ok(CallbackOutcome::InstallUpdate);
            }
            return Err(AuthError::InvalidCallback(
                "missing state parameter".to_string(),
            ));
        };
        let state = state.to_string();

        let session = self
            .services
            .sessions
            .find_by_id(&state)
            .await?
            .ok_or_else(|| AuthError::SessionNotFound(state.clone()))?;

        // Single use: consume before any dispatch so a replayed callback
        // finds nothing.
        self.services.sessions.delete(&state).await?;

        let result = self.callback_inner(&session, &params).await;
        match &result {
            Ok(CallbackOutcome::Completed { pending, .. }) => {
                self.services
                    .notifier
                    .notify_success(
                        session.ws_client_id.as_deref(),
                        &session.provider_config_key,
                        &session.connection_id,
                        *pending,
                    )
                    .await;
                self.services
                    .hooks
                    .on_connection_created(
                        &session.environment_id,
                        &session.provider_config_key,
                        &session.connection_id,
                    )
                    .await;
                metrics::counter!("keybridge_flows_completed_total").increment(1);
            }
            Ok(_) => {}
            Err(error) => {
                self.services
                    .notifier
                    .notify_err(
                        session.ws_client_id.as_deref(),
                        &session.provider_config_key,
                        &session.connection_id,
                        error,
                    )
                    .await;
                self.services
                    .hooks
                    .on_connection_creation_failed(
                        &session.environment_id,
                        &session.provider_config_key,
                        &session.connection_id,
                        error,
                    )
                    .await;
                metrics::counter!("keybridge_flows_failed_total").increment(1);
            }
        }
        result
    }

    async fn callback_inner(
        &self,
        session: &Session,
        params: &CallbackParams,
    ) -> Result<CallbackOutcome, AuthError> {
        let stored = self
            .services
            .provider_configs
            .find_by_key(&session.environment_id, &session.provider_config_key)
            .await?;
        let template = self.registry.get(&stored.provider)?;

        // Re-apply the request-scoped overrides captured at begin.
        let overrides = RequestOverrides::from_map(&session.request_overrides);
        let cfg = RequestConfig::build(session.environment_id, template, &stored, &overrides);

        let handler = self
            .handlers
            .get(&session.auth_mode)
            .ok_or_else(|| {
                AuthError::InvalidCallback(format!(
                    "auth mode '{}' has no callback leg",
                    session.auth_mode
                ))
            })?;

        handler
            .callback(&self.services, &cfg, session.clone(), params)
            .await
    }
}

/// Every authenticated mode needs a client id, secret, and scope set before
/// any work starts. The id and secret may arrive through the stored config,
/// a request override, or the request credential payload (client-credentials
/// callers commonly supply their own pair).
fn validate_mode_requirements(
    cfg: &RequestConfig,
    request: &AuthorizeRequest,
) -> Result<(), AuthError> {
    if cfg.template.auth_mode == AuthMode::None {
        return Ok(());
    }

    let from_request = |field: &str| {
        request
            .credentials
            .get(field)
            .is_some_and(|v| !v.trim().is_empty())
    };

    if cfg.oauth_client_id.trim().is_empty() && !from_request("client_id") {
        return Err(AuthError::InvalidProviderConfig(
            "oauth_client_id is missing".to_string(),
        ));
    }
    if cfg.oauth_client_secret.trim().is_empty() && !from_request("client_secret") {
        return Err(AuthError::InvalidProviderConfig(
            "oauth_client_secret is missing".to_string(),
        ));
    }
    if cfg.joined_scopes().is_none() {
        return Err(AuthError::InvalidProviderConfig(
            "oauth_scopes is missing".to_string(),
        ));
    }
    Ok(())
}

/// Validate every placeholder in a URL template before any network call.
pub(crate) fn render_url(
    template_url: &str,
    cfg: &RequestConfig,
) -> Result<String, AuthError> {
    let params = cfg.interpolation_params();
    interpolation::validate(template_url, &params)?;
    Ok(interpolation::interpolate(template_url, &params)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn stored_config() -> provider_config::Model {
        provider_config::Model {
            id: Uuid::new_v4(),
            environment_id: Uuid::new_v4(),
            unique_key: "github-prod".to_string(),
            provider: "github".to_string(),
            oauth_client_id: "stored-id".to_string(),
            oauth_client_secret: "stored-secret".to_string(),
            oauth_scopes: Some("repo,user".to_string()),
            app_link: None,
            custom: Some(json!({"subdomain": "acme"})),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn request_config_layering() {
        let mut template = TemplateRegistry::builtin().get("google").unwrap().clone();
        template
            .authorization_params
            .insert("audience".to_string(), "default".to_string());

        let overrides = RequestOverrides {
            params: [("region".to_string(), json!("eu"))].into_iter().collect(),
            authorization_params: [
                ("audience".to_string(), "tenant-a".to_string()),
                ("prompt".to_string(), String::new()),
            ]
            .into_iter()
            .collect(),
            oauth_client_id: Some("override-id".to_string()),
            oauth_client_secret: None,
            oauth_scopes: None,
        };

        let stored = stored_config();
        let cfg = RequestConfig::build(stored.environment_id, &template, &stored, &overrides);

        assert_eq!(cfg.oauth_client_id, "override-id");
        assert_eq!(cfg.oauth_client_secret, "stored-secret");
        assert_eq!(
            cfg.authorization_params.get("audience").map(String::as_str),
            Some("tenant-a")
        );
        // empty override removes the template default
        assert!(!cfg.authorization_params.contains_key("prompt"));
        assert_eq!(
            cfg.authorization_params.get("access_type").map(String::as_str),
            Some("offline")
        );
        assert_eq!(cfg.connection_config.get("region"), Some(&json!("eu")));
    }

    #[test]
    fn scopes_join_with_template_separator() {
        let registry = TemplateRegistry::builtin();
        let stored = stored_config();

        let github = registry.get("github").unwrap();
        let cfg = RequestConfig::build(
            stored.environment_id,
            github,
            &stored,
            &RequestOverrides::default(),
        );
        assert_eq!(cfg.joined_scopes().as_deref(), Some("repo,user"));

        let google = registry.get("google").unwrap();
        let cfg = RequestConfig::build(
            stored.environment_id,
            google,
            &stored,
            &RequestOverrides::default(),
        );
        assert_eq!(cfg.joined_scopes().as_deref(), Some("repo user"));
    }

    #[test]
    fn authenticated_modes_require_client_pair_and_scopes() {
        let registry = TemplateRegistry::builtin();
        let request = AuthorizeRequest::default();

        let mut stored = stored_config();
        stored.oauth_scopes = None;
        let cfg = RequestConfig::build(
            stored.environment_id,
            registry.get("github").unwrap(),
            &stored,
            &RequestOverrides::default(),
        );
        let err = validate_mode_requirements(&cfg, &request).unwrap_err();
        assert!(matches!(err, AuthError::InvalidProviderConfig(_)));

        let mut stored = stored_config();
        stored.oauth_client_secret = String::new();
        let cfg = RequestConfig::build(
            stored.environment_id,
            registry.get("api-key").unwrap(),
            &stored,
            &RequestOverrides::default(),
        );
        let err = validate_mode_requirements(&cfg, &request).unwrap_err();
        assert!(matches!(err, AuthError::InvalidProviderConfig(_)));

        // the unauthenticated mode is exempt
        let mut bare = stored_config();
        bare.oauth_client_id = String::new();
        bare.oauth_client_secret = String::new();
        bare.oauth_scopes = None;
        let cfg = RequestConfig::build(
            bare.environment_id,
            registry.get("unauthenticated").unwrap(),
            &bare,
            &RequestOverrides::default(),
        );
        assert!(validate_mode_requirements(&cfg, &request).is_ok());
    }

    #[test]
    fn request_credentials_satisfy_the_client_pair() {
        let registry = TemplateRegistry::builtin();
        let mut stored = stored_config();
        stored.oauth_client_id = String::new();
        stored.oauth_client_secret = String::new();
        let cfg = RequestConfig::build(
            stored.environment_id,
            registry.get("salesforce-cc").unwrap(),
            &stored,
            &RequestOverrides::default(),
        );

        let mut request = AuthorizeRequest::default();
        assert!(validate_mode_requirements(&cfg, &request).is_err());

        request
            .credentials
            .insert("client_id".to_string(), "cid".to_string());
        request
            .credentials
            .insert("client_secret".to_string(), "cs".to_string());
        assert!(validate_mode_requirements(&cfg, &request).is_ok());
    }

    #[test]
    fn connection_config_merge_precedence() {
        let session: BTreeMap<String, JsonValue> =
            [("a".to_string(), json!(1)), ("b".to_string(), json!(1))]
                .into_iter()
                .collect();
        let callback: BTreeMap<String, JsonValue> =
            [("b".to_string(), json!(2)), ("c".to_string(), json!(2))]
                .into_iter()
                .collect();
        let overrides: BTreeMap<String, JsonValue> =
            [("c".to_string(), json!(3))].into_iter().collect();

        let merged = merge_connection_config(&session, &callback, &overrides);
        assert_eq!(merged.get("a"), Some(&json!(1)));
        assert_eq!(merged.get("b"), Some(&json!(2)));
        assert_eq!(merged.get("c"), Some(&json!(3)));
    }

    #[test]
    fn overrides_round_trip_through_session_map() {
        let overrides = RequestOverrides {
            params: [("shop".to_string(), json!("acme"))].into_iter().collect(),
            authorization_params: [("audience".to_string(), "x".to_string())]
                .into_iter()
                .collect(),
            oauth_client_id: Some("id".to_string()),
            oauth_client_secret: Some("secret".to_string()),
            oauth_scopes: None,
        };

        let map = overrides.to_map();
        assert_eq!(RequestOverrides::from_map(&map), overrides);
    }

    #[test]
    fn callback_metadata_excludes_artifacts() {
        let params = CallbackParams::new(
            [
                ("state".to_string(), "s".to_string()),
                ("code".to_string(), "c".to_string()),
                ("shop".to_string(), "acme.example".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        let metadata = params.metadata();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata.get("shop"), Some(&json!("acme.example")));
    }
}
