//! Marketplace app installation flows.
//!
//! The redirect leg points at the provider's install page; the callback
//! carries an `installation_id` instead of an authorization code. Credentials
//! are minted locally from the app's private key: a short-lived signed JWT
//! either is the credential (app-store mode) or buys an installation access
//! token from the provider (app mode).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use url::Url;

use crate::credentials::{self, AuthMode};
use crate::error::AuthError;
use crate::interpolation;
use crate::session::Session;

use super::{
    AuthFlowHandler, AuthorizeRequest, BeginOutcome, CallbackOutcome, CallbackParams,
    FlowServices, RequestConfig, merge_connection_config, oauth2, render_url,
};

pub struct AppInstallFlow;

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

fn custom_str<'a>(cfg: &'a RequestConfig, key: &str) -> Result<&'a str, AuthError> {
    cfg.custom
        .get(key)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| {
            AuthError::InvalidProviderConfig(format!(
                "provider '{}' is missing '{}' in its custom config",
                cfg.provider, key
            ))
        })
}

/// Short-lived app JWT signed with the configured private key. The 60 second
/// backdate absorbs clock drift against the provider.
pub(crate) fn mint_app_jwt(cfg: &RequestConfig) -> Result<String, AuthError> {
    let app_id = custom_str(cfg, "app_id")?;
    let private_key = custom_str(cfg, "private_key")?;

    let key = EncodingKey::from_rsa_pem(private_key.as_bytes()).map_err(|e| {
        AuthError::InvalidProviderConfig(format!("app private key unusable: {}", e))
    })?;

    let now = Utc::now().timestamp();
    let claims = AppClaims {
        iat: now - 60,
        exp: now + 600,
        iss: app_id.to_string(),
    };

    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(|e| {
        AuthError::InvalidProviderConfig(format!("app JWT signing failed: {}", e))
    })
}

#[derive(Serialize)]
struct StoreClaims {
    iss: String,
    iat: i64,
    exp: i64,
    aud: String,
}

/// Self-contained store token: the signed ES256 JWT is the credential, no
/// provider round trip involved.
pub(crate) fn mint_store_token(
    cfg: &RequestConfig,
    private_key: &str,
) -> Result<JsonValue, AuthError> {
    let issuer_id = custom_str(cfg, "issuer_id")?;
    let key_id = custom_str(cfg, "key_id")?;

    let key = EncodingKey::from_ec_pem(private_key.as_bytes()).map_err(|e| {
        AuthError::InvalidProviderConfig(format!("store private key unusable: {}", e))
    })?;

    let now = Utc::now().timestamp();
    let expires = now + 15 * 60;
    let claims = StoreClaims {
        iss: issuer_id.to_string(),
        iat: now,
        exp: expires,
        aud: "appstoreconnect-v1".to_string(),
    };

    let mut header = Header::new(Algorithm::ES256);
    header.kid = Some(key_id.to_string());

    let token = jsonwebtoken::encode(&header, &claims, &key).map_err(|e| {
        AuthError::InvalidProviderConfig(format!("store JWT signing failed: {}", e))
    })?;

    Ok(json!({
        "access_token": token,
        "private_key": private_key,
        "expires_at": expires,
    }))
}

/// Trade the app JWT for an installation access token.
pub(crate) async fn fetch_installation_token(
    services: &FlowServices,
    cfg: &RequestConfig,
    installation_id: &str,
) -> Result<JsonValue, AuthError> {
    let jwt = mint_app_jwt(cfg)?;

    let token_url = cfg
        .template
        .installation_token_url
        .as_deref()
        .or(cfg.template.token_url.as_deref())
        .ok_or_else(|| {
            AuthError::InvalidProviderConfig(format!(
                "provider '{}' has no installation token URL",
                cfg.provider
            ))
        })?;

    // The token URL may reference the installation alongside the usual
    // config placeholders.
    let mut params = cfg.interpolation_params();
    params.insert("installation_id".to_string(), installation_id.to_string());
    interpolation::validate(token_url, &params)?;
    let token_url = interpolation::interpolate(token_url, &params)?;

    let response = services
        .http
        .post(&token_url)
        .bearer_auth(&jwt)
        .header("accept", "application/json")
        .send()
        .await
        .map_err(|e| AuthError::TokenRetrievalFailed {
            provider: cfg.provider.clone(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(AuthError::TokenRetrievalFailed {
            provider: cfg.provider.clone(),
            reason: format!("status {}", status),
        });
    }

    let mut raw = response
        .json::<JsonValue>()
        .await
        .map_err(|_| AuthError::TokenResponseUnparsable {
            provider: cfg.provider.clone(),
        })?;

    if let Some(map) = raw.as_object_mut() {
        map.insert(
            "installation_id".to_string(),
            JsonValue::String(installation_id.to_string()),
        );
    }
    Ok(raw)
}

#[async_trait]
impl AuthFlowHandler for AppInstallFlow {
    async fn begin(
        &self,
        _services: &FlowServices,
        cfg: &RequestConfig,
        session: &mut Session,
    ) -> Result<Url, AuthError> {
        let authorization_url = cfg.template.authorization_url.as_deref().ok_or_else(|| {
            AuthError::InvalidProviderConfig(format!(
                "provider '{}' has no install URL",
                cfg.provider
            ))
        })?;
        let rendered = render_url(authorization_url, cfg)?;

        let mut url = Url::parse(&rendered).map_err(|e| {
            AuthError::InvalidProviderConfig(format!("install URL invalid: {}", e))
        })?;

        let mut query = url.query_pairs_mut();
        query.append_pair("state", &session.id);
        for (key, value) in &cfg.authorization_params {
            query.append_pair(key, value);
        }
        drop(query);

        Ok(url)
    }

    async fn callback(
        &self,
        services: &Arc<FlowServices>,
        cfg: &RequestConfig,
        session: Session,
        params: &CallbackParams,
    ) -> Result<CallbackOutcome, AuthError> {
        // installation_id rides along in the callback metadata either way.
        let connection_config = merge_connection_config(
            &session.connection_config,
            &params.metadata(),
            &cfg.connection_config,
        );

        if let Some(installation_id) = params.get("installation_id") {
            let raw = fetch_installation_token(services, cfg, installation_id).await?;
            let parsed = credentials::parse(&raw, session.auth_mode)?;

            // A two-step connection stored earlier without its install id
            // flips out of pending here.
            let metadata = (session.auth_mode == AuthMode::Custom)
                .then(|| json!({ "pending": false }));

            let result = services
                .connections
                .upsert(
                    &session.environment_id,
                    &session.provider_config_key,
                    &session.provider,
                    &session.connection_id,
                    &parsed,
                    JsonValue::Object(connection_config.into_iter().collect()),
                    metadata,
                )
                .await?;

            return Ok(CallbackOutcome::Completed {
                connection_id: session.connection_id,
                provider_config_key: session.provider_config_key,
                operation: result.operation,
                pending: false,
            });
        }

        if session.auth_mode != AuthMode::Custom {
            return Err(AuthError::InvalidCallback(
                "missing installation_id parameter".to_string(),
            ));
        }

        // Two-step install, code leg first: exchange the user grant and store
        // the connection as pending until the install id arrives.
        let code = params.get("code").ok_or_else(|| {
            AuthError::InvalidCallback(
                "missing code and installation_id parameters".to_string(),
            )
        })?;

        let token_url = cfg.template.token_url.as_deref().ok_or_else(|| {
            AuthError::InvalidProviderConfig(format!(
                "provider '{}' has no token URL",
                cfg.provider
            ))
        })?;
        let token_url = render_url(token_url, cfg)?;

        let mut form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
            ("redirect_uri".to_string(), session.callback_url.clone()),
        ];
        if let Some(verifier) = &session.code_verifier {
            form.push(("code_verifier".to_string(), verifier.clone()));
        }

        let raw = oauth2::post_token_request(
            &services.http,
            &cfg.template,
            &token_url,
            &cfg.oauth_client_id,
            &cfg.oauth_client_secret,
            &cfg.provider,
            form,
        )
        .await?;
        let parsed = credentials::parse(&raw, AuthMode::Custom)?;

        let result = services
            .connections
            .upsert(
                &session.environment_id,
                &session.provider_config_key,
                &session.provider,
                &session.connection_id,
                &parsed,
                JsonValue::Object(connection_config.into_iter().collect()),
                Some(json!({ "pending": true })),
            )
            .await?;

        Ok(CallbackOutcome::Completed {
            connection_id: session.connection_id,
            provider_config_key: session.provider_config_key,
            operation: result.operation,
            pending: true,
        })
    }
}

/// Synchronous store connect: mint the ES256 token and store it in one step.
/// The signing key may arrive in the request credential payload or sit in the
/// stored custom config.
pub(crate) async fn issue_store_credential(
    services: &Arc<FlowServices>,
    cfg: &RequestConfig,
    request: &AuthorizeRequest,
) -> Result<BeginOutcome, AuthError> {
    let private_key = request
        .credentials
        .get("private_key")
        .map(String::as_str)
        .or_else(|| cfg.custom.get("private_key").and_then(JsonValue::as_str))
        .ok_or_else(|| {
            AuthError::InvalidProviderConfig(format!(
                "provider '{}' needs a signing private key",
                cfg.provider
            ))
        })?;

    let raw = mint_store_token(cfg, private_key)?;
    let parsed = credentials::parse(&raw, AuthMode::AppStore)?;

    let connection_config = JsonValue::Object(
        cfg.connection_config
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );

    let result = services
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

    services
        .notifier
        .notify_success(
            request.ws_client_id.as_deref(),
            &cfg.provider_config_key,
            &request.connection_id,
            false,
        )
        .await;
    services
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn config_with_custom(custom: BTreeMap<String, JsonValue>) -> RequestConfig {
        RequestConfig {
            provider: "github-app".to_string(),
            provider_config_key: "github-app-prod".to_string(),
            environment_id: Uuid::new_v4(),
            template: crate::providers::TemplateRegistry::builtin()
                .get("github-app")
                .unwrap()
                .clone(),
            oauth_client_id: String::new(),
            oauth_client_secret: String::new(),
            scopes: None,
            app_link: Some("https://github.com/apps/acme".to_string()),
            custom,
            authorization_params: BTreeMap::new(),
            connection_config: BTreeMap::new(),
        }
    }

    #[test]
    fn jwt_mint_requires_app_id_and_key() {
        let cfg = config_with_custom(BTreeMap::new());
        let err = mint_app_jwt(&cfg).unwrap_err();
        assert!(matches!(err, AuthError::InvalidProviderConfig(_)));
    }

    #[test]
    fn jwt_mint_rejects_garbage_key() {
        let custom: BTreeMap<String, JsonValue> = [
            ("app_id".to_string(), json!("12345")),
            ("private_key".to_string(), json!("not a pem")),
        ]
        .into_iter()
        .collect();
        let cfg = config_with_custom(custom);
        let err = mint_app_jwt(&cfg).unwrap_err();
        assert!(matches!(err, AuthError::InvalidProviderConfig(_)));
    }

    #[test]
    fn store_mint_requires_issuer_and_key_id() {
        let cfg = config_with_custom(BTreeMap::new());
        let err = mint_store_token(&cfg, "not a pem").unwrap_err();
        assert!(matches!(err, AuthError::InvalidProviderConfig(_)));
    }
}
