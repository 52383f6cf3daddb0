//! OAuth 2.0 client-credentials grant.
//!
//! No redirect leg and no session: the token is minted and stored inside the
//! authorize request. The client id and secret are persisted alongside the
//! token so the refresh path can re-issue without the stored provider config.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::credentials::{self, AuthMode};
use crate::error::AuthError;

use super::oauth2::post_token_request;
use super::{AuthorizeRequest, BeginOutcome, FlowServices, RequestConfig, render_url};

pub async fn issue(
    services: &Arc<FlowServices>,
    cfg: &RequestConfig,
    request: &AuthorizeRequest,
) -> Result<BeginOutcome, AuthError> {
    // A request-supplied pair wins over the stored provider config.
    let client_id = request
        .credentials
        .get("client_id")
        .cloned()
        .unwrap_or_else(|| cfg.oauth_client_id.clone());
    let client_secret = request
        .credentials
        .get("client_secret")
        .cloned()
        .unwrap_or_else(|| cfg.oauth_client_secret.clone());

    let raw = mint(services, cfg, &client_id, &client_secret).await?;
    let parsed = credentials::parse(&raw, AuthMode::OAuth2Cc)?;

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

/// Mint a grant and fold the client pair into the raw payload so the parsed
/// credential is self-contained for later re-issue.
pub(crate) async fn mint(
    services: &FlowServices,
    cfg: &RequestConfig,
    client_id: &str,
    client_secret: &str,
) -> Result<JsonValue, AuthError> {
    if client_id.trim().is_empty() || client_secret.trim().is_empty() {
        return Err(AuthError::InvalidProviderConfig(
            "client credentials grant needs a client id and secret".to_string(),
        ));
    }

    let token_url = cfg.template.token_url.as_deref().ok_or_else(|| {
        AuthError::InvalidProviderConfig(format!("provider '{}' has no token URL", cfg.provider))
    })?;
    let token_url = render_url(token_url, cfg)?;

    let mut form = vec![(
        "grant_type".to_string(),
        "client_credentials".to_string(),
    )];
    if let Some(scopes) = cfg.joined_scopes() {
        form.push(("scope".to_string(), scopes));
    }

    let mut raw = post_token_request(
        &services.http,
        &cfg.template,
        &token_url,
        client_id,
        client_secret,
        &cfg.provider,
        form,
    )
    .await?;

    if let Some(map) = raw.as_object_mut() {
        map.insert(
            "client_id".to_string(),
            JsonValue::String(client_id.to_string()),
        );
        map.insert(
            "client_secret".to_string(),
            JsonValue::String(client_secret.to_string()),
        );
    }
    Ok(raw)
}
