//! OAuth 2.0 authorization-code flow with optional PKCE.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use rand::RngCore;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use url::Url;

use crate::credentials::{self, AuthMode};
use crate::error::AuthError;
use crate::interpolation;
use crate::providers::{ProviderTemplate, TokenRequestAuthMethod};
use crate::session::Session;

use super::{
    AuthFlowHandler, CallbackOutcome, CallbackParams, FlowServices, RequestConfig,
    merge_connection_config, render_url,
};

pub struct OAuth2Flow;

/// 24 random bytes, hex encoded.
fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// S256 challenge: unpadded base64url of the verifier's SHA-256.
fn code_challenge(verifier: &str) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// POST to a token endpoint with the configured client auth style and parse
/// the JSON body.
pub(crate) async fn post_token_request(
    http: &reqwest::Client,
    template: &ProviderTemplate,
    token_url: &str,
    client_id: &str,
    client_secret: &str,
    provider: &str,
    mut form: Vec<(String, String)>,
) -> Result<JsonValue, AuthError> {
    for (k, v) in &template.token_params {
        form.push((k.clone(), v.clone()));
    }

    let mut request = http
        .post(token_url)
        .header("accept", "application/json");

    match template.token_request_auth_method {
        TokenRequestAuthMethod::Basic => {
            request = request.basic_auth(client_id, Some(client_secret));
        }
        TokenRequestAuthMethod::Body => {
            form.push(("client_id".to_string(), client_id.to_string()));
            form.push(("client_secret".to_string(), client_secret.to_string()));
        }
    }

    let response = request
        .form(&form)
        .send()
        .await
        .map_err(|e| AuthError::TokenRetrievalFailed {
            provider: provider.to_string(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(provider, %status, "token endpoint returned an error");
        return Err(AuthError::TokenRetrievalFailed {
            provider: provider.to_string(),
            reason: format!("status {}: {}", status, truncate(&body, 200)),
        });
    }

    response
        .json::<JsonValue>()
        .await
        .map_err(|_| AuthError::TokenResponseUnparsable {
            provider: provider.to_string(),
        })
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        s.chars().take(max).collect()
    } else {
        s.to_string()
    }
}

/// Exchange a refresh token for a new grant (refresh path).
pub(crate) async fn exchange_refresh_token(
    http: &reqwest::Client,
    cfg: &RequestConfig,
    refresh_token: &str,
) -> Result<JsonValue, AuthError> {
    let token_url = cfg.template.token_url.as_deref().ok_or_else(|| {
        AuthError::InvalidProviderConfig(format!("provider '{}' has no token URL", cfg.provider))
    })?;
    let token_url = render_url(token_url, cfg)?;

    post_token_request(
        http,
        &cfg.template,
        &token_url,
        &cfg.oauth_client_id,
        &cfg.oauth_client_secret,
        &cfg.provider,
        vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
        ],
    )
    .await
}

#[async_trait]
impl AuthFlowHandler for OAuth2Flow {
    async fn begin(
        &self,
        _services: &FlowServices,
        cfg: &RequestConfig,
        session: &mut Session,
    ) -> Result<Url, AuthError> {
        let authorization_url = cfg.template.authorization_url.as_deref().ok_or_else(|| {
            AuthError::InvalidProviderConfig(format!(
                "provider '{}' has no authorization URL",
                cfg.provider
            ))
        })?;
        let rendered = render_url(authorization_url, cfg)?;

        // The token endpoint is only rendered at callback time, but an
        // unsatisfiable placeholder must surface before the user is
        // redirected anywhere.
        if let Some(token_url) = cfg.template.token_url.as_deref() {
            interpolation::validate(token_url, &cfg.interpolation_params())?;
        }

        let mut url = Url::parse(&rendered).map_err(|e| {
            AuthError::InvalidProviderConfig(format!("authorization URL invalid: {}", e))
        })?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &cfg.oauth_client_id);
            query.append_pair("redirect_uri", &session.callback_url);
            query.append_pair("response_type", "code");
            query.append_pair("state", &session.id);
            if let Some(scopes) = cfg.joined_scopes() {
                query.append_pair("scope", &scopes);
            }
            for (key, value) in &cfg.authorization_params {
                query.append_pair(key, value);
            }

            if !cfg.template.disable_pkce {
                let verifier = generate_code_verifier();
                query.append_pair("code_challenge", &code_challenge(&verifier));
                query.append_pair("code_challenge_method", "S256");
                session.code_verifier = Some(verifier);
            }
        }

        // Literal substitutions some providers require in the final URL
        let mut final_url = url.to_string();
        for (from, to) in &cfg.template.authorization_url_replacements {
            final_url = final_url.replace(from.as_str(), to.as_str());
        }
        Url::parse(&final_url).map_err(|e| {
            AuthError::InvalidProviderConfig(format!("authorization URL invalid: {}", e))
        })
    }

    async fn callback(
        &self,
        services: &Arc<FlowServices>,
        cfg: &RequestConfig,
        session: Session,
        params: &CallbackParams,
    ) -> Result<CallbackOutcome, AuthError> {
        if let Some(error) = params.get("error") {
            return Err(AuthError::InvalidCallback(format!(
                "provider returned error '{}'",
                error
            )));
        }

        // Provider-specific exchange replaces the generic one entirely.
        let raw = if let Some(exchanger) = services.extensions.exchanger(&cfg.provider) {
            exchanger.exchange(services, cfg, &session, params).await?
        } else {
            let code = params
                .get("code")
                .ok_or_else(|| AuthError::InvalidCallback("missing code parameter".to_string()))?;

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

            post_token_request(
                &services.http,
                &cfg.template,
                &token_url,
                &cfg.oauth_client_id,
                &cfg.oauth_client_secret,
                &cfg.provider,
                form,
            )
            .await?
        };

        let parsed = credentials::parse(&raw, AuthMode::OAuth2)?;

        let connection_config = merge_connection_config(
            &session.connection_config,
            &params.metadata(),
            &cfg.connection_config,
        );

        let result = services
            .connections
            .upsert(
                &session.environment_id,
                &session.provider_config_key,
                &session.provider,
                &session.connection_id,
                &parsed,
                JsonValue::Object(connection_config.into_iter().collect()),
                None,
            )
            .await?;

        Ok(CallbackOutcome::Completed {
            connection_id: session.connection_id,
            provider_config_key: session.provider_config_key,
            operation: result.operation,
            pending: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_is_24_bytes_hex() {
        let verifier = generate_code_verifier();
        assert_eq!(verifier.len(), 48);
        assert!(verifier.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(verifier, generate_code_verifier());
    }

    #[test]
    fn challenge_matches_rfc_7636_vector() {
        // Appendix B of RFC 7636
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn challenge_has_no_padding() {
        let challenge = code_challenge(&generate_code_verifier());
        assert!(!challenge.contains('='));
        assert!(!challenge.contains('+'));
        assert!(!challenge.contains('/'));
    }
}
