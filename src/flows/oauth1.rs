//! OAuth 1.0a three-legged flow.
//!
//! Signing follows RFC 5849: strict percent-encoding, sorted parameter
//! normalization, HMAC-SHA1 over the base string. The access-token exchange
//! runs in a spawned task; the callback response only acknowledges receipt
//! and the outcome is delivered over the notifier.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use rand::RngCore;
use serde_json::Value as JsonValue;
use sha1::Sha1;
use url::Url;

use crate::credentials::{self, AuthMode};
use crate::error::AuthError;
use crate::session::Session;

use super::{
    AuthFlowHandler, CallbackOutcome, CallbackParams, FlowServices, RequestConfig,
    merge_connection_config, render_url,
};

type HmacSha1 = Hmac<Sha1>;

/// RFC 3986 unreserved characters stay bare; everything else is encoded.
const OAUTH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub struct OAuth1Flow;

fn oauth_encode(value: &str) -> String {
    utf8_percent_encode(value, OAUTH_ENCODE_SET).to_string()
}

fn nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Signature base string per RFC 5849 §3.4.1: method, base URL, and the
/// sorted, encoded parameter list.
fn signature_base_string(
    method: &str,
    base_url: &str,
    params: &BTreeMap<String, String>,
) -> String {
    let normalized = params
        .iter()
        .map(|(k, v)| format!("{}={}", oauth_encode(k), oauth_encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_uppercase(),
        oauth_encode(base_url),
        oauth_encode(&normalized)
    )
}

fn sign(base_string: &str, consumer_secret: &str, token_secret: Option<&str>) -> String {
    let key = format!(
        "{}&{}",
        oauth_encode(consumer_secret),
        token_secret.map(oauth_encode).unwrap_or_default()
    );
    let mut mac = HmacSha1::new_from_slice(key.as_bytes()).expect("hmac accepts any key length");
    mac.update(base_string.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Build the `Authorization: OAuth ...` header for a signed POST with no
/// body parameters.
fn authorization_header(
    url: &str,
    consumer_key: &str,
    consumer_secret: &str,
    token: Option<&str>,
    token_secret: Option<&str>,
    extra: &[(&str, &str)],
) -> String {
    let mut params: BTreeMap<String, String> = BTreeMap::new();
    params.insert("oauth_consumer_key".to_string(), consumer_key.to_string());
    params.insert("oauth_nonce".to_string(), nonce());
    params.insert(
        "oauth_signature_method".to_string(),
        "HMAC-SHA1".to_string(),
    );
    params.insert(
        "oauth_timestamp".to_string(),
        chrono::Utc::now().timestamp().to_string(),
    );
    params.insert("oauth_version".to_string(), "1.0".to_string());
    if let Some(token) = token {
        params.insert("oauth_token".to_string(), token.to_string());
    }
    for (k, v) in extra {
        params.insert((*k).to_string(), (*v).to_string());
    }

    let base = signature_base_string("POST", url, &params);
    let signature = sign(&base, consumer_secret, token_secret);
    params.insert("oauth_signature".to_string(), signature);

    let header = params
        .iter()
        .map(|(k, v)| format!(r#"{}="{}""#, oauth_encode(k), oauth_encode(v)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("OAuth {}", header)
}

/// Parse a form-encoded token response into a JSON object.
fn parse_form_body(body: &str) -> JsonValue {
    JsonValue::Object(
        url::form_urlencoded::parse(body.as_bytes())
            .map(|(k, v)| (k.into_owned(), JsonValue::String(v.into_owned())))
            .collect(),
    )
}

async fn signed_post(
    http: &reqwest::Client,
    url: &str,
    provider: &str,
    header: String,
) -> Result<JsonValue, AuthError> {
    let response = http
        .post(url)
        .header("authorization", header)
        .send()
        .await
        .map_err(|e| AuthError::TokenRetrievalFailed {
            provider: provider.to_string(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(AuthError::TokenRetrievalFailed {
            provider: provider.to_string(),
            reason: format!("status {}", status),
        });
    }

    Ok(parse_form_body(&body))
}

#[async_trait]
impl AuthFlowHandler for OAuth1Flow {
    /// First leg: obtain a request token. No session row exists yet, so a
    /// provider failure here leaves nothing behind.
    async fn begin(
        &self,
        services: &FlowServices,
        cfg: &RequestConfig,
        session: &mut Session,
    ) -> Result<Url, AuthError> {
        let request_url = cfg.template.request_url.as_deref().ok_or_else(|| {
            AuthError::InvalidProviderConfig(format!(
                "provider '{}' has no request token URL",
                cfg.provider
            ))
        })?;
        let request_url = render_url(request_url, cfg)?;

        // The state rides on the callback URL; OAuth 1.0a has no native
        // state parameter.
        let mut callback = Url::parse(&session.callback_url).map_err(|e| {
            AuthError::InvalidProviderConfig(format!("callback URL invalid: {}", e))
        })?;
        callback
            .query_pairs_mut()
            .append_pair("state", &session.id);

        let header = authorization_header(
            &request_url,
            &cfg.oauth_client_id,
            &cfg.oauth_client_secret,
            None,
            None,
            &[("oauth_callback", callback.as_str())],
        );

        let response = signed_post(&services.http, &request_url, &cfg.provider, header).await?;
        let request_token = response
            .get("oauth_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AuthError::TokenResponseUnparsable {
                provider: cfg.provider.clone(),
            })?;
        let request_token_secret = response
            .get("oauth_token_secret")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AuthError::TokenResponseUnparsable {
                provider: cfg.provider.clone(),
            })?;

        session.request_token_secret = Some(request_token_secret.to_string());

        let authorization_url = cfg.template.authorization_url.as_deref().ok_or_else(|| {
            AuthError::InvalidProviderConfig(format!(
                "provider '{}' has no authorization URL",
                cfg.provider
            ))
        })?;
        let mut url = Url::parse(&render_url(authorization_url, cfg)?).map_err(|e| {
            AuthError::InvalidProviderConfig(format!("authorization URL invalid: {}", e))
        })?;
        url.query_pairs_mut()
            .append_pair("oauth_token", request_token);
        Ok(url)
    }

    /// Third leg: trade the verifier for the access token in a background
    /// task. The HTTP callback only acknowledges; the notifier carries the
    /// authoritative outcome.
    async fn callback(
        &self,
        services: &Arc<FlowServices>,
        cfg: &RequestConfig,
        session: Session,
        params: &CallbackParams,
    ) -> Result<CallbackOutcome, AuthError> {
        let oauth_token = params
            .get("oauth_token")
            .ok_or_else(|| AuthError::InvalidCallback("missing oauth_token".to_string()))?
            .to_string();
        let oauth_verifier = params
            .get("oauth_verifier")
            .ok_or_else(|| AuthError::InvalidCallback("missing oauth_verifier".to_string()))?
            .to_string();

        let token_url = cfg.template.token_url.as_deref().ok_or_else(|| {
            AuthError::InvalidProviderConfig(format!(
                "provider '{}' has no access token URL",
                cfg.provider
            ))
        })?;
        let token_url = render_url(token_url, cfg)?;

        let services = services.clone();
        let cfg = cfg.clone();
        let metadata = params.metadata();

        tokio::spawn(async move {
            let result = exchange_access_token(
                &services,
                &cfg,
                &session,
                &token_url,
                &oauth_token,
                &oauth_verifier,
                metadata,
            )
            .await;

            match result {
                Ok(()) => {
                    services
                        .notifier
                        .notify_success(
                            session.ws_client_id.as_deref(),
                            &session.provider_config_key,
                            &session.connection_id,
                            false,
                        )
                        .await;
                    services
                        .hooks
                        .on_connection_created(
                            &session.environment_id,
                            &session.provider_config_key,
                            &session.connection_id,
                        )
                        .await;
                }
                Err(error) => {
                    services
                        .notifier
                        .notify_err(
                            session.ws_client_id.as_deref(),
                            &session.provider_config_key,
                            &session.connection_id,
                            &error,
                        )
                        .await;
                    services
                        .hooks
                        .on_connection_creation_failed(
                            &session.environment_id,
                            &session.provider_config_key,
                            &session.connection_id,
                            &error,
                        )
                        .await;
                }
            }
        });

        Ok(CallbackOutcome::Deferred)
    }
}

async fn exchange_access_token(
    services: &FlowServices,
    cfg: &RequestConfig,
    session: &Session,
    token_url: &str,
    oauth_token: &str,
    oauth_verifier: &str,
    metadata: BTreeMap<String, JsonValue>,
) -> Result<(), AuthError> {
    let header = authorization_header(
        token_url,
        &cfg.oauth_client_id,
        &cfg.oauth_client_secret,
        Some(oauth_token),
        session.request_token_secret.as_deref(),
        &[("oauth_verifier", oauth_verifier)],
    );

    let raw = signed_post(&services.http, token_url, &cfg.provider, header).await?;
    let parsed = credentials::parse(&raw, AuthMode::OAuth1)?;

    let connection_config =
        merge_connection_config(&session.connection_config, &metadata, &cfg.connection_config);

    services
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
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_matches_rfc_3986() {
        assert_eq!(oauth_encode("abcXYZ012-._~"), "abcXYZ012-._~");
        assert_eq!(oauth_encode("a b+c"), "a%20b%2Bc");
        assert_eq!(oauth_encode("http://x/y?z=1"), "http%3A%2F%2Fx%2Fy%3Fz%3D1");
    }

    #[test]
    fn base_string_sorts_and_encodes_params() {
        let mut params = BTreeMap::new();
        params.insert("b".to_string(), "2 2".to_string());
        params.insert("a".to_string(), "1".to_string());

        let base = signature_base_string("post", "https://api.example.com/request", &params);
        assert_eq!(
            base,
            "POST&https%3A%2F%2Fapi.example.com%2Frequest&a%3D1%26b%3D2%25202"
        );
    }

    #[test]
    fn signature_matches_known_vector() {
        // HMAC-SHA1("key1&key2", "text") has a stable value
        let sig = sign("text", "key1", Some("key2"));
        let mut mac = HmacSha1::new_from_slice(b"key1&key2").unwrap();
        mac.update(b"text");
        let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        assert_eq!(sig, expected);
    }

    #[test]
    fn form_body_parses_to_object() {
        let parsed = parse_form_body("oauth_token=t&oauth_token_secret=s&extra=1");
        assert_eq!(parsed["oauth_token"], "t");
        assert_eq!(parsed["oauth_token_secret"], "s");
        assert_eq!(parsed["extra"], "1");
    }

    #[test]
    fn header_includes_signature_and_callback() {
        let header = authorization_header(
            "https://api.example.com/request",
            "ck",
            "cs",
            None,
            None,
            &[("oauth_callback", "https://bridge.example.com/oauth/callback?state=s1")],
        );
        assert!(header.starts_with("OAuth "));
        assert!(header.contains("oauth_signature="));
        assert!(header.contains("oauth_callback="));
        assert!(header.contains("oauth_consumer_key=\"ck\""));
    }
}
