//! Authorization initiation endpoint.

use axum::{
    extract::{Path, RawQuery, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;

use crate::auth::{EnvironmentExtension, EnvironmentHeader, OperatorAuth};
use crate::error::ApiError;
use crate::flows::{AuthorizeRequest, BeginOutcome, RequestOverrides};
use crate::server::AppState;

use super::operation_str;

/// Outcome of an authorize request
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuthorizeResponse {
    /// Redirect the end user to this URL; the flow finishes via the callback
    Redirect {
        authorize_url: String,
        session_id: String,
    },
    /// Synchronous mode; the credential is already stored
    Connected {
        connection_id: String,
        provider_config_key: String,
        operation: String,
    },
}

/// Parse the authorize query string, including the bracketed map parameters
/// (`params[region]=eu`, `authorization_params[prompt]=consent`,
/// `credentials[api_key]=...`).
pub(crate) fn parse_authorize_query(query: &str) -> AuthorizeRequest {
    let mut request = AuthorizeRequest::default();
    let mut overrides = RequestOverrides::default();

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let value = value.into_owned();
        match key.as_ref() {
            "connection_id" => request.connection_id = value,
            "ws_client_id" => request.ws_client_id = Some(value),
            "hmac" => request.hmac = Some(value),
            "oauth_client_id_override" => overrides.oauth_client_id = Some(value),
            "oauth_client_secret_override" => overrides.oauth_client_secret = Some(value),
            "oauth_scopes_override" => overrides.oauth_scopes = Some(value),
            key => {
                if let Some(name) = bracketed(key, "params") {
                    overrides.params.insert(name, JsonValue::String(value));
                } else if let Some(name) = bracketed(key, "authorization_params") {
                    overrides.authorization_params.insert(name, value);
                } else if let Some(name) = bracketed(key, "credentials") {
                    request.credentials.insert(name, value);
                }
                // unknown parameters are ignored
            }
        }
    }

    request.overrides = overrides;
    request
}

fn bracketed(key: &str, prefix: &str) -> Option<String> {
    key.strip_prefix(prefix)?
        .strip_prefix('[')?
        .strip_suffix(']')
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Start an authorization flow for a provider config
///
/// Redirect-based modes return a provider URL to send the end user to;
/// synchronous modes (client credentials, key/secret import) store the
/// credential immediately.
#[utoipa::path(
    get,
    path = "/authorize/{provider_config_key}",
    security(("bearer_auth" = [])),
    params(
        ("provider_config_key" = String, Path, description = "Provider config key"),
        ("connection_id" = String, Query, description = "Caller-chosen connection identifier"),
        EnvironmentHeader
    ),
    responses(
        (status = 200, description = "Flow started or connection created", body = AuthorizeResponse),
        (status = 400, description = "Validation or configuration error", body = ApiError),
        (status = 401, description = "Missing or invalid credentials", body = ApiError),
        (status = 502, description = "Provider error", body = ApiError)
    ),
    tag = "flows"
)]
pub async fn authorize(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    EnvironmentExtension(environment): EnvironmentExtension,
    Path(provider_config_key): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Json<AuthorizeResponse>, ApiError> {
    let request = parse_authorize_query(query.as_deref().unwrap_or_default());

    let outcome = state
        .dispatcher
        .begin_authorization(environment.0, &provider_config_key, request)
        .await?;

    Ok(Json(match outcome {
        BeginOutcome::Redirect { url, session_id } => AuthorizeResponse::Redirect {
            authorize_url: url.to_string(),
            session_id,
        },
        BeginOutcome::Connected {
            connection_id,
            provider_config_key,
            operation,
        } => AuthorizeResponse::Connected {
            connection_id,
            provider_config_key,
            operation: operation_str(operation).to_string(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bracketed_keys_are_split_into_maps() {
        let request = parse_authorize_query(
            "connection_id=user-1&ws_client_id=ws-9&hmac=abc\
             &params%5Bregion%5D=eu&authorization_params%5Bprompt%5D=consent\
             &credentials%5Bapi_key%5D=k-1&oauth_scopes_override=repo",
        );

        assert_eq!(request.connection_id, "user-1");
        assert_eq!(request.ws_client_id.as_deref(), Some("ws-9"));
        assert_eq!(request.hmac.as_deref(), Some("abc"));
        assert_eq!(request.overrides.params.get("region"), Some(&json!("eu")));
        assert_eq!(
            request.overrides.authorization_params.get("prompt").map(String::as_str),
            Some("consent")
        );
        assert_eq!(request.credentials.get("api_key").map(String::as_str), Some("k-1"));
        assert_eq!(request.overrides.oauth_scopes.as_deref(), Some("repo"));
    }

    #[test]
    fn unknown_and_malformed_keys_are_ignored() {
        let request = parse_authorize_query("connection_id=c&params%5B%5D=x&bogus=1&params=flat");
        assert_eq!(request.connection_id, "c");
        assert!(request.overrides.params.is_empty());
        assert!(request.credentials.is_empty());
    }

    #[test]
    fn empty_query_gives_default_request() {
        let request = parse_authorize_query("");
        assert!(request.connection_id.is_empty());
        assert!(request.hmac.is_none());
    }
}
