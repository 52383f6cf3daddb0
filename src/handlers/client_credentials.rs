//! Client-credentials grant endpoint.

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::{EnvironmentExtension, EnvironmentHeader, OperatorAuth};
use crate::error::ApiError;
use crate::flows::{AuthorizeRequest, BeginOutcome};
use crate::server::AppState;

use super::operation_str;

#[derive(Debug, Deserialize, ToSchema)]
pub struct ClientCredentialsQuery {
    pub connection_id: String,
    #[serde(default)]
    pub ws_client_id: Option<String>,
    #[serde(default)]
    pub hmac: Option<String>,
}

/// Optional client pair overriding the stored provider config
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ClientCredentialsBody {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ClientCredentialsResponse {
    pub connection_id: String,
    pub provider_config_key: String,
    pub operation: String,
}

/// Mint and store a client-credentials grant
///
/// Synchronous: the token endpoint is called inside the request and the
/// connection exists when the response returns.
#[utoipa::path(
    post,
    path = "/oauth2/client-credentials/{provider_config_key}",
    security(("bearer_auth" = [])),
    params(
        ("provider_config_key" = String, Path, description = "Provider config key"),
        ("connection_id" = String, Query, description = "Caller-chosen connection identifier"),
        EnvironmentHeader
    ),
    request_body = ClientCredentialsBody,
    responses(
        (status = 200, description = "Grant minted and stored", body = ClientCredentialsResponse),
        (status = 400, description = "Validation or configuration error", body = ApiError),
        (status = 502, description = "Token endpoint rejected the grant", body = ApiError)
    ),
    tag = "flows"
)]
pub async fn client_credentials(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    EnvironmentExtension(environment): EnvironmentExtension,
    Path(provider_config_key): Path<String>,
    Query(query): Query<ClientCredentialsQuery>,
    body: Option<Json<ClientCredentialsBody>>,
) -> Result<Json<ClientCredentialsResponse>, ApiError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let mut request = AuthorizeRequest {
        connection_id: query.connection_id,
        ws_client_id: query.ws_client_id,
        hmac: query.hmac,
        ..Default::default()
    };
    if let Some(client_id) = body.client_id {
        request.credentials.insert("client_id".to_string(), client_id);
    }
    if let Some(client_secret) = body.client_secret {
        request
            .credentials
            .insert("client_secret".to_string(), client_secret);
    }

    match state
        .dispatcher
        .begin_authorization(environment.0, &provider_config_key, request)
        .await?
    {
        BeginOutcome::Connected {
            connection_id,
            provider_config_key,
            operation,
        } => Ok(Json(ClientCredentialsResponse {
            connection_id,
            provider_config_key,
            operation: operation_str(operation).to_string(),
        })),
        BeginOutcome::Redirect { .. } => Err(ApiError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "CONFIGURATION_ERROR".to_string(),
            format!(
                "provider config '{}' is not a client-credentials config",
                provider_config_key
            ),
        )),
    }
}
