//! Connection read and delete endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;

use crate::auth::{EnvironmentExtension, EnvironmentHeader, OperatorAuth};
use crate::error::ApiError;
use crate::repositories::StoredConnection;
use crate::server::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConnectionQuery {
    pub provider_config_key: String,
    #[serde(default)]
    pub force_refresh: bool,
}

/// A connection with its decrypted, refreshed credentials
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ConnectionResponse {
    pub connection_id: String,
    pub provider_config_key: String,
    pub provider: String,
    /// Typed credential union, tagged by `type`
    #[schema(value_type = Object)]
    pub credentials: JsonValue,
    #[schema(value_type = Object)]
    pub connection_config: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fetched_at: Option<DateTime<Utc>>,
}

fn not_found(connection_id: &str, provider_config_key: &str) -> ApiError {
    ApiError::new(
        StatusCode::NOT_FOUND,
        "NOT_FOUND".to_string(),
        format!(
            "no connection '{}' for provider config '{}'",
            connection_id, provider_config_key
        ),
    )
}

fn to_response(connection: StoredConnection) -> Result<ConnectionResponse, ApiError> {
    let credentials = serde_json::to_value(&connection.credentials)
        .map_err(|e| anyhow::anyhow!("credential serialization failed: {}", e))?;
    Ok(ConnectionResponse {
        connection_id: connection.connection_id,
        provider_config_key: connection.provider_config_key,
        provider: connection.provider,
        credentials,
        connection_config: connection.connection_config,
        metadata: connection.metadata,
        created_at: connection.created_at,
        updated_at: connection.updated_at,
        last_fetched_at: connection.last_fetched_at,
    })
}

/// Read a connection's credentials
///
/// Every read goes through the refresh coordinator, so returned credentials
/// are guaranteed usable. `force_refresh=true` refreshes regardless of
/// expiry.
#[utoipa::path(
    get,
    path = "/connections/{connection_id}",
    security(("bearer_auth" = [])),
    params(
        ("connection_id" = String, Path, description = "Connection identifier"),
        ("provider_config_key" = String, Query, description = "Provider config key"),
        ("force_refresh" = Option<bool>, Query, description = "Refresh even when not stale"),
        EnvironmentHeader
    ),
    responses(
        (status = 200, description = "Connection with fresh credentials", body = ConnectionResponse),
        (status = 404, description = "No such connection", body = ApiError),
        (status = 502, description = "Credential refresh failed", body = ApiError),
        (status = 503, description = "Refresh lock contention, retry", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn get_connection(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    EnvironmentExtension(environment): EnvironmentExtension,
    Path(connection_id): Path<String>,
    Query(query): Query<ConnectionQuery>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    let services = state.dispatcher.services();

    let connection = services
        .connections
        .find_by_natural_key(&environment.0, &query.provider_config_key, &connection_id)
        .await?
        .ok_or_else(|| not_found(&connection_id, &query.provider_config_key))?;

    let connection = state
        .refresher
        .ensure_fresh(connection, query.force_refresh)
        .await?;

    services.connections.touch_last_fetched(&connection.id).await?;

    Ok(Json(to_response(connection)?))
}

/// Soft-delete a connection
///
/// The row is retained for audit; the natural key becomes free for a new
/// connection.
#[utoipa::path(
    delete,
    path = "/connections/{connection_id}",
    security(("bearer_auth" = [])),
    params(
        ("connection_id" = String, Path, description = "Connection identifier"),
        ("provider_config_key" = String, Query, description = "Provider config key"),
        EnvironmentHeader
    ),
    responses(
        (status = 204, description = "Connection deleted"),
        (status = 404, description = "No such connection", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn delete_connection(
    State(state): State<AppState>,
    _operator_auth: OperatorAuth,
    EnvironmentExtension(environment): EnvironmentExtension,
    Path(connection_id): Path<String>,
    Query(query): Query<ConnectionQuery>,
) -> Result<StatusCode, ApiError> {
    let deleted = state
        .dispatcher
        .services()
        .connections
        .soft_delete(&environment.0, &query.provider_config_key, &connection_id)
        .await?;

    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(&connection_id, &query.provider_config_key))
    }
}
