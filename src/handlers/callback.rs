//! Shared provider callback endpoint.

use std::collections::BTreeMap;

use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::flows::{CallbackOutcome, CallbackParams};
use crate::server::AppState;

use super::operation_str;

/// Callback acknowledgement body
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CallbackResponse {
    /// `success`, `pending`, or `acknowledged`
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_config_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

/// Provider redirect target shared by every flow
///
/// Correlates the callback to its pending session via the `state` parameter
/// and finishes the flow. Unauthenticated: a valid single-use session id is
/// the only credential. The notifier channel is authoritative for flows whose
/// exchange continues in the background.
#[utoipa::path(
    get,
    path = "/oauth/callback",
    responses(
        (status = 200, description = "Flow finished or acknowledged", body = CallbackResponse),
        (status = 400, description = "Malformed callback", body = ApiError),
        (status = 404, description = "Unknown or already-consumed session", body = ApiError),
        (status = 502, description = "Provider token exchange failed", body = ApiError)
    ),
    tag = "flows"
)]
pub async fn callback(
    State(state): State<AppState>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Json<CallbackResponse>, ApiError> {
    let outcome = state
        .dispatcher
        .handle_callback(CallbackParams::new(params))
        .await?;

    Ok(Json(match outcome {
        CallbackOutcome::Completed {
            connection_id,
            provider_config_key,
            operation,
            pending,
        } => CallbackResponse {
            status: if pending { "pending" } else { "success" }.to_string(),
            connection_id: Some(connection_id),
            provider_config_key: Some(provider_config_key),
            operation: Some(operation_str(operation).to_string()),
        },
        CallbackOutcome::Deferred => CallbackResponse {
            status: "pending".to_string(),
            connection_id: None,
            provider_config_key: None,
            operation: None,
        },
        CallbackOutcome::InstallUpdate => CallbackResponse {
            status: "acknowledged".to_string(),
            connection_id: None,
            provider_config_key: None,
            operation: None,
        },
    }))
}
