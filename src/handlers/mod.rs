//! # API Handlers
//!
//! HTTP endpoint handlers for the authorization and credential API.

use axum::response::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::repositories::UpsertOperation;

pub mod authorize;
pub mod callback;
pub mod client_credentials;
pub mod connections;

/// Basic service information returned by the root endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub status: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            status: "ok".to_string(),
        }
    }
}

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo::default())
}

pub(crate) fn operation_str(operation: UpsertOperation) -> &'static str {
    match operation {
        UpsertOperation::Created => "created",
        UpsertOperation::Updated => "updated",
    }
}
