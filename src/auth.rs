//! Operator authentication and environment scoping.
//!
//! Management endpoints require a bearer token from the configured operator
//! set plus an `X-Environment-Id` header carrying the environment UUID. The
//! callback endpoint stays outside this middleware: its only credential is a
//! valid session id.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{ApiError, unauthorized, validation_error};

/// Environment ID wrapper for type safety
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentId(pub Uuid);

/// Marker type for authenticated operator requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatorAuth;

/// Extractor for the environment ID from request extensions
#[derive(Debug, Clone)]
pub struct EnvironmentExtension(pub EnvironmentId);

/// Middleware validating the bearer token and the environment header.
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let headers = request.headers().clone();

    let token = extract_bearer_token(&headers)?;
    validate_token(&config, token)?;

    let environment = extract_environment_id(&headers)?;
    tracing::debug!(environment_id = %environment.0, "authenticated operator request");

    request
        .extensions_mut()
        .insert(EnvironmentExtension(environment));
    request.extensions_mut().insert(OperatorAuth);

    Ok(next.run(request).await)
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(AUTHORIZATION)
        .ok_or_else(|| unauthorized(Some("Missing Authorization header")))
        .and_then(|value| {
            value
                .to_str()
                .map_err(|_| unauthorized(Some("Invalid Authorization header")))
        })
        .and_then(|header| {
            header
                .strip_prefix("Bearer ")
                .ok_or_else(|| unauthorized(Some("Authorization header must use Bearer scheme")))
        })
}

fn validate_token(config: &AppConfig, token: &str) -> Result<(), ApiError> {
    let is_valid = config
        .operator_tokens
        .iter()
        .any(|configured| ConstantTimeEq::ct_eq(token.as_bytes(), configured.as_bytes()).into());

    if is_valid {
        Ok(())
    } else {
        Err(unauthorized(Some("Invalid bearer token")))
    }
}

fn extract_environment_id(headers: &HeaderMap) -> Result<EnvironmentId, ApiError> {
    let header_value = headers
        .get("X-Environment-Id")
        .ok_or_else(|| {
            validation_error(
                "Missing required header",
                serde_json::json!({ "X-Environment-Id": "Required header is missing" }),
            )
        })?
        .to_str()
        .map_err(|_| {
            validation_error(
                "Invalid environment header",
                serde_json::json!({ "X-Environment-Id": "Header must be valid UTF-8" }),
            )
        })?;

    header_value
        .parse::<Uuid>()
        .map(EnvironmentId)
        .map_err(|_| {
            validation_error(
                "Invalid environment ID",
                serde_json::json!({ "X-Environment-Id": "Must be a valid UUID" }),
            )
        })
}

/// OpenAPI header parameter for X-Environment-Id
#[derive(Debug, Serialize, Deserialize, IntoParams, utoipa::ToSchema)]
#[into_params(parameter_in = Header)]
pub struct EnvironmentHeader {
    /// Environment identifier (UUID) that scopes the request
    #[serde(rename = "X-Environment-Id")]
    #[param(rename = "X-Environment-Id", value_type = String)]
    pub environment_id: String,
}

impl<S> FromRequestParts<S> for EnvironmentExtension
where
    Arc<AppConfig>: FromRef<S>,
    S: Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<EnvironmentExtension>()
            .cloned()
            .ok_or_else(|| {
                validation_error(
                    "Environment context missing",
                    serde_json::json!({ "X-Environment-Id": "Environment context not present" }),
                )
            })
    }
}

impl<S> FromRequestParts<S> for OperatorAuth
where
    Arc<AppConfig>: FromRef<S>,
    S: Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<OperatorAuth>()
            .copied()
            .ok_or_else(|| unauthorized(Some("Operator authentication required")))
    }
}
