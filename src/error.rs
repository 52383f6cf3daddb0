//! Unified error handling
//!
//! Domain failures are `AuthError` variants; every outbound HTTP error is an
//! `ApiError` rendered as problem+json with a trace id. Flow failures are
//! additionally delivered to the waiting client over the notifier channel.

use axum::{
    extract::rejection::JsonRejection,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::credentials::ParseError;
use crate::crypto::CryptoError;
use crate::interpolation::InterpolationError;
use crate::providers::TemplateError;
use crate::telemetry;

/// Domain error for the authorization and credential lifecycle paths.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing required parameter '{0}'")]
    MissingParam(&'static str),
    #[error("invalid callback: {0}")]
    InvalidCallback(String),
    #[error("HMAC digest verification failed")]
    InvalidHmac,
    #[error("unknown provider config '{0}'")]
    UnknownProviderConfig(String),
    #[error("provider config invalid: {0}")]
    InvalidProviderConfig(String),
    #[error(transparent)]
    UnknownProviderTemplate(#[from] TemplateError),
    #[error(transparent)]
    MissingInterpolationParam(#[from] InterpolationError),
    #[error("token retrieval from {provider} failed: {reason}")]
    TokenRetrievalFailed { provider: String, reason: String },
    #[error("token response from {provider} could not be parsed")]
    TokenResponseUnparsable { provider: String },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("encryption key does not match the key this database was encrypted with")]
    EncryptionKeyImmutable,
    #[error("storage error: {0}")]
    Storage(#[from] sea_orm::DbErr),
    #[error("session '{0}' not found or already consumed")]
    SessionNotFound(String),
    #[error("a session with id '{0}' already exists")]
    DuplicateSession(String),
    #[error("timed out waiting for the refresh lock on '{0}'")]
    LockTimeout(String),
    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),
}

impl AuthError {
    /// Stable SCREAMING_SNAKE_CASE code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingParam(_) | AuthError::InvalidCallback(_) => "VALIDATION_FAILED",
            AuthError::InvalidHmac => "UNAUTHORIZED",
            AuthError::UnknownProviderConfig(_)
            | AuthError::UnknownProviderTemplate(_)
            | AuthError::InvalidProviderConfig(_) => "CONFIGURATION_ERROR",
            AuthError::MissingInterpolationParam(_) => "INTERPOLATION_ERROR",
            AuthError::TokenRetrievalFailed { .. }
            | AuthError::TokenResponseUnparsable { .. }
            | AuthError::Parse(_)
            | AuthError::RefreshFailed(_) => "PROVIDER_ERROR",
            AuthError::Crypto(_)
            | AuthError::EncryptionKeyImmutable
            | AuthError::Storage(_) => "STORAGE_ERROR",
            AuthError::LockTimeout(_) => "LOCK_TIMEOUT",
            AuthError::SessionNotFound(_) => "NOT_FOUND",
            AuthError::DuplicateSession(_) => "CONFLICT",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingParam(_)
            | AuthError::InvalidCallback(_)
            | AuthError::MissingInterpolationParam(_)
            | AuthError::UnknownProviderConfig(_)
            | AuthError::InvalidProviderConfig(_)
            | AuthError::UnknownProviderTemplate(_) => StatusCode::BAD_REQUEST,
            AuthError::InvalidHmac => StatusCode::UNAUTHORIZED,
            AuthError::TokenRetrievalFailed { .. }
            | AuthError::TokenResponseUnparsable { .. }
            | AuthError::Parse(_)
            | AuthError::RefreshFailed(_) => StatusCode::BAD_GATEWAY,
            AuthError::Crypto(_)
            | AuthError::EncryptionKeyImmutable
            | AuthError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AuthError::LockTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AuthError::DuplicateSession(_) => StatusCode::CONFLICT,
        }
    }
}

/// Unified API error response body (problem+json)
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: Box<str>,
    /// Human-readable message
    pub message: Box<str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Box<serde_json::Value>>,
    /// Suggested retry delay in seconds
    pub retry_after: Option<u64>,
    /// Correlation trace id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Box<str>>,
}

impl ApiError {
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into().into_boxed_str(),
            message: message.into().into_boxed_str(),
            details: None,
            retry_after: None,
            trace_id: Self::current_trace_id(),
        }
    }

    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(Box::new(details.into()));
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Active trace id, or a short generated correlation id so the response
    /// always carries something the client can quote back.
    fn current_trace_id() -> Option<Box<str>> {
        telemetry::current_trace_id()
            .map(|trace_id| trace_id.into_boxed_str())
            .or_else(|| {
                Some(format!("corr-{}", &uuid::Uuid::new_v4().to_string()[..8]).into_boxed_str())
            })
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        let status = error.status();
        if status.is_server_error() {
            tracing::error!(code = error.code(), "{}", error);
        } else {
            tracing::debug!(code = error.code(), "{}", error);
        }

        // Internal detail stays out of 5xx bodies
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "An internal storage error occurred".to_string()
        } else {
            error.to_string()
        };

        let mut api = ApiError::new(status, error.code().to_string(), message);
        if let AuthError::LockTimeout(_) = error {
            api = api.with_retry_after(1);
        }
        api
    }
}

fn is_unique_violation(error: &sea_orm::DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        sea_orm::DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | sea_orm::DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error
        .code()
        .map(|code| {
            let code = code.as_ref();
            code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code)
        })
        .unwrap_or(false)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after
            && let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert("retry-after", header_value);
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", error);

        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            "An internal error occurred",
        )
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(err) => format!("Invalid JSON: {}", err),
            JsonRejection::JsonSyntaxError(err) => format!("JSON syntax error: {}", err),
            JsonRejection::MissingJsonContentType(_) => {
                "Missing 'Content-Type: application/json' header".to_string()
            }
            _ => "Invalid request body".to_string(),
        };

        Self::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", &message)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        if is_unique_violation(&error) {
            tracing::debug!(?error, "unique constraint violation");
            return Self::new(StatusCode::CONFLICT, "CONFLICT", "Resource already exists");
        }

        match error {
            sea_orm::DbErr::RecordNotFound(record) => Self::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                &format!("Record not found: {}", record),
            ),
            sea_orm::DbErr::Conn(connection_err) => {
                tracing::error!("database connection error: {:?}", connection_err);
                Self::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Database service unavailable",
                )
            }
            other => {
                tracing::error!("database error: {:?}", other);
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORAGE_ERROR",
                    "Database error occurred",
                )
            }
        }
    }
}

/// 401 UNAUTHORIZED with an optional message.
pub fn unauthorized(message: Option<&str>) -> ApiError {
    let msg = message.unwrap_or("Authentication required");
    ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg)
}

/// 400 VALIDATION_FAILED with per-field details.
pub fn validation_error(message: &str, field_errors: serde_json::Value) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", message).with_details(field_errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_mapping_covers_the_taxonomy() {
        let cases: Vec<(AuthError, StatusCode, &str)> = vec![
            (
                AuthError::MissingParam("connection_id"),
                StatusCode::BAD_REQUEST,
                "VALIDATION_FAILED",
            ),
            (AuthError::InvalidHmac, StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            (
                AuthError::UnknownProviderConfig("gh".to_string()),
                StatusCode::BAD_REQUEST,
                "CONFIGURATION_ERROR",
            ),
            (
                AuthError::TokenRetrievalFailed {
                    provider: "github".to_string(),
                    reason: "500".to_string(),
                },
                StatusCode::BAD_GATEWAY,
                "PROVIDER_ERROR",
            ),
            (
                AuthError::EncryptionKeyImmutable,
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_ERROR",
            ),
            (
                AuthError::LockTimeout("e:k:c".to_string()),
                StatusCode::SERVICE_UNAVAILABLE,
                "LOCK_TIMEOUT",
            ),
            (
                AuthError::SessionNotFound("s".to_string()),
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
            ),
        ];

        for (error, status, code) in cases {
            assert_eq!(error.status(), status, "{:?}", code);
            assert_eq!(error.code(), code);
            let api: ApiError = error.into();
            assert_eq!(api.status, status);
            assert_eq!(api.code.as_ref(), code);
        }
    }

    #[test]
    fn storage_errors_hide_internal_detail() {
        let api: ApiError = AuthError::Crypto(CryptoError::DecryptionFailed).into();
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!api.message.contains("decryption"));
    }

    #[test]
    fn lock_timeout_is_retryable() {
        let api: ApiError = AuthError::LockTimeout("k".to_string()).into();
        assert_eq!(api.retry_after, Some(1));
        let response = api.into_response();
        assert_eq!(response.headers().get("retry-after").unwrap(), "1");
    }

    #[test]
    fn problem_json_content_type() {
        let error = ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", "bad");
        let response = error.into_response();
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn trace_id_always_present() {
        let error = ApiError::new(StatusCode::BAD_REQUEST, "VALIDATION_FAILED", "bad");
        let trace_id = error.trace_id.expect("trace id");
        assert!(trace_id.starts_with("corr-"));
    }

    #[test]
    fn record_not_found_maps_to_404() {
        let api: ApiError = sea_orm::DbErr::RecordNotFound("connections".to_string()).into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);
    }
}
