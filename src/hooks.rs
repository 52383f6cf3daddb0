//! Outbound collaborators
//!
//! Seams the broker calls out through: the HMAC gate on flow initiation, the
//! client notifier that delivers the authoritative flow outcome, and the
//! connection lifecycle hooks. Defaults are provided for all three; hosting
//! applications swap in their own implementations.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// Verifies the caller-supplied digest on `GET /authorize`. When no key is
/// configured the gate is disabled and every request passes.
#[derive(Clone)]
pub struct HmacGate {
    key: Option<Vec<u8>>,
}

impl HmacGate {
    pub fn new(key: Option<String>) -> Self {
        Self {
            key: key.map(String::into_bytes),
        }
    }

    pub fn disabled() -> Self {
        Self { key: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    /// Compute the expected digest over `env:provider_config_key:connection_id`.
    pub fn digest(
        &self,
        environment_id: &str,
        provider_config_key: &str,
        connection_id: &str,
    ) -> Option<String> {
        let key = self.key.as_ref()?;
        let mut mac = HmacSha256::new_from_slice(key).ok()?;
        mac.update(
            format!("{}:{}:{}", environment_id, provider_config_key, connection_id).as_bytes(),
        );
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    /// Verify a hex digest in constant time. With the gate enabled, an absent
    /// or mismatched digest is [`AuthError::InvalidHmac`].
    pub fn verify(
        &self,
        environment_id: &str,
        provider_config_key: &str,
        connection_id: &str,
        provided: Option<&str>,
    ) -> Result<(), AuthError> {
        let Some(expected) = self.digest(environment_id, provider_config_key, connection_id) else {
            return Ok(());
        };

        let provided = provided.ok_or(AuthError::InvalidHmac)?;
        if expected.as_bytes().ct_eq(provided.as_bytes()).into() {
            Ok(())
        } else {
            Err(AuthError::InvalidHmac)
        }
    }
}

/// Delivers flow outcomes to the waiting client channel. The HTTP response of
/// the callback endpoint is cosmetic; this channel is authoritative.
#[async_trait]
pub trait ClientNotifier: Send + Sync {
    /// `pending` marks a two-step install whose credential is stored but
    /// still waiting on the provider's install id.
    async fn notify_success(
        &self,
        ws_client_id: Option<&str>,
        provider_config_key: &str,
        connection_id: &str,
        pending: bool,
    );

    async fn notify_err(
        &self,
        ws_client_id: Option<&str>,
        provider_config_key: &str,
        connection_id: &str,
        error: &AuthError,
    );
}

/// Default notifier that reports over tracing only.
#[derive(Default)]
pub struct LogNotifier;

#[async_trait]
impl ClientNotifier for LogNotifier {
    async fn notify_success(
        &self,
        ws_client_id: Option<&str>,
        provider_config_key: &str,
        connection_id: &str,
        pending: bool,
    ) {
        tracing::info!(
            ws_client_id,
            provider_config_key,
            connection_id,
            pending,
            "authorization flow succeeded"
        );
    }

    async fn notify_err(
        &self,
        ws_client_id: Option<&str>,
        provider_config_key: &str,
        connection_id: &str,
        error: &AuthError,
    ) {
        tracing::warn!(
            ws_client_id,
            provider_config_key,
            connection_id,
            code = error.code(),
            "authorization flow failed: {}",
            error
        );
    }
}

/// Post-persistence lifecycle hooks.
#[async_trait]
pub trait ConnectionHooks: Send + Sync {
    async fn on_connection_created(
        &self,
        environment_id: &uuid::Uuid,
        provider_config_key: &str,
        connection_id: &str,
    );

    async fn on_connection_creation_failed(
        &self,
        environment_id: &uuid::Uuid,
        provider_config_key: &str,
        connection_id: &str,
        error: &AuthError,
    );
}

/// Default hooks: no-op.
#[derive(Default)]
pub struct NoopHooks;

#[async_trait]
impl ConnectionHooks for NoopHooks {
    async fn on_connection_created(
        &self,
        _environment_id: &uuid::Uuid,
        _provider_config_key: &str,
        _connection_id: &str,
    ) {
    }

    async fn on_connection_creation_failed(
        &self,
        _environment_id: &uuid::Uuid,
        _provider_config_key: &str,
        _connection_id: &str,
        _error: &AuthError,
    ) {
    }
}
