//! Credential refresh coordination.
//!
//! `ensure_fresh` is the single entry point the read path goes through. The
//! staleness decision runs twice: once without the lock to keep the common
//! fresh case cheap, and again under the lock against a re-read row, so
//! concurrent readers collapse into one provider call and the losers return
//! the winner's result.

use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::config::FlowConfig;
use crate::credentials::{self, AuthCredentials};
use crate::error::AuthError;
use crate::flows::{
    FlowServices, RequestConfig, RequestOverrides, app_install, client_credentials, oauth2,
};
use crate::lock::{RefreshLock, lock_key};
use crate::providers::TemplateRegistry;
use crate::repositories::StoredConnection;

/// Providers that rotate their long-lived token through the refresh grant
/// with the access token standing in for the refresh token.
const NO_REFRESH_TOKEN_PROVIDERS: &[&str] = &["facebook"];

pub struct RefreshCoordinator {
    services: Arc<FlowServices>,
    registry: Arc<TemplateRegistry>,
    locks: Arc<dyn RefreshLock>,
    flow: FlowConfig,
}

/// Whether this credential kind can be re-derived at all.
fn supports_refresh(credentials: &AuthCredentials, provider: &str) -> bool {
    match credentials {
        AuthCredentials::OAuth2 { refresh_token, .. } => {
            refresh_token.is_some() || NO_REFRESH_TOKEN_PROVIDERS.contains(&provider)
        }
        AuthCredentials::OAuth2Cc { .. }
        | AuthCredentials::App { .. }
        | AuthCredentials::AppStore { .. } => true,
        _ => false,
    }
}

/// Expiry check against the configured buffer. A credential without an
/// expiry never goes stale on its own.
fn expires_within(credentials: &AuthCredentials, buffer_seconds: i64) -> bool {
    match credentials.expires_at() {
        Some(expires_at) => expires_at <= Utc::now() + Duration::seconds(buffer_seconds),
        None => false,
    }
}

impl RefreshCoordinator {
    pub fn new(
        services: Arc<FlowServices>,
        registry: Arc<TemplateRegistry>,
        locks: Arc<dyn RefreshLock>,
        flow: FlowConfig,
    ) -> Self {
        Self {
            services,
            registry,
            locks,
            flow,
        }
    }

    async fn is_stale(
        &self,
        connection: &StoredConnection,
        force: bool,
    ) -> Result<bool, AuthError> {
        if force {
            return Ok(true);
        }
        if let Some(introspector) = self.services.extensions.introspector(&connection.provider)
            && introspector.is_stale(&connection.credentials).await?
        {
            return Ok(true);
        }
        Ok(expires_within(
            &connection.credentials,
            self.flow.refresh_buffer_seconds,
        ))
    }

    /// Return the connection with credentials guaranteed usable, refreshing
    /// them first when stale (or when `force` is set).
    pub async fn ensure_fresh(
        &self,
        connection: StoredConnection,
        force: bool,
    ) -> Result<StoredConnection, AuthError> {
        if !supports_refresh(&connection.credentials, &connection.provider) {
            return Ok(connection);
        }
        if !self.is_stale(&connection, force).await? {
            return Ok(connection);
        }

        let key = lock_key(
            &connection.environment_id,
            &connection.provider_config_key,
            &connection.connection_id,
        );
        let lease = self
            .locks
            .acquire(
                &key,
                Duration::seconds(self.flow.lock_ttl_seconds),
                Duration::seconds(self.flow.lock_timeout_seconds),
            )
            .await?;

        let result = self.refresh_locked(&connection, force).await;

        // The lease is released on every path; a failed release only means
        // the TTL does the cleanup.
        if let Err(release_err) = self.locks.release(&lease).await {
            tracing::warn!(lock_key = %key, error = %release_err, "refresh lock release failed");
        }

        match result {
            Ok(refreshed) => {
                metrics::counter!(
                    "keybridge_refreshes_total",
                    "provider" => refreshed.provider.clone()
                )
                .increment(1);
                Ok(refreshed)
            }
            Err(error) => {
                metrics::counter!(
                    "keybridge_refresh_failures_total",
                    "provider" => connection.provider.clone()
                )
                .increment(1);
                Err(error)
            }
        }
    }

    /// Runs with the lease held. Re-reads the row first: a waiter that lost
    /// the acquire race finds credentials another holder just wrote.
    async fn refresh_locked(
        &self,
        observed: &StoredConnection,
        force: bool,
    ) -> Result<StoredConnection, AuthError> {
        let current = self
            .services
            .connections
            .find_by_natural_key(
                &observed.environment_id,
                &observed.provider_config_key,
                &observed.connection_id,
            )
            .await?
            .ok_or_else(|| {
                AuthError::RefreshFailed("connection was deleted mid-refresh".to_string())
            })?;

        // Someone else refreshed while we waited for the lock.
        if current.updated_at > observed.updated_at {
            return Ok(current);
        }
        if !self.is_stale(&current, force).await? {
            return Ok(current);
        }

        let stored = self
            .services
            .provider_configs
            .find_by_key(&current.environment_id, &current.provider_config_key)
            .await?;
        let template = self.registry.get(&stored.provider)?;
        let cfg = RequestConfig::build(
            current.environment_id,
            template,
            &stored,
            &RequestOverrides::default(),
        );

        let raw = self.rederive(&current, &cfg).await?;
        let mut parsed = credentials::parse(&raw, current.credentials.auth_mode())?;

        // Providers that do not rotate the refresh token omit it from the
        // response; keep the stored one.
        if let AuthCredentials::OAuth2 {
            refresh_token: new_refresh, ..
        } = &mut parsed
            && new_refresh.is_none()
        {
            *new_refresh = current.credentials.refresh_token().map(str::to_string);
        }

        self.services
            .connections
            .update_credentials(&current.id, &parsed)
            .await?;

        tracing::info!(
            provider_config_key = %current.provider_config_key,
            connection_id = %current.connection_id,
            "refreshed credentials"
        );

        Ok(StoredConnection {
            credentials: parsed,
            updated_at: Utc::now(),
            ..current
        })
    }

    /// Mode-specific re-derivation of a fresh raw token payload.
    async fn rederive(
        &self,
        current: &StoredConnection,
        cfg: &RequestConfig,
    ) -> Result<serde_json::Value, AuthError> {
        match &current.credentials {
            AuthCredentials::OAuth2 {
                access_token,
                refresh_token,
                ..
            } => {
                let grant_token = refresh_token
                    .as_deref()
                    .or_else(|| {
                        NO_REFRESH_TOKEN_PROVIDERS
                            .contains(&current.provider.as_str())
                            .then_some(access_token.as_str())
                    })
                    .ok_or_else(|| {
                        AuthError::RefreshFailed("no refresh token stored".to_string())
                    })?;
                oauth2::exchange_refresh_token(&self.services.http, cfg, grant_token).await
            }
            AuthCredentials::OAuth2Cc {
                client_id,
                client_secret,
                ..
            } => client_credentials::mint(&self.services, cfg, client_id, client_secret).await,
            AuthCredentials::App { .. } => {
                let installation_id = current
                    .connection_config
                    .get("installation_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        AuthError::RefreshFailed(
                            "no installation_id in connection config".to_string(),
                        )
                    })?;
                app_install::fetch_installation_token(&self.services, cfg, installation_id).await
            }
            AuthCredentials::AppStore { private_key, .. } => {
                app_install::mint_store_token(cfg, private_key)
            }
            other => Err(AuthError::RefreshFailed(format!(
                "auth mode '{}' is not refreshable",
                other.auth_mode()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn oauth2_credentials(refresh_token: Option<&str>, expires_in: i64) -> AuthCredentials {
        AuthCredentials::OAuth2 {
            access_token: "at".to_string(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at: Some(Utc::now() + Duration::seconds(expires_in)),
            raw: json!({}),
        }
    }

    #[test]
    fn oauth2_without_refresh_token_is_not_refreshable() {
        let creds = oauth2_credentials(None, 60);
        assert!(!supports_refresh(&creds, "github"));
    }

    #[test]
    fn facebook_refreshes_with_its_access_token() {
        let creds = oauth2_credentials(None, 60);
        assert!(supports_refresh(&creds, "facebook"));
    }

    #[test]
    fn static_credentials_never_refresh() {
        let creds = AuthCredentials::ApiKey {
            api_key: "k".to_string(),
            raw: json!({}),
        };
        assert!(!supports_refresh(&creds, "stripe"));
    }

    #[test]
    fn buffer_decides_staleness() {
        // expires in 5 minutes, buffer 15 minutes: stale
        assert!(expires_within(&oauth2_credentials(Some("rt"), 300), 900));
        // expires in an hour: fresh
        assert!(!expires_within(&oauth2_credentials(Some("rt"), 3600), 900));

        // no expiry never goes stale by time
        let creds = AuthCredentials::OAuth2 {
            access_token: "at".to_string(),
            refresh_token: Some("rt".to_string()),
            expires_at: None,
            raw: json!({}),
        };
        assert!(!expires_within(&creds, 900));
    }
}
