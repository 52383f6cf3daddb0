//! Provider template registry
//!
//! A template is the static, provider-shaped half of a flow: endpoints,
//! default params, PKCE posture. Per-tenant values (client id/secret, scopes)
//! live in `ProviderConfig` rows and are merged at request time.
//!
//! A built-in set ships in the binary; a JSON file referenced by
//! `KEYBRIDGE_TEMPLATES_PATH` extends or overrides it.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::credentials::AuthMode;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unknown provider template '{0}'")]
    UnknownTemplate(String),
    #[error("failed to read template file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse template file: {0}")]
    FileParse(#[from] serde_json::Error),
}

/// How the client id/secret are presented on the token request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenRequestAuthMethod {
    /// HTTP Basic authorization header
    Basic,
    /// Form fields in the request body
    #[default]
    Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderTemplate {
    pub auth_mode: AuthMode,
    #[serde(default)]
    pub authorization_url: Option<String>,
    #[serde(default)]
    pub token_url: Option<String>,
    /// Endpoint that trades an app JWT for an installation access token.
    /// Falls back to `token_url` for providers where the two coincide.
    #[serde(default)]
    pub installation_token_url: Option<String>,
    /// OAuth 1.0a temporary-credentials endpoint
    #[serde(default)]
    pub request_url: Option<String>,
    #[serde(default = "default_scope_separator")]
    pub scope_separator: String,
    #[serde(default)]
    pub disable_pkce: bool,
    #[serde(default)]
    pub token_request_auth_method: TokenRequestAuthMethod,
    /// Default query params appended to the authorization redirect
    #[serde(default)]
    pub authorization_params: BTreeMap<String, String>,
    /// Default form params sent on the token exchange
    #[serde(default)]
    pub token_params: BTreeMap<String, String>,
    /// Literal string substitutions applied to the final authorization URL
    #[serde(default)]
    pub authorization_url_replacements: BTreeMap<String, String>,
    /// Base URL for post-connect verification probes
    #[serde(default)]
    pub proxy_base_url: Option<String>,
}

fn default_scope_separator() -> String {
    " ".to_string()
}

impl ProviderTemplate {
    fn redirect_based(auth_mode: AuthMode, authorization_url: &str, token_url: &str) -> Self {
        ProviderTemplate {
            auth_mode,
            authorization_url: Some(authorization_url.to_string()),
            token_url: Some(token_url.to_string()),
            installation_token_url: None,
            request_url: None,
            scope_separator: default_scope_separator(),
            disable_pkce: false,
            token_request_auth_method: TokenRequestAuthMethod::Body,
            authorization_params: BTreeMap::new(),
            token_params: BTreeMap::new(),
            authorization_url_replacements: BTreeMap::new(),
            proxy_base_url: None,
        }
    }

    fn tokenless(auth_mode: AuthMode) -> Self {
        ProviderTemplate {
            auth_mode,
            authorization_url: None,
            token_url: None,
            installation_token_url: None,
            request_url: None,
            scope_separator: default_scope_separator(),
            disable_pkce: false,
            token_request_auth_method: TokenRequestAuthMethod::Body,
            authorization_params: BTreeMap::new(),
            token_params: BTreeMap::new(),
            authorization_url_replacements: BTreeMap::new(),
            proxy_base_url: None,
        }
    }
}

/// Immutable provider template lookup, built once at startup.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: BTreeMap<String, ProviderTemplate>,
}

impl TemplateRegistry {
    /// Built-in templates only.
    pub fn builtin() -> Self {
        let mut templates = BTreeMap::new();

        let mut github = ProviderTemplate::redirect_based(
            AuthMode::OAuth2,
            "https://github.com/login/oauth/authorize",
            "https://github.com/login/oauth/access_token",
        );
        github.scope_separator = ",".to_string();
        github.disable_pkce = true;
        templates.insert("github".to_string(), github);

        let mut github_app = ProviderTemplate::redirect_based(
            AuthMode::App,
            "https://github.com/apps/{{app_public_link}}/installations/new",
            "https://api.github.com/app/installations/{{installation_id}}/access_tokens",
        );
        github_app.disable_pkce = true;
        templates.insert("github-app".to_string(), github_app);

        // Two-step variant: a user OAuth grant first, the installation id
        // arrives later and finalizes the connection.
        let mut github_app_oauth = ProviderTemplate::redirect_based(
            AuthMode::Custom,
            "https://github.com/apps/{{app_public_link}}/installations/new",
            "https://github.com/login/oauth/access_token",
        );
        github_app_oauth.installation_token_url = Some(
            "https://api.github.com/app/installations/{{installation_id}}/access_tokens"
                .to_string(),
        );
        github_app_oauth.disable_pkce = true;
        templates.insert("github-app-oauth".to_string(), github_app_oauth);

        // The minted ES256 JWT is the credential; no redirect leg at all.
        templates.insert(
            "appstore".to_string(),
            ProviderTemplate::tokenless(AuthMode::AppStore),
        );

        let mut google = ProviderTemplate::redirect_based(
            AuthMode::OAuth2,
            "https://accounts.google.com/o/oauth2/v2/auth",
            "https://oauth2.googleapis.com/token",
        );
        google
            .authorization_params
            .insert("access_type".to_string(), "offline".to_string());
        google
            .authorization_params
            .insert("prompt".to_string(), "consent".to_string());
        templates.insert("google".to_string(), google);

        let mut facebook = ProviderTemplate::redirect_based(
            AuthMode::OAuth2,
            "https://www.facebook.com/v20.0/dialog/oauth",
            "https://graph.facebook.com/v20.0/oauth/access_token",
        );
        facebook.disable_pkce = true;
        templates.insert("facebook".to_string(), facebook);

        let mut slack = ProviderTemplate::redirect_based(
            AuthMode::OAuth2,
            "https://slack.com/oauth/v2/authorize",
            "https://slack.com/api/oauth.v2.access",
        );
        slack.scope_separator = ",".to_string();
        slack.disable_pkce = true;
        templates.insert("slack".to_string(), slack);

        let mut twitter = ProviderTemplate::redirect_based(
            AuthMode::OAuth1,
            "https://api.twitter.com/oauth/authorize",
            "https://api.twitter.com/oauth/access_token",
        );
        twitter.request_url = Some("https://api.twitter.com/oauth/request_token".to_string());
        templates.insert("twitter".to_string(), twitter);

        let mut salesforce_cc = ProviderTemplate::tokenless(AuthMode::OAuth2Cc);
        salesforce_cc.token_url =
            Some("https://login.salesforce.com/services/oauth2/token".to_string());
        salesforce_cc.token_request_auth_method = TokenRequestAuthMethod::Basic;
        templates.insert("salesforce-cc".to_string(), salesforce_cc);

        templates.insert("api-key".to_string(), ProviderTemplate::tokenless(AuthMode::ApiKey));
        templates.insert("basic".to_string(), ProviderTemplate::tokenless(AuthMode::Basic));
        templates.insert("unauthenticated".to_string(), ProviderTemplate::tokenless(AuthMode::None));

        TemplateRegistry { templates }
    }

    /// Built-ins plus templates loaded from a JSON file
    /// (`{"provider-name": {template}, ...}`). File entries win on conflict.
    pub fn from_file(path: &Path) -> Result<Self, TemplateError> {
        let mut registry = Self::builtin();
        let contents = std::fs::read_to_string(path)?;
        let extra: BTreeMap<String, ProviderTemplate> = serde_json::from_str(&contents)?;
        registry.templates.extend(extra);
        Ok(registry)
    }

    pub fn get(&self, provider: &str) -> Result<&ProviderTemplate, TemplateError> {
        self.templates
            .get(provider)
            .ok_or_else(|| TemplateError::UnknownTemplate(provider.to_string()))
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn builtin_registry_has_core_modes() {
        let registry = TemplateRegistry::builtin();
        assert_eq!(registry.get("github").unwrap().auth_mode, AuthMode::OAuth2);
        assert_eq!(registry.get("twitter").unwrap().auth_mode, AuthMode::OAuth1);
        assert_eq!(registry.get("github-app").unwrap().auth_mode, AuthMode::App);
        assert_eq!(
            registry.get("github-app-oauth").unwrap().auth_mode,
            AuthMode::Custom
        );
        assert_eq!(
            registry.get("appstore").unwrap().auth_mode,
            AuthMode::AppStore
        );
        assert_eq!(registry.get("api-key").unwrap().auth_mode, AuthMode::ApiKey);
    }

    #[test]
    fn unknown_template_is_an_error() {
        let registry = TemplateRegistry::builtin();
        let err = registry.get("does-not-exist").unwrap_err();
        assert!(matches!(err, TemplateError::UnknownTemplate(_)));
    }

    #[test]
    fn file_entries_override_builtins() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "github": {{
                    "auth_mode": "oauth2",
                    "authorization_url": "https://ghe.internal/login/oauth/authorize",
                    "token_url": "https://ghe.internal/login/oauth/access_token",
                    "disable_pkce": true
                }},
                "acme": {{
                    "auth_mode": "oauth2",
                    "authorization_url": "https://{{{{subdomain}}}}.acme.test/authorize",
                    "token_url": "https://api.acme.test/token"
                }}
            }}"#
        )
        .unwrap();

        let registry = TemplateRegistry::from_file(file.path()).unwrap();
        assert_eq!(
            registry.get("github").unwrap().authorization_url.as_deref(),
            Some("https://ghe.internal/login/oauth/authorize")
        );
        let acme = registry.get("acme").unwrap();
        assert_eq!(acme.scope_separator, " ");
        assert!(!acme.disable_pkce);
    }

    #[test]
    fn template_defaults_deserialize() {
        let tpl: ProviderTemplate = serde_json::from_str(
            r#"{"auth_mode": "oauth2", "authorization_url": "https://a", "token_url": "https://t"}"#,
        )
        .unwrap();
        assert_eq!(tpl.token_request_auth_method, TokenRequestAuthMethod::Body);
        assert!(tpl.authorization_params.is_empty());
        assert!(!tpl.disable_pkce);
    }
}
