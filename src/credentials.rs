//! Credential parsing and the typed credential union
//!
//! [`parse`] normalizes a raw provider token response into exactly one
//! [`AuthCredentials`] variant. It is a pure function: no network or storage
//! side effects, and it either fully succeeds or fails atomically.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Authorization protocol for a provider, as declared by its template.
///
/// Closed set; flow dispatch is a table lookup over this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[serde(rename = "oauth2")]
    OAuth2,
    #[serde(rename = "oauth1")]
    OAuth1,
    /// OAuth2 client-credentials grant
    #[serde(rename = "oauth2_cc")]
    OAuth2Cc,
    /// Platform app install using a JWT assertion (e.g. GitHub Apps)
    App,
    /// App-store style install: the minted JWT itself is the access token
    AppStore,
    /// Two-step app installation driven through an OAuth2-shaped flow
    Custom,
    ApiKey,
    Basic,
    None,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::OAuth2 => "oauth2",
            AuthMode::OAuth1 => "oauth1",
            AuthMode::OAuth2Cc => "oauth2_cc",
            AuthMode::App => "app",
            AuthMode::AppStore => "app_store",
            AuthMode::Custom => "custom",
            AuthMode::ApiKey => "api_key",
            AuthMode::Basic => "basic",
            AuthMode::None => "none",
        }
    }
}

impl std::str::FromStr for AuthMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oauth2" => Ok(AuthMode::OAuth2),
            "oauth1" => Ok(AuthMode::OAuth1),
            "oauth2_cc" => Ok(AuthMode::OAuth2Cc),
            "app" => Ok(AuthMode::App),
            "app_store" => Ok(AuthMode::AppStore),
            "custom" => Ok(AuthMode::Custom),
            "api_key" => Ok(AuthMode::ApiKey),
            "basic" => Ok(AuthMode::Basic),
            "none" => Ok(AuthMode::None),
            other => Err(ParseError::UnsupportedAuthMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential parse failures
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("missing required field '{field}' for {mode} credentials")]
    MissingField { mode: AuthMode, field: &'static str },
    #[error("field '{field}' has an invalid value")]
    InvalidField { field: &'static str },
    #[error("unsupported auth mode '{0}'")]
    UnsupportedAuthMode(String),
}

/// Typed credential union. Exactly one variant is stored per connection;
/// every variant retains the untouched raw provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthCredentials {
    #[serde(rename = "oauth2")]
    OAuth2 {
        access_token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        raw: JsonValue,
    },
    #[serde(rename = "oauth1")]
    OAuth1 {
        oauth_token: String,
        oauth_token_secret: String,
        raw: JsonValue,
    },
    #[serde(rename = "oauth2_cc")]
    OAuth2Cc {
        token: String,
        client_id: String,
        client_secret: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        raw: JsonValue,
    },
    App {
        access_token: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        raw: JsonValue,
    },
    AppStore {
        access_token: String,
        /// Base64-encoded signing key the token was minted from
        private_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        expires_at: Option<DateTime<Utc>>,
        raw: JsonValue,
    },
    ApiKey {
        api_key: String,
        raw: JsonValue,
    },
    Basic {
        username: String,
        #[serde(default)]
        password: String,
        raw: JsonValue,
    },
    None {
        raw: JsonValue,
    },
}

impl AuthCredentials {
    pub fn auth_mode(&self) -> AuthMode {
        match self {
            AuthCredentials::OAuth2 { .. } => AuthMode::OAuth2,
            AuthCredentials::OAuth1 { .. } => AuthMode::OAuth1,
            AuthCredentials::OAuth2Cc { .. } => AuthMode::OAuth2Cc,
            AuthCredentials::App { .. } => AuthMode::App,
            AuthCredentials::AppStore { .. } => AuthMode::AppStore,
            AuthCredentials::ApiKey { .. } => AuthMode::ApiKey,
            AuthCredentials::Basic { .. } => AuthMode::Basic,
            AuthCredentials::None { .. } => AuthMode::None,
        }
    }

    /// Expiry instant, for the variants that have one
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            AuthCredentials::OAuth2 { expires_at, .. }
            | AuthCredentials::OAuth2Cc { expires_at, .. }
            | AuthCredentials::App { expires_at, .. }
            | AuthCredentials::AppStore { expires_at, .. } => *expires_at,
            _ => None,
        }
    }

    pub fn refresh_token(&self) -> Option<&str> {
        match self {
            AuthCredentials::OAuth2 { refresh_token, .. } => refresh_token.as_deref(),
            _ => None,
        }
    }

    /// Untouched provider response
    pub fn raw(&self) -> &JsonValue {
        match self {
            AuthCredentials::OAuth2 { raw, .. }
            | AuthCredentials::OAuth1 { raw, .. }
            | AuthCredentials::OAuth2Cc { raw, .. }
            | AuthCredentials::App { raw, .. }
            | AuthCredentials::AppStore { raw, .. }
            | AuthCredentials::ApiKey { raw, .. }
            | AuthCredentials::Basic { raw, .. }
            | AuthCredentials::None { raw } => raw,
        }
    }
}

/// Normalize a raw provider response into a typed credential variant.
///
/// `expires_at` in the response takes precedence over `now + expires_in`.
pub fn parse(raw: &JsonValue, auth_mode: AuthMode) -> Result<AuthCredentials, ParseError> {
    match auth_mode {
        AuthMode::OAuth2 => Ok(AuthCredentials::OAuth2 {
            access_token: required_string(raw, auth_mode, "access_token")?,
            refresh_token: optional_string(raw, "refresh_token"),
            expires_at: parse_expiry(raw)?,
            raw: raw.clone(),
        }),
        AuthMode::OAuth1 => Ok(AuthCredentials::OAuth1 {
            oauth_token: required_string(raw, auth_mode, "oauth_token")?,
            oauth_token_secret: required_string(raw, auth_mode, "oauth_token_secret")?,
            raw: raw.clone(),
        }),
        AuthMode::OAuth2Cc => Ok(AuthCredentials::OAuth2Cc {
            // client-credentials responses use either field name
            token: optional_string(raw, "token")
                .or_else(|| optional_string(raw, "access_token"))
                .ok_or(ParseError::MissingField {
                    mode: auth_mode,
                    field: "token",
                })?,
            client_id: required_string(raw, auth_mode, "client_id")?,
            client_secret: required_string(raw, auth_mode, "client_secret")?,
            expires_at: parse_expiry(raw)?,
            raw: raw.clone(),
        }),
        AuthMode::App | AuthMode::Custom => Ok(AuthCredentials::App {
            access_token: optional_string(raw, "access_token")
                .or_else(|| optional_string(raw, "token"))
                .ok_or(ParseError::MissingField {
                    mode: auth_mode,
                    field: "access_token",
                })?,
            expires_at: parse_expiry(raw)?,
            raw: raw.clone(),
        }),
        AuthMode::AppStore => Ok(AuthCredentials::AppStore {
            access_token: required_string(raw, auth_mode, "access_token")?,
            private_key: required_string(raw, auth_mode, "private_key")?,
            expires_at: parse_expiry(raw)?,
            raw: raw.clone(),
        }),
        AuthMode::ApiKey => Ok(AuthCredentials::ApiKey {
            api_key: required_string(raw, auth_mode, "api_key")?,
            raw: raw.clone(),
        }),
        AuthMode::Basic => Ok(AuthCredentials::Basic {
            username: required_string(raw, auth_mode, "username")?,
            password: optional_string(raw, "password").unwrap_or_default(),
            raw: raw.clone(),
        }),
        AuthMode::None => Ok(AuthCredentials::None { raw: raw.clone() }),
    }
}

fn required_string(
    raw: &JsonValue,
    mode: AuthMode,
    field: &'static str,
) -> Result<String, ParseError> {
    optional_string(raw, field).ok_or(ParseError::MissingField { mode, field })
}

fn optional_string(raw: &JsonValue, field: &str) -> Option<String> {
    raw.get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Derive the expiry instant: an explicit `expires_at` wins over a relative
/// `expires_in` (which providers send as a number or a numeric string).
fn parse_expiry(raw: &JsonValue) -> Result<Option<DateTime<Utc>>, ParseError> {
    if let Some(value) = raw.get("expires_at") {
        let parsed = match value {
            JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| ParseError::InvalidField { field: "expires_at" })?,
            JsonValue::Number(n) => {
                let secs = n.as_i64().ok_or(ParseError::InvalidField { field: "expires_at" })?;
                DateTime::from_timestamp(secs, 0)
                    .ok_or(ParseError::InvalidField { field: "expires_at" })?
            }
            _ => return Err(ParseError::InvalidField { field: "expires_at" }),
        };
        return Ok(Some(parsed));
    }

    if let Some(value) = raw.get("expires_in") {
        let secs = match value {
            JsonValue::Number(n) => n
                .as_i64()
                .ok_or(ParseError::InvalidField { field: "expires_in" })?,
            JsonValue::String(s) => s
                .parse::<i64>()
                .map_err(|_| ParseError::InvalidField { field: "expires_in" })?,
            _ => return Err(ParseError::InvalidField { field: "expires_in" }),
        };
        return Ok(Some(Utc::now() + Duration::seconds(secs)));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn oauth2_with_expires_in() {
        let raw = json!({
            "access_token": "at-1",
            "refresh_token": "rt-1",
            "expires_in": 3600
        });
        let before = Utc::now() + Duration::seconds(3600);
        let creds = parse(&raw, AuthMode::OAuth2).unwrap();
        let after = Utc::now() + Duration::seconds(3600);

        match creds {
            AuthCredentials::OAuth2 {
                access_token,
                refresh_token,
                expires_at,
                raw: kept,
            } => {
                assert_eq!(access_token, "at-1");
                assert_eq!(refresh_token.as_deref(), Some("rt-1"));
                let expires_at = expires_at.unwrap();
                assert!(expires_at >= before && expires_at <= after);
                assert_eq!(kept, raw);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn explicit_expires_at_wins_over_expires_in() {
        let raw = json!({
            "access_token": "at-1",
            "expires_at": "2030-01-01T00:00:00Z",
            "expires_in": 60
        });
        let creds = parse(&raw, AuthMode::OAuth2).unwrap();
        assert_eq!(
            creds.expires_at().unwrap(),
            DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z").unwrap()
        );
    }

    #[test]
    fn expires_in_as_string_is_accepted() {
        let raw = json!({"access_token": "at", "expires_in": "7200"});
        let creds = parse(&raw, AuthMode::OAuth2).unwrap();
        assert!(creds.expires_at().is_some());
    }

    #[test]
    fn oauth2_missing_access_token_fails_atomically() {
        let raw = json!({"refresh_token": "rt-only"});
        let err = parse(&raw, AuthMode::OAuth2).unwrap_err();
        assert!(matches!(
            err,
            ParseError::MissingField { field: "access_token", .. }
        ));
    }

    #[test]
    fn oauth1_requires_both_token_and_secret() {
        let raw = json!({"oauth_token": "t"});
        let err = parse(&raw, AuthMode::OAuth1).unwrap_err();
        assert!(matches!(
            err,
            ParseError::MissingField { field: "oauth_token_secret", .. }
        ));

        let raw = json!({"oauth_token": "t", "oauth_token_secret": "s"});
        let creds = parse(&raw, AuthMode::OAuth1).unwrap();
        assert_eq!(creds.auth_mode(), AuthMode::OAuth1);
    }

    #[test]
    fn client_credentials_accepts_token_or_access_token() {
        let raw = json!({
            "access_token": "cc-token",
            "client_id": "cid",
            "client_secret": "cs",
            "expires_in": 600
        });
        match parse(&raw, AuthMode::OAuth2Cc).unwrap() {
            AuthCredentials::OAuth2Cc { token, .. } => assert_eq!(token, "cc-token"),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn api_key_and_basic() {
        let creds = parse(&json!({"api_key": "k"}), AuthMode::ApiKey).unwrap();
        assert_eq!(creds.auth_mode(), AuthMode::ApiKey);

        let creds = parse(&json!({"username": "u"}), AuthMode::Basic).unwrap();
        match creds {
            AuthCredentials::Basic { username, password, .. } => {
                assert_eq!(username, "u");
                assert_eq!(password, "");
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn unknown_auth_mode_string_is_a_parse_error() {
        let err = "saml".parse::<AuthMode>().unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedAuthMode(_)));
    }

    #[test]
    fn credentials_json_roundtrip() {
        let raw = json!({"access_token": "a", "expires_in": 60});
        let creds = parse(&raw, AuthMode::OAuth2).unwrap();
        let encoded = serde_json::to_value(&creds).unwrap();
        let decoded: AuthCredentials = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, creds);
    }
}
