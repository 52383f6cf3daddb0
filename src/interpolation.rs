//! `{{placeholder}}` interpolation for provider URL templates
//!
//! Templates are validated before any network call: an unresolved placeholder
//! is an error naming the missing parameter, never a request with a literal
//! `{{...}}` left in it.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("valid regex"));

#[derive(Debug, Error)]
pub enum InterpolationError {
    #[error("missing interpolation parameter '{0}'")]
    MissingParam(String),
}

/// List the placeholder names a template references, in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Check that every placeholder in `template` has a value, without rendering.
pub fn validate(template: &str, params: &BTreeMap<String, String>) -> Result<(), InterpolationError> {
    for name in placeholders(template) {
        if !params.contains_key(&name) {
            return Err(InterpolationError::MissingParam(name));
        }
    }
    Ok(())
}

/// Render `template`, substituting every `{{name}}` from `params`.
pub fn interpolate(
    template: &str,
    params: &BTreeMap<String, String>,
) -> Result<String, InterpolationError> {
    validate(template, params)?;
    let rendered = PLACEHOLDER_RE.replace_all(template, |caps: &regex::Captures<'_>| {
        params
            .get(&caps[1])
            .cloned()
            .unwrap_or_default()
    });
    Ok(rendered.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_placeholders() {
        let out = interpolate(
            "https://{{subdomain}}.example.com/oauth/{{tenant}}/authorize",
            &params(&[("subdomain", "acme"), ("tenant", "t1")]),
        )
        .unwrap();
        assert_eq!(out, "https://acme.example.com/oauth/t1/authorize");
    }

    #[test]
    fn missing_param_is_named() {
        let err = interpolate(
            "https://{{subdomain}}.example.com",
            &params(&[]),
        )
        .unwrap_err();
        assert!(matches!(err, InterpolationError::MissingParam(ref n) if n == "subdomain"));
    }

    #[test]
    fn validate_does_not_render() {
        let p = params(&[("region", "eu")]);
        assert!(validate("https://{{region}}.api.example.com", &p).is_ok());
        assert!(validate("https://{{region}}.api.example.com/{{shard}}", &p).is_err());
    }

    #[test]
    fn template_without_placeholders_passes_through() {
        let out = interpolate("https://api.example.com/authorize", &params(&[])).unwrap();
        assert_eq!(out, "https://api.example.com/authorize");
    }

    #[test]
    fn whitespace_inside_braces_is_tolerated() {
        let out = interpolate("{{ host }}/x", &params(&[("host", "h")])).unwrap();
        assert_eq!(out, "h/x");
    }
}
