//! Token validation and key-set cache settings.

use serde::{Deserialize, Serialize};
use tether_core::retry::BackoffConfig;

/// Default key-set location; `{domain}` is replaced by the issuer domain.
pub const DEFAULT_KEY_SET_URL_TEMPLATE: &str = "https://{domain}/.well-known/jwks.json";

/// Identity token validation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Expected `iss` claim, compared exactly.
    pub issuer: String,
    /// Expected audience; must appear in the token's `aud`.
    pub audience: String,
    /// Domain whose key set verifies signatures. Derived from `issuer` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer_domain: Option<String>,
    /// Tolerance applied to `exp` and `iat`, in seconds.
    pub clock_skew_secs: u64,
    /// Require the token subject to equal the account id in the connect path.
    pub bind_subject: bool,
    /// Key-set cache behaviour.
    pub key_set: KeySetSettings,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            audience: String::new(),
            issuer_domain: None,
            clock_skew_secs: 60,
            bind_subject: true,
            key_set: KeySetSettings::default(),
        }
    }
}

impl AuthSettings {
    /// The domain keys are fetched for.
    ///
    /// `issuer_domain` wins; otherwise the host part of `issuer`
    /// (`https://id.example.com/tenant` → `id.example.com`).
    pub fn key_domain(&self) -> Option<String> {
        if let Some(domain) = self.issuer_domain.as_deref().filter(|d| !d.is_empty()) {
            return Some(domain.to_owned());
        }
        let rest = self
            .issuer
            .split_once("://")
            .map_or(self.issuer.as_str(), |(_, rest)| rest);
        let host = rest.split('/').next().unwrap_or_default();
        (!host.is_empty()).then(|| host.to_owned())
    }
}

/// Key-set (JWKS) cache settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeySetSettings {
    /// URL template; `{domain}` is substituted.
    pub url_template: String,
    /// Fresh lifetime of a cached key set, in seconds.
    pub ttl_secs: u64,
    /// Absolute ceiling for serving a stale key set after fetch failures.
    pub max_stale_secs: u64,
    /// Per-fetch timeout in milliseconds.
    pub fetch_timeout_ms: u64,
    /// Retry spacing after failed fetches.
    pub backoff: BackoffConfig,
}

impl Default for KeySetSettings {
    fn default() -> Self {
        Self {
            url_template: DEFAULT_KEY_SET_URL_TEMPLATE.to_string(),
            ttl_secs: 3600,
            max_stale_secs: 86_400,
            fetch_timeout_ms: 5000,
            backoff: BackoffConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_domain_from_issuer_url() {
        let s = AuthSettings {
            issuer: "https://id.example.com/tenant/1".into(),
            ..AuthSettings::default()
        };
        assert_eq!(s.key_domain().as_deref(), Some("id.example.com"));
    }

    #[test]
    fn key_domain_bare_issuer() {
        let s = AuthSettings {
            issuer: "id.example.com".into(),
            ..AuthSettings::default()
        };
        assert_eq!(s.key_domain().as_deref(), Some("id.example.com"));
    }

    #[test]
    fn explicit_domain_wins() {
        let s = AuthSettings {
            issuer: "https://id.example.com/".into(),
            issuer_domain: Some("127.0.0.1:9999".into()),
            ..AuthSettings::default()
        };
        assert_eq!(s.key_domain().as_deref(), Some("127.0.0.1:9999"));
    }

    #[test]
    fn empty_issuer_has_no_domain() {
        assert!(AuthSettings::default().key_domain().is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let s: AuthSettings =
            serde_json::from_str(r#"{"issuer":"x","keySet":{"ttlSecs":60}}"#).unwrap();
        assert_eq!(s.key_set.ttl_secs, 60);
        assert_eq!(s.key_set.fetch_timeout_ms, 5000);
        assert!(s.bind_subject);
    }
}
