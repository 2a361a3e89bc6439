//! Identity token validation.
//!
//! Checks run in a fixed order and the first failure wins:
//! structure, expiry, issuer, audience, key lookup, signature. Claims are
//! decoded before the signature is checked so that cheap rejections never
//! touch the key-set cache, but nothing from an unverified token is returned.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use jsonwebtoken::Algorithm;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tether_core::AuthError;
use tether_settings::{AuthSettings, SettingsError};
use tracing::debug;

use crate::claims::Claims;
use crate::keyset::{KeySet, KeySetCache, VerificationKey};

/// What a token must satisfy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Exact expected `iss`.
    pub issuer: String,
    /// Audience that must appear in `aud`.
    pub audience: String,
    /// Domain whose key set verifies the signature.
    pub key_domain: String,
    /// Tolerance for `exp` and `iat`.
    pub clock_skew: Duration,
}

impl ValidationOptions {
    /// Build from the `auth` settings section.
    pub fn from_settings(auth: &AuthSettings) -> Result<Self, SettingsError> {
        let key_domain = auth.key_domain().ok_or_else(|| {
            SettingsError::InvalidValue("cannot derive key domain from auth.issuer".into())
        })?;
        Ok(Self {
            issuer: auth.issuer.clone(),
            audience: auth.audience.clone(),
            key_domain,
            clock_skew: Duration::from_secs(auth.clock_skew_secs),
        })
    }
}

/// Validates compact JWS identity tokens against a [`KeySetCache`].
#[derive(Clone)]
pub struct TokenValidator {
    keys: Arc<KeySetCache>,
}

impl TokenValidator {
    /// Create a validator over a shared key-set cache.
    pub fn new(keys: Arc<KeySetCache>) -> Self {
        Self { keys }
    }

    /// The underlying key-set cache.
    pub fn key_cache(&self) -> &Arc<KeySetCache> {
        &self.keys
    }

    /// Validate `token` against the current wall-clock time.
    pub async fn validate(&self, token: &str, opts: &ValidationOptions) -> Result<Claims, AuthError> {
        self.validate_at(token, opts, Utc::now()).await
    }

    /// Validate `token` as of `now`.
    pub async fn validate_at(
        &self,
        token: &str,
        opts: &ValidationOptions,
        now: DateTime<Utc>,
    ) -> Result<Claims, AuthError> {
        let parsed = ParsedToken::decode(token)?;
        let claims = &parsed.claims;

        let now = now.timestamp();
        let skew = i64::try_from(opts.clock_skew.as_secs()).unwrap_or(i64::MAX);
        if claims.issued_at() > now.saturating_add(skew) {
            return Err(AuthError::Malformed("iat is in the future".into()));
        }
        if claims.expires_at() < now.saturating_sub(skew) {
            return Err(AuthError::Expired);
        }
        if claims.issuer() != opts.issuer {
            return Err(AuthError::BadIssuer);
        }
        if !claims.audience().contains(&opts.audience) {
            return Err(AuthError::BadAudience);
        }

        let kid = parsed.header.kid.as_deref();
        let key_set = self.key_set_containing(&opts.key_domain, kid).await?;
        let key = kid
            .and_then(|kid| key_set.key(kid))
            .ok_or_else(|| AuthError::NoMatchingKey {
                kid: kid.map(str::to_owned),
            })?;
        verify_signature(&parsed, key)?;

        Ok(parsed.claims)
    }

    /// Cached key set holding `kid`, refreshing once if it is unknown.
    async fn key_set_containing(
        &self,
        domain: &str,
        kid: Option<&str>,
    ) -> Result<Arc<KeySet>, AuthError> {
        let Some(kid) = kid else {
            return Err(AuthError::NoMatchingKey { kid: None });
        };
        let keys = self
            .keys
            .get_keys(domain)
            .await
            .map_err(|e| AuthError::KeyFetchFailed(e.to_string()))?;
        if keys.key(kid).is_some() {
            return Ok(keys);
        }

        debug!(domain, kid, "unknown kid, refreshing key set");
        match self.keys.refresh(domain).await {
            Ok(refreshed) if refreshed.key(kid).is_some() => Ok(refreshed),
            _ => Err(AuthError::NoMatchingKey {
                kid: Some(kid.to_owned()),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JoseHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

struct ParsedToken<'a> {
    signing_input: &'a str,
    signature: &'a str,
    header: JoseHeader,
    claims: Claims,
}

impl<'a> ParsedToken<'a> {
    fn decode(token: &'a str) -> Result<Self, AuthError> {
        let mut segments = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(AuthError::Malformed("expected three segments".into()));
        };
        if header.is_empty() || payload.is_empty() || signature.is_empty() {
            return Err(AuthError::Malformed("empty segment".into()));
        }

        let jose: JoseHeader = decode_segment(header, "header")?;
        let claims: Claims = decode_segment(payload, "claims")?;
        if URL_SAFE_NO_PAD.decode(signature).is_err() {
            return Err(AuthError::Malformed("signature is not base64url".into()));
        }

        Ok(Self {
            signing_input: &token[..header.len() + 1 + payload.len()],
            signature,
            header: jose,
            claims,
        })
    }
}

fn decode_segment<T: DeserializeOwned>(segment: &str, what: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::Malformed(format!("{what} is not base64url")))?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|_| AuthError::Malformed(format!("{what} is not JSON")))?;
    if !value.is_object() {
        return Err(AuthError::Malformed(format!("{what} is not a JSON object")));
    }
    serde_json::from_value(value).map_err(|e| AuthError::Malformed(format!("{what}: {e}")))
}

/// Verify with the key's declared algorithm, falling back to the header's.
fn verify_signature(token: &ParsedToken<'_>, key: &VerificationKey) -> Result<(), AuthError> {
    let header_alg = Algorithm::from_str(&token.header.alg).ok();
    let algorithm = match (key.algorithm(), header_alg) {
        (Some(declared), Some(requested)) if declared == requested => declared,
        (None, Some(requested)) => requested,
        _ => return Err(AuthError::BadSignature),
    };
    // crypto::verify assumes the key matches the algorithm family.
    if !key.family().supports(algorithm) {
        return Err(AuthError::BadSignature);
    }
    match jsonwebtoken::crypto::verify(
        token.signature,
        token.signing_input.as_bytes(),
        key.decoding_key(),
        algorithm,
    ) {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => Err(AuthError::BadSignature),
    }
}
