//! Issuer key sets and the process-wide key-set cache.
//!
//! [`KeySetCache`] serves an issuer's verification keys from memory while they
//! are younger than the TTL. A miss starts one spawned fetch per domain; every
//! caller arriving while it runs awaits the same shared future, and the fetch
//! completes (and is cached) even if all of them go away. After a failure the
//! domain backs off exponentially, and a stale set is served until it passes
//! the staleness ceiling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, KeyAlgorithm, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey};
use parking_lot::Mutex;
use serde_json::Value;
use tether_core::metrics::{KEY_FETCHES_TOTAL, KEY_FETCH_DURATION_SECONDS};
use tether_core::retry::BackoffConfig;
use tether_settings::KeySetSettings;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::FetchError;

/// Public-key family of a verification key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyFamily {
    /// `kty: RSA`
    Rsa,
    /// `kty: EC`
    EllipticCurve,
    /// `kty: OKP` (Ed25519)
    OctetKeyPair,
}

impl KeyFamily {
    /// Whether a key of this family can verify `algorithm`. HMAC never can.
    pub fn supports(self, algorithm: Algorithm) -> bool {
        match algorithm {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => self == Self::Rsa,
            Algorithm::ES256 | Algorithm::ES384 => self == Self::EllipticCurve,
            Algorithm::EdDSA => self == Self::OctetKeyPair,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => false,
        }
    }
}

/// One public verification key from an issuer's key set.
#[derive(Clone)]
pub struct VerificationKey {
    kid: String,
    family: KeyFamily,
    algorithm: Option<Algorithm>,
    decoding: DecodingKey,
}

impl VerificationKey {
    /// Build from a parsed JWK. `None` for keys that cannot verify signatures.
    fn from_jwk(jwk: &Jwk) -> Option<Self> {
        let kid = jwk.common.key_id.clone().filter(|k| !k.is_empty())?;
        if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
            return None;
        }
        let family = match &jwk.algorithm {
            AlgorithmParameters::RSA(_) => KeyFamily::Rsa,
            AlgorithmParameters::EllipticCurve(_) => KeyFamily::EllipticCurve,
            AlgorithmParameters::OctetKeyPair(_) => KeyFamily::OctetKeyPair,
            // Shared secrets have no place in a public key set.
            AlgorithmParameters::OctetKey(_) => return None,
        };
        let algorithm = match &jwk.common.key_algorithm {
            None => None,
            Some(declared) => Some(signing_algorithm(declared)?),
        };
        let decoding = DecodingKey::from_jwk(jwk).ok()?;
        Some(Self {
            kid,
            family,
            algorithm,
            decoding,
        })
    }

    /// Key id (`kid`).
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Key family (`kty`).
    pub fn family(&self) -> KeyFamily {
        self.family
    }

    /// Algorithm the key declares, if any.
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.algorithm
    }

    /// Decoded public material.
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding
    }
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .field("family", &self.family)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

fn signing_algorithm(declared: &KeyAlgorithm) -> Option<Algorithm> {
    match declared {
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        // Encryption algorithms (RSA1_5, RSA-OAEP, ...)
        _ => None,
    }
}

/// An issuer's verification keys as of one fetch.
#[derive(Clone, Debug)]
pub struct KeySet {
    issuer_domain: String,
    keys: Vec<VerificationKey>,
    fetched_at: DateTime<Utc>,
}

impl KeySet {
    /// Parse a JWK set document (`{"keys": [...]}`).
    ///
    /// Keys that cannot verify signatures (encryption keys, shared secrets,
    /// unknown key types, keys without `kid`) are skipped.
    pub fn from_jwks(issuer_domain: &str, document: &Value) -> Result<Self, FetchError> {
        let entries = document
            .get("keys")
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::InvalidKeySet("missing `keys` array".into()))?;

        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries {
            let parsed = serde_json::from_value::<Jwk>(entry.clone())
                .ok()
                .and_then(|jwk| VerificationKey::from_jwk(&jwk));
            match parsed {
                Some(key) => keys.push(key),
                None => debug!(issuer_domain, "skipping unusable key set entry"),
            }
        }
        if keys.is_empty() {
            warn!(issuer_domain, "key set contains no usable signing keys");
        }

        Ok(Self {
            issuer_domain: issuer_domain.to_owned(),
            keys,
            fetched_at: Utc::now(),
        })
    }

    /// Domain the set was fetched for.
    pub fn issuer_domain(&self) -> &str {
        &self.issuer_domain
    }

    /// Look up a key by `kid`.
    pub fn key(&self, kid: &str) -> Option<&VerificationKey> {
        self.keys.iter().find(|k| k.kid == kid)
    }

    /// Key ids in document order.
    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(|k| k.kid.as_str())
    }

    /// Number of usable keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the set has no usable keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Wall-clock time of the fetch.
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }
}

/// Network step of the cache.
#[async_trait]
pub trait KeySetFetcher: Send + Sync + 'static {
    /// Fetch and parse the key set for `domain`.
    async fn fetch(&self, domain: &str) -> Result<KeySet, FetchError>;
}

/// Fetches `{url_template with {domain} substituted}` over HTTPS.
pub struct HttpKeySetFetcher {
    client: reqwest::Client,
    url_template: String,
}

impl HttpKeySetFetcher {
    /// Create a fetcher with its own client and request timeout.
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tether-gateway/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url_template: url_template.into(),
        })
    }

    /// Resolved key-set URL for `domain`.
    pub fn url_for(&self, domain: &str) -> String {
        self.url_template.replace("{domain}", domain)
    }
}

#[async_trait]
impl KeySetFetcher for HttpKeySetFetcher {
    async fn fetch(&self, domain: &str) -> Result<KeySet, FetchError> {
        let url = self.url_for(domain);
        debug!(%url, "fetching key set");
        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
            });
        }
        let document: Value = response
            .json()
            .await
            .map_err(|e| FetchError::InvalidKeySet(e.to_string()))?;
        KeySet::from_jwks(domain, &document)
    }
}

/// Cache timing parameters.
#[derive(Clone, Debug)]
pub struct KeySetCacheConfig {
    /// Fresh lifetime of a cached set.
    pub ttl: Duration,
    /// Oldest set served when refetching fails.
    pub max_stale: Duration,
    /// Deadline for one fetch.
    pub fetch_timeout: Duration,
    /// Minimum age before an unknown `kid` forces a refetch.
    pub min_refresh_interval: Duration,
    /// Spacing of attempts after failures.
    pub backoff: BackoffConfig,
}

impl Default for KeySetCacheConfig {
    fn default() -> Self {
        Self::from(&KeySetSettings::default())
    }
}

impl From<&KeySetSettings> for KeySetCacheConfig {
    fn from(settings: &KeySetSettings) -> Self {
        Self {
            ttl: Duration::from_secs(settings.ttl_secs),
            max_stale: Duration::from_secs(settings.max_stale_secs),
            fetch_timeout: Duration::from_millis(settings.fetch_timeout_ms),
            min_refresh_interval: Duration::from_secs(60),
            backoff: settings.backoff.clone(),
        }
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<KeySet>, FetchError>>>;

struct CachedKeys {
    keys: Arc<KeySet>,
    fetched_at: Instant,
}

#[derive(Default)]
struct Slot {
    cached: Option<CachedKeys>,
    inflight: Option<SharedFetch>,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Slot {
    fn younger_than(&self, now: Instant, age: Duration) -> Option<Arc<KeySet>> {
        self.cached
            .as_ref()
            .filter(|c| now.duration_since(c.fetched_at) < age)
            .map(|c| Arc::clone(&c.keys))
    }
}

/// Process-wide issuer key-set cache. Construct once and share by `Arc`.
pub struct KeySetCache {
    fetcher: Arc<dyn KeySetFetcher>,
    config: KeySetCacheConfig,
    slots: Mutex<HashMap<String, Slot>>,
}

impl KeySetCache {
    /// Create a cache over `fetcher`.
    pub fn new(fetcher: Arc<dyn KeySetFetcher>, config: KeySetCacheConfig) -> Arc<Self> {
        Arc::new(Self {
            fetcher,
            config,
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Keys for `domain`, from cache when fresh.
    pub async fn get_keys(self: &Arc<Self>, domain: &str) -> Result<Arc<KeySet>, FetchError> {
        let pending = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(domain.to_owned()).or_default();
            let now = Instant::now();
            if let Some(fresh) = slot.younger_than(now, self.config.ttl) {
                return Ok(fresh);
            }
            match self.begin_fetch(slot, domain, now) {
                Ok(pending) => pending,
                Err(err) => return slot.younger_than(now, self.config.max_stale).ok_or(err),
            }
        };
        pending.await
    }

    /// Refetch `domain` unless the cached set is younger than the minimum
    /// refresh interval. Used when a token names a `kid` the set lacks.
    pub async fn refresh(self: &Arc<Self>, domain: &str) -> Result<Arc<KeySet>, FetchError> {
        let pending = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(domain.to_owned()).or_default();
            let now = Instant::now();
            if let Some(recent) = slot.younger_than(now, self.config.min_refresh_interval) {
                return Ok(recent);
            }
            match self.begin_fetch(slot, domain, now) {
                Ok(pending) => pending,
                Err(err) => return slot.younger_than(now, self.config.max_stale).ok_or(err),
            }
        };
        pending.await
    }

    /// Drop everything cached for `domain`.
    pub fn invalidate(&self, domain: &str) {
        if self.slots.lock().remove(domain).is_some() {
            info!(domain, "key set invalidated");
        }
    }

    /// Number of domains with a cached key set.
    pub fn cached_domains(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| s.cached.is_some())
            .count()
    }

    /// Join the in-flight fetch or start one, honouring backoff.
    fn begin_fetch(
        self: &Arc<Self>,
        slot: &mut Slot,
        domain: &str,
        now: Instant,
    ) -> Result<SharedFetch, FetchError> {
        if let Some(inflight) = &slot.inflight {
            return Ok(inflight.clone());
        }
        if let Some(retry_at) = slot.retry_at.filter(|at| now < *at) {
            return Err(FetchError::BackingOff {
                retry_in_ms: millis(retry_at.saturating_duration_since(now)),
            });
        }
        let pending = self.spawn_fetch(domain.to_owned());
        slot.inflight = Some(pending.clone());
        Ok(pending)
    }

    fn spawn_fetch(self: &Arc<Self>, domain: String) -> SharedFetch {
        let cache = Arc::clone(self);
        let task = tokio::spawn(async move {
            let started = Instant::now();
            let timeout = cache.config.fetch_timeout;
            let result = tokio::time::timeout(timeout, cache.fetcher.fetch(&domain))
                .await
                .unwrap_or(Err(FetchError::Timeout {
                    timeout_ms: millis(timeout),
                }));
            metrics::histogram!(KEY_FETCH_DURATION_SECONDS)
                .record(started.elapsed().as_secs_f64());
            cache.complete(&domain, result)
        });
        async move {
            task.await.unwrap_or_else(|e| {
                Err(FetchError::Transport(format!("key fetch task failed: {e}")))
            })
        }
        .boxed()
        .shared()
    }

    /// Record a fetch result and resolve what waiters receive.
    fn complete(
        &self,
        domain: &str,
        result: Result<KeySet, FetchError>,
    ) -> Result<Arc<KeySet>, FetchError> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(domain.to_owned()).or_default();
        slot.inflight = None;
        let now = Instant::now();

        match result {
            Ok(keys) => {
                metrics::counter!(KEY_FETCHES_TOTAL, "outcome" => "ok").increment(1);
                info!(domain, keys = keys.len(), "key set refreshed");
                let keys = Arc::new(keys);
                slot.cached = Some(CachedKeys {
                    keys: Arc::clone(&keys),
                    fetched_at: now,
                });
                slot.failures = 0;
                slot.retry_at = None;
                Ok(keys)
            }
            Err(err) => {
                metrics::counter!(KEY_FETCHES_TOTAL, "outcome" => err.kind()).increment(1);
                slot.failures = slot.failures.saturating_add(1);
                let delay = self.config.backoff.delay(slot.failures, rand::random::<f64>());
                slot.retry_at = Some(now + delay);
                match slot.younger_than(now, self.config.max_stale) {
                    Some(stale) => {
                        warn!(
                            domain,
                            error = %err,
                            failures = slot.failures,
                            retry_in_ms = millis(delay),
                            "key fetch failed, serving stale key set"
                        );
                        Ok(stale)
                    }
                    None => {
                        warn!(
                            domain,
                            error = %err,
                            failures = slot.failures,
                            retry_in_ms = millis(delay),
                            "key fetch failed"
                        );
                        Err(err)
                    }
                }
            }
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, MockFetcher, TestKey};
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DOMAIN: &str = "id.tether.test";

    fn config() -> KeySetCacheConfig {
        KeySetCacheConfig {
            backoff: BackoffConfig {
                jitter_factor: 0.0,
                ..BackoffConfig::default()
            },
            ..KeySetCacheConfig::default()
        }
    }

    fn cache_over(fetcher: &Arc<MockFetcher>) -> Arc<KeySetCache> {
        KeySetCache::new(Arc::clone(fetcher) as Arc<dyn KeySetFetcher>, config())
    }

    // ── KeySet parsing ──────────────────────────────────────────────

    #[test]
    fn parses_signing_keys_and_skips_the_rest() {
        let doc = json!({"keys": [
            testing::jwk(TestKey::Primary, true),
            {"kty": "oct", "kid": "shared", "k": "c2VjcmV0"},
            {"kty": "RSA", "kid": "enc", "use": "enc", "n": "AQAB", "e": "AQAB"},
            {"kty": "RSA", "n": "AQAB", "e": "AQAB"},
            {"kty": "weird", "kid": "w"},
            testing::jwk(TestKey::Secondary, false),
        ]});
        let set = KeySet::from_jwks(DOMAIN, &doc).unwrap();
        assert_eq!(
            set.key_ids().collect::<Vec<_>>(),
            vec![testing::KID_PRIMARY, testing::KID_SECONDARY]
        );
        let primary = set.key(testing::KID_PRIMARY).unwrap();
        assert_eq!(primary.family(), KeyFamily::Rsa);
        assert_eq!(primary.algorithm(), Some(Algorithm::RS256));
        assert_eq!(set.key(testing::KID_SECONDARY).unwrap().algorithm(), None);
        assert_eq!(set.issuer_domain(), DOMAIN);
    }

    #[test]
    fn missing_keys_array_is_invalid() {
        assert_matches!(
            KeySet::from_jwks(DOMAIN, &json!({"data": []})),
            Err(FetchError::InvalidKeySet(_))
        );
    }

    #[test]
    fn family_supports() {
        assert!(KeyFamily::Rsa.supports(Algorithm::RS256));
        assert!(KeyFamily::Rsa.supports(Algorithm::PS512));
        assert!(!KeyFamily::Rsa.supports(Algorithm::ES256));
        assert!(!KeyFamily::Rsa.supports(Algorithm::HS256));
        assert!(KeyFamily::EllipticCurve.supports(Algorithm::ES384));
        assert!(!KeyFamily::OctetKeyPair.supports(Algorithm::RS256));
    }

    #[test]
    fn debug_omits_key_material() {
        let set = KeySet::from_jwks(DOMAIN, &testing::jwks()).unwrap();
        let rendered = format!("{:?}", set.key(testing::KID_PRIMARY).unwrap());
        assert!(rendered.contains(testing::KID_PRIMARY));
        assert!(!rendered.contains("decoding"));
    }

    // ── HTTP fetcher ────────────────────────────────────────────────

    #[tokio::test]
    async fn http_fetcher_hits_well_known_path_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/jwks.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(testing::jwks()))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher =
            HttpKeySetFetcher::new("http://{domain}/.well-known/jwks.json", Duration::from_secs(5))
                .unwrap();
        let cache = KeySetCache::new(Arc::new(fetcher), config());
        let domain = server.address().to_string();

        let first = cache.get_keys(&domain).await.unwrap();
        let second = cache.get_keys(&domain).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 2);
        assert_eq!(cache.cached_domains(), 1);
    }

    #[tokio::test]
    async fn http_fetcher_maps_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/jwks.json"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let fetcher =
            HttpKeySetFetcher::new("http://{domain}/.well-known/jwks.json", Duration::from_secs(5))
                .unwrap();
        let err = fetcher.fetch(&server.address().to_string()).await.unwrap_err();
        assert_eq!(err, FetchError::Http { status: 503 });
    }

    #[tokio::test]
    async fn http_fetcher_rejects_non_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let fetcher =
            HttpKeySetFetcher::new("http://{domain}/.well-known/jwks.json", Duration::from_secs(5))
                .unwrap();
        assert_matches!(
            fetcher.fetch(&server.address().to_string()).await,
            Err(FetchError::InvalidKeySet(_))
        );
    }

    #[test]
    fn url_template_substitution() {
        let fetcher = HttpKeySetFetcher::new(
            "https://{domain}/.well-known/jwks.json",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            fetcher.url_for("id.example.com"),
            "https://id.example.com/.well-known/jwks.json"
        );
    }

    // ── Cache behaviour ─────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_fetch() {
        let fetcher = Arc::new(MockFetcher::new(testing::jwks()).with_delay(Duration::from_millis(50)));
        let cache = cache_over(&fetcher);

        let results =
            futures::future::join_all((0..20).map(|_| cache.get_keys(DOMAIN))).await;

        assert_eq!(fetcher.calls(), 1);
        let first = results[0].as_ref().unwrap();
        for r in &results {
            assert!(Arc::ptr_eq(first, r.as_ref().unwrap()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn serves_from_cache_until_ttl() {
        let fetcher = Arc::new(MockFetcher::new(testing::jwks()));
        let cache = cache_over(&fetcher);

        let _ = cache.get_keys(DOMAIN).await.unwrap();
        tokio::time::advance(Duration::from_secs(3599)).await;
        let _ = cache.get_keys(DOMAIN).await.unwrap();
        assert_eq!(fetcher.calls(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let _ = cache.get_keys(DOMAIN).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_served_on_failure_then_backoff_skips_network() {
        let fetcher = Arc::new(MockFetcher::new(testing::jwks()));
        let cache = cache_over(&fetcher);
        let original = cache.get_keys(DOMAIN).await.unwrap();

        fetcher.set_failing(true);
        tokio::time::advance(Duration::from_secs(3601)).await;

        let stale = cache.get_keys(DOMAIN).await.unwrap();
        assert!(Arc::ptr_eq(&original, &stale));
        assert_eq!(fetcher.calls(), 2);

        // Inside the 1s backoff window: no network attempt.
        let again = cache.get_keys(DOMAIN).await.unwrap();
        assert!(Arc::ptr_eq(&original, &again));
        assert_eq!(fetcher.calls(), 2);

        // Window elapsed: next attempt goes out; backoff doubles to 2s.
        tokio::time::advance(Duration::from_millis(1001)).await;
        let _ = cache.get_keys(DOMAIN).await.unwrap();
        assert_eq!(fetcher.calls(), 3);
        tokio::time::advance(Duration::from_millis(1500)).await;
        let _ = cache.get_keys(DOMAIN).await.unwrap();
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_beyond_ceiling_fails() {
        let fetcher = Arc::new(MockFetcher::new(testing::jwks()));
        let cache = cache_over(&fetcher);
        let _ = cache.get_keys(DOMAIN).await.unwrap();

        fetcher.set_failing(true);
        tokio::time::advance(Duration::from_secs(24 * 3600 + 1)).await;
        assert_matches!(cache.get_keys(DOMAIN).await, Err(FetchError::Http { status: 503 }));
    }

    #[tokio::test(start_paused = true)]
    async fn cold_failure_backs_off_and_recovers() {
        let fetcher = Arc::new(MockFetcher::new(testing::jwks()));
        fetcher.set_failing(true);
        let cache = cache_over(&fetcher);

        assert_matches!(cache.get_keys(DOMAIN).await, Err(FetchError::Http { .. }));
        assert_matches!(cache.get_keys(DOMAIN).await, Err(FetchError::BackingOff { .. }));
        assert_eq!(fetcher.calls(), 1);

        fetcher.set_failing(false);
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(cache.get_keys(DOMAIN).await.is_ok());
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_times_out() {
        let fetcher =
            Arc::new(MockFetcher::new(testing::jwks()).with_delay(Duration::from_secs(30)));
        let cache = cache_over(&fetcher);
        assert_matches!(
            cache.get_keys(DOMAIN).await,
            Err(FetchError::Timeout { timeout_ms: 5000 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_requester_does_not_cancel_fetch() {
        let fetcher =
            Arc::new(MockFetcher::new(testing::jwks()).with_delay(Duration::from_millis(100)));
        let cache = cache_over(&fetcher);

        let requester = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_keys(DOMAIN).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        requester.abort();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(cache.cached_domains(), 1);
        let _ = cache.get_keys(DOMAIN).await.unwrap();
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_respects_minimum_interval() {
        let fetcher = Arc::new(MockFetcher::new(testing::jwks()));
        let cache = cache_over(&fetcher);
        let _ = cache.get_keys(DOMAIN).await.unwrap();

        let _ = cache.refresh(DOMAIN).await.unwrap();
        assert_eq!(fetcher.calls(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        let _ = cache.refresh(DOMAIN).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_forces_refetch() {
        let fetcher = Arc::new(MockFetcher::new(testing::jwks()));
        let cache = cache_over(&fetcher);
        let _ = cache.get_keys(DOMAIN).await.unwrap();
        cache.invalidate(DOMAIN);
        assert_eq!(cache.cached_domains(), 0);
        let _ = cache.get_keys(DOMAIN).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn domains_are_independent() {
        let fetcher = Arc::new(MockFetcher::new(testing::jwks()));
        let cache = cache_over(&fetcher);
        let a = cache.get_keys("a.example").await.unwrap();
        let b = cache.get_keys("b.example").await.unwrap();
        assert_eq!(a.issuer_domain(), "a.example");
        assert_eq!(b.issuer_domain(), "b.example");
        assert_eq!(fetcher.calls(), 2);
    }
}
