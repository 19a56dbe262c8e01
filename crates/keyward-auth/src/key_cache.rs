//! Public signing key cache with failure-driven rotation.
//!
//! The cache is a single slot holding an immutable [`PublicSigningKeySet`].
//! Readers take a cheap `Arc` snapshot; a refresh swaps in a new snapshot
//! wholesale. Refreshes are only triggered by verification failures
//! (unknown `kid`, bad signature), throttled to one per
//! [`KeyRefreshPolicy::min_refresh_interval`], and retried in the
//! background with capped exponential backoff.

use crate::error::KeyCacheError;
use crate::jwks::{JwkSet, PublicSigningKeySet};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Default minimum interval between two key refreshes (1 hour).
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Where signing keys come from.
#[async_trait]
pub trait SigningKeySource: Send + Sync {
    /// Fetch a fresh snapshot of the provider's signing keys.
    async fn fetch(&self) -> Result<PublicSigningKeySet, KeyCacheError>;
}

/// Subset of the OIDC discovery document needed to locate the JWKS.
#[derive(Debug, Clone, Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

/// Fetches keys over HTTP: discovery document first, then `jwks_uri`.
///
/// The `jwks_uri` is resolved once and reused for later refreshes.
pub struct HttpJwksSource {
    issuer_uri: String,
    http_client: reqwest::Client,
    jwks_uri: OnceCell<String>,
}

impl HttpJwksSource {
    #[must_use]
    pub fn new(issuer_uri: impl Into<String>, http_client: reqwest::Client) -> Self {
        Self {
            issuer_uri: issuer_uri.into(),
            http_client,
            jwks_uri: OnceCell::new(),
        }
    }

    /// Get well-known configuration URL for an issuer.
    #[must_use]
    pub fn well_known_url(issuer_uri: &str) -> String {
        let issuer_uri = issuer_uri.trim_end_matches('/');
        format!("{issuer_uri}/.well-known/openid-configuration")
    }

    #[instrument(skip(self), fields(issuer = %self.issuer_uri))]
    async fn discover_jwks_uri(&self) -> Result<String, KeyCacheError> {
        let url = Self::well_known_url(&self.issuer_uri);
        let failed = |message: String| KeyCacheError::DiscoveryFailed {
            issuer: self.issuer_uri.clone(),
            message,
        };

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| failed(format!("HTTP error: {e}")))?;

        if !response.status().is_success() {
            return Err(failed(format!("HTTP status {}", response.status())));
        }

        let document: DiscoveryDocument = response
            .json()
            .await
            .map_err(|e| failed(format!("JSON parse error: {e}")))?;

        debug!(jwks_uri = %document.jwks_uri, "discovered JWKS endpoint");
        Ok(document.jwks_uri)
    }

    async fn fetch_jwks(&self, jwks_uri: &str) -> Result<JwkSet, KeyCacheError> {
        let failed = |message: String| KeyCacheError::JwksFetchFailed {
            uri: jwks_uri.to_string(),
            message,
        };

        let response = self
            .http_client
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| failed(format!("HTTP error: {e}")))?;

        if !response.status().is_success() {
            return Err(failed(format!("HTTP status {}", response.status())));
        }

        response
            .json()
            .await
            .map_err(|e| failed(format!("JSON parse error: {e}")))
    }
}

#[async_trait]
impl SigningKeySource for HttpJwksSource {
    async fn fetch(&self) -> Result<PublicSigningKeySet, KeyCacheError> {
        let jwks_uri = self
            .jwks_uri
            .get_or_try_init(|| self.discover_jwks_uri())
            .await?;

        let jwks = self.fetch_jwks(jwks_uri).await?;
        let set = PublicSigningKeySet::from_jwks(jwks, jwks_uri, Utc::now())?;

        info!(jwks_uri = %jwks_uri, key_count = set.len(), "JWKS fetched");
        Ok(set)
    }
}

/// Throttle and retry schedule for failure-driven refreshes.
#[derive(Debug, Clone)]
pub struct KeyRefreshPolicy {
    /// At most one refresh starts per interval.
    pub min_refresh_interval: Duration,
    /// Delay before the second attempt; doubles after each failure.
    pub initial_backoff: Duration,
    /// Upper bound on the delay between two attempts.
    pub max_backoff: Duration,
    /// Attempts per refresh before giving up until the next trigger.
    pub max_attempts: u32,
}

impl Default for KeyRefreshPolicy {
    fn default() -> Self {
        Self {
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl KeyRefreshPolicy {
    /// Set the throttle window.
    #[must_use]
    pub fn min_refresh_interval(mut self, interval: Duration) -> Self {
        self.min_refresh_interval = interval;
        self
    }

    /// Set the retry limits.
    #[must_use]
    pub fn retries(mut self, max_attempts: u32, initial: Duration, max: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Delay to wait after the given (1-based) failed attempt.
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Cache statistics for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyCacheStats {
    /// Refresh requests received (one per rejected signature).
    pub refresh_requests: u64,
    /// Requests that actually started a refresh (not throttled).
    pub refreshes_started: u64,
    /// Individual fetch attempts, including retries.
    pub fetch_attempts: u64,
    pub fetch_failures: u64,
}

#[derive(Default)]
struct Counters {
    refresh_requests: AtomicU64,
    refreshes_started: AtomicU64,
    fetch_attempts: AtomicU64,
    fetch_failures: AtomicU64,
}

struct Inner {
    slot: watch::Sender<Arc<PublicSigningKeySet>>,
    source: Arc<dyn SigningKeySource>,
    policy: KeyRefreshPolicy,
    last_refresh: Mutex<Option<Instant>>,
    counters: Counters,
}

/// Signing key cache shared by every clone of a verifier.
#[derive(Clone)]
pub struct SigningKeyCache {
    inner: Arc<Inner>,
}

impl SigningKeyCache {
    /// Fetch the initial key set.
    ///
    /// # Errors
    ///
    /// Bootstrap is not retried: any failure is returned to the caller.
    #[instrument(skip_all)]
    pub async fn bootstrap(
        source: Arc<dyn SigningKeySource>,
        policy: KeyRefreshPolicy,
    ) -> Result<Self, KeyCacheError> {
        let initial = source.fetch().await?;
        info!(key_count = initial.len(), "signing key cache bootstrapped");

        let (slot, _) = watch::channel(Arc::new(initial));
        let counters = Counters::default();
        counters.fetch_attempts.store(1, Ordering::Relaxed);

        Ok(Self {
            inner: Arc::new(Inner {
                slot,
                source,
                policy,
                last_refresh: Mutex::new(None),
                counters,
            }),
        })
    }

    /// Current snapshot. Never blocks on a refresh in progress.
    #[must_use]
    pub fn current(&self) -> Arc<PublicSigningKeySet> {
        self.inner.slot.borrow().clone()
    }

    /// Receive every future snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<PublicSigningKeySet>> {
        self.inner.slot.subscribe()
    }

    /// Ask for a background refresh after a signature failure.
    ///
    /// Returns `true` if a refresh was started, `false` if throttled.
    pub fn request_refresh(&self) -> bool {
        let counters = &self.inner.counters;
        counters.refresh_requests.fetch_add(1, Ordering::Relaxed);

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("key refresh requested outside of a tokio runtime, ignoring");
            return false;
        };

        {
            let Ok(mut last) = self.inner.last_refresh.lock() else {
                return false;
            };
            let now = Instant::now();
            if let Some(started) = *last {
                if now.duration_since(started) < self.inner.policy.min_refresh_interval {
                    debug!("key refresh throttled");
                    return false;
                }
            }
            *last = Some(now);
        }

        counters.refreshes_started.fetch_add(1, Ordering::Relaxed);
        info!("starting signing key refresh");
        handle.spawn(refresh_with_backoff(Arc::clone(&self.inner)));
        true
    }

    /// Get cache statistics.
    #[must_use]
    pub fn stats(&self) -> KeyCacheStats {
        let counters = &self.inner.counters;
        KeyCacheStats {
            refresh_requests: counters.refresh_requests.load(Ordering::Relaxed),
            refreshes_started: counters.refreshes_started.load(Ordering::Relaxed),
            fetch_attempts: counters.fetch_attempts.load(Ordering::Relaxed),
            fetch_failures: counters.fetch_failures.load(Ordering::Relaxed),
        }
    }
}

async fn refresh_with_backoff(inner: Arc<Inner>) {
    let policy = &inner.policy;

    for attempt in 1..=policy.max_attempts {
        inner.counters.fetch_attempts.fetch_add(1, Ordering::Relaxed);

        match inner.source.fetch().await {
            Ok(set) => {
                info!(attempt, key_count = set.len(), "signing keys refreshed");
                inner.slot.send_replace(Arc::new(set));
                return;
            }
            Err(e) => {
                inner.counters.fetch_failures.fetch_add(1, Ordering::Relaxed);
                if attempt == policy.max_attempts {
                    break;
                }
                let delay = policy.backoff_after(attempt);
                warn!(
                    attempt,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "signing key refresh failed"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    warn!(
        attempts = policy.max_attempts,
        "giving up on signing key refresh until the next trigger"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwks::Jwk;
    use std::sync::atomic::AtomicU32;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::test_support::TEST_N;

    fn key_set(kid: &str) -> PublicSigningKeySet {
        let jwk = Jwk {
            kty: "RSA".into(),
            use_: Some("sig".into()),
            kid: Some(kid.into()),
            alg: Some("RS256".into()),
            n: Some(TEST_N.into()),
            e: Some("AQAB".into()),
            crv: None,
            x: None,
            y: None,
            d: None,
        };
        PublicSigningKeySet::from_jwks(JwkSet { keys: vec![jwk] }, "test", Utc::now()).unwrap()
    }

    /// Succeeds on the first call, then fails `failures` times, then succeeds.
    struct ScriptedSource {
        calls: AtomicU32,
        failures: u32,
    }

    #[async_trait]
    impl SigningKeySource for ScriptedSource {
        async fn fetch(&self) -> Result<PublicSigningKeySet, KeyCacheError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                return Ok(key_set("k1"));
            }
            if call <= self.failures {
                return Err(KeyCacheError::JwksFetchFailed {
                    uri: "test".into(),
                    message: "HTTP status 503".into(),
                });
            }
            Ok(key_set("k2"))
        }
    }

    fn scripted(failures: u32) -> Arc<ScriptedSource> {
        Arc::new(ScriptedSource {
            calls: AtomicU32::new(0),
            failures,
        })
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = KeyRefreshPolicy::default();
        let delays: Vec<u64> = (1..=9).map(|a| policy.backoff_after(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_is_throttled() {
        let cache = SigningKeyCache::bootstrap(scripted(0), KeyRefreshPolicy::default())
            .await
            .unwrap();

        assert!(cache.request_refresh());
        for _ in 0..5 {
            assert!(!cache.request_refresh());
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(cache.current().get("k2").is_some());

        let stats = cache.stats();
        assert_eq!(stats.refresh_requests, 6);
        assert_eq!(stats.refreshes_started, 1);

        tokio::time::sleep(DEFAULT_MIN_REFRESH_INTERVAL).await;
        assert!(cache.request_refresh());
        assert_eq!(cache.stats().refreshes_started, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_retries_with_backoff() {
        let source = scripted(3);
        let cache = SigningKeyCache::bootstrap(source.clone(), KeyRefreshPolicy::default())
            .await
            .unwrap();
        let mut updates = cache.subscribe();

        let started = Instant::now();
        assert!(cache.request_refresh());
        updates.changed().await.unwrap();

        // Fails at t=0, 1, 3; succeeds at t=7.
        assert_eq!(started.elapsed().as_secs(), 7);
        assert!(cache.current().get("k2").is_some());
        assert!(cache.current().get("k1").is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 5);

        let stats = cache.stats();
        assert_eq!(stats.fetch_failures, 3);
        assert_eq!(stats.fetch_attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_gives_up_after_max_attempts() {
        let source = scripted(u32::MAX);
        let cache = SigningKeyCache::bootstrap(source.clone(), KeyRefreshPolicy::default())
            .await
            .unwrap();

        assert!(cache.request_refresh());
        tokio::time::sleep(Duration::from_secs(3600)).await;

        // Bootstrap + 10 attempts, then nothing until the next trigger.
        assert_eq!(source.calls.load(Ordering::SeqCst), 11);
        assert_eq!(cache.stats().fetch_failures, 10);
        assert!(cache.current().get("k1").is_some());
    }

    #[tokio::test]
    async fn test_http_source_discovers_then_fetches() {
        let mock_server = MockServer::start().await;
        let jwks_uri = format!("{}/protocol/openid-connect/certs", mock_server.uri());

        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "jwks_uri": jwks_uri })),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/protocol/openid-connect/certs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "keys": [{"kty": "RSA", "use": "sig", "kid": "k1", "alg": "RS256", "n": TEST_N, "e": "AQAB"}]
            })))
            .expect(2)
            .mount(&mock_server)
            .await;

        let source = HttpJwksSource::new(format!("{}/", mock_server.uri()), reqwest::Client::new());
        let first = source.fetch().await.unwrap();
        let second = source.fetch().await.unwrap();
        assert!(first.get("k1").is_some());
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_returned() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let source = Arc::new(HttpJwksSource::new(mock_server.uri(), reqwest::Client::new()));
        let result = SigningKeyCache::bootstrap(source, KeyRefreshPolicy::default()).await;

        let err = result.err().expect("bootstrap should fail");
        assert!(matches!(err, KeyCacheError::DiscoveryFailed { .. }));
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_well_known_url() {
        assert_eq!(
            HttpJwksSource::well_known_url("https://idp.example.com/realms/demo/"),
            "https://idp.example.com/realms/demo/.well-known/openid-configuration"
        );
    }
}
