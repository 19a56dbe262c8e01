//! Access token verification.
//!
//! [`AccessTokenVerifier::verify`] never errors for network reasons: the
//! key cache is consulted synchronously and an unknown `kid` fails fast as
//! `invalid signature` while a throttled background refresh is requested.

use crate::claims::AccessTokenClaims;
use crate::dpop::{self, DpopPolicy};
use crate::error::{KeyCacheError, TokenValidationError};
use crate::jwks::{alg_name, ALLOWED_ALGORITHMS};
use crate::key_cache::{HttpJwksSource, KeyRefreshPolicy, SigningKeyCache};
use crate::request::{ProxyTrust, RequestAuthContext};
use jsonwebtoken::{decode, decode_header, Validation};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Configuration for token verification.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Issuer URI; used for discovery and, by default, as the expected `iss`.
    pub issuer_uri: String,
    /// Expected `iss` claim when it differs from the issuer URI.
    pub expected_issuer: Option<String>,
    /// Expected audience (if set, tokens without any matching audience are rejected).
    pub expected_audience: Option<Vec<String>>,
    /// Clock skew tolerance in seconds (default: 60).
    pub clock_skew_tolerance: u64,
    pub dpop: DpopPolicy,
    pub proxy: ProxyTrust,
    pub key_refresh: KeyRefreshPolicy,
    /// Timeout for discovery and JWKS requests.
    pub http_timeout: Duration,
}

impl VerifierConfig {
    #[must_use]
    pub fn new(issuer_uri: impl Into<String>) -> Self {
        Self {
            issuer_uri: issuer_uri.into(),
            expected_issuer: None,
            expected_audience: None,
            clock_skew_tolerance: 60,
            dpop: DpopPolicy::default(),
            proxy: ProxyTrust::default(),
            key_refresh: KeyRefreshPolicy::default(),
            http_timeout: Duration::from_secs(10),
        }
    }

    /// Set the expected issuer.
    #[must_use]
    pub fn issuer(mut self, iss: impl Into<String>) -> Self {
        self.expected_issuer = Some(iss.into());
        self
    }

    /// Set the expected audience.
    #[must_use]
    pub fn audience(mut self, aud: Vec<impl Into<String>>) -> Self {
        self.expected_audience = Some(aud.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_clock_skew(mut self, tolerance_secs: u64) -> Self {
        self.clock_skew_tolerance = tolerance_secs;
        self
    }

    #[must_use]
    pub fn dpop(mut self, policy: DpopPolicy) -> Self {
        self.dpop = policy;
        self
    }

    #[must_use]
    pub fn proxy(mut self, proxy: ProxyTrust) -> Self {
        self.proxy = proxy;
        self
    }

    #[must_use]
    pub fn key_refresh(mut self, policy: KeyRefreshPolicy) -> Self {
        self.key_refresh = policy;
        self
    }

    fn issuer_to_match(&self) -> &str {
        self.expected_issuer
            .as_deref()
            .unwrap_or(&self.issuer_uri)
            .trim_end_matches('/')
    }
}

/// Result of successful token verification.
#[derive(Debug, Clone)]
pub struct VerifiedToken<T = AccessTokenClaims> {
    /// Claims in the requested shape.
    pub claims: T,
    /// The payload exactly as signed.
    pub raw_claims: Value,
    /// Key ID used for verification.
    pub kid: String,
}

/// Token verifier bound to one issuer.
#[derive(Clone)]
pub struct AccessTokenVerifier {
    keys: SigningKeyCache,
    config: Arc<VerifierConfig>,
}

impl AccessTokenVerifier {
    /// Discover the issuer, fetch its JWKS and build a verifier.
    ///
    /// # Errors
    ///
    /// Any discovery or JWKS failure is fatal here. The error converts into
    /// a [`keyward_core::InitializationError`] (`?` or `.into()`), flagged as
    /// "auth server likely down" for network failures.
    #[instrument(skip_all, fields(issuer = %config.issuer_uri))]
    pub async fn bootstrap(config: VerifierConfig) -> Result<Self, KeyCacheError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| KeyCacheError::HttpClient(e.to_string()))?;

        let source = Arc::new(HttpJwksSource::new(config.issuer_uri.clone(), http_client));
        let keys = SigningKeyCache::bootstrap(source, config.key_refresh.clone()).await?;
        Ok(Self::with_key_cache(config, keys))
    }

    /// Build a verifier on top of an existing key cache.
    #[must_use]
    pub fn with_key_cache(config: VerifierConfig, keys: SigningKeyCache) -> Self {
        Self {
            keys,
            config: Arc::new(config),
        }
    }

    #[must_use]
    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Get a reference to the signing key cache.
    #[must_use]
    pub fn key_cache(&self) -> &SigningKeyCache {
        &self.keys
    }

    /// Verify a request's access token against the RFC 9068 claims shape.
    ///
    /// # Errors
    ///
    /// Returns the [`TokenValidationError`] of the first failed check.
    pub fn verify(
        &self,
        ctx: &RequestAuthContext,
    ) -> Result<VerifiedToken<AccessTokenClaims>, TokenValidationError> {
        self.verify_as::<AccessTokenClaims>(ctx)
    }

    /// Verify and additionally deserialize the payload into `T`.
    ///
    /// The RFC 9068 shape is always checked first; `T` is an
    /// application-specific schema on top of it.
    #[instrument(skip_all, fields(scheme = ctx.scheme.as_str()))]
    pub fn verify_as<T: DeserializeOwned>(
        &self,
        ctx: &RequestAuthContext,
    ) -> Result<VerifiedToken<T>, TokenValidationError> {
        let result = self.verify_inner(ctx);
        match &result {
            Ok(verified) => debug!(kid = %verified.kid, "access token verified"),
            Err(e) => {
                debug!(cause = e.cause(), error = %e, "access token rejected");
                if e.is_invalid_signature() {
                    self.keys.request_refresh();
                }
            }
        }
        result
    }

    fn verify_inner<T: DeserializeOwned>(
        &self,
        ctx: &RequestAuthContext,
    ) -> Result<VerifiedToken<T>, TokenValidationError> {
        let token = ctx.access_token.as_str();

        // 1. header
        let header = decode_header(token)
            .map_err(|e| TokenValidationError::MalformedHeader(e.to_string()))?;
        if !ALLOWED_ALGORITHMS.contains(&header.alg) {
            return Err(TokenValidationError::MalformedHeader(format!(
                "algorithm {} is not allowed",
                alg_name(header.alg)
            )));
        }
        let kid = header
            .kid
            .ok_or_else(|| TokenValidationError::MalformedHeader("missing kid".to_string()))?;

        // 2. key lookup, no synchronous refetch
        let keys = self.keys.current();
        let key = keys.get(&kid).ok_or_else(|| {
            TokenValidationError::InvalidSignature(format!("no signing key with kid '{kid}'"))
        })?;
        if !key.jwk().supports(header.alg) {
            return Err(TokenValidationError::InvalidSignature(format!(
                "key '{kid}' cannot verify {}",
                alg_name(header.alg)
            )));
        }

        // 3. signature and time claims
        let mut validation = Validation::new(header.alg);
        validation.leeway = self.config.clock_skew_tolerance;
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::from(["exp".to_string()]);

        let raw_claims = decode::<Value>(token, key.decoding_key(), &validation)
            .map_err(map_jwt_error)?
            .claims;

        // 4. mandatory RFC 9068 shape
        let claims: AccessTokenClaims = serde_json::from_value(raw_claims.clone())
            .map_err(|e| TokenValidationError::SchemaViolation(e.to_string()))?;

        let now = chrono::Utc::now().timestamp();
        let leeway = self.config.clock_skew_tolerance as i64;
        if claims.iat > now + leeway {
            return Err(TokenValidationError::NotYetValid(
                "iat is in the future".to_string(),
            ));
        }

        let expected_issuer = self.config.issuer_to_match();
        if claims.iss.trim_end_matches('/') != expected_issuer {
            warn!(expected = %expected_issuer, actual = %claims.iss, "Issuer mismatch");
            return Err(TokenValidationError::SchemaViolation(format!(
                "unexpected issuer '{}'",
                claims.iss
            )));
        }

        // 5. application schema and audience
        let typed: T = serde_json::from_value(raw_claims.clone())
            .map_err(|e| TokenValidationError::SchemaViolation(e.to_string()))?;

        if let Some(expected) = &self.config.expected_audience {
            if !expected.iter().any(|aud| claims.aud.contains(aud)) {
                return Err(TokenValidationError::AudienceMismatch(format!(
                    "token audience {:?} does not include any of {:?}",
                    claims.aud.as_vec(),
                    expected
                )));
            }
        }

        // 6. sender constraint
        dpop::check_binding(&claims, ctx, &self.config.dpop, now)?;

        Ok(VerifiedToken {
            claims: typed,
            raw_claims,
            kid,
        })
    }
}

/// Map jsonwebtoken errors to TokenValidationError.
fn map_jwt_error(err: jsonwebtoken::errors::Error) -> TokenValidationError {
    use jsonwebtoken::errors::ErrorKind;

    match err.kind() {
        ErrorKind::ExpiredSignature => TokenValidationError::Expired,
        ErrorKind::ImmatureSignature => {
            TokenValidationError::NotYetValid("nbf is in the future".to_string())
        }
        ErrorKind::InvalidSignature
        | ErrorKind::InvalidRsaKey(_)
        | ErrorKind::InvalidEcdsaKey
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::Crypto(_) => TokenValidationError::InvalidSignature(err.to_string()),
        ErrorKind::Json(_) | ErrorKind::MissingRequiredClaim(_) => {
            TokenValidationError::SchemaViolation(err.to_string())
        }
        _ => TokenValidationError::MalformedHeader(err.to_string()),
    }
}
