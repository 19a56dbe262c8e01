//! Axum integration: an extractor that verifies the caller's access token.

use crate::claims::AccessTokenClaims;
use crate::error::TokenValidationError;
use crate::request::RequestAuthContext;
use crate::verifier::{AccessTokenVerifier, VerifiedToken};
use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use serde::de::DeserializeOwned;
use std::ops::Deref;

/// Verified access token of the current request.
///
/// Requires [`AccessTokenVerifier`] to be extractable from the router state.
/// Rejects with `401` and a `WWW-Authenticate` challenge.
///
/// ```rust,ignore
/// async fn whoami(Authenticated(token): Authenticated) -> String {
///     token.claims.sub
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Authenticated<T = AccessTokenClaims>(pub VerifiedToken<T>);

impl<T> Deref for Authenticated<T> {
    type Target = VerifiedToken<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[async_trait]
impl<S, T> FromRequestParts<S> for Authenticated<T>
where
    AccessTokenVerifier: FromRef<S>,
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = TokenValidationError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = AccessTokenVerifier::from_ref(state);
        let ctx = RequestAuthContext::from_parts(
            &parts.method,
            &parts.uri,
            &parts.headers,
            &verifier.config().proxy,
        )?;
        verifier.verify_as::<T>(&ctx).map(Authenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeyCacheError;
    use crate::jwks::{JwkSet, PublicSigningKeySet};
    use crate::key_cache::{KeyRefreshPolicy, SigningKeyCache, SigningKeySource};
    use crate::test_support::{access_token, public_jwk, standard_claims};
    use crate::verifier::VerifierConfig;
    use axum::{body::Body, http::Request, routing::get, Router};
    use serde_json::json;
    use std::sync::Arc;
    use tower::ServiceExt;

    const ISSUER: &str = "https://idp.example.com";

    struct StaticSource;

    #[async_trait]
    impl SigningKeySource for StaticSource {
        async fn fetch(&self) -> Result<PublicSigningKeySet, KeyCacheError> {
            let jwks: JwkSet =
                serde_json::from_value(json!({ "keys": [public_jwk("k1")] })).unwrap();
            PublicSigningKeySet::from_jwks(jwks, "static", chrono::Utc::now())
        }
    }

    async fn app() -> Router {
        let keys = SigningKeyCache::bootstrap(Arc::new(StaticSource), KeyRefreshPolicy::default())
            .await
            .unwrap();
        let verifier = AccessTokenVerifier::with_key_cache(VerifierConfig::new(ISSUER), keys);

        Router::new()
            .route(
                "/whoami",
                get(|token: Authenticated| async move { token.claims.sub.clone() }),
            )
            .with_state(verifier)
    }

    #[tokio::test]
    async fn test_extractor_accepts_valid_token() {
        let token = access_token("k1", &standard_claims(ISSUER));
        let response = app()
            .await
            .oneshot(
                Request::builder()
                    .uri("/whoami")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"user-123");
    }

    #[tokio::test]
    async fn test_extractor_rejects_missing_header() {
        let response = app()
            .await
            .oneshot(Request::builder().uri("/whoami").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), 401);
        let challenge = response.headers().get("www-authenticate").unwrap();
        assert!(challenge.to_str().unwrap().starts_with("Bearer, DPoP algs="));
    }
}
