//! Access token verification for keyward resource servers.
//!
//! This crate provides:
//! - RFC 9068 access token validation (signature, time claims, schema, audience)
//! - A JWKS cache with failure-driven, throttled key rotation
//! - DPoP (RFC 9449) sender-constraint enforcement
//! - An axum extractor returning `401` with a `WWW-Authenticate` challenge
//!
//! # Example
//!
//! ```rust,ignore
//! use keyward_auth::{AccessTokenVerifier, RequestAuthContext, VerifierConfig};
//!
//! let verifier = AccessTokenVerifier::bootstrap(
//!     VerifierConfig::new("https://idp.example.com/realms/demo").audience(vec!["orders-api"]),
//! )
//! .await?;
//!
//! match verifier.verify(&RequestAuthContext::bearer(token)) {
//!     Ok(verified) => println!("hello {}", verified.claims.sub),
//!     Err(e) => println!("rejected: {} ({})", e.cause(), e.message()),
//! }
//! ```

mod claims;
mod dpop;
mod error;
mod jwks;
mod key_cache;
mod middleware;
mod request;
mod verifier;

#[cfg(test)]
mod test_support;

// Re-export public API
pub use claims::{AccessTokenClaims, Audience, Confirmation};
pub use dpop::{verify_proof, DpopPolicy, DPOP_PROOF_TYPE};
pub use error::{KeyCacheError, TokenValidationError};
pub use jwks::{Jwk, JwkSet, PublicSigningKeySet, SigningKey, ALLOWED_ALGORITHMS};
pub use key_cache::{
    HttpJwksSource, KeyCacheStats, KeyRefreshPolicy, SigningKeyCache, SigningKeySource,
    DEFAULT_MIN_REFRESH_INTERVAL,
};
pub use middleware::Authenticated;
pub use request::{AuthScheme, ProxyTrust, RequestAuthContext};
pub use verifier::{AccessTokenVerifier, VerifiedToken, VerifierConfig};

pub use keyward_core::InitializationError;
