//! Error types for access token verification.
//!
//! [`TokenValidationError`] is what the verifier returns for a rejected
//! token: a stable machine-readable [`cause`](TokenValidationError::cause)
//! plus a debug message. [`KeyCacheError`] covers the network side
//! (discovery and JWKS retrieval).

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use crate::jwks::{alg_name, ALLOWED_ALGORITHMS};
use keyward_core::InitializationError;
use serde::Serialize;
use thiserror::Error;

/// Why an access token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenValidationError {
    /// No usable `Authorization` header on the request.
    #[error("missing access token: {0}")]
    MissingToken(String),

    /// Token header unreadable, no `kid`, or a disallowed algorithm.
    #[error("malformed token header: {0}")]
    MalformedHeader(String),

    /// Unknown `kid` or signature mismatch.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// `exp` is in the past (beyond clock skew tolerance).
    #[error("token has expired")]
    Expired,

    /// `iat` or `nbf` lies in the future.
    #[error("token is not yet valid: {0}")]
    NotYetValid(String),

    /// Payload is not a valid RFC 9068 access token, or not the
    /// application-supplied claims shape.
    #[error("token does not respect schema: {0}")]
    SchemaViolation(String),

    #[error("audience mismatch: {0}")]
    AudienceMismatch(String),

    /// DPoP binding or proof rejected.
    #[error("DPoP violation: {0}")]
    DpopViolation(String),
}

impl TokenValidationError {
    /// Stable, machine-readable cause.
    #[must_use]
    pub fn cause(&self) -> &'static str {
        match self {
            Self::MissingToken(_) => "missing token",
            Self::MalformedHeader(_) => "malformed header",
            Self::InvalidSignature(_) => "invalid signature",
            Self::Expired => "expired",
            Self::NotYetValid(_) => "not yet valid",
            Self::SchemaViolation(_) => "does not respect schema",
            Self::AudienceMismatch(_) => "audience mismatch",
            Self::DpopViolation(_) => "dpop violation",
        }
    }

    /// Human readable message for debugging (not shown to end users).
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Returns a machine-readable error code.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingToken(_) => "missing_token",
            Self::MalformedHeader(_) => "malformed_header",
            Self::InvalidSignature(_) => "invalid_signature",
            Self::Expired => "token_expired",
            Self::NotYetValid(_) => "token_not_yet_valid",
            Self::SchemaViolation(_) => "schema_violation",
            Self::AudienceMismatch(_) => "audience_mismatch",
            Self::DpopViolation(_) => "dpop_violation",
        }
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }

    /// Check if this error should trigger a signing key refresh.
    #[must_use]
    pub fn is_invalid_signature(&self) -> bool {
        matches!(self, Self::InvalidSignature(_))
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired)
    }

    #[must_use]
    pub fn is_dpop_violation(&self) -> bool {
        matches!(self, Self::DpopViolation(_))
    }

    /// `WWW-Authenticate` challenge for this rejection (RFC 6750 §3, RFC 9449 §7.1).
    ///
    /// Without credentials both schemes are offered, DPoP with its proof algorithms.
    #[must_use]
    pub fn challenge(&self) -> String {
        match self {
            Self::MissingToken(_) => format!("Bearer, DPoP algs=\"{}\"", dpop_algs()),
            Self::DpopViolation(_) => {
                format!("DPoP error=\"invalid_token\", algs=\"{}\"", dpop_algs())
            }
            _ => "Bearer error=\"invalid_token\"".to_string(),
        }
    }
}

fn dpop_algs() -> String {
    ALLOWED_ALGORITHMS
        .iter()
        .map(|alg| alg_name(*alg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// JSON body returned with a 401.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    cause: &'static str,
    message: String,
}

impl IntoResponse for TokenValidationError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.error_code(),
            cause: self.cause(),
            message: self.message(),
        };
        let mut response = (self.status_code(), Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(&self.challenge()) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }
}

/// Failure to obtain the provider's public signing keys.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyCacheError {
    #[error("discovery failed for issuer {issuer}: {message}")]
    DiscoveryFailed { issuer: String, message: String },

    #[error("JWKS fetch failed from {uri}: {message}")]
    JwksFetchFailed { uri: String, message: String },

    #[error("JWKS at {uri} contains no usable signing key")]
    NoUsableKeys { uri: String },

    #[error("HTTP client error: {0}")]
    HttpClient(String),
}

impl KeyCacheError {
    /// Network failures are retried with backoff during rotation.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DiscoveryFailed { .. } | Self::JwksFetchFailed { .. }
        )
    }
}

/// Bootstrap failures reported in the same shape as the browser engine:
/// network failures mean "retry later", anything else "fix configuration".
impl From<KeyCacheError> for InitializationError {
    fn from(err: KeyCacheError) -> Self {
        if err.is_transient() {
            InitializationError::auth_server_down(err.to_string())
        } else {
            InitializationError::misconfiguration(err.to_string())
        }
    }
}
