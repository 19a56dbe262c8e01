//! Internal error type of the session engine.
//!
//! These never reach the application as-is: the bootstrapper turns them
//! into an [`keyward_core::InitializationError`] (through diagnostics) or
//! into an anonymous session, and a failed renewal becomes a forced login.

use keyward_core::TokenSetError;
use thiserror::Error;

/// Result type for session engine operations.
pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Transport failure (DNS, TLS, connection refused, timeout).
    #[error("request to {url} failed: {message}")]
    Unreachable { url: String, message: String },

    #[error("discovery failed for {url}: HTTP status {status}")]
    DiscoveryStatus { url: String, status: u16 },

    #[error("invalid discovery document at {url}: {message}")]
    InvalidDiscovery { url: String, message: String },

    /// The token endpoint answered with an OAuth error.
    #[error("token endpoint returned HTTP {status}: {error}")]
    TokenEndpoint {
        status: u16,
        error: String,
        description: Option<String>,
    },

    #[error("invalid token response: {0}")]
    InvalidTokenResponse(String),

    #[error("no refresh token available")]
    NoRefreshToken,

    /// `prompt=none` renewal in a hidden frame did not yield a code.
    #[error("silent renewal failed: {0}")]
    SilentRenewal(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("operation was abandoned before completing")]
    Aborted,

    #[error("session has ended")]
    SessionEnded,
}

impl ClientError {
    /// Whether the authorization server could not be reached at all.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Unreachable { .. } => true,
            Self::DiscoveryStatus { status, .. } => *status >= 500,
            Self::TokenEndpoint { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<TokenSetError> for ClientError {
    fn from(err: TokenSetError) -> Self {
        ClientError::InvalidTokenResponse(err.to_string())
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        ClientError::InvalidUrl(err.to_string())
    }
}
