//! Error types shared across keyward crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a session could not be established at startup.
///
/// Produced by the bootstrapper (usually after running diagnostics) and
/// handed to the application unchanged. `is_auth_server_likely_down`
/// separates "retry later" from "fix your configuration".
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct InitializationError {
    message: String,
    is_auth_server_likely_down: bool,
}

impl InitializationError {
    /// Create a new initialization error.
    #[must_use]
    pub fn new(message: impl Into<String>, is_auth_server_likely_down: bool) -> Self {
        Self {
            message: message.into(),
            is_auth_server_likely_down,
        }
    }

    /// The authorization server did not answer or answered with a server error.
    #[must_use]
    pub fn auth_server_down(message: impl Into<String>) -> Self {
        Self::new(message, true)
    }

    /// The authorization server answered but the client setup is wrong.
    #[must_use]
    pub fn misconfiguration(message: impl Into<String>) -> Self {
        Self::new(message, false)
    }

    /// Human readable explanation, possibly multi-line.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn is_auth_server_likely_down(&self) -> bool {
        self.is_auth_server_likely_down
    }
}

/// Failure to read a JWT payload without verifying it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JwtDecodeError {
    #[error("token is not a compact JWS (expected 3 segments, got {0})")]
    SegmentCount(usize),

    #[error("invalid base64url in payload: {0}")]
    Base64(String),

    #[error("invalid JSON in payload: {0}")]
    Json(String),
}

/// Failure to build a [`crate::TokenSet`] from a token endpoint response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenSetError {
    #[error("access token expiry unknown: no exp claim and no expires_in")]
    MissingAccessTokenExpiry,

    #[error("token endpoint response has no id_token")]
    MissingIdToken,

    #[error("id token payload unreadable: {0}")]
    IdToken(#[from] JwtDecodeError),
}
