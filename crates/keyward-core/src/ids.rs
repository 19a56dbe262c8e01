//! Correlation Identifiers
//!
//! - [`ConfigurationId`] is derived from `(issuer_uri, client_id)` and keys
//!   every cross-tab channel, storage entry and in-flight registry slot.
//! - [`AppInstanceId`] is generated once per page load so a tab can ignore
//!   the broadcasts it sent itself.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

/// Number of hex characters kept from the configuration hash.
const CONFIGURATION_ID_LEN: usize = 16;

/// Error type for ID parsing failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse
    pub id_type: &'static str,
    /// What was wrong with the input
    pub message: String,
}

impl Display for ParseIdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to parse {}: {}", self.id_type, self.message)
    }
}

impl std::error::Error for ParseIdError {}

/// Stable hash of a client configuration.
///
/// Two configurations with the same issuer (ignoring a trailing slash) and
/// the same client id share an identifier, in every tab.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigurationId(String);

impl ConfigurationId {
    #[must_use]
    pub fn new(issuer_uri: &str, client_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(issuer_uri.trim_end_matches('/').as_bytes());
        hasher.update([0u8]);
        hasher.update(client_id.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(digest[..CONFIGURATION_ID_LEN].to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ConfigurationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConfigurationId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == CONFIGURATION_ID_LEN && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(ParseIdError {
                id_type: "ConfigurationId",
                message: format!("expected {CONFIGURATION_ID_LEN} hex characters"),
            })
        }
    }
}

/// Random identifier of one page load (one tab, one lifetime).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppInstanceId(Uuid);

impl AppInstanceId {
    /// Creates a new random ID using UUID v4.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an ID from an existing UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns a reference to the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AppInstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AppInstanceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AppInstanceId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self).map_err(|e| ParseIdError {
            id_type: "AppInstanceId",
            message: e.to_string(),
        })
    }
}
