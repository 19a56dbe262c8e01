//! The token set held by a logged-in session.
//!
//! A [`TokenSet`] is never mutated: every login or renewal builds a new one
//! from the token endpoint response and swaps it in wholesale.

use crate::error::TokenSetError;
use crate::jwt::{decode_payload_unverified, read_exp_unverified};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Successful response of the token endpoint (RFC 6749 §5.1 plus OIDC).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEndpointResponse {
    pub access_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Access token lifetime in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,

    /// Refresh token lifetime in seconds (Keycloak extension, `0` = no expiry).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_expires_in: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Claims of the id token, read without verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    pub iss: String,
    pub sub: String,
    pub exp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,

    /// Every other claim (`aud`, `email`, `preferred_username`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IdTokenClaims {
    /// Look up a claim that is not modelled as a field.
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }
}

/// Tokens of a logged-in session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    access_token: String,
    access_token_expiration_time: DateTime<Utc>,
    id_token: String,
    decoded_id_token: IdTokenClaims,
    refresh_token: Option<String>,
    refresh_token_expiration_time: Option<DateTime<Utc>>,
}

impl TokenSet {
    /// Build a token set from a token endpoint response.
    ///
    /// `previous` is the set being renewed, if any: providers may omit the
    /// refresh token (or the id token) from a refresh response, in which
    /// case the previous ones carry over.
    ///
    /// # Errors
    ///
    /// Fails when the access token expiry cannot be determined, or when no
    /// readable id token is available.
    pub fn from_response(
        response: TokenEndpointResponse,
        previous: Option<&TokenSet>,
        now: DateTime<Utc>,
    ) -> Result<Self, TokenSetError> {
        let access_token_expiration_time = read_exp_unverified(&response.access_token)
            .and_then(timestamp)
            .or_else(|| response.expires_in.map(|secs| now + Duration::seconds(secs)))
            .ok_or(TokenSetError::MissingAccessTokenExpiry)?;

        let (id_token, decoded_id_token) = match response.id_token {
            Some(id_token) => {
                let decoded = decode_payload_unverified::<IdTokenClaims>(&id_token)?;
                (id_token, decoded)
            }
            None => match previous {
                Some(prev) => (prev.id_token.clone(), prev.decoded_id_token.clone()),
                None => return Err(TokenSetError::MissingIdToken),
            },
        };

        let (refresh_token, refresh_token_expiration_time) = match response.refresh_token {
            Some(refresh_token) => {
                let expiry = read_exp_unverified(&refresh_token)
                    .filter(|exp| *exp > 0)
                    .and_then(timestamp)
                    .or_else(|| {
                        response
                            .refresh_expires_in
                            .filter(|secs| *secs > 0)
                            .map(|secs| now + Duration::seconds(secs))
                    });
                (Some(refresh_token), expiry)
            }
            None => match previous {
                Some(prev) => (
                    prev.refresh_token.clone(),
                    prev.refresh_token_expiration_time,
                ),
                None => (None, None),
            },
        };

        let token_set = Self {
            access_token: response.access_token,
            access_token_expiration_time,
            id_token,
            decoded_id_token,
            refresh_token,
            refresh_token_expiration_time,
        };
        token_set.warn_on_inverted_expiry();
        Ok(token_set)
    }

    fn warn_on_inverted_expiry(&self) {
        if let Some(refresh_exp) = self.refresh_token_expiration_time {
            if refresh_exp < self.access_token_expiration_time {
                warn!(
                    access_token_expiration_time = %self.access_token_expiration_time,
                    refresh_token_expiration_time = %refresh_exp,
                    "refresh token expires before the access token; \
                     check the SSO session idle timeout of your provider"
                );
            }
        }
    }

    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    #[must_use]
    pub fn access_token_expiration_time(&self) -> DateTime<Utc> {
        self.access_token_expiration_time
    }

    #[must_use]
    pub fn id_token(&self) -> &str {
        &self.id_token
    }

    #[must_use]
    pub fn decoded_id_token(&self) -> &IdTokenClaims {
        &self.decoded_id_token
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    #[must_use]
    pub fn refresh_token_expiration_time(&self) -> Option<DateTime<Utc>> {
        self.refresh_token_expiration_time
    }

    /// The earliest of the access and refresh token expiries.
    ///
    /// Renewal has to happen before this instant.
    #[must_use]
    pub fn renewal_deadline(&self) -> DateTime<Utc> {
        match self.refresh_token_expiration_time {
            Some(refresh_exp) => refresh_exp.min(self.access_token_expiration_time),
            None => self.access_token_expiration_time,
        }
    }

    /// Whether a refresh grant can still be attempted with this set.
    #[must_use]
    pub fn has_usable_refresh_token(&self, now: DateTime<Utc>) -> bool {
        match (&self.refresh_token, self.refresh_token_expiration_time) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(_), Some(exp)) => exp > now,
        }
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}
