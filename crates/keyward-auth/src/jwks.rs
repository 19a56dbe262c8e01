//! JWKS models and the immutable [`PublicSigningKeySet`] snapshot.

use crate::error::KeyCacheError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// JSON Web Key Set - a collection of JWKs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwkSet {
    /// The array of JWKs.
    pub keys: Vec<Jwk>,
}

/// JSON Web Key (RFC 7517), public members only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type ("RSA", "EC").
    pub kty: String,

    /// Public key use ("sig" or "enc").
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    /// RSA modulus (base64url encoded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    /// RSA exponent (base64url encoded).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,

    /// EC curve name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,

    /// Private exponent; present only in private keys, which must be refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

impl Jwk {
    /// Whether this key may verify signatures (`use` absent or "sig").
    #[must_use]
    pub fn is_signing_key(&self) -> bool {
        self.use_.as_deref().map_or(true, |u| u == "sig")
    }

    #[must_use]
    pub fn is_private(&self) -> bool {
        self.d.is_some()
    }

    /// Check that a JWS algorithm can be verified with this key.
    #[must_use]
    pub fn supports(&self, alg: Algorithm) -> bool {
        if let Some(declared) = &self.alg {
            if declared != alg_name(alg) {
                return false;
            }
        }
        match alg {
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => self.kty == "RSA",
            Algorithm::ES256 => self.kty == "EC" && self.crv.as_deref() == Some("P-256"),
            Algorithm::ES384 => self.kty == "EC" && self.crv.as_deref() == Some("P-384"),
            _ => false,
        }
    }

    /// Build a jsonwebtoken decoding key.
    pub fn to_decoding_key(&self) -> Result<DecodingKey, String> {
        match self.kty.as_str() {
            "RSA" => {
                let n = self.n.as_deref().ok_or("missing modulus (n)")?;
                let e = self.e.as_deref().ok_or("missing exponent (e)")?;
                DecodingKey::from_rsa_components(n, e).map_err(|e| e.to_string())
            }
            "EC" => {
                let x = self.x.as_deref().ok_or("missing x coordinate")?;
                let y = self.y.as_deref().ok_or("missing y coordinate")?;
                DecodingKey::from_ec_components(x, y).map_err(|e| e.to_string())
            }
            other => Err(format!("unsupported key type {other}")),
        }
    }

    /// RFC 7638 JWK SHA-256 thumbprint, base64url encoded.
    pub fn thumbprint(&self) -> Result<String, String> {
        // Required members only, lexicographic order, no whitespace.
        let canonical = match self.kty.as_str() {
            "RSA" => {
                let n = self.n.as_deref().ok_or("missing modulus (n)")?;
                let e = self.e.as_deref().ok_or("missing exponent (e)")?;
                format!(r#"{{"e":"{e}","kty":"RSA","n":"{n}"}}"#)
            }
            "EC" => {
                let crv = self.crv.as_deref().ok_or("missing curve")?;
                let x = self.x.as_deref().ok_or("missing x coordinate")?;
                let y = self.y.as_deref().ok_or("missing y coordinate")?;
                format!(r#"{{"crv":"{crv}","kty":"EC","x":"{x}","y":"{y}"}}"#)
            }
            other => return Err(format!("unsupported key type {other}")),
        };
        Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
    }
}

/// JWS algorithm name as it appears in a JOSE header.
#[must_use]
pub fn alg_name(alg: Algorithm) -> &'static str {
    match alg {
        Algorithm::HS256 => "HS256",
        Algorithm::HS384 => "HS384",
        Algorithm::HS512 => "HS512",
        Algorithm::ES256 => "ES256",
        Algorithm::ES384 => "ES384",
        Algorithm::RS256 => "RS256",
        Algorithm::RS384 => "RS384",
        Algorithm::RS512 => "RS512",
        Algorithm::PS256 => "PS256",
        Algorithm::PS384 => "PS384",
        Algorithm::PS512 => "PS512",
        Algorithm::EdDSA => "EdDSA",
    }
}

/// Asymmetric algorithms accepted on access tokens and DPoP proofs.
pub const ALLOWED_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// A verification key resolved from a JWK.
#[derive(Clone)]
pub struct SigningKey {
    jwk: Jwk,
    decoding_key: DecodingKey,
}

impl SigningKey {
    #[must_use]
    pub fn jwk(&self) -> &Jwk {
        &self.jwk
    }

    #[must_use]
    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.jwk.kid)
            .field("kty", &self.jwk.kty)
            .field("alg", &self.jwk.alg)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a provider's signing keys, indexed by `kid`.
///
/// Replaced wholesale on refresh; never merged with a previous snapshot.
#[derive(Debug, Clone)]
pub struct PublicSigningKeySet {
    keys: HashMap<String, SigningKey>,
    fetched_at: DateTime<Utc>,
}

impl PublicSigningKeySet {
    /// Build a snapshot from a JWKS document.
    ///
    /// Keys without `kid`, encryption keys, private keys and keys of an
    /// unsupported type are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`KeyCacheError::NoUsableKeys`] when nothing usable remains.
    pub fn from_jwks(
        jwks: JwkSet,
        source_uri: &str,
        fetched_at: DateTime<Utc>,
    ) -> Result<Self, KeyCacheError> {
        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            let Some(kid) = jwk.kid.clone() else {
                debug!(kty = %jwk.kty, "skipping JWK without kid");
                continue;
            };
            if !jwk.is_signing_key() || jwk.is_private() {
                debug!(kid = %kid, "skipping non-signing JWK");
                continue;
            }
            match jwk.to_decoding_key() {
                Ok(decoding_key) => {
                    keys.insert(kid, SigningKey { jwk, decoding_key });
                }
                Err(reason) => debug!(kid = %kid, reason = %reason, "skipping unusable JWK"),
            }
        }

        if keys.is_empty() {
            return Err(KeyCacheError::NoUsableKeys {
                uri: source_uri.to_string(),
            });
        }

        Ok(Self { keys, fetched_at })
    }

    /// Find a key by its key ID (kid).
    #[must_use]
    pub fn get(&self, kid: &str) -> Option<&SigningKey> {
        self.keys.get(kid)
    }

    #[must_use]
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn kids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }
}
