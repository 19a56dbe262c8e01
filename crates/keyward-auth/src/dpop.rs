//! DPoP (RFC 9449) sender-constraint checks.
//!
//! A token whose payload carries `cnf.jkt` is bound to a client key and
//! must be presented with the `DPoP` scheme together with a proof JWT
//! signed by that key.

use crate::claims::AccessTokenClaims;
use crate::error::TokenValidationError;
use crate::jwks::{Jwk, ALLOWED_ALGORITHMS};
use crate::request::{AuthScheme, RequestAuthContext};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::Algorithm;
use keyward_core::decode_payload_unverified;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Expected `typ` header of a proof.
pub const DPOP_PROOF_TYPE: &str = "dpop+jwt";

/// How DPoP proofs are checked.
#[derive(Debug, Clone)]
pub struct DpopPolicy {
    /// Verify the proof cryptographically. When false only the presence
    /// of `cnf.jkt` and of a proof header is enforced.
    pub verify_proof: bool,
    /// Oldest acceptable proof (`iat`).
    pub max_proof_age: Duration,
    /// Tolerance for proofs issued slightly in the future.
    pub leeway: Duration,
}

impl Default for DpopPolicy {
    fn default() -> Self {
        Self {
            verify_proof: true,
            max_proof_age: Duration::from_secs(300),
            leeway: Duration::from_secs(5),
        }
    }
}

impl DpopPolicy {
    /// Presence checks only.
    #[must_use]
    pub fn presence_only() -> Self {
        Self {
            verify_proof: false,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProofHeader {
    #[serde(default)]
    typ: Option<String>,
    alg: String,
    #[serde(default)]
    jwk: Option<Jwk>,
}

#[derive(Debug, Deserialize)]
struct ProofClaims {
    #[serde(default)]
    jti: Option<String>,
    #[serde(default)]
    htm: Option<String>,
    #[serde(default)]
    htu: Option<String>,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    ath: Option<String>,
}

fn violation(message: impl Into<String>) -> TokenValidationError {
    TokenValidationError::DpopViolation(message.into())
}

/// Enforce the sender constraint of an already signature-checked token.
pub(crate) fn check_binding(
    claims: &AccessTokenClaims,
    ctx: &RequestAuthContext,
    policy: &DpopPolicy,
    now: i64,
) -> Result<(), TokenValidationError> {
    let jkt = claims.dpop_jkt();

    match ctx.scheme {
        AuthScheme::Bearer => match jkt {
            Some(_) => Err(violation(
                "DPoP-bound token (cnf.jkt) presented with the Bearer scheme",
            )),
            None => Ok(()),
        },
        AuthScheme::DPoP => {
            let jkt = jkt.ok_or_else(|| violation("DPoP scheme used but token has no cnf.jkt"))?;
            let proof = ctx
                .dpop_proof
                .as_deref()
                .ok_or_else(|| violation("missing DPoP proof header"))?;

            if !policy.verify_proof {
                return Ok(());
            }

            let htm = ctx
                .expected_htm
                .as_deref()
                .ok_or_else(|| violation("request method unknown"))?;
            let htu = ctx
                .expected_htu
                .as_deref()
                .ok_or_else(|| violation("request URL could not be reconstructed"))?;

            verify_proof(proof, &ctx.access_token, jkt, htm, htu, policy, now)
        }
    }
}

/// Verify a DPoP proof JWT against the request and the bound token.
///
/// # Errors
///
/// Returns `DpopViolation` describing the first failed check.
pub fn verify_proof(
    proof: &str,
    access_token: &str,
    expected_jkt: &str,
    htm: &str,
    htu: &str,
    policy: &DpopPolicy,
    now: i64,
) -> Result<(), TokenValidationError> {
    let (signing_input, signature) = proof
        .rsplit_once('.')
        .ok_or_else(|| violation("proof is not a compact JWS"))?;
    let header_segment = signing_input
        .split('.')
        .next()
        .ok_or_else(|| violation("proof is not a compact JWS"))?;

    let header: ProofHeader = URL_SAFE_NO_PAD
        .decode(header_segment.trim_end_matches('='))
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .ok_or_else(|| violation("proof header is not valid JSON"))?;

    if !header
        .typ
        .as_deref()
        .is_some_and(|typ| typ.eq_ignore_ascii_case(DPOP_PROOF_TYPE))
    {
        return Err(violation(format!("proof typ must be {DPOP_PROOF_TYPE}")));
    }

    let alg = Algorithm::from_str(&header.alg)
        .ok()
        .filter(|alg| ALLOWED_ALGORITHMS.contains(alg))
        .ok_or_else(|| violation(format!("proof algorithm '{}' not allowed", header.alg)))?;

    let jwk = header
        .jwk
        .ok_or_else(|| violation("proof header has no jwk"))?;
    if jwk.is_private() {
        return Err(violation("proof jwk contains private key material"));
    }
    if !jwk.supports(alg) {
        return Err(violation("proof jwk does not match its algorithm"));
    }

    let thumbprint = jwk.thumbprint().map_err(violation)?;
    if thumbprint != expected_jkt {
        debug!(expected = %expected_jkt, actual = %thumbprint, "DPoP key thumbprint mismatch");
        return Err(violation("proof key does not match cnf.jkt"));
    }

    let key = jwk.to_decoding_key().map_err(violation)?;
    let valid = jsonwebtoken::crypto::verify(signature, signing_input.as_bytes(), &key, alg)
        .map_err(|e| violation(format!("proof signature check failed: {e}")))?;
    if !valid {
        return Err(violation("proof signature is invalid"));
    }

    let claims: ProofClaims = decode_payload_unverified(proof)
        .map_err(|e| violation(format!("proof payload unreadable: {e}")))?;

    if claims.jti.as_deref().map_or(true, str::is_empty) {
        return Err(violation("proof has no jti"));
    }

    if claims.htm.as_deref() != Some(htm) {
        return Err(violation(format!("proof htm does not match {htm}")));
    }

    let proof_htu = claims
        .htu
        .as_deref()
        .ok_or_else(|| violation("proof has no htu"))?;
    if !same_target_uri(proof_htu, htu) {
        return Err(violation(format!("proof htu does not match {htu}")));
    }

    let iat = claims.iat.ok_or_else(|| violation("proof has no iat"))?;
    let max_age = policy.max_proof_age.as_secs() as i64;
    let leeway = policy.leeway.as_secs() as i64;
    if iat > now + leeway {
        return Err(violation("proof iat is in the future"));
    }
    if now - iat > max_age + leeway {
        return Err(violation("proof is too old"));
    }

    let expected_ath = URL_SAFE_NO_PAD.encode(Sha256::digest(access_token.as_bytes()));
    if claims.ath.as_deref() != Some(expected_ath.as_str()) {
        return Err(violation("proof ath does not match the access token"));
    }

    Ok(())
}

/// Compare two `htu` values ignoring query and fragment (RFC 9449 §4.3).
fn same_target_uri(a: &str, b: &str) -> bool {
    match (url::Url::parse(a), url::Url::parse(b)) {
        (Ok(a), Ok(b)) => {
            a.scheme() == b.scheme()
                && a.host_str() == b.host_str()
                && a.port_or_known_default() == b.port_or_known_default()
                && a.path() == b.path()
        }
        _ => false,
    }
}
