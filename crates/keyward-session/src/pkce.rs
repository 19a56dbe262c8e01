//! PKCE (RFC 7636) and `state` generation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use keyward_core::ConfigurationId;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

const STATE_PREFIX: &str = "ks";

fn random_b64url<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A fresh code verifier: 64 URL-safe characters.
#[must_use]
pub fn generate_code_verifier() -> String {
    random_b64url::<48>()
}

/// `BASE64URL(SHA256(verifier))`
#[must_use]
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// A fresh `state` that names the configuration it belongs to.
///
/// Format: `ks.<configuration id>.<22 random chars>`.
#[must_use]
pub fn generate_state(config_id: &ConfigurationId) -> String {
    format!("{STATE_PREFIX}.{config_id}.{}", random_b64url::<16>())
}

/// The configuration a `state` was generated for, if it is one of ours.
#[must_use]
pub fn configuration_of_state(state: &str) -> Option<ConfigurationId> {
    let mut parts = state.splitn(3, '.');
    if parts.next()? != STATE_PREFIX {
        return None;
    }
    let config_id = parts.next()?.parse().ok()?;
    parts.next().filter(|nonce| !nonce.is_empty())?;
    Some(config_id)
}
