//! Reading JWT payloads without signature verification.
//!
//! Only for tokens received directly from the token endpoint over TLS
//! (id token claims, expiry hints). Never use this to make an
//! authorization decision; that is the job of `keyward-auth`.

use crate::error::JwtDecodeError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Decode the payload segment of a compact JWS.
///
/// # Errors
///
/// Returns [`JwtDecodeError`] if the token does not have three segments or
/// the payload is not base64url-encoded JSON matching `T`.
pub fn decode_payload_unverified<T: DeserializeOwned>(token: &str) -> Result<T, JwtDecodeError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(JwtDecodeError::SegmentCount(segments.len()));
    }

    // Some providers pad their segments.
    let payload = segments[1].trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| JwtDecodeError::Base64(e.to_string()))?;

    serde_json::from_slice(&bytes).map_err(|e| JwtDecodeError::Json(e.to_string()))
}

#[derive(Deserialize)]
struct ExpOnly {
    exp: Option<i64>,
}

/// The `exp` claim of a token, if it is a JWT carrying one.
///
/// Opaque tokens yield `None`.
#[must_use]
pub fn read_exp_unverified(token: &str) -> Option<i64> {
    decode_payload_unverified::<ExpOnly>(token).ok()?.exp
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn make_token(payload: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).unwrap());
        format!("{header}.{body}.c2ln")
    }

    #[test]
    fn test_decode_payload() {
        let token = make_token(&json!({"sub": "user-123", "exp": 1_700_000_000}));
        let payload: Value = decode_payload_unverified(&token).unwrap();
        assert_eq!(payload["sub"], "user-123");
    }

    #[test]
    fn test_decode_padded_payload() {
        let header = URL_SAFE_NO_PAD.encode(b"{}");
        let token = format!("{header}.eyJhIjoxfQ==.sig");
        let payload: Value = decode_payload_unverified(&token).unwrap();
        assert_eq!(payload["a"], 1);
    }

    #[test]
    fn test_decode_wrong_segment_count() {
        let err = decode_payload_unverified::<Value>("opaque-refresh-token").unwrap_err();
        assert_eq!(err, JwtDecodeError::SegmentCount(1));
    }

    #[test]
    fn test_decode_bad_json() {
        let body = URL_SAFE_NO_PAD.encode(b"not json");
        let err = decode_payload_unverified::<Value>(&format!("a.{body}.c")).unwrap_err();
        assert!(matches!(err, JwtDecodeError::Json(_)));
    }

    #[test]
    fn test_read_exp() {
        let token = make_token(&json!({"exp": 42}));
        assert_eq!(read_exp_unverified(&token), Some(42));
        assert_eq!(read_exp_unverified(&make_token(&json!({"sub": "x"}))), None);
        assert_eq!(read_exp_unverified("opaque"), None);
    }
}
