//! Extraction of the per-request authentication context from HTTP parts.

use crate::error::TokenValidationError;
use http::{header, HeaderMap, Method, Uri};

/// Authorization scheme the token was presented with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Bearer,
    DPoP,
}

impl AuthScheme {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::Bearer => "Bearer",
            AuthScheme::DPoP => "DPoP",
        }
    }
}

/// How to reconstruct the externally visible request URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTrust {
    /// Honor `Forwarded` / `X-Forwarded-Proto` / `X-Forwarded-Host`.
    /// Only enable behind a reverse proxy that overwrites these headers.
    pub trust_forwarded_headers: bool,
    /// Scheme assumed when neither the URI nor a trusted proxy header says.
    pub default_scheme: String,
}

impl Default for ProxyTrust {
    fn default() -> Self {
        Self {
            trust_forwarded_headers: false,
            default_scheme: "https".to_string(),
        }
    }
}

impl ProxyTrust {
    #[must_use]
    pub fn trusted() -> Self {
        Self {
            trust_forwarded_headers: true,
            ..Default::default()
        }
    }
}

/// Everything the verifier needs from one inbound request.
///
/// Built per request, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAuthContext {
    pub scheme: AuthScheme,
    pub access_token: String,
    /// Value of the `DPoP` header.
    pub dpop_proof: Option<String>,
    /// Externally visible request URL (for `htu`).
    pub expected_htu: Option<String>,
    /// Request method (for `htm`).
    pub expected_htm: Option<String>,
}

impl RequestAuthContext {
    /// Context for a plain bearer token.
    #[must_use]
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            scheme: AuthScheme::Bearer,
            access_token: access_token.into(),
            dpop_proof: None,
            expected_htu: None,
            expected_htm: None,
        }
    }

    /// Context for a DPoP-bound token.
    #[must_use]
    pub fn dpop(
        access_token: impl Into<String>,
        proof: Option<String>,
        htm: impl Into<String>,
        htu: impl Into<String>,
    ) -> Self {
        Self {
            scheme: AuthScheme::DPoP,
            access_token: access_token.into(),
            dpop_proof: proof,
            expected_htu: Some(htu.into()),
            expected_htm: Some(htm.into()),
        }
    }

    /// Parse `Authorization` and `DPoP` headers.
    ///
    /// # Errors
    ///
    /// - `MissingToken` when there is no `Authorization` header with a
    ///   supported scheme
    /// - `DpopViolation` when more than one `DPoP` header is present
    pub fn from_parts(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        proxy: &ProxyTrust,
    ) -> Result<Self, TokenValidationError> {
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                TokenValidationError::MissingToken("no Authorization header".to_string())
            })?;

        let (scheme, token) = parse_authorization(authorization)?;

        let mut proofs = headers.get_all("dpop").iter();
        let dpop_proof = match (proofs.next(), proofs.next()) {
            (None, _) => None,
            (Some(value), None) => Some(
                value
                    .to_str()
                    .map_err(|_| {
                        TokenValidationError::DpopViolation("DPoP header is not ASCII".to_string())
                    })?
                    .trim()
                    .to_string(),
            ),
            (Some(_), Some(_)) => {
                return Err(TokenValidationError::DpopViolation(
                    "more than one DPoP header".to_string(),
                ))
            }
        };

        Ok(Self {
            scheme,
            access_token: token.to_string(),
            dpop_proof,
            expected_htu: external_url(uri, headers, proxy),
            expected_htm: Some(method.as_str().to_string()),
        })
    }
}

fn parse_authorization(value: &str) -> Result<(AuthScheme, &str), TokenValidationError> {
    let (scheme, token) = value.trim().split_once(' ').ok_or_else(|| {
        TokenValidationError::MissingToken("Authorization header has no credentials".to_string())
    })?;

    let scheme = if scheme.eq_ignore_ascii_case("bearer") {
        AuthScheme::Bearer
    } else if scheme.eq_ignore_ascii_case("dpop") {
        AuthScheme::DPoP
    } else {
        return Err(TokenValidationError::MissingToken(format!(
            "unsupported authorization scheme '{scheme}'"
        )));
    };

    let token = token.trim();
    if token.is_empty() {
        return Err(TokenValidationError::MissingToken(
            "empty access token".to_string(),
        ));
    }
    Ok((scheme, token))
}

/// Rebuild `scheme://host/path` as seen by the client.
fn external_url(uri: &Uri, headers: &HeaderMap, proxy: &ProxyTrust) -> Option<String> {
    let mut scheme = uri.scheme_str().map(str::to_string);
    let mut host = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| header_str(headers, header::HOST.as_str()).map(str::to_string));

    if proxy.trust_forwarded_headers {
        let (fwd_proto, fwd_host) = forwarded_proto_and_host(headers);
        if let Some(proto) = fwd_proto.or_else(|| first_value(headers, "x-forwarded-proto")) {
            scheme = Some(proto);
        }
        if let Some(h) = fwd_host.or_else(|| first_value(headers, "x-forwarded-host")) {
            host = Some(h);
        }
    }

    let scheme = scheme.unwrap_or_else(|| proxy.default_scheme.clone());
    let host = host?;
    Some(format!("{}://{}{}", scheme.to_ascii_lowercase(), host, uri.path()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn first_value(headers: &HeaderMap, name: &str) -> Option<String> {
    header_str(headers, name)
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `proto` and `host` of the first element of an RFC 7239 `Forwarded` header.
fn forwarded_proto_and_host(headers: &HeaderMap) -> (Option<String>, Option<String>) {
    let Some(first) = header_str(headers, "forwarded").and_then(|v| v.split(',').next()) else {
        return (None, None);
    };

    let mut proto = None;
    let mut host = None;
    for pair in first.split(';') {
        let Some((key, value)) = pair.trim().split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "proto" => proto = Some(value),
            "host" => host = Some(value),
            _ => {}
        }
    }
    (proto, host)
}
