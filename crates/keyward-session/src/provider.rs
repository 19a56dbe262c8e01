//! Authorization server client: discovery, token endpoint, end-session URL.

use crate::error::{ClientError, ClientResult};
use keyward_core::TokenEndpointResponse;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use url::Url;

const WELL_KNOWN_PATH: &str = "/.well-known/openid-configuration";

/// Bounds of the derived silent restoration timeout.
pub(crate) const MIN_SILENT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_SILENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Subset of the OpenID Provider Metadata the engine uses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
}

/// A discovery document and how long it took to fetch.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub metadata: ProviderMetadata,
    pub latency: Duration,
}

impl Discovery {
    /// `5s + 4 × latency`, clamped to `[5s, 30s]`.
    #[must_use]
    pub fn silent_restoration_timeout(&self) -> Duration {
        (MIN_SILENT_TIMEOUT + self.latency * 4).clamp(MIN_SILENT_TIMEOUT, MAX_SILENT_TIMEOUT)
    }
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Well-known discovery URL for an issuer.
#[must_use]
pub fn well_known_url(issuer_uri: &str) -> String {
    format!("{}{WELL_KNOWN_PATH}", issuer_uri.trim_end_matches('/'))
}

/// Stateless client for one authorization server.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    issuer_uri: String,
}

impl ProviderClient {
    pub fn new(issuer_uri: impl Into<String>, timeout: Duration) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Unreachable {
                url: String::new(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self::with_http_client(issuer_uri, http))
    }

    #[must_use]
    pub fn with_http_client(issuer_uri: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            http,
            issuer_uri: issuer_uri.into(),
        }
    }

    #[must_use]
    pub fn issuer_uri(&self) -> &str {
        &self.issuer_uri
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Fetch the discovery document, measuring the round trip.
    #[instrument(skip(self), fields(issuer = %self.issuer_uri))]
    pub async fn discover(&self) -> ClientResult<Discovery> {
        let url = well_known_url(&self.issuer_uri);
        let started = Instant::now();

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| unreachable(&url, &e))?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, status = status.as_u16(), "discovery endpoint returned an error");
            return Err(ClientError::DiscoveryStatus {
                url,
                status: status.as_u16(),
            });
        }

        let metadata: ProviderMetadata =
            response
                .json()
                .await
                .map_err(|e| ClientError::InvalidDiscovery {
                    url: url.clone(),
                    message: e.to_string(),
                })?;
        let latency = started.elapsed();

        if metadata.issuer.trim_end_matches('/') != self.issuer_uri.trim_end_matches('/') {
            warn!(
                configured = %self.issuer_uri,
                advertised = %metadata.issuer,
                "discovery document advertises a different issuer"
            );
        }

        debug!(latency_ms = latency.as_millis() as u64, "discovery complete");
        Ok(Discovery { metadata, latency })
    }

    /// Authorization code grant with PKCE.
    #[instrument(skip_all)]
    pub async fn exchange_code(
        &self,
        metadata: &ProviderMetadata,
        client_id: &str,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> ClientResult<TokenEndpointResponse> {
        let params = [
            ("grant_type", "authorization_code"),
            ("client_id", client_id),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", code_verifier),
        ];
        self.token_request(&metadata.token_endpoint, &params).await
    }

    /// Refresh token grant.
    #[instrument(skip_all)]
    pub async fn refresh(
        &self,
        metadata: &ProviderMetadata,
        client_id: &str,
        refresh_token: &str,
    ) -> ClientResult<TokenEndpointResponse> {
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", client_id),
            ("refresh_token", refresh_token),
        ];
        self.token_request(&metadata.token_endpoint, &params).await
    }

    async fn token_request(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> ClientResult<TokenEndpointResponse> {
        let response = self
            .http
            .post(endpoint)
            .form(params)
            .send()
            .await
            .map_err(|e| unreachable(endpoint, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (error, description) = match serde_json::from_str::<OAuthErrorBody>(&body) {
                Ok(parsed) => (parsed.error, parsed.error_description),
                Err(_) => (format!("http_{}", status.as_u16()), None),
            };
            warn!(status = status.as_u16(), error = %error, "token endpoint rejected request");
            return Err(ClientError::TokenEndpoint {
                status: status.as_u16(),
                error,
                description,
            });
        }

        response
            .json::<TokenEndpointResponse>()
            .await
            .map_err(|e| ClientError::InvalidTokenResponse(e.to_string()))
    }

    /// RP-initiated logout URL, or `None` when the provider has no end-session endpoint.
    pub fn end_session_url(
        metadata: &ProviderMetadata,
        id_token: &str,
        client_id: &str,
        post_logout_redirect_uri: &Url,
    ) -> ClientResult<Option<Url>> {
        let Some(endpoint) = &metadata.end_session_endpoint else {
            return Ok(None);
        };
        let mut url = Url::parse(endpoint)?;
        url.query_pairs_mut()
            .append_pair("id_token_hint", id_token)
            .append_pair("client_id", client_id)
            .append_pair("post_logout_redirect_uri", post_logout_redirect_uri.as_str());
        Ok(Some(url))
    }
}

fn unreachable(url: &str, err: &reqwest::Error) -> ClientError {
    ClientError::Unreachable {
        url: url.to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn metadata(base: &str) -> ProviderMetadata {
        ProviderMetadata {
            issuer: base.to_string(),
            authorization_endpoint: format!("{base}/auth"),
            token_endpoint: format!("{base}/token"),
            end_session_endpoint: Some(format!("{base}/logout")),
            jwks_uri: None,
        }
    }

    fn client(issuer: &str) -> ProviderClient {
        ProviderClient::new(issuer, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_well_known_url_trims_trailing_slash() {
        assert_eq!(
            well_known_url("https://idp.example.com/realms/demo/"),
            "https://idp.example.com/realms/demo/.well-known/openid-configuration"
        );
    }

    #[test]
    fn test_silent_timeout_is_clamped() {
        let metadata = metadata("https://idp.example.com");
        let timeout = |ms| {
            Discovery {
                metadata: metadata.clone(),
                latency: Duration::from_millis(ms),
            }
            .silent_restoration_timeout()
        };
        assert_eq!(timeout(0), Duration::from_secs(5));
        assert_eq!(timeout(500), Duration::from_secs(7));
        assert_eq!(timeout(20_000), Duration::from_secs(30));
    }

    #[test]
    fn test_end_session_url() {
        let metadata = metadata("https://idp.example.com");
        let target = Url::parse("https://app.example.com/bye?x=1").unwrap();
        let url = ProviderClient::end_session_url(&metadata, "id.token.jwt", "spa", &target)
            .unwrap()
            .unwrap();

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(url.path(), "/logout");
        assert!(pairs.contains(&("id_token_hint".into(), "id.token.jwt".into())));
        assert!(pairs.contains(&("client_id".into(), "spa".into())));
        assert!(pairs.contains(&(
            "post_logout_redirect_uri".into(),
            "https://app.example.com/bye?x=1".into()
        )));

        let mut without = metadata;
        without.end_session_endpoint = None;
        assert!(ProviderClient::end_session_url(&without, "t", "spa", &target)
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_discover() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "issuer": server.uri(),
                "authorization_endpoint": format!("{}/auth", server.uri()),
                "token_endpoint": format!("{}/token", server.uri()),
            })))
            .mount(&server)
            .await;

        let discovery = client(&server.uri()).discover().await.unwrap();
        assert_eq!(discovery.metadata.token_endpoint, format!("{}/token", server.uri()));
        assert!(discovery.metadata.end_session_endpoint.is_none());
    }

    #[tokio::test]
    async fn test_discover_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server.uri()).discover().await.unwrap_err();
        assert!(matches!(err, ClientError::DiscoveryStatus { status: 503, .. }));
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_refresh_sends_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-2",
                "expires_in": 300,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = client(&server.uri())
            .refresh(&metadata(&server.uri()), "spa", "rt-1")
            .await
            .unwrap();
        assert_eq!(response.access_token, "at-2");
        assert_eq!(response.expires_in, Some(300));
    }

    #[tokio::test]
    async fn test_token_endpoint_oauth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Code not valid",
            })))
            .mount(&server)
            .await;

        let err = client(&server.uri())
            .exchange_code(&metadata(&server.uri()), "spa", "c", "https://app/", "v")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ClientError::TokenEndpoint {
                status: 400,
                error: "invalid_grant".into(),
                description: Some("Code not valid".into()),
            }
        );
    }
}
