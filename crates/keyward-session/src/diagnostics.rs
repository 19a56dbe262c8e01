//! Explain why a session could not be established.
//!
//! Runs only after something failed, so it may spend a few extra requests.
//! The checks go from "is the server there at all" to "is the client
//! registered correctly", and the first conclusive one wins.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::provider::{well_known_url, ProviderClient, ProviderMetadata};
use keyward_core::InitializationError;
use reqwest::header::{HeaderMap, CONTENT_SECURITY_POLICY, X_FRAME_OPTIONS};
use tracing::{debug, instrument};
use url::Url;

/// What failed before diagnostics were requested.
#[derive(Debug, Clone)]
pub enum FailureContext {
    Discovery(ClientError),
    TokenEndpoint(ClientError),
    /// The hidden frame never answered.
    SilentRestorationTimeout {
        authorization_url: Url,
        redirect_uri: Url,
    },
}

enum Fetched {
    Reachable { status: u16, headers: HeaderMap, body: String },
    Unreachable(String),
}

async fn fetch(http: &reqwest::Client, url: &str) -> Fetched {
    match http.get(url).send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            Fetched::Reachable { status, headers, body }
        }
        Err(e) => Fetched::Unreachable(e.to_string()),
    }
}

fn is_discovery_document(status: u16, body: &str) -> bool {
    (200..300).contains(&status) && serde_json::from_str::<ProviderMetadata>(body).is_ok()
}

/// Produce the error reported to the application.
#[instrument(skip_all)]
pub async fn diagnose(
    provider: &ProviderClient,
    config: &ClientConfig,
    failure: &FailureContext,
) -> InitializationError {
    debug!(failure = ?failure, "running diagnostics");

    if let Some(error) = check_discovery(provider, &config.issuer_uri).await {
        return error;
    }

    if let FailureContext::SilentRestorationTimeout {
        authorization_url,
        redirect_uri,
    } = failure
    {
        if let Fetched::Reachable { headers, .. } = fetch(provider.http(), redirect_uri.as_str()).await {
            if let Some(problem) = framing_problem(&headers, redirect_uri, authorization_url) {
                return InitializationError::misconfiguration(problem);
            }
        }
        if let Some(problem) = check_authorization_framing(config, authorization_url, redirect_uri).await {
            return InitializationError::misconfiguration(problem);
        }
    }

    let redirect_uri = match failure {
        FailureContext::SilentRestorationTimeout { redirect_uri, .. } => redirect_uri,
        _ => &config.home_url,
    };
    InitializationError::misconfiguration(checklist(config, redirect_uri, failure))
}

async fn check_discovery(provider: &ProviderClient, issuer_uri: &str) -> Option<InitializationError> {
    let url = well_known_url(issuer_uri);
    let reason = match fetch(provider.http(), &url).await {
        Fetched::Reachable { status, body, .. } if is_discovery_document(status, &body) => return None,
        Fetched::Reachable { status, .. } => format!("HTTP {status}"),
        Fetched::Unreachable(message) => message,
    };

    for candidate in sibling_issuers(issuer_uri) {
        if let Fetched::Reachable { status, body, .. } =
            fetch(provider.http(), &well_known_url(&candidate)).await
        {
            if is_discovery_document(status, &body) {
                return Some(InitializationError::misconfiguration(format!(
                    "The issuer URI {issuer_uri} is wrong: {url} answered {reason}. \
                     A provider was found at {candidate}; did you mean that issuer URI?"
                )));
            }
        }
    }

    let down = reason
        .strip_prefix("HTTP ")
        .and_then(|status| status.parse::<u16>().ok())
        .map_or(true, |status| status >= 500);
    Some(if down {
        InitializationError::auth_server_down(format!(
            "The OpenID discovery endpoint {url} could not be reached ({reason}). \
             Either the authorization server is down or the issuer URI {issuer_uri} is wrong."
        ))
    } else {
        InitializationError::misconfiguration(format!(
            "The OpenID discovery endpoint {url} answered {reason}. \
             The issuer URI {issuer_uri} does not look like a valid OIDC issuer."
        ))
    })
}

/// Keycloak realm URLs with the legacy `/auth` prefix toggled.
fn sibling_issuers(issuer_uri: &str) -> Vec<String> {
    let Ok(url) = Url::parse(issuer_uri) else {
        return Vec::new();
    };
    let path = url.path().trim_end_matches('/');
    let toggled = if let Some(rest) = path.strip_prefix("/auth/realms/") {
        format!("/realms/{rest}")
    } else if let Some(rest) = path.strip_prefix("/realms/") {
        format!("/auth/realms/{rest}")
    } else {
        return Vec::new();
    };
    let mut sibling = url.clone();
    sibling.set_path(&toggled);
    vec![sibling.as_str().trim_end_matches('/').to_string()]
}

/// One `Content-Security-Policy` header, parsed into directives.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Policy {
    directives: Vec<(String, Vec<String>)>,
}

impl Policy {
    fn parse(header: &str) -> Self {
        let directives = header
            .split(';')
            .filter_map(|directive| {
                let mut tokens = directive.split_whitespace();
                let name = tokens.next()?.to_ascii_lowercase();
                Some((name, tokens.map(str::to_string).collect()))
            })
            .collect();
        Self { directives }
    }

    fn directive(&self, name: &str) -> Option<&[String]> {
        self.directives
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, sources)| sources.as_slice())
    }

    /// First present directive among `names`, with its name.
    fn effective<'a>(&'a self, names: &[&'a str]) -> Option<(&'a str, &'a [String])> {
        names
            .iter()
            .find_map(|name| self.directive(name).map(|sources| (*name, sources)))
    }
}

/// Whether one CSP source expression allows `target`.
fn source_allows(source: &str, target: &Url, self_origin: &Url) -> bool {
    let source = source.trim();
    match source.to_ascii_lowercase().as_str() {
        "*" => return matches!(target.scheme(), "http" | "https"),
        "'none'" => return false,
        "'self'" => return target.origin() == self_origin.origin(),
        s if s.starts_with('\'') => return false,
        s if s.ends_with(':') && !s.contains('/') => {
            let scheme = &s[..s.len() - 1];
            return scheme == target.scheme() || (scheme == "http" && target.scheme() == "https");
        }
        _ => {}
    }

    let (scheme, rest) = match source.split_once("://") {
        Some((scheme, rest)) => (Some(scheme.to_ascii_lowercase()), rest),
        None => (None, source),
    };
    if let Some(scheme) = &scheme {
        let upgraded = scheme == "http" && target.scheme() == "https";
        if scheme != target.scheme() && !upgraded {
            return false;
        }
    } else if target.scheme() != self_origin.scheme()
        && !(self_origin.scheme() == "http" && target.scheme() == "https")
    {
        return false;
    }

    let host_port = rest.split('/').next().unwrap_or_default();
    let (host, port) = match host_port.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (host_port, None),
    };
    let Some(target_host) = target.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    let host_matches = match host.strip_prefix("*.") {
        Some(suffix) => target_host
            .strip_suffix(suffix)
            .is_some_and(|prefix| prefix.ends_with('.') && prefix.len() > 1),
        None => host == "*" || host == target_host,
    };
    if !host_matches {
        return false;
    }

    match port {
        Some("*") => true,
        Some(port) => port.parse::<u16>().ok() == target.port_or_known_default(),
        None => target.port().is_none(),
    }
}

fn sources_allow(sources: &[String], target: &Url, self_origin: &Url) -> bool {
    sources.iter().any(|s| source_allows(s, target, self_origin))
}

fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Why the redirect page cannot run inside the hidden frame, if it cannot.
///
/// `headers` are the redirect page's response headers; it is both the
/// framing parent (its `frame-src` must allow the authorization server) and
/// the framed document (its `frame-ancestors` must allow itself).
fn framing_problem(headers: &HeaderMap, redirect_uri: &Url, authorization_url: &Url) -> Option<String> {
    if let Some(value) = headers.get(X_FRAME_OPTIONS).and_then(|v| v.to_str().ok()) {
        if value.trim().eq_ignore_ascii_case("deny") {
            return Some(format!(
                "The page at {redirect_uri} is served with `X-Frame-Options: DENY`, so it cannot \
                 load in the hidden iframe used for silent session restoration. \
                 Serve it with `X-Frame-Options: SAMEORIGIN` instead."
            ));
        }
    }

    let policies: Vec<Policy> = headers
        .get_all(CONTENT_SECURITY_POLICY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(Policy::parse)
        .collect();

    for policy in &policies {
        if let Some((name, sources)) = policy.effective(&["frame-src", "child-src", "default-src"]) {
            if !sources_allow(sources, authorization_url, redirect_uri) {
                let auth_origin = origin_of(authorization_url);
                let mut fixed: Vec<&str> = sources
                    .iter()
                    .map(String::as_str)
                    .filter(|s| *s != "'none'")
                    .collect();
                fixed.push(&auth_origin);
                return Some(format!(
                    "The Content-Security-Policy of {redirect_uri} blocks {auth_origin} in \
                     iframes (`{name} {current}`). Add `frame-src {fixed}`.",
                    current = sources.join(" "),
                    fixed = fixed.join(" "),
                ));
            }
        }
        if let Some(sources) = policy.directive("frame-ancestors") {
            if !sources_allow(sources, redirect_uri, redirect_uri) {
                return Some(format!(
                    "The Content-Security-Policy of {redirect_uri} forbids framing it in the \
                     application (`frame-ancestors {current}`). Add `frame-ancestors 'self'`.",
                    current = sources.join(" "),
                ));
            }
        }
    }
    None
}

/// Fetch the authorization endpoint itself: it is the first document the
/// hidden frame loads, so its own framing headers must allow the application.
async fn check_authorization_framing(
    config: &ClientConfig,
    authorization_url: &Url,
    app_url: &Url,
) -> Option<String> {
    // Only the first response matters; following it would land on the app.
    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(config.http_timeout)
        .build()
        .ok()?;
    match fetch(&http, authorization_url.as_str()).await {
        Fetched::Reachable { headers, .. } => authorization_framing_problem(&headers, authorization_url, app_url),
        Fetched::Unreachable(message) => {
            debug!(error = %message, "authorization endpoint unreachable");
            None
        }
    }
}

/// Why the authorization endpoint refuses to load inside a frame of `app_url`, if it does.
fn authorization_framing_problem(headers: &HeaderMap, authorization_url: &Url, app_url: &Url) -> Option<String> {
    let auth_origin = origin_of(authorization_url);
    let app_origin = origin_of(app_url);

    if let Some(value) = headers.get(X_FRAME_OPTIONS).and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        let blocked = value.eq_ignore_ascii_case("deny")
            || (value.eq_ignore_ascii_case("sameorigin") && auth_origin != app_origin);
        if blocked {
            return Some(format!(
                "The authorization server at {auth_origin} is served with `X-Frame-Options: {value}`, \
                 so {app_origin} cannot load it in the hidden iframe used for silent session \
                 restoration. Allow {app_origin} with `Content-Security-Policy: frame-ancestors \
                 'self' {app_origin}` on the authorization server, or use full-page redirect restoration."
            ));
        }
    }

    for value in headers.get_all(CONTENT_SECURITY_POLICY).iter().filter_map(|v| v.to_str().ok()) {
        let policy = Policy::parse(value);
        if let Some(sources) = policy.directive("frame-ancestors") {
            if !sources_allow(sources, app_url, authorization_url) {
                return Some(format!(
                    "The Content-Security-Policy of the authorization server at {auth_origin} \
                     forbids framing by {app_origin} (`frame-ancestors {current}`). Add {app_origin} \
                     to its `frame-ancestors`, or use full-page redirect restoration.",
                    current = sources.join(" "),
                ));
            }
        }
    }
    None
}

/// Keycloak realm name of an issuer URI, if it looks like one.
fn keycloak_realm(issuer_uri: &str) -> Option<String> {
    let url = Url::parse(issuer_uri).ok()?;
    let mut segments = url.path_segments()?;
    segments.find(|s| *s == "realms")?;
    segments.next().filter(|s| !s.is_empty()).map(str::to_string)
}

fn checklist(config: &ClientConfig, redirect_uri: &Url, failure: &FailureContext) -> String {
    let headline = match failure {
        FailureContext::SilentRestorationTimeout { .. } => {
            "Silent session restoration did not complete in time."
        }
        FailureContext::TokenEndpoint(_) => "The token endpoint could not be reached from the application.",
        FailureContext::Discovery(_) => "The session could not be established.",
    };
    let origin = origin_of(redirect_uri);
    let client_id = &config.client_id;

    match keycloak_realm(&config.issuer_uri) {
        Some(realm) => format!(
            "{headline} In the Keycloak admin console, realm \"{realm}\", open Clients > \"{client_id}\" and check that:\n\
             - the client exists and \"Client authentication\" is off (public client)\n\
             - \"Standard flow\" is enabled\n\
             - \"Valid redirect URIs\" contains {origin}/*\n\
             - \"Valid post logout redirect URIs\" contains {origin}/*\n\
             - \"Web origins\" contains {origin}"
        ),
        None => format!(
            "{headline} Check the client registration at {issuer}:\n\
             - client \"{client_id}\" exists and is a public client using the authorization code flow with PKCE\n\
             - {redirect_uri} is an allowed redirect URI\n\
             - {origin} is an allowed origin for cross-origin requests",
            issuer = config.issuer_uri,
        ),
    }
}
