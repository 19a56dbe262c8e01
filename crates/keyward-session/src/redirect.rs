//! Authorization redirects.
//!
//! Before leaving for the authorization endpoint the engine saves a
//! [`RedirectContext`] in session storage under the `state` value; the
//! bootstrapper consumes it when the browser comes back.

use crate::config::ClientConfig;
use crate::error::ClientResult;
use crate::host::KeyValueStore;
use crate::keys;
use crate::pkce::{code_challenge, generate_code_verifier, generate_state};
use crate::provider::ProviderMetadata;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Why the browser was sent to the authorization endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectKind {
    /// Interactive login requested by the application.
    Login,
    /// `prompt=none` restoration.
    SilentRestore,
    /// Renewal failed; the user has to authenticate again.
    ForcedRelogin,
}

/// What the engine needs to finish an authorization round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectContext {
    pub kind: RedirectKind,
    pub code_verifier: String,
    pub redirect_uri: String,
}

impl RedirectContext {
    pub(crate) fn save(&self, storage: &dyn KeyValueStore, namespace: &str, state: &str) {
        match serde_json::to_string(self) {
            Ok(json) => storage.set(&keys::redirect_context(namespace, state), &json),
            Err(e) => tracing::error!(error = %e, "failed to serialize redirect context"),
        }
    }

    /// Whether a context is waiting for `state` in this page's storage.
    pub(crate) fn is_pending(storage: &dyn KeyValueStore, namespace: &str, state: &str) -> bool {
        storage.get(&keys::redirect_context(namespace, state)).is_some()
    }

    /// Read and delete the context saved for `state`.
    ///
    /// `None` when it was already consumed (back button, reload) or never existed.
    pub(crate) fn take(storage: &dyn KeyValueStore, namespace: &str, state: &str) -> Option<Self> {
        let key = keys::redirect_context(namespace, state);
        let raw = storage.get(&key)?;
        storage.remove(&key);
        serde_json::from_str(&raw).ok()
    }
}

/// Rewrites the authorization URL right before navigation.
pub type UrlTransform = Arc<dyn Fn(Url) -> Url + Send + Sync>;

/// Options of an interactive login.
#[derive(Clone, Default)]
pub struct LoginParams {
    /// Where the user lands after login. Defaults to the current page.
    pub redirect_target: Option<Url>,
    pub extra_query_params: Vec<(String, String)>,
    /// Applied last, after every parameter is set.
    pub transform_url: Option<UrlTransform>,
}

impl LoginParams {
    #[must_use]
    pub fn redirect_to(mut self, target: Url) -> Self {
        self.redirect_target = Some(target);
        self
    }

    #[must_use]
    pub fn query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_query_params.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn transform_url(mut self, transform: impl Fn(Url) -> Url + Send + Sync + 'static) -> Self {
        self.transform_url = Some(Arc::new(transform));
        self
    }
}

impl fmt::Debug for LoginParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginParams")
            .field("redirect_target", &self.redirect_target)
            .field("extra_query_params", &self.extra_query_params)
            .field("transform_url", &self.transform_url.is_some())
            .finish()
    }
}

/// A prepared authorization request.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: Url,
    pub state: String,
    pub context: RedirectContext,
}

/// Build the authorization URL for `kind`, landing on `redirect_uri`.
pub fn authorization_request(
    config: &ClientConfig,
    metadata: &ProviderMetadata,
    kind: RedirectKind,
    redirect_uri: &Url,
    params: &LoginParams,
) -> ClientResult<AuthorizationRequest> {
    let config_id = config.configuration_id();
    let state = generate_state(&config_id);
    let code_verifier = generate_code_verifier();

    let mut url = Url::parse(&metadata.authorization_endpoint)?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", redirect_uri.as_str())
            .append_pair("scope", &config.scope_param())
            .append_pair("state", &state)
            .append_pair("code_challenge", &code_challenge(&code_verifier))
            .append_pair("code_challenge_method", "S256");
        if kind == RedirectKind::SilentRestore {
            query.append_pair("prompt", "none");
        }
        for (name, value) in config
            .extra_query_params
            .iter()
            .chain(params.extra_query_params.iter())
        {
            query.append_pair(name, value);
        }
    }
    if let Some(transform) = &params.transform_url {
        url = transform(url);
    }

    debug!(kind = ?kind, "prepared authorization request");
    Ok(AuthorizationRequest {
        url,
        state,
        context: RedirectContext {
            kind,
            code_verifier,
            redirect_uri: redirect_uri.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use crate::pkce::configuration_of_state;

    fn setup() -> (ClientConfig, ProviderMetadata) {
        let config = ClientConfig::new(
            "https://idp.example.com/realms/demo",
            "spa",
            Url::parse("https://app.example.com/").unwrap(),
        )
        .extra_query_param("ui_locales", "fr");
        let metadata = ProviderMetadata {
            issuer: config.issuer_uri.clone(),
            authorization_endpoint: "https://idp.example.com/realms/demo/protocol/openid-connect/auth"
                .into(),
            token_endpoint: "https://idp.example.com/realms/demo/protocol/openid-connect/token"
                .into(),
            end_session_endpoint: None,
            jwks_uri: None,
        };
        (config, metadata)
    }

    fn query(url: &Url, name: &str) -> Option<String> {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn test_login_request() {
        let (config, metadata) = setup();
        let target = Url::parse("https://app.example.com/orders?tab=open").unwrap();
        let params = LoginParams::default().query_param("kc_idp_hint", "google");

        let request =
            authorization_request(&config, &metadata, RedirectKind::Login, &target, &params)
                .unwrap();

        assert_eq!(query(&request.url, "response_type").as_deref(), Some("code"));
        assert_eq!(query(&request.url, "client_id").as_deref(), Some("spa"));
        assert_eq!(
            query(&request.url, "redirect_uri").as_deref(),
            Some("https://app.example.com/orders?tab=open")
        );
        assert_eq!(query(&request.url, "scope").as_deref(), Some("openid profile"));
        assert_eq!(query(&request.url, "code_challenge_method").as_deref(), Some("S256"));
        assert_eq!(
            query(&request.url, "code_challenge"),
            Some(code_challenge(&request.context.code_verifier))
        );
        assert_eq!(query(&request.url, "ui_locales").as_deref(), Some("fr"));
        assert_eq!(query(&request.url, "kc_idp_hint").as_deref(), Some("google"));
        assert_eq!(query(&request.url, "prompt"), None);
        assert_eq!(
            configuration_of_state(&request.state),
            Some(config.configuration_id())
        );
    }

    #[test]
    fn test_silent_request_uses_prompt_none() {
        let (config, metadata) = setup();
        let request = authorization_request(
            &config,
            &metadata,
            RedirectKind::SilentRestore,
            &config.home_url,
            &LoginParams::default(),
        )
        .unwrap();
        assert_eq!(query(&request.url, "prompt").as_deref(), Some("none"));
    }

    #[test]
    fn test_transform_url_runs_last() {
        let (config, metadata) = setup();
        let params = LoginParams::default().transform_url(|mut url| {
            url.set_host(Some("login.example.com")).unwrap();
            url
        });
        let request = authorization_request(
            &config,
            &metadata,
            RedirectKind::Login,
            &config.home_url,
            &params,
        )
        .unwrap();

        assert_eq!(request.url.host_str(), Some("login.example.com"));
        assert!(query(&request.url, "state").is_some());
    }

    #[test]
    fn test_redirect_context_is_consumed_once() {
        let storage = MemoryStorage::new();
        let context = RedirectContext {
            kind: RedirectKind::Login,
            code_verifier: "v".into(),
            redirect_uri: "https://app.example.com/".into(),
        };
        context.save(&storage, "keyward", "ks.abc.def");

        assert_eq!(
            RedirectContext::take(&storage, "keyward", "ks.abc.def"),
            Some(context)
        );
        assert_eq!(RedirectContext::take(&storage, "keyward", "ks.abc.def"), None);
    }
}
