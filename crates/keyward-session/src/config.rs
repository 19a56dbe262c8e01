//! Client configuration.

use keyward_core::ConfigurationId;
use std::time::Duration;
use url::Url;

/// Default namespace prefix for storage keys and channel names.
pub const DEFAULT_NAMESPACE: &str = "keyward";

/// Renewal fires this long before the earliest token expiry.
pub const RENEWAL_MARGIN: Duration = Duration::from_millis(25_000);

/// How a session is restored when there is no local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestorationMethod {
    /// Hidden iframe with `prompt=none`, reply via `postMessage`.
    #[default]
    Iframe,
    /// Top-level redirect with `prompt=none`.
    FullPageRedirect,
    /// Never attempt silent restoration.
    Disabled,
}

/// Configuration of one OIDC client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub issuer_uri: String,
    pub client_id: String,
    /// Scopes requested in addition to `openid`.
    pub scopes: Vec<String>,
    /// Application root; default post-logout and post-login target.
    pub home_url: Url,
    pub restoration: RestorationMethod,
    /// Fixed silent restoration timeout. Derived from discovery latency when unset.
    pub silent_restoration_timeout: Option<Duration>,
    /// Inactivity after which the user is logged out. No auto-logout when unset.
    pub idle_session_lifetime: Option<Duration>,
    /// Countdown ticks are published during this final window.
    pub auto_logout_warning: Duration,
    pub namespace: String,
    /// Added to every authorization request.
    pub extra_query_params: Vec<(String, String)>,
    pub http_timeout: Duration,
}

impl ClientConfig {
    #[must_use]
    pub fn new(issuer_uri: impl Into<String>, client_id: impl Into<String>, home_url: Url) -> Self {
        Self {
            issuer_uri: issuer_uri.into(),
            client_id: client_id.into(),
            scopes: vec!["profile".to_string()],
            home_url,
            restoration: RestorationMethod::default(),
            silent_restoration_timeout: None,
            idle_session_lifetime: None,
            auto_logout_warning: Duration::from_secs(60),
            namespace: DEFAULT_NAMESPACE.to_string(),
            extra_query_params: Vec::new(),
            http_timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn scopes(mut self, scopes: Vec<impl Into<String>>) -> Self {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn restoration(mut self, method: RestorationMethod) -> Self {
        self.restoration = method;
        self
    }

    #[must_use]
    pub fn silent_restoration_timeout(mut self, timeout: Duration) -> Self {
        self.silent_restoration_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn idle_session_lifetime(mut self, lifetime: Duration) -> Self {
        self.idle_session_lifetime = Some(lifetime);
        self
    }

    #[must_use]
    pub fn auto_logout_warning(mut self, window: Duration) -> Self {
        self.auto_logout_warning = window;
        self
    }

    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    #[must_use]
    pub fn extra_query_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_query_params.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn configuration_id(&self) -> ConfigurationId {
        ConfigurationId::new(&self.issuer_uri, &self.client_id)
    }

    /// Space separated scope parameter, always starting with `openid`.
    #[must_use]
    pub fn scope_param(&self) -> String {
        let mut scopes = vec!["openid"];
        scopes.extend(
            self.scopes
                .iter()
                .map(String::as_str)
                .filter(|s| *s != "openid"),
        );
        scopes.join(" ")
    }
}
