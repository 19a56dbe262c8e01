//! Sessions handed to the application.

use crate::callback::{strip_callback_params, CallbackOutcome};
use crate::config::{ClientConfig, RestorationMethod};
use crate::context::ClientContext;
use crate::cross_tab::activity::ActivityTracker;
use crate::cross_tab::{countdown, login, logout};
use crate::error::{ClientError, ClientResult};
use crate::host::Host;
use crate::inflight::Participation;
use crate::keys;
use crate::provider::{ProviderClient, ProviderMetadata, MIN_SILENT_TIMEOUT};
use crate::redirect::{authorization_request, LoginParams, RedirectKind};
use crate::renewal;
use crate::silent;
use chrono::Utc;
use keyward_core::{
    ConfigurationId, IdTokenClaims, InitializationError, TokenEndpointResponse, TokenSet,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

/// Where the browser goes after logout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "redirectTo", rename_all = "snake_case")]
pub enum LogoutRedirect {
    Home,
    CurrentPage,
    SpecificUrl { url: String },
}

/// Whether a logout started here or was received from another tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogoutOrigin {
    Local,
    Propagated,
}

/// The outcome of bootstrapping.
#[derive(Debug)]
pub enum Session {
    NotLoggedIn(AnonymousSession),
    LoggedIn(LoggedInSession),
}

impl Session {
    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        matches!(self, Self::LoggedIn(_))
    }

    #[must_use]
    pub fn as_logged_in(&self) -> Option<&LoggedInSession> {
        match self {
            Self::LoggedIn(session) => Some(session),
            Self::NotLoggedIn(_) => None,
        }
    }

    #[must_use]
    pub fn as_anonymous(&self) -> Option<&AnonymousSession> {
        match self {
            Self::NotLoggedIn(session) => Some(session),
            Self::LoggedIn(_) => None,
        }
    }
}

/// Everything one configuration needs to talk to its provider.
#[derive(Clone)]
pub(crate) struct ClientParts {
    pub config: Arc<ClientConfig>,
    pub config_id: ConfigurationId,
    pub context: ClientContext,
    pub host: Host,
    pub provider: ProviderClient,
}

impl ClientParts {
    pub(crate) fn persist(&self, tokens: &TokenSet) {
        match serde_json::to_string(tokens) {
            Ok(json) => self.host.session_storage.set(
                &keys::session_marker(&self.config.namespace, &self.config_id),
                &json,
            ),
            Err(e) => error!(error = %e, "failed to persist token set"),
        }
    }

    pub(crate) fn clear_persisted(&self) {
        self.host
            .session_storage
            .remove(&keys::session_marker(&self.config.namespace, &self.config_id));
    }

    pub(crate) fn persisted(&self) -> Option<TokenSet> {
        let key = keys::session_marker(&self.config.namespace, &self.config_id);
        let raw = self.host.session_storage.get(&key)?;
        match serde_json::from_str(&raw) {
            Ok(tokens) => Some(tokens),
            Err(e) => {
                warn!(error = %e, "discarding unreadable persisted session");
                self.host.session_storage.remove(&key);
                None
            }
        }
    }

    /// The current page without authorization response parameters.
    pub(crate) fn current_page(&self) -> Url {
        strip_callback_params(&self.host.navigator.current_url())
    }
}

/// A visitor without tokens.
pub struct AnonymousSession {
    parts: ClientParts,
    metadata: Option<ProviderMetadata>,
    initialization_error: Option<InitializationError>,
}

impl AnonymousSession {
    pub(crate) fn new(
        parts: ClientParts,
        metadata: Option<ProviderMetadata>,
        initialization_error: Option<InitializationError>,
    ) -> Self {
        Self {
            parts,
            metadata,
            initialization_error,
        }
    }

    /// Why restoration failed, when it failed for a reason worth surfacing.
    #[must_use]
    pub fn initialization_error(&self) -> Option<&InitializationError> {
        self.initialization_error.as_ref()
    }

    /// Navigate to the authorization endpoint for an interactive login.
    #[instrument(skip_all, fields(config_id = %self.parts.config_id))]
    pub async fn login(&self, params: LoginParams) -> ClientResult<()> {
        let metadata = match &self.metadata {
            Some(metadata) => metadata.clone(),
            None => self.parts.provider.discover().await?.metadata,
        };
        let target = params
            .redirect_target
            .clone()
            .unwrap_or_else(|| self.parts.current_page());
        let request = authorization_request(
            &self.parts.config,
            &metadata,
            RedirectKind::Login,
            &target,
            &params,
        )?;
        request.context.save(
            self.parts.host.session_storage.as_ref(),
            &self.parts.config.namespace,
            &request.state,
        );
        info!("redirecting to the authorization endpoint");
        self.parts.host.navigator.redirect(&request.url);
        Ok(())
    }

    /// Resolves when another tab completes an interactive login for this configuration.
    pub async fn wait_for_login_in_other_tab(&self) {
        login::wait_for_login(
            self.parts.host.broadcast.as_ref(),
            &self.parts.config.namespace,
            &self.parts.config_id,
            self.parts.context.app_instance_id(),
        )
        .await;
    }
}

impl fmt::Debug for AnonymousSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnonymousSession")
            .field("config_id", &self.parts.config_id)
            .field("initialization_error", &self.initialization_error)
            .finish_non_exhaustive()
    }
}

/// State shared by a logged-in session and its background tasks.
pub(crate) struct SessionCore {
    parts: ClientParts,
    metadata: ProviderMetadata,
    tokens: watch::Sender<Arc<TokenSet>>,
    ended: AtomicBool,
}

impl SessionCore {
    pub(crate) fn new(parts: ClientParts, metadata: ProviderMetadata, tokens: Arc<TokenSet>) -> Self {
        let (tokens, _) = watch::channel(tokens);
        Self {
            parts,
            metadata,
            tokens,
            ended: AtomicBool::new(false),
        }
    }

    pub(crate) fn current_tokens(&self) -> Arc<TokenSet> {
        self.tokens.borrow().clone()
    }

    pub(crate) fn subscribe_tokens(&self) -> watch::Receiver<Arc<TokenSet>> {
        self.tokens.subscribe()
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Current tokens, after any running renewal settles.
    pub(crate) async fn get_tokens(&self) -> Arc<TokenSet> {
        if let Some(pending) = self.parts.context.in_flight().pending(&self.parts.config_id) {
            if let Ok(tokens) = pending.wait().await {
                return tokens;
            }
        }
        let tokens = self.current_tokens();
        if !self.is_ended() && tokens.access_token_expiration_time() <= Utc::now() {
            // The timer can be late after the machine slept.
            if let Ok(renewed) = self.renew_tokens().await {
                return renewed;
            }
        }
        tokens
    }

    /// Refresh now, or join the renewal already running.
    pub(crate) async fn renew_tokens(&self) -> ClientResult<Arc<TokenSet>> {
        if self.is_ended() {
            return Err(ClientError::SessionEnded);
        }
        let guard = match self.parts.context.in_flight().join(&self.parts.config_id) {
            Participation::Follower(pending) => return pending.wait().await,
            Participation::Leader(guard) => guard,
        };

        let outcome = self.refresh_once().await;
        match &outcome {
            Ok(tokens) => {
                self.parts.persist(tokens);
                self.tokens.send_replace(Arc::clone(tokens));
                info!(
                    expires_at = %tokens.access_token_expiration_time(),
                    "tokens renewed"
                );
            }
            Err(e) => {
                error!(error = %e, "token renewal failed, forcing a new login");
                self.force_login();
            }
        }
        guard.complete(outcome.clone());
        outcome
    }

    async fn refresh_once(&self) -> ClientResult<Arc<TokenSet>> {
        let current = self.current_tokens();
        let refresh_token = current
            .refresh_token()
            .filter(|_| current.has_usable_refresh_token(Utc::now()));
        let response = match refresh_token {
            Some(refresh_token) => {
                self.parts
                    .provider
                    .refresh(&self.metadata, &self.parts.config.client_id, refresh_token)
                    .await?
            }
            None if self.parts.config.restoration == RestorationMethod::Iframe => {
                self.renew_in_frame().await?
            }
            None => return Err(ClientError::NoRefreshToken),
        };
        let renewed = TokenSet::from_response(response, Some(&current), Utc::now())?;
        Ok(Arc::new(renewed))
    }

    /// Renewal for providers that issue no refresh token: a `prompt=none`
    /// round trip in a hidden frame, then a code exchange.
    async fn renew_in_frame(&self) -> ClientResult<TokenEndpointResponse> {
        debug!("no usable refresh token, renewing through a hidden frame");
        let timeout = self
            .parts
            .config
            .silent_restoration_timeout
            .unwrap_or(MIN_SILENT_TIMEOUT);
        let round_trip = silent::authorize_in_frame(&self.parts, &self.metadata, timeout).await?;

        match round_trip.reply.map(|callback| callback.outcome) {
            Some(CallbackOutcome::Code { code, .. }) => {
                let context = round_trip.request.context;
                self.parts
                    .provider
                    .exchange_code(
                        &self.metadata,
                        &self.parts.config.client_id,
                        &code,
                        &context.redirect_uri,
                        &context.code_verifier,
                    )
                    .await
            }
            Some(CallbackOutcome::Error { error, .. }) => Err(ClientError::SilentRenewal(error)),
            None => Err(ClientError::SilentRenewal(
                "no answer from the hidden frame".to_string(),
            )),
        }
    }

    /// Send the user back to the authorization endpoint, returning to this page.
    pub(crate) fn force_login(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.parts.clear_persisted();
        let target = self.parts.current_page();
        let request = match authorization_request(
            &self.parts.config,
            &self.metadata,
            RedirectKind::ForcedRelogin,
            &target,
            &LoginParams::default(),
        ) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "cannot build authorization request");
                return;
            }
        };
        request.context.save(
            self.parts.host.session_storage.as_ref(),
            &self.parts.config.namespace,
            &request.state,
        );
        self.parts.host.navigator.redirect(&request.url);
    }

    pub(crate) fn logout(&self, redirect: LogoutRedirect, origin: LogoutOrigin) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.parts.clear_persisted();
        let target = self.resolve(&redirect);

        let url = match origin {
            LogoutOrigin::Local => {
                logout::publish(
                    Arc::clone(&self.parts.host.local_storage),
                    &self.parts.config.namespace,
                    &self.parts.config_id,
                    self.parts.context.app_instance_id(),
                    redirect,
                );
                let tokens = self.current_tokens();
                match ProviderClient::end_session_url(
                    &self.metadata,
                    tokens.id_token(),
                    &self.parts.config.client_id,
                    &target,
                ) {
                    Ok(Some(url)) => url,
                    Ok(None) => target,
                    Err(e) => {
                        warn!(error = %e, "invalid end-session endpoint, skipping provider logout");
                        target
                    }
                }
            }
            // The provider session is already gone.
            LogoutOrigin::Propagated => target,
        };

        info!(origin = ?origin, "logging out");
        self.parts.host.navigator.redirect(&url);
    }

    fn resolve(&self, redirect: &LogoutRedirect) -> Url {
        match redirect {
            LogoutRedirect::Home => self.parts.config.home_url.clone(),
            LogoutRedirect::CurrentPage => self.parts.current_page(),
            LogoutRedirect::SpecificUrl { url } => Url::parse(url).unwrap_or_else(|e| {
                warn!(url = %url, error = %e, "invalid logout target, using home");
                self.parts.config.home_url.clone()
            }),
        }
    }
}

/// A visitor with tokens.
///
/// Dropping it stops renewal, cross-tab listeners and the auto-logout countdown.
pub struct LoggedInSession {
    core: Arc<SessionCore>,
    activity: ActivityTracker,
    countdown: watch::Receiver<Option<u64>>,
    tasks: Vec<JoinHandle<()>>,
}

impl LoggedInSession {
    /// Start the background tasks of a fresh session.
    pub(crate) fn start(parts: ClientParts, metadata: ProviderMetadata, tokens: Arc<TokenSet>) -> Self {
        parts.persist(&tokens);
        let discriminator = tokens
            .decoded_id_token()
            .sid
            .clone()
            .unwrap_or_else(|| parts.config_id.to_string());
        let core = Arc::new(SessionCore::new(parts, metadata, tokens));
        let parts = &core.parts;
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(renewal::run(Arc::clone(&core))));

        let propagated = Arc::clone(&core);
        tasks.push(tokio::spawn(logout::listen(
            Arc::clone(&parts.host.local_storage),
            parts.host.local_storage.subscribe(),
            keys::logout_propagation(&parts.config.namespace, &parts.config_id),
            parts.context.app_instance_id(),
            move |redirect| propagated.logout(redirect, LogoutOrigin::Propagated),
        )));

        let (activity, tracker_task) = ActivityTracker::spawn(
            Arc::clone(&parts.host.broadcast),
            keys::interaction_tracker_channel(&parts.config.namespace, &discriminator),
            parts.context.app_instance_id(),
        );
        tasks.push(tracker_task);

        let (countdown_tx, countdown_rx) = watch::channel(None);
        if let Some(lifetime) = parts.config.idle_session_lifetime {
            let expiring = Arc::clone(&core);
            tasks.push(tokio::spawn(countdown::run(
                activity.subscribe(),
                lifetime,
                parts.config.auto_logout_warning,
                countdown_tx,
                move || expiring.logout(LogoutRedirect::CurrentPage, LogoutOrigin::Local),
            )));
        }

        Self {
            core,
            activity,
            countdown: countdown_rx,
            tasks,
        }
    }

    #[must_use]
    pub fn configuration_id(&self) -> &ConfigurationId {
        &self.core.parts.config_id
    }

    /// Current tokens. Returns the same `Arc` until the next renewal.
    pub async fn get_tokens(&self) -> Arc<TokenSet> {
        self.core.get_tokens().await
    }

    pub async fn get_access_token(&self) -> String {
        self.get_tokens().await.access_token().to_string()
    }

    /// Claims of the current id token.
    #[must_use]
    pub fn decoded_id_token(&self) -> IdTokenClaims {
        self.core.current_tokens().decoded_id_token().clone()
    }

    /// Renew now. Concurrent callers share one network request and its result.
    ///
    /// A failure hands the page over to a forced login.
    pub async fn renew_tokens(&self) -> ClientResult<Arc<TokenSet>> {
        self.core.renew_tokens().await
    }

    /// Notified with every new token set.
    #[must_use]
    pub fn subscribe_to_tokens_change(&self) -> watch::Receiver<Arc<TokenSet>> {
        self.core.subscribe_tokens()
    }

    /// Remaining seconds before auto-logout, during the warning window only.
    #[must_use]
    pub fn subscribe_to_auto_logout_countdown(&self) -> watch::Receiver<Option<u64>> {
        self.countdown.clone()
    }

    /// Report a user interaction (key press, pointer move, ...).
    pub fn record_user_interaction(&self) {
        self.activity.record();
    }

    /// Log out here and in every other tab.
    pub fn logout(&self, redirect: LogoutRedirect) {
        self.core.logout(redirect, LogoutOrigin::Local);
    }

    #[must_use]
    pub fn has_ended(&self) -> bool {
        self.core.is_ended()
    }
}

impl Drop for LoggedInSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl fmt::Debug for LoggedInSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggedInSession")
            .field("config_id", &self.core.parts.config_id)
            .field("ended", &self.core.is_ended())
            .finish_non_exhaustive()
    }
}
