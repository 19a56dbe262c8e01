//! Session bootstrap.
//!
//! Tried in order, first success wins:
//!
//! 1. the page is an authorization response for this configuration;
//! 2. this tab holds a persisted session with a usable refresh token;
//!    a persisted session without one falls through to 3;
//! 3. silent restoration against the provider session (`prompt=none`).
//!
//! Otherwise the visitor is anonymous.

use crate::callback::{strip_callback_params, CallbackOutcome, CallbackParams};
use crate::config::{ClientConfig, RestorationMethod};
use crate::context::ClientContext;
use crate::cross_tab::{login, logout};
use crate::diagnostics::{diagnose, FailureContext};
use crate::error::{ClientError, ClientResult};
use crate::host::Host;
use crate::inflight::{OperationOutcome, Participation};
use crate::keys;
use crate::pkce::configuration_of_state;
use crate::provider::{Discovery, ProviderClient, ProviderMetadata};
use crate::redirect::{authorization_request, LoginParams, RedirectContext, RedirectKind};
use crate::session::{AnonymousSession, ClientParts, LoggedInSession, Session};
use crate::silent;
use chrono::Utc;
use keyward_core::{InitializationError, TokenEndpointResponse, TokenSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Establish the session of `config` in this page.
///
/// Only an authorization server error returned to the landing page fails
/// outright; every other problem yields an anonymous session, carrying an
/// [`InitializationError`] when diagnostics found something to report.
#[instrument(skip_all, fields(issuer = %config.issuer_uri, client_id = %config.client_id))]
pub async fn create_session(
    context: &ClientContext,
    host: Host,
    config: ClientConfig,
) -> Result<Session, InitializationError> {
    let provider = ProviderClient::new(&config.issuer_uri, config.http_timeout)
        .map_err(|e| InitializationError::misconfiguration(e.to_string()))?;
    logout::collect_garbage(host.local_storage.as_ref(), &config.namespace, Utc::now());

    let bootstrap = Bootstrap {
        parts: ClientParts {
            config_id: config.configuration_id(),
            config: Arc::new(config),
            context: context.clone(),
            host,
            provider,
        },
    };
    bootstrap.run().await
}

struct Bootstrap {
    parts: ClientParts,
}

impl Bootstrap {
    async fn run(self) -> Result<Session, InitializationError> {
        let current = self.parts.host.navigator.current_url();
        let callback = CallbackParams::from_url(&current).filter(|params| {
            configuration_of_state(&params.state).as_ref() == Some(&self.parts.config_id)
        });
        if let Some(callback) = callback {
            // A silent round trip started by the page that framed us: the
            // request context lives there, not here.
            let namespace = &self.parts.config.namespace;
            let own = RedirectContext::is_pending(
                self.parts.host.session_storage.as_ref(),
                namespace,
                &callback.state,
            );
            if !own && silent::hand_to_opener(&self.parts.host, &current) {
                return Ok(self.anonymous(None, None));
            }
            self.parts
                .host
                .navigator
                .replace_url(&strip_callback_params(&current));
            return self.complete_redirect(callback).await;
        }

        if let Some(persisted) = self.parts.persisted() {
            if persisted.has_usable_refresh_token(Utc::now()) {
                return Ok(self.restore_persisted(persisted).await);
            }
            debug!("persisted session has no usable refresh token");
            self.parts.clear_persisted();
        }

        self.restore_silently().await
    }

    fn anonymous(
        &self,
        metadata: Option<ProviderMetadata>,
        error: Option<InitializationError>,
    ) -> Session {
        Session::NotLoggedIn(AnonymousSession::new(self.parts.clone(), metadata, error))
    }

    fn logged_in(&self, metadata: ProviderMetadata, tokens: Arc<TokenSet>) -> Session {
        info!(
            subject = %tokens.decoded_id_token().sub,
            expires_at = %tokens.access_token_expiration_time(),
            "session established"
        );
        Session::LoggedIn(LoggedInSession::start(self.parts.clone(), metadata, tokens))
    }

    async fn diagnosed(&self, metadata: Option<ProviderMetadata>, failure: FailureContext) -> Session {
        let error = diagnose(&self.parts.provider, &self.parts.config, &failure).await;
        warn!(
            down = error.is_auth_server_likely_down(),
            message = %error.message(),
            "session could not be established"
        );
        self.anonymous(metadata, Some(error))
    }

    async fn discover(&self) -> Result<Discovery, Session> {
        match self.parts.provider.discover().await {
            Ok(discovery) => Ok(discovery),
            Err(e) => Err(self.diagnosed(None, FailureContext::Discovery(e)).await),
        }
    }

    /// Run a token request as the single in-flight operation of this configuration.
    async fn exclusive<F>(&self, request: F, previous: Option<&TokenSet>) -> OperationOutcome
    where
        F: Future<Output = ClientResult<TokenEndpointResponse>>,
    {
        let guard = match self.parts.context.in_flight().join(&self.parts.config_id) {
            Participation::Leader(guard) => guard,
            Participation::Follower(pending) => return pending.wait().await,
        };
        let outcome = match request.await {
            Ok(response) => TokenSet::from_response(response, previous, Utc::now())
                .map(Arc::new)
                .map_err(ClientError::from),
            Err(e) => Err(e),
        };
        guard.complete(outcome.clone());
        outcome
    }

    async fn exchange_code(
        &self,
        metadata: &ProviderMetadata,
        code: &str,
        context: &RedirectContext,
    ) -> OperationOutcome {
        let request = self.parts.provider.exchange_code(
            metadata,
            &self.parts.config.client_id,
            code,
            &context.redirect_uri,
            &context.code_verifier,
        );
        self.exclusive(request, None).await
    }

    /// Turn an exchange outcome into a session.
    async fn after_exchange(
        &self,
        metadata: ProviderMetadata,
        outcome: OperationOutcome,
        kind: RedirectKind,
    ) -> Session {
        match outcome {
            Ok(tokens) => {
                if kind != RedirectKind::SilentRestore {
                    login::publish(
                        self.parts.host.broadcast.as_ref(),
                        &self.parts.config.namespace,
                        &self.parts.config_id,
                        self.parts.context.app_instance_id(),
                    );
                }
                self.logged_in(metadata, tokens)
            }
            Err(e) if e.is_unreachable() => {
                self.diagnosed(Some(metadata), FailureContext::TokenEndpoint(e))
                    .await
            }
            Err(e) => {
                warn!(error = %e, "authorization code exchange failed");
                self.anonymous(Some(metadata), None)
            }
        }
    }

    fn authorization_error(error: &str, description: Option<&str>) -> InitializationError {
        InitializationError::misconfiguration(format!(
            "The authorization server answered with error \"{error}\"{}",
            description.map(|d| format!(": {d}")).unwrap_or_default()
        ))
    }

    #[instrument(skip_all)]
    async fn complete_redirect(self, callback: CallbackParams) -> Result<Session, InitializationError> {
        let namespace = &self.parts.config.namespace;
        let session_storage = self.parts.host.session_storage.as_ref();
        session_storage.remove(&keys::silent_restore_attempted(namespace, &self.parts.config_id));

        let Some(context) = RedirectContext::take(session_storage, namespace, &callback.state) else {
            warn!("authorization response without a pending request (reload or back button)");
            return Ok(self.anonymous(None, None));
        };

        match &callback.outcome {
            CallbackOutcome::Error { error, .. }
                if callback.outcome.is_no_session() || error == "access_denied" =>
            {
                debug!(error = %error, kind = ?context.kind, "no session at the provider");
                Ok(self.anonymous(None, None))
            }
            CallbackOutcome::Error { error, description } => {
                Err(Self::authorization_error(error, description.as_deref()))
            }
            CallbackOutcome::Code { code, .. } => {
                let discovery = match self.discover().await {
                    Ok(discovery) => discovery,
                    Err(session) => return Ok(session),
                };
                let outcome = self.exchange_code(&discovery.metadata, code, &context).await;
                Ok(self
                    .after_exchange(discovery.metadata, outcome, context.kind)
                    .await)
            }
        }
    }

    #[instrument(skip_all)]
    async fn restore_persisted(self, persisted: TokenSet) -> Session {
        let discovery = match self.discover().await {
            Ok(discovery) => discovery,
            Err(session) => return session,
        };
        let refresh_token = persisted.refresh_token().unwrap_or_default().to_string();
        let request = self.parts.provider.refresh(
            &discovery.metadata,
            &self.parts.config.client_id,
            &refresh_token,
        );
        match self.exclusive(request, Some(&persisted)).await {
            Ok(tokens) => self.logged_in(discovery.metadata, tokens),
            Err(e) => {
                warn!(error = %e, "could not restore persisted session");
                self.parts.clear_persisted();
                self.anonymous(Some(discovery.metadata), None)
            }
        }
    }

    #[instrument(skip_all)]
    async fn restore_silently(self) -> Result<Session, InitializationError> {
        let method = self.parts.config.restoration;
        if method == RestorationMethod::Disabled {
            return Ok(self.anonymous(None, None));
        }
        let discovery = match self.discover().await {
            Ok(discovery) => discovery,
            Err(session) => return Ok(session),
        };

        match method {
            RestorationMethod::FullPageRedirect => Ok(self.redirect_silently(discovery.metadata)),
            _ => self.restore_in_frame(discovery).await,
        }
    }

    fn redirect_silently(&self, metadata: ProviderMetadata) -> Session {
        let namespace = &self.parts.config.namespace;
        let marker = keys::silent_restore_attempted(namespace, &self.parts.config_id);
        let session_storage = self.parts.host.session_storage.as_ref();
        if session_storage.get(&marker).is_some() {
            // Came back without an authorization response.
            session_storage.remove(&marker);
            return self.anonymous(Some(metadata), None);
        }

        let target = self.parts.current_page();
        match authorization_request(
            &self.parts.config,
            &metadata,
            RedirectKind::SilentRestore,
            &target,
            &LoginParams::default(),
        ) {
            Ok(request) => {
                session_storage.set(&marker, "1");
                request.context.save(session_storage, namespace, &request.state);
                debug!("redirecting for silent session restoration");
                self.parts.host.navigator.redirect(&request.url);
            }
            Err(e) => warn!(error = %e, "cannot build silent restoration request"),
        }
        self.anonymous(Some(metadata), None)
    }

    async fn restore_in_frame(self, discovery: Discovery) -> Result<Session, InitializationError> {
        let timeout = self
            .parts
            .config
            .silent_restoration_timeout
            .unwrap_or_else(|| discovery.silent_restoration_timeout());
        let round_trip = silent::authorize_in_frame(&self.parts, &discovery.metadata, timeout)
            .await
            .map_err(|e| {
                InitializationError::misconfiguration(format!("Invalid authorization endpoint: {e}"))
            })?;

        let Some(callback) = round_trip.reply else {
            let failure = FailureContext::SilentRestorationTimeout {
                authorization_url: round_trip.request.url,
                redirect_uri: round_trip.redirect_uri,
            };
            return Ok(self.diagnosed(Some(discovery.metadata), failure).await);
        };
        let request = round_trip.request;

        match &callback.outcome {
            CallbackOutcome::Error { .. } if callback.outcome.is_no_session() => {
                debug!("no session at the provider");
                Ok(self.anonymous(Some(discovery.metadata), None))
            }
            CallbackOutcome::Error { error, description } => {
                Err(Self::authorization_error(error, description.as_deref()))
            }
            CallbackOutcome::Code { code, .. } => {
                let outcome = self
                    .exchange_code(&discovery.metadata, code, &request.context)
                    .await;
                Ok(self
                    .after_exchange(discovery.metadata, outcome, RedirectKind::SilentRestore)
                    .await)
            }
        }
    }
}
