//! Observable bootstrap state for UI adapters.

use crate::bootstrap::create_session;
use crate::config::ClientConfig;
use crate::context::ClientContext;
use crate::host::Host;
use crate::session::Session;
use keyward_core::InitializationError;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Progress of an asynchronous load.
#[derive(Debug, Clone)]
pub enum LoadState<T, E> {
    Pending,
    Ready(T),
    Errored(E),
}

impl<T, E> LoadState<T, E> {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

pub type SessionState = LoadState<Arc<Session>, InitializationError>;

/// A session being bootstrapped in the background.
///
/// Adapters render `Pending` first and re-render on every change.
pub struct SessionCell {
    state: watch::Receiver<SessionState>,
    task: JoinHandle<()>,
}

impl SessionCell {
    /// Start bootstrapping `config` on the current runtime.
    pub fn spawn(context: ClientContext, host: Host, config: ClientConfig) -> Self {
        let (tx, state) = watch::channel(LoadState::Pending);
        let task = tokio::spawn(async move {
            let next = match create_session(&context, host, config).await {
                Ok(session) => LoadState::Ready(Arc::new(session)),
                Err(error) => LoadState::Errored(error),
            };
            tx.send_replace(next);
        });
        Self { state, task }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// The session once bootstrap settles.
    pub async fn wait(&self) -> Result<Arc<Session>, InitializationError> {
        let mut state = self.state.clone();
        loop {
            match &*state.borrow_and_update() {
                LoadState::Ready(session) => return Ok(Arc::clone(session)),
                LoadState::Errored(error) => return Err(error.clone()),
                LoadState::Pending => {}
            }
            if state.changed().await.is_err() {
                return Err(InitializationError::misconfiguration(
                    "session bootstrap was cancelled",
                ));
            }
        }
    }
}

impl Drop for SessionCell {
    fn drop(&mut self) {
        self.task.abort();
    }
}
