//! Keyward Session
//!
//! Browser-side OIDC relying-party engine:
//!
//! - Session bootstrap from an authorization response, a persisted session
//!   or silent restoration ([`create_session`], [`SessionCell`])
//! - Token storage and proactive renewal, with one in-flight renewal per
//!   configuration shared by every caller
//! - Cross-tab login/logout propagation, activity tracking and auto-logout
//! - Diagnostics that tell "server down" apart from "misconfigured client"
//!
//! The host environment (storage, broadcast channels, navigation, frames)
//! is injected through [`Host`]; [`memory`] provides in-process doubles.

mod bootstrap;
pub mod callback;
mod config;
mod context;
pub mod cross_tab;
pub mod diagnostics;
mod error;
mod host;
pub mod inflight;
mod keys;
pub mod memory;
pub mod pkce;
pub mod provider;
pub mod redirect;
mod renewal;
mod session;
mod silent;
mod state;

pub use bootstrap::create_session;
pub use config::{ClientConfig, RestorationMethod, DEFAULT_NAMESPACE, RENEWAL_MARGIN};
pub use context::ClientContext;
pub use cross_tab::activity::ActivityTracker;
pub use error::{ClientError, ClientResult};
pub use host::{BroadcastHub, FrameHost, Host, KeyValueStore, Navigator, StorageEvent};
pub use redirect::LoginParams;
pub use renewal::renewal_delay;
pub use session::{AnonymousSession, LoggedInSession, LogoutRedirect, Session};
pub use state::{LoadState, SessionCell, SessionState};

pub use keyward_core::{
    AppInstanceId, ConfigurationId, IdTokenClaims, InitializationError, TokenSet,
};
