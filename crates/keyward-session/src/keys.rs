//! Storage keys and broadcast channel names.
//!
//! Every name is `<namespace>:<purpose>:<discriminator>` so several
//! configurations (and several libraries) can share one origin.

use keyward_core::ConfigurationId;

pub(crate) const LOGOUT_PROPAGATION: &str = "logout-propagation";

/// Persisted token set of a logged-in tab (session storage).
pub(crate) fn session_marker(ns: &str, config_id: &ConfigurationId) -> String {
    format!("{ns}:session:{config_id}")
}

/// Context saved before an authorization redirect (session storage).
pub(crate) fn redirect_context(ns: &str, state: &str) -> String {
    format!("{ns}:redirect-context:{state}")
}

/// Set while a full-page silent restoration is outstanding (session storage).
pub(crate) fn silent_restore_attempted(ns: &str, config_id: &ConfigurationId) -> String {
    format!("{ns}:silent-restore-attempted:{config_id}")
}

pub(crate) fn logout_propagation(ns: &str, config_id: &ConfigurationId) -> String {
    format!("{ns}:{LOGOUT_PROPAGATION}:{config_id}")
}

pub(crate) fn logout_propagation_prefix(ns: &str) -> String {
    format!("{ns}:{LOGOUT_PROPAGATION}:")
}

pub(crate) fn login_propagation_channel(ns: &str, config_id: &ConfigurationId) -> String {
    format!("{ns}:login-propagation:{config_id}")
}

/// `discriminator` is the provider session id when known, else the configuration id.
pub(crate) fn interaction_tracker_channel(ns: &str, discriminator: &str) -> String {
    format!("{ns}:user-interaction-tracker:{discriminator}")
}
