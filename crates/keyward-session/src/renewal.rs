//! Proactive token renewal.

use crate::config::RENEWAL_MARGIN;
use crate::session::SessionCore;
use chrono::{DateTime, Utc};
use keyward_core::TokenSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Time until renewal should start: the earliest expiry minus the margin.
#[must_use]
pub fn renewal_delay(tokens: &TokenSet, now: DateTime<Utc>) -> Duration {
    let margin = chrono::Duration::milliseconds(RENEWAL_MARGIN.as_millis() as i64);
    (tokens.renewal_deadline() - margin - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Renew shortly before expiry, rescheduling whenever the tokens change.
///
/// Ends when a renewal fails (the session has then been handed over to a
/// forced login) or the session ends.
pub(crate) async fn run(core: Arc<SessionCore>) {
    let mut tokens = core.subscribe_tokens();
    loop {
        if core.is_ended() {
            return;
        }
        let delay = renewal_delay(&tokens.borrow_and_update(), Utc::now());
        debug!(delay_secs = delay.as_secs(), "scheduled token renewal");

        tokio::select! {
            () = tokio::time::sleep(delay) => {
                if core.renew_tokens().await.is_err() {
                    return;
                }
            }
            changed = tokens.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
