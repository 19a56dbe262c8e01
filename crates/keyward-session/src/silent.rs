//! `prompt=none` authorization round trips in a hidden frame.
//!
//! The opener builds the request and waits; the page that loads inside the
//! frame recognises the authorization response and posts its URL back
//! ([`hand_to_opener`]). Used by bootstrap and by renewal without a
//! refresh token.

use crate::callback::{parse_silent_restore_message, silent_restore_message, CallbackParams};
use crate::error::ClientResult;
use crate::host::Host;
use crate::provider::ProviderMetadata;
use crate::redirect::{authorization_request, AuthorizationRequest, LoginParams, RedirectKind};
use crate::session::ClientParts;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

/// A finished frame round trip. `reply` is `None` on timeout or when the frame closed.
pub(crate) struct FrameRoundTrip {
    pub request: AuthorizationRequest,
    pub redirect_uri: Url,
    pub reply: Option<CallbackParams>,
}

pub(crate) async fn authorize_in_frame(
    parts: &ClientParts,
    metadata: &ProviderMetadata,
    timeout: Duration,
) -> ClientResult<FrameRoundTrip> {
    let redirect_uri = parts.config.home_url.clone();
    let request = authorization_request(
        &parts.config,
        metadata,
        RedirectKind::SilentRestore,
        &redirect_uri,
        &LoginParams::default(),
    )?;
    debug!(timeout_ms = timeout.as_millis() as u64, "opening hidden authorization frame");

    let mut frame = parts.host.frames.open_hidden_frame(&request.url);
    let reply = tokio::time::timeout(timeout, frame_reply(&mut frame, &request.state))
        .await
        .ok()
        .flatten();
    drop(frame);

    Ok(FrameRoundTrip {
        request,
        redirect_uri,
        reply,
    })
}

/// First frame message answering `state`. `None` when the frame goes away.
async fn frame_reply(frame: &mut mpsc::UnboundedReceiver<Value>, state: &str) -> Option<CallbackParams> {
    while let Some(message) = frame.recv().await {
        match parse_silent_restore_message(&message) {
            Some(params) if params.state == state => return Some(params),
            _ => debug!("ignoring unrelated frame message"),
        }
    }
    None
}

/// Post the authorization response at `landing` to the opener of this frame.
///
/// `false` when this page is not framed, so the response is its own to complete.
pub(crate) fn hand_to_opener(host: &Host, landing: &Url) -> bool {
    if !host.frames.is_framed() {
        return false;
    }
    debug!("authorization response loaded in a hidden frame, posting it to the opener");
    host.frames.post_to_parent(silent_restore_message(landing));
    true
}
