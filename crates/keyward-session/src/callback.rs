//! Authorization response parameters in the landing URL.

use serde_json::{json, Value};
use url::Url;

/// `type` of the message a silent-restoration frame posts to its parent.
pub const SILENT_RESTORE_MESSAGE_TYPE: &str = "keyward:silent-restore";

const CALLBACK_PARAMS: &[&str] = &[
    "code",
    "state",
    "session_state",
    "iss",
    "error",
    "error_description",
    "error_uri",
];

/// `error` values that only mean "no session" during a `prompt=none` round trip.
const SILENT_NO_SESSION_ERRORS: &[&str] = &[
    "login_required",
    "interaction_required",
    "consent_required",
    "account_selection_required",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Code {
        code: String,
        session_state: Option<String>,
    },
    Error {
        error: String,
        description: Option<String>,
    },
}

/// Parsed authorization response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub state: String,
    pub outcome: CallbackOutcome,
}

impl CallbackParams {
    /// Read the response from `url`. `None` when the URL is not an authorization response.
    #[must_use]
    pub fn from_url(url: &Url) -> Option<Self> {
        let lookup = |name: &str| {
            url.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        };
        let state = lookup("state")?;

        let outcome = if let Some(error) = lookup("error") {
            CallbackOutcome::Error {
                error,
                description: lookup("error_description"),
            }
        } else {
            CallbackOutcome::Code {
                code: lookup("code")?,
                session_state: lookup("session_state"),
            }
        };
        Some(Self { state, outcome })
    }
}

impl CallbackOutcome {
    /// Whether this is a "no session" answer to a silent request.
    #[must_use]
    pub fn is_no_session(&self) -> bool {
        matches!(self, Self::Error { error, .. } if SILENT_NO_SESSION_ERRORS.contains(&error.as_str()))
    }
}

/// Message the redirect page posts to its parent when it loads inside the
/// silent-restoration frame.
#[must_use]
pub fn silent_restore_message(landing_url: &Url) -> Value {
    json!({ "type": SILENT_RESTORE_MESSAGE_TYPE, "url": landing_url.as_str() })
}

/// The authorization response carried by a frame message, if it is one.
#[must_use]
pub fn parse_silent_restore_message(message: &Value) -> Option<CallbackParams> {
    if message.get("type")?.as_str()? != SILENT_RESTORE_MESSAGE_TYPE {
        return None;
    }
    let url = Url::parse(message.get("url")?.as_str()?).ok()?;
    CallbackParams::from_url(&url)
}

/// `url` without the authorization response parameters.
///
/// Other query segments are kept byte for byte, in order.
#[must_use]
pub fn strip_callback_params(url: &Url) -> Url {
    let Some(query) = url.query() else {
        return url.clone();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|segment| {
            let name = segment.split('=').next().unwrap_or_default();
            let name = form_urlencoded_name(name);
            !CALLBACK_PARAMS.contains(&name.as_str())
        })
        .collect();

    let mut stripped = url.clone();
    if kept.is_empty() {
        stripped.set_query(None);
    } else {
        stripped.set_query(Some(&kept.join("&")));
    }
    stripped
}

fn form_urlencoded_name(raw: &str) -> String {
    url::form_urlencoded::parse(raw.as_bytes())
        .next()
        .map(|(k, _)| k.into_owned())
        .unwrap_or_default()
}
