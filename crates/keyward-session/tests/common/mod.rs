//! Shared fixtures: a wiremock authorization server and in-memory tabs.

#![allow(dead_code)]

use jsonwebtoken::{encode, EncodingKey, Header};
use keyward_session::memory::MemoryTab;
use keyward_session::{
    create_session, ClientConfig, ClientContext, LoggedInSession, LoginParams, RestorationMethod,
    Session,
};
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const REALM_PATH: &str = "/realms/demo";
pub const CLIENT_ID: &str = "spa";

pub fn issuer(server: &MockServer) -> String {
    format!("{}{REALM_PATH}", server.uri())
}

pub fn discovery_document(server: &MockServer) -> Value {
    let issuer = issuer(server);
    json!({
        "issuer": issuer,
        "authorization_endpoint": "https://idp.example.com/realms/demo/protocol/openid-connect/auth",
        "token_endpoint": format!("{issuer}/protocol/openid-connect/token"),
        "end_session_endpoint": "https://idp.example.com/realms/demo/protocol/openid-connect/logout",
        "jwks_uri": format!("{issuer}/protocol/openid-connect/certs"),
    })
}

pub async fn mount_discovery(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(format!("{REALM_PATH}/.well-known/openid-configuration")))
        .respond_with(ResponseTemplate::new(200).set_body_json(discovery_document(server)))
        .mount(server)
        .await;
}

/// Discovery whose authorization endpoint is served by `server` too, so
/// diagnostics can fetch its headers.
pub async fn mount_local_discovery(server: &MockServer) {
    let mut document = discovery_document(server);
    document["authorization_endpoint"] = json!(format!("{}{}", server.uri(), authorization_path()));
    Mock::given(method("GET"))
        .and(path(format!("{REALM_PATH}/.well-known/openid-configuration")))
        .respond_with(ResponseTemplate::new(200).set_body_json(document))
        .mount(server)
        .await;
}

pub fn authorization_path() -> String {
    format!("{REALM_PATH}/protocol/openid-connect/auth")
}

pub fn token_path() -> String {
    format!("{REALM_PATH}/protocol/openid-connect/token")
}

/// An id token; the engine reads it without verification.
pub fn id_token(server: &MockServer, sid: &str) -> String {
    let now = chrono::Utc::now().timestamp();
    encode(
        &Header::default(),
        &json!({
            "iss": issuer(server),
            "sub": "user-123",
            "aud": CLIENT_ID,
            "exp": now + 3600,
            "iat": now,
            "sid": sid,
            "preferred_username": "alice",
        }),
        &EncodingKey::from_secret(b"not-verified"),
    )
    .expect("id token encodes")
}

pub fn token_response(server: &MockServer, access_token: &str, expires_in: i64) -> Value {
    json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "id_token": id_token(server, "sid-1"),
        "refresh_token": format!("refresh-for-{access_token}"),
        "expires_in": expires_in,
        "refresh_expires_in": 1800,
    })
}

/// Code exchange for `code`, answering with `access_token`.
pub async fn mount_code_exchange(server: &MockServer, code: &str, access_token: &str, expires_in: i64) {
    Mock::given(method("POST"))
        .and(path(token_path()))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains(format!("code={code}&")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(token_response(server, access_token, expires_in)),
        )
        .mount(server)
        .await;
}

pub fn home() -> Url {
    Url::parse("https://app.example.com/").unwrap()
}

pub fn config(server: &MockServer) -> ClientConfig {
    ClientConfig::new(issuer(server), CLIENT_ID, home())
        .restoration(RestorationMethod::Disabled)
        .silent_restoration_timeout(Duration::from_millis(300))
}

pub fn query(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// The URL the authorization server sends the browser back to.
pub fn authorization_response(authorization_url: &Url, code: &str) -> Url {
    let redirect_uri = query(authorization_url, "redirect_uri").expect("redirect_uri");
    let state = query(authorization_url, "state").expect("state");
    let mut landing = Url::parse(&redirect_uri).unwrap();
    landing
        .query_pairs_mut()
        .append_pair("state", &state)
        .append_pair("session_state", "sess-1")
        .append_pair("code", code);
    landing
}

/// Interactive login in `tab`, completed with `code`. The code exchange must be mounted.
pub async fn log_in(tab: &MemoryTab, config: ClientConfig, code: &str) -> LoggedInSession {
    let context = ClientContext::new();
    let session = create_session(&context, tab.host.clone(), config.clone())
        .await
        .expect("bootstrap succeeds");
    let Session::NotLoggedIn(anonymous) = session else {
        panic!("expected an anonymous session");
    };
    anonymous.login(LoginParams::default()).await.expect("login redirect");
    let authorization_url = tab.navigator.last_redirect().expect("redirected");

    tab.navigator.load(authorization_response(&authorization_url, code));
    let reloaded = ClientContext::new();
    match create_session(&reloaded, tab.host.clone(), config)
        .await
        .expect("bootstrap succeeds")
    {
        Session::LoggedIn(session) => session,
        Session::NotLoggedIn(anonymous) => panic!(
            "expected a logged-in session, got {:?}",
            anonymous.initialization_error()
        ),
    }
}
