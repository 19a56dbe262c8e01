//! HTTP surface of the resource server.

use axum::extract::{FromRef, State};
use axum::routing::get;
use axum::{Json, Router};
use keyward_auth::{AccessTokenVerifier, Authenticated, KeyCacheStats};
use serde::Serialize;

/// Shared router state.
#[derive(Clone)]
pub struct AppState {
    pub verifier: AccessTokenVerifier,
}

impl FromRef<AppState> for AccessTokenVerifier {
    fn from_ref(state: &AppState) -> Self {
        state.verifier.clone()
    }
}

/// Build the application router.
pub fn router(verifier: AccessTokenVerifier) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/whoami", get(whoami))
        .with_state(AppState { verifier })
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    signing_keys: usize,
    key_cache: KeyCacheStatsBody,
}

#[derive(Debug, Serialize)]
struct KeyCacheStatsBody {
    refresh_requests: u64,
    refreshes_started: u64,
    fetch_attempts: u64,
    fetch_failures: u64,
}

impl From<KeyCacheStats> for KeyCacheStatsBody {
    fn from(stats: KeyCacheStats) -> Self {
        Self {
            refresh_requests: stats.refresh_requests,
            refreshes_started: stats.refreshes_started,
            fetch_attempts: stats.fetch_attempts,
            fetch_failures: stats.fetch_failures,
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let keys = state.verifier.key_cache();
    Json(HealthResponse {
        status: "ok",
        signing_keys: keys.current().len(),
        key_cache: keys.stats().into(),
    })
}

#[derive(Debug, Serialize)]
struct WhoAmIResponse {
    sub: String,
    client_id: Option<String>,
    scopes: Vec<String>,
    audience: Vec<String>,
    sender_constrained: bool,
    kid: String,
}

async fn whoami(Authenticated(token): Authenticated) -> Json<WhoAmIResponse> {
    let claims = &token.claims;
    tracing::debug!(sub = %claims.sub, kid = %token.kid, "Served identity");

    Json(WhoAmIResponse {
        sub: claims.sub.clone(),
        client_id: claims.client_id.clone(),
        scopes: claims
            .scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        audience: claims.aud.as_vec().into_iter().map(str::to_string).collect(),
        sender_constrained: claims.dpop_jkt().is_some(),
        kid: token.kid.clone(),
    })
}
