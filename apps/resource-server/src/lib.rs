//! Sample resource server protected by `keyward-auth`.
//!
//! Exposes `/health` (unauthenticated) and `/whoami`, which requires a valid
//! Bearer or DPoP-bound access token.

pub mod config;
pub mod routes;

pub use config::{ConfigError, ResourceServerConfig};
pub use routes::{router, AppState};
