use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use keyward_auth::{AccessTokenVerifier, InitializationError};
use resource_server::{router, ResourceServerConfig};

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,keyward_auth=debug,resource_server=debug")),
        )
        .init();

    let config = ResourceServerConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Configuration error: {e}");
        std::process::exit(1);
    });

    tracing::info!(
        listen_addr = %config.listen_addr,
        issuer = %config.issuer_uri,
        audience = ?config.expected_audience,
        trust_proxy = config.trust_proxy,
        dpop_verify_proof = config.dpop_verify_proof,
        "starting resource server"
    );

    // Keys must be available before the first request is served
    let verifier = AccessTokenVerifier::bootstrap(config.verifier_config())
        .await
        .unwrap_or_else(|e| {
            let e = InitializationError::from(e);
            tracing::error!(
                error = %e.message(),
                auth_server_down = e.is_auth_server_likely_down(),
                "failed to load signing keys"
            );
            std::process::exit(1);
        });

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to bind {}: {e}", config.listen_addr);
            std::process::exit(1);
        });

    tracing::info!(listen_addr = %config.listen_addr, "resource server listening");

    axum::serve(listener, router(verifier))
        .await
        .unwrap_or_else(|e| {
            eprintln!("Server error: {e}");
            std::process::exit(1);
        });
}
