use keyward_auth::{DpopPolicy, ProxyTrust, VerifierConfig};
use std::net::SocketAddr;

/// Configuration of the resource server.
#[derive(Debug, Clone)]
pub struct ResourceServerConfig {
    pub listen_addr: SocketAddr,

    /// Issuer URI of the authorization server (discovery and `iss` check).
    pub issuer_uri: String,

    /// Accepted `aud` values. Empty means the audience is not checked.
    pub expected_audience: Vec<String>,

    /// Rebuild the request URL from `Forwarded` / `X-Forwarded-*` for DPoP `htu` checks.
    /// Only enable behind a proxy that overwrites these headers.
    pub trust_proxy: bool,

    /// Verify DPoP proofs cryptographically (default). When false only their presence is required.
    pub dpop_verify_proof: bool,

    pub clock_skew_secs: u64,
}

impl ResourceServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let listen_addr = reader("KEYWARD_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("KEYWARD_LISTEN_ADDR".into(), e.to_string()))?;

        let issuer_uri = reader("KEYWARD_ISSUER_URI")
            .map_err(|_| ConfigError::MissingVar("KEYWARD_ISSUER_URI".into()))?;
        if issuer_uri.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "KEYWARD_ISSUER_URI".into(),
                "must not be empty".into(),
            ));
        }

        let expected_audience = reader("KEYWARD_EXPECTED_AUDIENCE")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|aud| !aud.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let trust_proxy = parse_bool(&reader, "KEYWARD_TRUST_PROXY", false)?;
        let dpop_verify_proof = parse_bool(&reader, "KEYWARD_DPOP_VERIFY_PROOF", true)?;

        let clock_skew_secs = reader("KEYWARD_CLOCK_SKEW_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse::<u64>()
            .map_err(|e| {
                ConfigError::InvalidValue("KEYWARD_CLOCK_SKEW_SECS".into(), e.to_string())
            })?;

        Ok(Self {
            listen_addr,
            issuer_uri,
            expected_audience,
            trust_proxy,
            dpop_verify_proof,
            clock_skew_secs,
        })
    }

    /// Verifier settings derived from this configuration.
    #[must_use]
    pub fn verifier_config(&self) -> VerifierConfig {
        let mut config = VerifierConfig::new(&self.issuer_uri).with_clock_skew(self.clock_skew_secs);
        if !self.expected_audience.is_empty() {
            config = config.audience(self.expected_audience.clone());
        }
        if self.trust_proxy {
            config = config.proxy(ProxyTrust::trusted());
        }
        if !self.dpop_verify_proof {
            config = config.dpop(DpopPolicy::presence_only());
        }
        config
    }
}

fn parse_bool<F>(reader: &F, key: &str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    match reader(key) {
        Ok(raw) => raw
            .trim()
            .parse::<bool>()
            .map_err(|e| ConfigError::InvalidValue(key.into(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}
