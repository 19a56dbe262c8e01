//! keyward Core Library
//!
//! Shared data model for the keyward relying-party engine and the
//! resource-server verifier.
//!
//! # Modules
//!
//! - [`ids`] - Correlation identifiers (ConfigurationId, AppInstanceId)
//! - [`tokens`] - The TokenSet held by a logged-in session
//! - [`jwt`] - Unverified JWT payload decoding
//! - [`error`] - InitializationError and decoding errors
//!
//! # Example
//!
//! ```
//! use keyward_core::{AppInstanceId, ConfigurationId};
//!
//! let config_id = ConfigurationId::new("https://idp.example.com/realms/demo", "spa");
//! let instance = AppInstanceId::new();
//!
//! assert_eq!(
//!     config_id,
//!     ConfigurationId::new("https://idp.example.com/realms/demo/", "spa")
//! );
//! assert_ne!(instance, AppInstanceId::new());
//! ```

pub mod error;
pub mod ids;
pub mod jwt;
pub mod tokens;

pub use error::{InitializationError, JwtDecodeError, TokenSetError};
pub use ids::{AppInstanceId, ConfigurationId, ParseIdError};
pub use jwt::{decode_payload_unverified, read_exp_unverified};
pub use tokens::{IdTokenClaims, TokenEndpointResponse, TokenSet};
