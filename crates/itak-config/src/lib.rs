//! Runtime configuration and the principal registry.
//!
//! Both files live under `data/`, carry a schema version in their first
//! field, and are hot-reloadable through the admin surface. Unknown
//! schema versions put the loader in read-only refusal: the process exits
//! with the config-invalid code rather than guessing.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod loader;
mod principals;
mod types;

pub use loader::{load_or_init, save};
pub use principals::PrincipalRegistry;
pub use types::{
    AdapterConfig, ConfigError, ConfigResult, DeploymentMode, ItakConfig, SecurityConfig,
    CONFIG_SCHEMA_VERSION,
};

/// SHA-256 of an API token, hex-encoded, for at-rest storage.
#[must_use]
pub fn hash_token(token: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(token.as_bytes()))
}
