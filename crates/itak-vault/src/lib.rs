//! Secret vault and output guard.
//!
//! Secrets live only inside the vault; everything else carries `{{name}}`
//! placeholders. Placeholders are expanded just-in-time before external
//! I/O, and every outbound surface (model output, tool results, log lines)
//! passes through the two-pass redactor.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod redact;
mod vault;

pub use error::{VaultError, VaultResult};
pub use redact::{OutputGuard, MASK};
pub use vault::SecretVault;
