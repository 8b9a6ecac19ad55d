//! The secret store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{VaultError, VaultResult};
use crate::redact::PLACEHOLDER_RE;

/// A secret value. Zeroized on drop, never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct SecretValue(String);

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

/// In-memory secret store with just-in-time placeholder expansion.
///
/// Read-heavy: readers share the lock, writers take the exclusive latch.
/// Values never leave the vault except through [`materialize`](Self::materialize),
/// which is called immediately before external I/O.
#[derive(Debug, Default)]
pub struct SecretVault {
    secrets: RwLock<HashMap<String, SecretValue>>,
}

impl SecretVault {
    /// Create an empty vault.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every file under `dir` as a secret named after the file.
    ///
    /// Encryption at rest is handled outside this process; files are read
    /// as opaque bytes and trimmed of trailing whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Storage`] if the directory cannot be read.
    pub fn load_dir(&self, dir: &Path) -> VaultResult<usize> {
        let mut loaded = 0usize;
        if !dir.exists() {
            debug!(dir = %dir.display(), "Secrets directory absent, vault starts empty");
            return Ok(0);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                warn!("Skipping secret file with non-UTF-8 name");
                continue;
            };
            let value = std::fs::read_to_string(entry.path())?;
            self.put(&name, value.trim_end());
            loaded = loaded.saturating_add(1);
        }
        debug!(count = loaded, "Loaded secrets");
        Ok(loaded)
    }

    /// Insert or replace a secret.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn put(&self, name: &str, value: &str) {
        let mut secrets = self.secrets.write().expect("vault lock poisoned");
        secrets.insert(name.to_string(), SecretValue(value.to_string()));
    }

    /// Remove a secret. Returns whether it existed.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn remove(&self, name: &str) -> bool {
        let mut secrets = self.secrets.write().expect("vault lock poisoned");
        secrets.remove(name).is_some()
    }

    /// Whether a secret with this name exists.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.secrets
            .read()
            .expect("vault lock poisoned")
            .contains_key(name)
    }

    /// Names of all stored secrets. Values are never enumerated.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.secrets
            .read()
            .expect("vault lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Expand every `{{name}}` in `template` with the stored value.
    ///
    /// Call-site contract: the expanded string goes straight into external
    /// I/O and is never stored, logged, or appended to a transcript.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::MissingSecret`] for the first placeholder with
    /// no vault entry.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub fn materialize(&self, template: &str) -> VaultResult<String> {
        let secrets = self.secrets.read().expect("vault lock poisoned");
        let mut missing: Option<String> = None;
        let expanded = PLACEHOLDER_RE.replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            match secrets.get(name) {
                Some(value) => value.0.clone(),
                None => {
                    if missing.is_none() {
                        missing = Some(name.to_string());
                    }
                    caps[0].to_string()
                },
            }
        });
        match missing {
            Some(name) => Err(VaultError::MissingSecret { name }),
            None => Ok(expanded.into_owned()),
        }
    }

    /// Snapshot the current secret values for the redactor's literal pass.
    ///
    /// Only the redactor consumes this; values go into a scratch vector
    /// that is zeroized after the pass.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub(crate) fn value_snapshot(&self) -> Vec<String> {
        self.secrets
            .read()
            .expect("vault lock poisoned")
            .values()
            .map(|v| v.0.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialize_expands_known_placeholders() {
        let vault = SecretVault::new();
        vault.put("api_key", "sk-12345");
        let out = vault.materialize("Authorization: Bearer {{api_key}}").unwrap();
        assert_eq!(out, "Authorization: Bearer sk-12345");
    }

    #[test]
    fn materialize_fails_on_unknown_placeholder() {
        let vault = SecretVault::new();
        let err = vault.materialize("key={{nope}}").unwrap_err();
        assert!(matches!(err, VaultError::MissingSecret { name } if name == "nope"));
    }

    #[test]
    fn load_dir_reads_files_as_secrets() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tg_token"), "12345:abcdef\n").unwrap();
        let vault = SecretVault::new();
        assert_eq!(vault.load_dir(dir.path()).unwrap(), 1);
        assert_eq!(vault.materialize("{{tg_token}}").unwrap(), "12345:abcdef");
    }

    #[test]
    fn debug_never_prints_values() {
        let vault = SecretVault::new();
        vault.put("k", "hunter2");
        let debug = format!("{vault:?}");
        assert!(!debug.contains("hunter2"));
    }
}
