//! The principal registry (`data/principals.json`).

use itak_core::{Principal, Role, SessionKey};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::info;

use crate::types::{CONFIG_SCHEMA_VERSION, ConfigError, ConfigResult};

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    schema_version: u32,
    principals: Vec<Principal>,
}

/// Persisted registry of principals with hot reload.
///
/// Created at init; mutated only by owner operations; resolution maps an
/// external `(channel, external_id)` identity to one principal, which is
/// what gives the same human one memory scope across channels.
#[derive(Debug)]
pub struct PrincipalRegistry {
    path: PathBuf,
    principals: RwLock<Vec<Principal>>,
}

impl PrincipalRegistry {
    /// Load the registry, or initialize it with a sole owner on first
    /// run.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on I/O or parse failure, or when the file's
    /// schema version is newer than this build.
    pub fn load_or_init(path: impl Into<PathBuf>, owner_name: &str) -> ConfigResult<Self> {
        let path = path.into();
        if path.exists() {
            let body = std::fs::read_to_string(&path)?;
            let file: RegistryFile = serde_json::from_str(&body)?;
            if file.schema_version > CONFIG_SCHEMA_VERSION {
                return Err(ConfigError::SchemaTooNew {
                    found: file.schema_version,
                    supported: CONFIG_SCHEMA_VERSION,
                });
            }
            return Ok(Self {
                path,
                principals: RwLock::new(file.principals),
            });
        }

        let owner = Principal::new(owner_name, Role::Owner);
        let registry = Self {
            path,
            principals: RwLock::new(vec![owner]),
        };
        registry.persist()?;
        info!(owner = owner_name, "Initialized principal registry");
        Ok(registry)
    }

    fn persist(&self) -> ConfigResult<()> {
        let file = RegistryFile {
            schema_version: CONFIG_SCHEMA_VERSION,
            principals: self
                .principals
                .read()
                .expect("registry lock poisoned")
                .clone(),
        };
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    /// Re-read the file (admin reload).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on I/O or parse failure; on error the
    /// in-memory registry is left untouched.
    pub fn reload(&self) -> ConfigResult<()> {
        let body = std::fs::read_to_string(&self.path)?;
        let file: RegistryFile = serde_json::from_str(&body)?;
        *self.principals.write().expect("registry lock poisoned") = file.principals;
        info!("Principal registry reloaded");
        Ok(())
    }

    /// Resolve an external identity to its principal.
    #[must_use]
    pub fn resolve(&self, channel: &str, external_id: &str) -> Option<Principal> {
        self.principals
            .read()
            .expect("registry lock poisoned")
            .iter()
            .find(|p| p.is_bound(channel, external_id))
            .cloned()
    }

    /// Resolve the principal for a checkpointed session on restart. Direct
    /// rooms carry the external user id as their room id.
    #[must_use]
    pub fn resolve_session(&self, key: &SessionKey) -> Option<Principal> {
        self.resolve(key.channel(), key.room_id())
            .or_else(|| self.owner())
    }

    /// The owner principal.
    #[must_use]
    pub fn owner(&self) -> Option<Principal> {
        self.principals
            .read()
            .expect("registry lock poisoned")
            .iter()
            .find(|p| p.role == Role::Owner)
            .cloned()
    }

    /// Add or replace a principal (owner operation) and persist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the write-back fails.
    pub fn upsert(&self, principal: Principal) -> ConfigResult<()> {
        {
            let mut principals = self.principals.write().expect("registry lock poisoned");
            principals.retain(|p| p.id != principal.id);
            principals.push(principal);
        }
        self.persist()
    }

    /// Remove a principal by id (owner operation) and persist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the write-back fails.
    pub fn remove(&self, id: itak_core::PrincipalId) -> ConfigResult<bool> {
        let removed = {
            let mut principals = self.principals.write().expect("registry lock poisoned");
            let before = principals.len();
            principals.retain(|p| p.id != id);
            before != principals.len()
        };
        self.persist()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_reload_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("principals.json");

        let registry = PrincipalRegistry::load_or_init(&path, "dawn").unwrap();
        let mut owner = registry.owner().unwrap();
        owner = owner
            .with_binding("discord", "D")
            .with_binding("telegram", "T");
        registry.upsert(owner.clone()).unwrap();

        // Same principal resolves through both channels.
        let via_discord = registry.resolve("discord", "D").unwrap();
        let via_telegram = registry.resolve("telegram", "T").unwrap();
        assert_eq!(via_discord.id, via_telegram.id);
        assert!(registry.resolve("discord", "nobody").is_none());

        // A second load sees the persisted bindings.
        let reloaded = PrincipalRegistry::load_or_init(&path, "ignored").unwrap();
        assert!(reloaded.resolve("discord", "D").is_some());
    }
}
