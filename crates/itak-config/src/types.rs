//! Configuration types.

use itak_core::{Classify, ErrorKind};
use itak_heal::HealConfig;
use itak_limits::LimiterConfig;
use itak_llm::{ModelBinding, ModelRole};
use itak_memory::MemoryConfig;
use itak_runtime::RuntimeConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Current config schema version.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read or written.
    #[error("config I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// File could not be parsed.
    #[error("config parse failed: {0}")]
    Parse(#[from] serde_json::Error),

    /// Semantic validation failed; the process must exit config-invalid.
    #[error("config invalid: {0}")]
    Invalid(String),

    /// The file's schema version is newer than this build understands.
    #[error("config schema {found} is newer than supported {supported}")]
    SchemaTooNew {
        /// Version found in the file.
        found: u32,
        /// Version this build writes.
        supported: u32,
    },
}

impl Classify for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::InternalInvariant
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Where the process runs; picks bind defaults only, never probes hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// LAN-reachable box at home.
    HomeLan,
    /// Cloud VPS behind a reverse proxy.
    VpsCloud,
    /// Developer laptop.
    #[default]
    LocalDev,
}

impl DeploymentMode {
    /// Default bind address for the gateway.
    #[must_use]
    pub fn default_bind(self) -> &'static str {
        match self {
            Self::HomeLan => "0.0.0.0",
            // Behind a proxy or on a laptop, stay loopback-only.
            Self::VpsCloud | Self::LocalDev => "127.0.0.1",
        }
    }
}

/// Output guard and network policy settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    /// Strict output guard: unexpanded placeholders in outbound content
    /// become policy violations.
    #[serde(default)]
    pub strict_output_guard: bool,
    /// Host suffixes network tools may reach. Empty admits any public
    /// host.
    #[serde(default)]
    pub network_allowlist: Vec<String>,
    /// Exact hosts exempt from the private-range block (local search
    /// service).
    #[serde(default)]
    pub local_exemptions: Vec<String>,
}

/// One channel adapter's settings. Token-bearing values carry `{{name}}`
/// placeholders resolved through the vault at adapter init, never stored
/// expanded.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdapterConfig {
    /// Whether the adapter starts.
    #[serde(default)]
    pub enabled: bool,
    /// Adapter-specific settings.
    #[serde(default)]
    pub settings: Value,
}

/// The whole runtime configuration (`data/config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItakConfig {
    /// Schema version; first field in the file.
    pub schema_version: u32,
    /// Deployment mode.
    #[serde(default)]
    pub deployment_mode: DeploymentMode,
    /// Gateway port. Generated randomly at first run and persisted.
    pub port: u16,
    /// Per-role ordered fallback lists.
    pub models: HashMap<ModelRole, Vec<ModelBinding>>,
    /// Memory fabric settings.
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Rate and cost limits.
    #[serde(default)]
    pub limits: LimiterConfig,
    /// Security settings.
    #[serde(default)]
    pub security: SecurityConfig,
    /// Channel adapters, keyed by channel name.
    #[serde(default)]
    pub adapters: HashMap<String, AdapterConfig>,
    /// Scheduler settings.
    #[serde(default)]
    pub scheduler: RuntimeConfig,
    /// Self-healing settings.
    #[serde(default)]
    pub heal: HealConfig,
    /// Search service endpoint for the `web_search` tool.
    #[serde(default)]
    pub search_endpoint: Option<String>,
    /// Outbound webhook URLs for enumerated events.
    #[serde(default)]
    pub webhook_outbound: Vec<String>,
    /// SHA-256 of the gateway bearer token, hex. Compared in constant
    /// time; the plaintext token never persists.
    #[serde(default)]
    pub api_token_sha256: Option<String>,
}

impl ItakConfig {
    /// A runnable default with the given port and a scripted-free model
    /// table the operator is expected to replace.
    #[must_use]
    pub fn defaults(port: u16) -> Self {
        let mut models = HashMap::new();
        models.insert(
            ModelRole::Chat,
            vec![ModelBinding::new("local", "itak-chat").free_model()],
        );
        models.insert(
            ModelRole::Utility,
            vec![ModelBinding::new("local", "itak-utility").free_model()],
        );
        models.insert(
            ModelRole::Embedding,
            vec![ModelBinding::new("local", "itak-embed").free_model()],
        );
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            deployment_mode: DeploymentMode::default(),
            port,
            models,
            memory: MemoryConfig::default(),
            limits: LimiterConfig::default(),
            security: SecurityConfig::default(),
            adapters: HashMap::new(),
            scheduler: RuntimeConfig::default(),
            heal: HealConfig::default(),
            search_endpoint: None,
            webhook_outbound: Vec::new(),
            api_token_sha256: None,
        }
    }

    /// Semantic validation beyond what serde enforces.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] with the first violation.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.schema_version > CONFIG_SCHEMA_VERSION {
            return Err(ConfigError::SchemaTooNew {
                found: self.schema_version,
                supported: CONFIG_SCHEMA_VERSION,
            });
        }
        if self.port < 1024 {
            return Err(ConfigError::Invalid(format!(
                "port {} is privileged",
                self.port
            )));
        }
        let chat = self
            .models
            .get(&ModelRole::Chat)
            .filter(|b| !b.is_empty());
        if chat.is_none() {
            return Err(ConfigError::Invalid(
                "models.chat requires at least one binding".into(),
            ));
        }
        for (role, bindings) in &self.models {
            for binding in bindings {
                if binding.context_window == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "models.{role}: context_window must be positive"
                    )));
                }
                if !(0.0..=1.0).contains(&binding.history_fraction) {
                    return Err(ConfigError::Invalid(format!(
                        "models.{role}: history_fraction out of range"
                    )));
                }
            }
        }
        let weights = self.memory.ranker;
        let sum = weights.vector + weights.bm25 + weights.graph;
        if !(0.5..=1.5).contains(&sum) {
            return Err(ConfigError::Invalid(format!(
                "memory.ranker weights sum to {sum:.2}; expected about 1.0"
            )));
        }
        if self.memory.soft_pressure >= self.memory.hard_pressure {
            return Err(ConfigError::Invalid(
                "memory.soft_pressure must be below hard_pressure".into(),
            ));
        }
        if self.limits.budgets.soft_percent > self.limits.budgets.hard_percent {
            return Err(ConfigError::Invalid(
                "limits.budgets: soft_percent above hard_percent".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        ItakConfig::defaults(40123).validate().unwrap();
    }

    #[test]
    fn missing_chat_role_is_invalid() {
        let mut config = ItakConfig::defaults(40123);
        config.models.remove(&ModelRole::Chat);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(message)) if message.contains("models.chat")
        ));
    }

    #[test]
    fn newer_schema_is_refused() {
        let mut config = ItakConfig::defaults(40123);
        config.schema_version = CONFIG_SCHEMA_VERSION + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SchemaTooNew { .. })
        ));
    }

    #[test]
    fn inverted_pressure_thresholds_are_invalid() {
        let mut config = ItakConfig::defaults(40123);
        config.memory.soft_pressure = 0.95;
        config.memory.hard_pressure = 0.75;
        assert!(config.validate().is_err());
    }
}
