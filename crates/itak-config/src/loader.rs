//! Config file loading with first-run initialization.

use rand::Rng;
use std::path::Path;
use tracing::info;

use crate::types::{ConfigResult, ItakConfig};

/// Load `config.json`, or write and return defaults on first run. The
/// generated port is persisted so restarts keep it.
///
/// # Errors
///
/// Returns [`ConfigError`](crate::ConfigError) on I/O, parse, or
/// validation failure.
pub fn load_or_init(path: &Path) -> ConfigResult<ItakConfig> {
    if path.exists() {
        let body = std::fs::read_to_string(path)?;
        let config: ItakConfig = serde_json::from_str(&body)?;
        config.validate()?;
        return Ok(config);
    }

    let port = rand::thread_rng().gen_range(20000..60000);
    let config = ItakConfig::defaults(port);
    save(path, &config)?;
    info!(path = %path.display(), port, "Wrote initial configuration");
    Ok(config)
}

/// Persist a configuration.
///
/// # Errors
///
/// Returns [`ConfigError`](crate::ConfigError) on I/O or encode failure.
pub fn save(path: &Path, config: &ItakConfig) -> ConfigResult<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let body = serde_json::to_string_pretty(config)?;
    std::fs::write(path, body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_persists_a_random_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let first = load_or_init(&path).unwrap();
        assert!(path.exists());
        let second = load_or_init(&path).unwrap();
        assert_eq!(first.port, second.port);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_or_init(&path).is_err());
    }
}
