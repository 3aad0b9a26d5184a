//! TOML configuration file loading
//!
//! Supports `~/.config/hearth/config.toml` as a persistent config source.
//! Every field is optional; the file is a partial overlay on top of
//! defaults and is itself overridden by environment variables.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::GarageDoorsConfig;
use crate::relay::RetryPolicy;
use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct HubConfigFile {
    /// Hub identity (UUID)
    pub id: Option<String>,

    /// Shared envelope key file
    pub key_file: Option<String>,

    /// Ed25519 signing identity file
    pub identity_file: Option<String>,

    /// How long module teardown waits for in-flight calls
    pub drain_timeout_ms: Option<u64>,

    /// WAN relay connection
    #[serde(default)]
    pub relay: RelayFileConfig,

    /// Local broker tuning
    #[serde(default)]
    pub broker: BrokerFileConfig,

    /// How modules are found
    #[serde(default)]
    pub discovery: DiscoveryFileConfig,

    /// Modules the hub knows how to run in-process
    #[serde(default)]
    pub modules: Vec<ModuleFileConfig>,
}

/// Relay section
#[derive(Debug, Default, Deserialize)]
pub struct RelayFileConfig {
    pub enabled: Option<bool>,
    pub url: Option<String>,
    pub reconnect: Option<RetryPolicy>,
}

/// Broker section
#[derive(Debug, Default, Deserialize)]
pub struct BrokerFileConfig {
    /// Per-subscription channel capacity
    pub capacity: Option<usize>,
    /// Serve the broker endpoint socket
    pub listen: Option<bool>,
    pub socket: Option<String>,
}

/// Discovery section
#[derive(Debug, Default, Deserialize)]
pub struct DiscoveryFileConfig {
    /// `socket_dir` or `static`
    pub mode: Option<String>,
    pub socket_dir: Option<String>,
}

/// One `[[modules]]` entry
#[derive(Debug, Deserialize)]
pub struct ModuleFileConfig {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub garage_doors: Option<GarageDoorsConfig>,
}

/// Load the TOML config file
///
/// With an explicit `path` the file must exist. Without one the standard
/// path is tried and a missing file yields the defaults.
///
/// # Errors
///
/// Returns error if an explicit file is missing, or any file cannot be read
/// or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<HubConfigFile> {
    let path = match path {
        Some(path) => {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            path.to_path_buf()
        }
        None => {
            let Some(path) = config_file_path() else {
                return Ok(HubConfigFile::default());
            };
            if !path.exists() {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(HubConfigFile::default());
            }
            path
        }
    };

    let content = std::fs::read_to_string(&path).map_err(|e| {
        Error::Config(format!("failed to read config file {}: {e}", path.display()))
    })?;
    let config = parse_config_file(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Parse config file contents
///
/// # Errors
///
/// Returns [`Error::Toml`] if the contents are not a valid config file
pub fn parse_config_file(content: &str) -> Result<HubConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/hearth/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("hearth").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = parse_config_file("").unwrap();
        assert!(config.id.is_none());
        assert!(config.modules.is_empty());
        assert!(config.relay.enabled.is_none());
    }

    #[test]
    fn modules_parse_with_typed_sections() {
        let config = parse_config_file(
            r#"
            [[modules]]
            name = "garage-doors"
            kind = "garage-doors"

            [modules.garage_doors]
            pins = { main = 17, side = 27 }
            trigger_time_ms = 400
            "#,
        )
        .unwrap();

        let module = &config.modules[0];
        assert_eq!(module.name, "garage-doors");
        let doors = module.garage_doors.as_ref().unwrap();
        assert_eq!(doors.pins["side"], 27);
        assert_eq!(doors.trigger_time_ms, 400);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config_file(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "modules = 7").unwrap();
        assert!(load_config_file(Some(&path)).is_err());
    }
}
