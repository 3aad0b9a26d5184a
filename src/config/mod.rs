//! Configuration management for the Hearth hub
//!
//! Values resolve as environment > TOML file > defaults. The resolved
//! [`Config`] is validated once at startup.

pub mod file;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::DEFAULT_CAPACITY;
use crate::registry::DEFAULT_DRAIN_TIMEOUT;
use crate::relay::RelayConfig;
use crate::security::HubIdentity;
use crate::{Error, Result};

use file::HubConfigFile;

/// Hearth hub configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Hub identity on the relay
    pub id: Uuid,

    /// Shared envelope key
    pub key_file: PathBuf,

    /// Signing identity
    pub identity_file: PathBuf,

    /// How long module teardown waits for in-flight calls
    pub drain_timeout: Duration,

    /// WAN relay connection
    pub relay: RelayConfig,

    /// Local broker tuning
    pub broker: BrokerConfig,

    /// How modules are found
    pub discovery: DiscoveryConfig,

    /// Modules runnable in-process or via `serve-module`
    pub modules: Vec<ModuleConfig>,
}

/// Local broker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Per-subscription channel capacity
    pub capacity: usize,
    /// Serve topic publish/request to local processes
    pub listen: bool,
    /// Socket the broker endpoint listens on
    pub socket: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            listen: true,
            socket: default_broker_socket(),
        }
    }
}

/// Where module registrations come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// Watch the socket directory for out-of-process modules
    #[default]
    SocketDir,
    /// Run the configured modules in-process
    Static,
}

impl FromStr for DiscoveryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "socket_dir" | "socket-dir" | "sockets" => Ok(Self::SocketDir),
            "static" => Ok(Self::Static),
            other => Err(Error::Config(format!(
                "unknown discovery mode '{other}' (expected socket_dir or static)"
            ))),
        }
    }
}

/// Discovery configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub mode: DiscoveryMode,
    /// Directory module RPC sockets live in
    pub socket_dir: PathBuf,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::default(),
            socket_dir: default_socket_dir(),
        }
    }
}

/// Kinds of module the hub can build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// GPIO garage-door openers
    GarageDoors,
}

impl FromStr for ModuleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "garage-doors" => Ok(Self::GarageDoors),
            other => Err(Error::Config(format!("unknown module kind '{other}'"))),
        }
    }
}

/// One configured module
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    /// Registry and topic name
    pub name: String,
    pub kind: ModuleKind,
    /// Section for [`ModuleKind::GarageDoors`]
    pub garage_doors: Option<GarageDoorsConfig>,
}

/// How garage-door pins are driven
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpioBackend {
    /// Linux `/sys/class/gpio`
    #[default]
    Sysfs,
    /// In-memory pins for development
    Simulated,
}

/// Garage-door module configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GarageDoorsConfig {
    /// Door name to GPIO pin number
    pub pins: BTreeMap<String, u32>,

    /// How long a normal trigger holds the line low
    #[serde(default = "default_trigger_time_ms")]
    pub trigger_time_ms: u64,

    /// How long a forced trigger holds the line low
    #[serde(default = "default_force_trigger_time_ms")]
    pub force_trigger_time_ms: u64,

    #[serde(default)]
    pub gpio: GpioBackend,
}

const fn default_trigger_time_ms() -> u64 {
    500
}

const fn default_force_trigger_time_ms() -> u64 {
    10_000
}

impl GarageDoorsConfig {
    /// Normal trigger window
    #[must_use]
    pub const fn trigger_time(&self) -> Duration {
        Duration::from_millis(self.trigger_time_ms)
    }

    /// Forced trigger window
    #[must_use]
    pub const fn force_trigger_time(&self) -> Duration {
        Duration::from_millis(self.force_trigger_time_ms)
    }
}

/// Default key file: `~/.config/hearth/hub.key`
fn default_key_file() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from(".config/hearth/hub.key"),
        |d| d.config_dir().join("hearth").join("hub.key"),
    )
}

fn runtime_dir() -> PathBuf {
    directories::BaseDirs::new()
        .and_then(|d| d.runtime_dir().map(Path::to_path_buf))
        .unwrap_or_else(std::env::temp_dir)
        .join("hearth")
}

/// Default socket directory: `$XDG_RUNTIME_DIR/hearth/modules`, falling back
/// to the system temp dir
fn default_socket_dir() -> PathBuf {
    runtime_dir().join("modules")
}

/// Default broker endpoint: `$XDG_RUNTIME_DIR/hearth/broker.sock`
#[must_use]
pub fn default_broker_socket() -> PathBuf {
    runtime_dir().join("broker.sock")
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{name} must be a boolean, got '{value}'"))),
    }
}

impl Config {
    /// Load configuration from the TOML file and process environment
    ///
    /// # Errors
    ///
    /// Returns error if the config file or an override is malformed
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path)?;
        Self::resolve(fc, |name| std::env::var(name).ok())
    }

    /// Resolve a parsed config file against an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value cannot be parsed
    pub fn resolve(fc: HubConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // Hub id (env > toml > generated)
        let id = match env("HEARTH_ID").or(fc.id) {
            Some(raw) => Uuid::parse_str(raw.trim())
                .map_err(|e| Error::Config(format!("invalid hub id '{raw}': {e}")))?,
            None => {
                let id = Uuid::new_v4();
                tracing::warn!(id = %id, "no hub id configured, generated one for this run");
                id
            }
        };

        let key_file = env("HEARTH_KEY_FILE")
            .or(fc.key_file)
            .map_or_else(default_key_file, PathBuf::from);
        let identity_file = fc
            .identity_file
            .map_or_else(HubIdentity::default_path, PathBuf::from);

        let drain_timeout = fc
            .drain_timeout_ms
            .map_or(DEFAULT_DRAIN_TIMEOUT, Duration::from_millis);

        // Relay (env > toml > disabled)
        let relay_url = env("HEARTH_RELAY_URL").or(fc.relay.url);
        let relay_enabled = match env("HEARTH_RELAY_ENABLED") {
            Some(raw) => parse_bool("HEARTH_RELAY_ENABLED", &raw)?,
            None => fc.relay.enabled.unwrap_or(relay_url.is_some()),
        };
        let relay = RelayConfig {
            enabled: relay_enabled,
            url: relay_url,
            reconnect: fc.relay.reconnect.unwrap_or_default(),
        };

        let broker = BrokerConfig {
            capacity: fc.broker.capacity.unwrap_or(DEFAULT_CAPACITY),
            listen: fc.broker.listen.unwrap_or(true),
            socket: env("HEARTH_BROKER_SOCKET")
                .or(fc.broker.socket)
                .map_or_else(default_broker_socket, PathBuf::from),
        };

        let discovery = DiscoveryConfig {
            mode: env("HEARTH_DISCOVERY")
                .or(fc.discovery.mode)
                .map(|mode| mode.parse::<DiscoveryMode>())
                .transpose()?
                .unwrap_or_default(),
            socket_dir: env("HEARTH_SOCKET_DIR")
                .or(fc.discovery.socket_dir)
                .map_or_else(default_socket_dir, PathBuf::from),
        };

        let modules = fc
            .modules
            .into_iter()
            .map(|m| {
                Ok(ModuleConfig {
                    kind: m.kind.parse()?,
                    name: m.name,
                    garage_doors: m.garage_doors,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id,
            key_file,
            identity_file,
            drain_timeout,
            relay,
            broker,
            discovery,
            modules,
        })
    }

    /// Check the configuration for problems, reporting the first one
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.relay.enabled && self.relay.url.is_none() {
            return Err(Error::Config(
                "relay is enabled but no relay url is set".to_string(),
            ));
        }
        if self.drain_timeout.is_zero() {
            return Err(Error::Config("drain timeout must be positive".to_string()));
        }
        if self.broker.capacity == 0 {
            return Err(Error::Config("broker capacity must be at least 1".to_string()));
        }

        let mut seen = HashSet::new();
        for module in &self.modules {
            if module.name.trim().is_empty() {
                return Err(Error::Config("module name must not be empty".to_string()));
            }
            if !seen.insert(module.name.as_str()) {
                return Err(Error::Config(format!(
                    "module '{}' is configured more than once",
                    module.name
                )));
            }
            module.validate()?;
        }

        if self.discovery.mode == DiscoveryMode::Static && self.modules.is_empty() {
            tracing::warn!("static discovery with no modules configured");
        }
        Ok(())
    }

    /// Configured module by name
    #[must_use]
    pub fn module(&self, name: &str) -> Option<&ModuleConfig> {
        self.modules.iter().find(|m| m.name == name)
    }
}

impl ModuleConfig {
    /// Check the kind-specific section
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the problem
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            ModuleKind::GarageDoors => {
                let Some(section) = &self.garage_doors else {
                    return Err(Error::Config(format!(
                        "module '{}' is missing its [garage_doors] section",
                        self.name
                    )));
                };
                section.validate(&self.name)
            }
        }
    }
}

impl GarageDoorsConfig {
    fn validate(&self, module: &str) -> Result<()> {
        if self.pins.is_empty() {
            return Err(Error::Config(format!("module '{module}' has no doors in pins")));
        }
        if self.trigger_time_ms == 0 || self.force_trigger_time_ms == 0 {
            return Err(Error::Config(format!(
                "module '{module}' trigger times must be greater than zero"
            )));
        }
        if self.force_trigger_time_ms < self.trigger_time_ms {
            return Err(Error::Config(format!(
                "module '{module}' force_trigger_time_ms is shorter than trigger_time_ms"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::config::file::parse_config_file;

    const DOORS: &str = r#"
        id = "0f8fad5b-d9cb-469f-a165-70867728950e"

        [discovery]
        mode = "static"
        socket_dir = "/run/hearth"

        [[modules]]
        name = "garage-doors"
        kind = "garage_doors"

        [modules.garage_doors]
        pins = { main = 17 }
        trigger_time_ms = 500
        force_trigger_time_ms = 5000
        gpio = "simulated"
    "#;

    fn resolve(toml: &str, env: &[(&str, &str)]) -> Result<Config> {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::resolve(parse_config_file(toml)?, |name| env.get(name).cloned())
    }

    #[test]
    fn file_values_are_used() {
        let config = resolve(DOORS, &[]).unwrap();
        config.validate().unwrap();

        assert_eq!(config.id.to_string(), "0f8fad5b-d9cb-469f-a165-70867728950e");
        assert_eq!(config.discovery.mode, DiscoveryMode::Static);
        assert_eq!(config.discovery.socket_dir, PathBuf::from("/run/hearth"));
        assert!(!config.relay.enabled);

        let module = config.module("garage-doors").unwrap();
        assert_eq!(module.kind, ModuleKind::GarageDoors);
        let doors = module.garage_doors.as_ref().unwrap();
        assert_eq!(doors.gpio, GpioBackend::Simulated);
        assert_eq!(doors.force_trigger_time(), Duration::from_secs(5));
    }

    #[test]
    fn environment_overrides_file() {
        let config = resolve(
            DOORS,
            &[
                ("HEARTH_DISCOVERY", "socket_dir"),
                ("HEARTH_SOCKET_DIR", "/tmp/modules"),
                ("HEARTH_RELAY_URL", "wss://relay.example.com"),
            ],
        )
        .unwrap();

        assert_eq!(config.discovery.mode, DiscoveryMode::SocketDir);
        assert_eq!(config.discovery.socket_dir, PathBuf::from("/tmp/modules"));
        assert!(config.relay.enabled);
    }

    #[test]
    fn broker_endpoint_defaults_and_overrides() {
        let config = resolve("", &[]).unwrap();
        assert!(config.broker.listen);
        assert_eq!(config.broker.socket, default_broker_socket());
        assert_eq!(config.drain_timeout, DEFAULT_DRAIN_TIMEOUT);

        let config = resolve(
            "drain_timeout_ms = 250\n[broker]\nlisten = false\nsocket = \"/run/hearth/broker.sock\"\n",
            &[("HEARTH_BROKER_SOCKET", "/tmp/broker.sock")],
        )
        .unwrap();
        assert!(!config.broker.listen);
        assert_eq!(config.broker.socket, PathBuf::from("/tmp/broker.sock"));
        assert_eq!(config.drain_timeout, Duration::from_millis(250));
    }

    #[test]
    fn relay_can_be_disabled_from_environment() {
        let config = resolve(
            "[relay]\nurl = \"wss://relay.example.com\"\n",
            &[("HEARTH_RELAY_ENABLED", "false")],
        )
        .unwrap();
        assert!(!config.relay.enabled);
    }

    #[test]
    fn missing_id_is_generated() {
        let config = resolve("", &[]).unwrap();
        assert!(!config.id.is_nil());
    }

    #[test]
    fn malformed_overrides_are_rejected() {
        assert!(resolve("", &[("HEARTH_ID", "not-a-uuid")]).is_err());
        assert!(resolve("", &[("HEARTH_DISCOVERY", "mdns")]).is_err());
        assert!(resolve("", &[("HEARTH_RELAY_ENABLED", "maybe")]).is_err());
    }

    #[test]
    fn unknown_module_kind_is_rejected() {
        let err = resolve("[[modules]]\nname = \"x\"\nkind = \"sprinklers\"\n", &[]).unwrap_err();
        assert!(err.to_string().contains("unknown module kind"));
    }

    #[test]
    fn validation_reports_problems() {
        let cases = [
            (DOORS.replace("pins = { main = 17 }", "pins = {}"), "no doors"),
            (DOORS.replace("trigger_time_ms = 500", "trigger_time_ms = 0"), "greater than zero"),
            (DOORS.replace("5000", "100"), "shorter"),
            (
                DOORS.replace("[modules.garage_doors]", "[modules.other]"),
                "missing its [garage_doors]",
            ),
            (format!("{DOORS}\n[[modules]]\nname = \"garage-doors\"\nkind = \"garage-doors\"\n"), "more than once"),
            (format!("[relay]\nenabled = true\n{DOORS}"), "no relay url"),
            (format!("drain_timeout_ms = 0\n{DOORS}"), "drain timeout"),
        ];

        for (toml, expected) in cases {
            let err = resolve(&toml, &[]).unwrap().validate().unwrap_err();
            assert!(err.to_string().contains(expected), "{err} should mention {expected}");
        }
    }
}
