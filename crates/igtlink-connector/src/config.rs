//! Connector configuration.
//!
//! A hub configuration is a JSON file holding one entry per connector:
//!
//! ```json
//! {
//!   "connectors": [
//!     { "name": "Scanner", "role": { "type": "client", "host": "localhost", "port": 18944 },
//!       "persistent": true }
//!   ]
//! }
//! ```
//!
//! Missing fields take their defaults; unknown fields are logged and ignored.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use igtlink_types::ConnectorRole;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{ConnectorError, Result};

/// Default OpenIGTLink port
pub const DEFAULT_PORT: u16 = 18944;

fn default_name() -> String {
    "IGTLConnector".to_string()
}

fn default_io_timeout_ms() -> u64 {
    5
}

fn default_reconnect_base_ms() -> u64 {
    100
}

fn default_reconnect_max_ms() -> u64 {
    5000
}

fn default_command_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

/// Persisted settings of one connector session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorConfig {
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    pub role: ConnectorRole,

    /// Restart with the hub and keep retrying failed client connects
    #[serde(default)]
    pub persistent: bool,

    /// Accept only messages for devices already on the connector
    #[serde(default)]
    pub restrict_device_names: bool,

    /// I/O budget per `periodic_process` call
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Default timeout for commands and pending peer requests
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub check_crc: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            role: ConnectorRole::Unspecified,
            persistent: false,
            restrict_device_names: false,
            io_timeout_ms: default_io_timeout_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            command_timeout_secs: default_command_timeout_secs(),
            check_crc: true,
        }
    }
}

impl ConnectorConfig {
    #[must_use]
    pub fn server(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            role: ConnectorRole::Server { port },
            ..Self::default()
        }
    }

    #[must_use]
    pub fn client(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            role: ConnectorRole::Client {
                host: host.into(),
                port,
            },
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    #[must_use]
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// # Errors
    ///
    /// Returns `ConnectorError::Config` for an empty name or an inverted
    /// reconnect range.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ConnectorError::Config("connector name is empty".into()));
        }
        if self.reconnect_base_ms > self.reconnect_max_ms {
            return Err(ConnectorError::Config(format!(
                "{}: reconnectBaseMs ({}) exceeds reconnectMaxMs ({})",
                self.name, self.reconnect_base_ms, self.reconnect_max_ms
            )));
        }
        Ok(())
    }
}

/// All connectors managed by a hub
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    #[serde(default)]
    pub connectors: Vec<ConnectorConfig>,
}

impl HubConfig {
    /// Default config file location (`~/.config/igtlink/connectors.json` on Linux).
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "igtlink").map(|dirs| dirs.config_dir().join("connectors.json"))
    }

    /// Load from `path`. A missing file yields the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or a
    /// connector entry fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        warn_unknown_fields(&content, "connectors.json");
        let config: Self = serde_json::from_str(&content)?;
        for connector in &config.connectors {
            connector.validate()?;
        }
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails or the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

const CONNECTOR_KEYS: &[&str] = &[
    "name",
    "role",
    "persistent",
    "restrictDeviceNames",
    "ioTimeoutMs",
    "reconnectBaseMs",
    "reconnectMaxMs",
    "commandTimeoutSecs",
    "checkCrc",
];

const ROLE_KEYS: &[&str] = &["type", "host", "port"];

/// Warn about fields the configuration does not know.
pub fn warn_unknown_fields(content: &str, config_name: &str) {
    let Ok(value) = serde_json::from_str::<Value>(content) else {
        return;
    };

    for path in find_unknown_keys(&value) {
        warn!("Unknown config field in {config_name}: {path}");
    }
}

fn find_unknown_keys(value: &Value) -> Vec<String> {
    let mut unknowns = Vec::new();
    let Value::Object(root) = value else {
        return unknowns;
    };

    for (key, child) in root {
        if key != "connectors" {
            unknowns.push(key.clone());
            continue;
        }
        let Value::Array(entries) = child else {
            continue;
        };
        for (index, entry) in entries.iter().enumerate() {
            let prefix = format!("connectors[{index}]");
            unknowns.extend(unknown_in(entry, CONNECTOR_KEYS, &prefix));
            if let Some(role) = entry.get("role") {
                unknowns.extend(unknown_in(role, ROLE_KEYS, &format!("{prefix}.role")));
            }
        }
    }

    unknowns
}

fn unknown_in(value: &Value, expected: &[&str], prefix: &str) -> Vec<String> {
    let Value::Object(obj) = value else {
        return Vec::new();
    };
    let expected: HashSet<&str> = expected.iter().copied().collect();
    obj.keys()
        .filter(|key| !expected.contains(key.as_str()))
        .map(|key| format!("{prefix}.{key}"))
        .collect()
}
