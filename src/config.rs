// Deployment configuration - the YAML a user writes for one device
//
// The device, mqtt and wifi sections go verbatim into config.json, the entity list
// into entities.json.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Generic,
    Enviro,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceModel {
    pub name: String,
    pub domain: String,
    #[serde(rename = "type", default)]
    pub device_type: DeviceType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttModel {
    pub server: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_ssl")]
    pub ssl: bool,
}

fn default_ssl() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WifiModel {
    pub ssid: String,
    pub password: String,
}

/// A single entity. Everything besides `name` and `cls` is entity-specific
/// and passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityModel {
    pub name: String,
    pub cls: String,
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigModel {
    #[serde(default)]
    pub debug: bool,
    pub device: DeviceModel,
    pub mqtt: MqttModel,
    pub wifi: WifiModel,
    #[serde(default)]
    pub entities: Vec<EntityModel>,
}

impl ConfigModel {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_yaml(&text)?;
        log::debug!(
            "Loaded configuration for '{}' with {} entities",
            config.device.name,
            config.entities.len()
        );
        Ok(config)
    }

    /// Base URL of the device's OTA server. An explicit `host` replaces the
    /// name/domain derived hostname.
    pub fn device_url(&self, host: Option<&str>) -> String {
        match host {
            Some(host) => format!("http://{}", host.trim_end_matches('/')),
            None => format!("http://{}.{}", slugify(&self.device.name), self.device.domain),
        }
    }
}

/// Turn a name into a hostname-safe slug: lowercase, anything outside
/// `[a-z0-9]` becomes `-`.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' })
        .collect()
}
