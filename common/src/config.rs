use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
pub const DEFAULT_DEVICE_NAME: &str = "Badge";

// Fallback network baked in at build time, overridable per event.
pub const FALLBACK_WIFI_SSID: &str = match option_env!("BADGE_WIFI_SSID") {
    Some(ssid) => ssid,
    None => "badge-net",
};
pub const FALLBACK_WIFI_PASS: &str = match option_env!("BADGE_WIFI_PASS") {
    Some(pass) => pass,
    None => "badge-net-open",
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("mqtt broker missing from configuration")]
    MissingBroker,
    #[error("wifi credentials incomplete and use_defaults not set")]
    IncompleteWifi,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WifiConfig {
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub use_defaults: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub broker: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub wifi: WifiConfig,
    pub mqtt: MqttConfig,
}

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}

fn default_discovery_prefix() -> String {
    DEFAULT_DISCOVERY_PREFIX.to_string()
}

fn default_device_name() -> String {
    DEFAULT_DEVICE_NAME.to_string()
}

impl BridgeConfig {
    // Soft contract used by the boot path: any failure disables the bridge.
    pub fn load(path: &Path) -> Option<Self> {
        Self::from_file(path).ok()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.broker.trim().is_empty() {
            return Err(ConfigError::MissingBroker);
        }

        if !self.wifi.use_defaults {
            let ssid_present = self
                .wifi
                .ssid
                .as_deref()
                .is_some_and(|ssid| !ssid.trim().is_empty());
            let pass_present = self.wifi.password.is_some();
            if !ssid_present || !pass_present {
                return Err(ConfigError::IncompleteWifi);
            }
        }

        Ok(())
    }

    // `use_defaults` wins: custom fields supplied alongside it are ignored,
    // never merged.
    pub fn wifi_credentials(&self) -> (&str, &str) {
        if self.wifi.use_defaults {
            return (FALLBACK_WIFI_SSID, FALLBACK_WIFI_PASS);
        }

        (
            self.wifi.ssid.as_deref().unwrap_or(""),
            self.wifi.password.as_deref().unwrap_or(""),
        )
    }
}
