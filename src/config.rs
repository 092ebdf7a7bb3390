//! Configuration management for SolarBridge

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP status server configuration
    pub server: ServerConfig,
    /// MQTT broker configuration
    pub mqtt: MqttConfig,
    /// Inverter connection and polling
    pub device: DeviceConfig,
    /// Energy counter persistence
    pub energy: EnergyConfig,
    /// Default log filter when RUST_LOG is not set
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Enable the HTTP API
    pub enabled: bool,
    /// HTTP API host
    pub host: String,
    /// HTTP API port
    pub port: u16,
    /// Enable metrics endpoint
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Publish to MQTT at all
    pub enabled: bool,
    /// MQTT broker host
    pub host: String,
    /// MQTT broker port
    pub port: u16,
    /// Client ID
    pub client_id: String,
    /// Topic prefix
    pub topic_prefix: String,
    /// Home Assistant discovery prefix, empty to disable discovery
    pub discovery_prefix: String,
    /// QoS level (0, 1, or 2)
    pub qos: u8,
    /// Retain per-register state messages
    pub retain: bool,
    /// Username (optional)
    pub username: Option<String>,
    /// Password (optional)
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// How to reach the inverter
    pub connection: ConnectionConfig,
    /// Modbus unit ID
    pub unit_id: u8,
    /// Polling interval in seconds
    pub poll_interval_secs: u64,
    /// Timeout for a single register request in milliseconds
    pub read_timeout_ms: u64,
    /// Attempts per register request
    pub retries: u32,
    /// Pause between attempts in milliseconds
    pub retry_backoff_ms: u64,
    /// Register table CSV, built-in table when unset
    pub registers_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionConfig {
    /// Modbus TCP framing
    Tcp(TcpConnection),
    /// Modbus RTU framing over a TCP serial bridge
    RtuOverTcp(TcpConnection),
    /// Modbus RTU on a local serial port
    Rtu(RtuConnection),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpConnection {
    /// Host address
    pub host: String,
    /// Port
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtuConnection {
    /// Serial port path (e.g., /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits
    pub data_bits: u8,
    /// Stop bits
    pub stop_bits: u8,
    /// Parity: "none", "even", "odd"
    pub parity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyConfig {
    /// JSON file holding the energy counters
    pub state_file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 3000,
            metrics_enabled: true,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 1883,
            client_id: "solarbridge".to_string(),
            topic_prefix: "vevor_eml3500".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            qos: 1,
            retain: true,
            username: None,
            password: None,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::RtuOverTcp(TcpConnection {
                host: "localhost".to_string(),
                port: 23,
            }),
            unit_id: 1,
            poll_interval_secs: 60,
            read_timeout_ms: 5000,
            retries: 3,
            retry_backoff_ms: 1000,
            registers_file: None,
        }
    }
}

impl DeviceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Default for EnergyConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("energy_state.json"),
        }
    }
}

impl Config {
    /// Parse a YAML document; missing sections take their defaults
    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut config: Config =
            serde_yaml::from_str(content).with_context(|| "Failed to parse config file")?;
        if config.log_level.is_empty() {
            config.log_level = "info".to_string();
        }
        Ok(config)
    }

    /// Load from a file, or use defaults when it does not exist
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_yaml(&content)
        } else {
            tracing::warn!("Config file {} not found, using defaults", path.display());
            Self::from_yaml("{}")
        }
    }
}

/// Load configuration from file or use defaults
pub fn load_config() -> Result<Config> {
    let config_path =
        std::env::var("SOLARBRIDGE_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    Config::from_path(config_path)
}
