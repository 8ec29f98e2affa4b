//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `sensor-node.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - UplinkConfig: Where readings go and who they belong to.
//!     - PollingConfig: How often each sensor is read and the deadband width.
//!     - SensorsConfig: Backend choice, attach timeout, hub port per sensor.
//!     - LoggingConfig: Default log level.
//!
//! ==============================================================================

use crate::domain::SensorKind;
use crate::filter::DEFAULT_THRESHOLD;
use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE: &str = "sensor-node.toml";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub uplink: UplinkConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub sensors: SensorsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UplinkConfig {
    pub endpoint_url: String,
    pub user_id: String,
    pub plant_id: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_change_threshold")]
    pub change_threshold: f64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// vendor python SDK through a bridge process
    Phidget22,
    /// in-memory channels, no hardware needed
    Mock,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SensorsConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,
    #[serde(default = "default_attach_timeout_ms")]
    pub attach_timeout_ms: u64,
    /// interpreter used for the phidget22 bridge
    #[serde(default = "default_python")]
    pub python: String,
    /// extra PYTHONPATH entry where the vendor SDK lives (e.g. a venv)
    #[serde(default)]
    pub python_path: Option<String>,
    /// how long a bridge may take to answer a read or close
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    #[serde(default = "ChannelConfig::temperature")]
    pub temperature: ChannelConfig,
    #[serde(default = "ChannelConfig::lux")]
    pub lux: ChannelConfig,
    #[serde(default = "ChannelConfig::humidity")]
    pub humidity: ChannelConfig,
    #[serde(default = "ChannelConfig::voltage")]
    pub voltage: ChannelConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ChannelConfig {
    pub hub_port: u8,
    pub sensor_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// log a readable line for every forwarded reading
    #[serde(default = "default_true")]
    pub show_sensor_data: bool,
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_change_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

fn default_backend() -> Backend {
    Backend::Phidget22
}

fn default_attach_timeout_ms() -> u64 {
    5000
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_reply_timeout_ms() -> u64 {
    5000
}

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl ChannelConfig {
    fn new(hub_port: u8) -> Self {
        Self { hub_port, sensor_id: hub_port.to_string() }
    }

    fn temperature() -> Self {
        Self::new(0)
    }

    fn lux() -> Self {
        Self::new(1)
    }

    fn humidity() -> Self {
        Self::new(2)
    }

    fn voltage() -> Self {
        Self::new(3)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            change_threshold: default_change_threshold(),
        }
    }
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            attach_timeout_ms: default_attach_timeout_ms(),
            python: default_python(),
            python_path: None,
            reply_timeout_ms: default_reply_timeout_ms(),
            temperature: ChannelConfig::temperature(),
            lux: ChannelConfig::lux(),
            humidity: ChannelConfig::humidity(),
            voltage: ChannelConfig::voltage(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_level(), show_sensor_data: true }
    }
}

impl SensorsConfig {
    pub fn channel(&self, kind: SensorKind) -> &ChannelConfig {
        match kind {
            SensorKind::Temperature => &self.temperature,
            SensorKind::Lux => &self.lux,
            SensorKind::Humidity => &self.humidity,
            SensorKind::Voltage => &self.voltage,
        }
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl NodeConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;
        Self::parse(&content)
    }

    /// Parse and validate a toml document
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: NodeConfig = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let paths = [
            std::path::PathBuf::from("config").join(CONFIG_FILE),
            std::path::PathBuf::from("..").join("config").join(CONFIG_FILE),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {:#}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.uplink.endpoint_url.trim().is_empty() {
            bail!("uplink.endpoint_url must not be empty");
        }
        if self.uplink.user_id.trim().is_empty() {
            bail!("uplink.user_id must not be empty");
        }
        if self.uplink.plant_id.trim().is_empty() {
            bail!("uplink.plant_id must not be empty");
        }
        let threshold = self.polling.change_threshold;
        if !threshold.is_finite() || threshold < 0.0 {
            bail!("polling.change_threshold must be a finite non-negative number, got {}", threshold);
        }
        if self.polling.poll_interval_ms == 0 {
            bail!("polling.poll_interval_ms must be greater than zero");
        }
        if self.sensors.reply_timeout_ms == 0 {
            bail!("sensors.reply_timeout_ms must be greater than zero");
        }

        let mut ports = HashSet::new();
        for kind in SensorKind::ALL {
            let channel = self.sensors.channel(kind);
            if !ports.insert(channel.hub_port) {
                bail!("hub port {} is assigned to more than one sensor ({})", channel.hub_port, kind);
            }
        }
        Ok(())
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│        SENSOR NODE CONFIGURATION        │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Endpoint: {}", self.uplink.endpoint_url);
        println!("│ User: {} / Plant: {}", self.uplink.user_id, self.uplink.plant_id);
        println!("│ Backend: {:?}", self.sensors.backend);
        println!("│ Poll Interval: {}ms", self.polling.poll_interval_ms);
        println!("│ Change Threshold: {}", self.polling.change_threshold);
        for kind in SensorKind::ALL {
            let channel = self.sensors.channel(kind);
            println!("│   {:<12} port {} id {}", kind, channel.hub_port, channel.sensor_id);
        }
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            uplink: UplinkConfig {
                endpoint_url: "http://localhost:3000/sensors".to_string(),
                user_id: "EricSensorTest".to_string(),
                plant_id: "1".to_string(),
                request_timeout_ms: default_request_timeout_ms(),
            },
            polling: PollingConfig::default(),
            sensors: SensorsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
