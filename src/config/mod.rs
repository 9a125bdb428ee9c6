//! Service configuration
//!
//! Loaded once at startup through figment (YAML file merged with `ACQSRV_`
//! environment overrides). Connection/device validation lives in [`spec`];
//! this module carries the service-level sections.

pub mod provider;
pub mod spec;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::utils::error::Result;

pub use provider::{ConfigCache, ConfigProvider, FileConfigProvider, SnapshotWatcher};
pub use spec::ConnectionSpec;

/// Default measurement name for time-series points
pub const DEFAULT_MEASUREMENT: &str = "nbcb_collect_pump_sensor_data";

/// Service section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Capacity of the acquisition -> parser queue. Small values surface
    /// backpressure to the pollers quickly.
    #[serde(default = "default_parser_queue")]
    pub parser_queue: usize,
    /// Capacity of the parsed-batch and change-event queues
    #[serde(default = "default_event_queue")]
    pub event_queue: usize,
}

fn default_service_name() -> String {
    "acqsrv".to_string()
}

fn default_parser_queue() -> usize {
    64
}

fn default_event_queue() -> usize {
    256
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            parser_queue: default_parser_queue(),
            event_queue: default_event_queue(),
        }
    }
}

/// Logging section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Time-series sink section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InfluxConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_measurement")]
    pub measurement: String,
}

fn default_measurement() -> String {
    DEFAULT_MEASUREMENT.to_string()
}

/// Broker section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    #[serde(with = "humantime_serde", default = "default_keep_alive")]
    pub keep_alive: Duration,
}

fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "acqsrv".to_string()
}

fn default_base_topic() -> String {
    "acqsrv".to_string()
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(30)
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            base_topic: default_base_topic(),
            keep_alive: default_keep_alive(),
        }
    }
}

/// Top-level application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub influx: InfluxConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub connections: Vec<ConnectionSpec>,
}

impl AppConfig {
    /// Load from a YAML file merged with `ACQSRV_` environment overrides
    /// (`ACQSRV_MQTT__HOST=broker` style nesting).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: AppConfig = Figment::new()
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("ACQSRV_").split("__"))
            .extract()?;
        Ok(config)
    }
}
