//! Configuration for the polling station.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use sensorlink_common::{Format, LoggingConfig, TIMESTAMP_FIELD, load_config};

use crate::device::DeviceEntity;
use crate::protocol::{RegisterDescriptor, builtin_table};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(String),
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Parse(String),
    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<sensorlink_common::Error> for ConfigError {
    fn from(e: sensorlink_common::Error) -> Self {
        match e {
            sensorlink_common::Error::Io(e) => ConfigError::Io(e),
            other => ConfigError::Parse(other.to_string()),
        }
    }
}

/// Complete station configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Station identity, as tagged in the payload
    pub station: StationIdentity,

    /// Serial bus (or RTU/TCP gateway) settings
    pub bus: BusConfig,

    /// Additional protocol tables, keyed by model name
    #[serde(default)]
    pub models: HashMap<String, Vec<RegisterDescriptor>>,

    /// Devices on the bus
    pub devices: Vec<DeviceConfig>,

    /// Measurements in payload order
    pub measurements: Vec<MeasurementConfig>,

    /// Cycle timing
    #[serde(default)]
    pub polling: PollingConfig,

    /// Snapshot upload
    pub uplink: UplinkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity of the station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationIdentity {
    /// Station identifier sent with every snapshot
    pub id: String,

    /// Payload key carrying the identifier (default: "stationId")
    #[serde(default = "default_id_field")]
    pub id_field: String,

    /// Emit the cycle start time as a "timestamp" field
    #[serde(default)]
    pub include_timestamp: bool,
}

fn default_id_field() -> String {
    "stationId".to_string()
}

/// Bus settings shared by all devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Connection type and address
    pub connection: ConnectionConfig,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    1000
}

/// Connection configuration (RTU or TCP gateway).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// Modbus RTU (serial) connection
    Rtu {
        /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
        port: String,
        /// Baud rate (default: 9600)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Data bits (default: 8)
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        /// Parity: "none", "even", or "odd" (default: "none")
        #[serde(default = "default_parity")]
        parity: String,
        /// Stop bits: 1 or 2 (default: 1)
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
    /// Modbus TCP connection to a serial gateway
    Tcp {
        /// Host address (IP)
        host: String,
        /// TCP port (default: 502)
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

/// A device on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name (referenced by measurements)
    pub name: String,

    /// Model name: a built-in table or a key of `models`
    pub model: String,

    /// Modbus unit/slave ID (1-247)
    pub address: u8,
}

/// One field of the outbound snapshot.
///
/// Either a register read (`device` + `index`) or a fixed `value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Payload field name
    pub name: String,

    /// Device to read from
    #[serde(default)]
    pub device: Option<String>,

    /// Row of the device's protocol table
    #[serde(default)]
    pub index: Option<usize>,

    /// Scaling factor (raw * scale)
    #[serde(default = "default_scale")]
    pub scale: f64,

    /// Offset (raw * scale + offset)
    #[serde(default)]
    pub offset: f64,

    /// Fixed value for fields with no sensor behind them
    #[serde(default)]
    pub value: Option<f64>,
}

fn default_scale() -> f64 {
    1.0
}

/// Cycle timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Minimum spacing between cycle starts
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,

    /// Bus settling delay between consecutive reads
    #[serde(default = "default_inter_read_delay_ms")]
    pub inter_read_delay_ms: u64,

    /// Upper bound on one reconnect attempt
    #[serde(default = "default_reconnect_timeout_ms")]
    pub reconnect_timeout_ms: u64,

    /// How often the scheduler re-checks whether a cycle is due
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

fn default_cycle_interval_ms() -> u64 {
    15_000
}

fn default_inter_read_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_timeout_ms() -> u64 {
    8_000
}

fn default_tick_ms() -> u64 {
    100
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: default_cycle_interval_ms(),
            inter_read_delay_ms: default_inter_read_delay_ms(),
            reconnect_timeout_ms: default_reconnect_timeout_ms(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl PollingConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn inter_read_delay(&self) -> Duration {
        Duration::from_millis(self.inter_read_delay_ms)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// HTTP upload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkConfig {
    /// Collector URL (http or https)
    pub endpoint: String,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Payload encoding (default: json)
    #[serde(default)]
    pub format: Format,

    /// Honour HTTP(S)_PROXY environment variables (default: true)
    #[serde(default = "default_system_proxy")]
    pub system_proxy: bool,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_system_proxy() -> bool {
    true
}

/// Where a measurement's value comes from, after validation.
#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementSource {
    /// Read `index` of the device at position `device` in the device list.
    Register {
        device: usize,
        index: usize,
        scale: f64,
        offset: f64,
    },
    /// Fixed value.
    Constant(f64),
}

/// A validated measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub name: String,
    pub source: MeasurementSource,
}

impl Measurement {
    /// Apply the measurement's scaling to a raw register value.
    pub fn scale(&self, raw: f64) -> f64 {
        match self.source {
            MeasurementSource::Register { scale, offset, .. } => raw * scale + offset,
            MeasurementSource::Constant(value) => value,
        }
    }
}

/// Devices and measurements resolved from configuration.
#[derive(Debug, Clone)]
pub struct PollPlan {
    pub devices: Vec<DeviceEntity>,
    pub measurements: Vec<Measurement>,
}

impl StationConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let config: StationConfig = load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.plan().map(|_| ())
    }

    /// Resolve the protocol table for a model; configured models shadow built-ins.
    ///
    /// Model names match case-insensitively, for configured and built-in tables alike.
    pub fn table_for(&self, model: &str) -> Option<Vec<RegisterDescriptor>> {
        self.models
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(model))
            .map(|(_, table)| table.clone())
            .or_else(|| builtin_table(model).map(<[RegisterDescriptor]>::to_vec))
    }

    /// Validate everything and build the device entities and measurement list.
    ///
    /// Every measurement index is checked against its device's table here,
    /// so the polling loop never meets a configuration mismatch.
    pub fn plan(&self) -> Result<PollPlan, ConfigError> {
        if self.station.id.is_empty() {
            return Err(ConfigError::Validation(
                "Station id cannot be empty".to_string(),
            ));
        }

        if self.devices.is_empty() {
            return Err(ConfigError::Validation(
                "At least one device must be configured".to_string(),
            ));
        }

        if self.measurements.is_empty() {
            return Err(ConfigError::Validation(
                "At least one measurement must be configured".to_string(),
            ));
        }

        if self.polling.cycle_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "polling.cycle_interval_ms must be greater than 0".to_string(),
            ));
        }

        if let ConnectionConfig::Rtu { parity, .. } = &self.bus.connection {
            match parity.to_lowercase().as_str() {
                "none" | "even" | "odd" => {}
                _ => {
                    return Err(ConfigError::Validation(format!(
                        "Invalid parity '{}' (use none, even, or odd)",
                        parity
                    )));
                }
            }
        }

        match reqwest::Url::parse(&self.uplink.endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(ConfigError::Validation(format!(
                    "Uplink endpoint must be http or https, got '{}'",
                    url.scheme()
                )));
            }
            Err(e) => {
                return Err(ConfigError::Validation(format!(
                    "Invalid uplink endpoint '{}': {}",
                    self.uplink.endpoint, e
                )));
            }
        }

        let mut model_names = HashSet::new();
        for name in self.models.keys() {
            if !model_names.insert(name.to_ascii_lowercase()) {
                return Err(ConfigError::Validation(format!(
                    "Model '{}' is declared more than once (names are case-insensitive)",
                    name
                )));
            }
        }

        let devices = self.resolve_devices()?;
        let measurements = self.resolve_measurements(&devices)?;

        Ok(PollPlan {
            devices,
            measurements,
        })
    }

    fn resolve_devices(&self) -> Result<Vec<DeviceEntity>, ConfigError> {
        let mut names = HashSet::new();
        let mut addresses = HashSet::new();
        let mut devices = Vec::with_capacity(self.devices.len());

        for device in &self.devices {
            if device.name.is_empty() {
                return Err(ConfigError::Validation(
                    "Device name cannot be empty".to_string(),
                ));
            }

            if !names.insert(device.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate device name '{}'",
                    device.name
                )));
            }

            if !(1..=247).contains(&device.address) {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': address must be 1-247",
                    device.name
                )));
            }

            if !addresses.insert(device.address) {
                return Err(ConfigError::Validation(format!(
                    "Device '{}': bus address {} is already used",
                    device.name, device.address
                )));
            }

            let table = self.table_for(&device.model).ok_or_else(|| {
                ConfigError::Validation(format!(
                    "Device '{}': unknown model '{}'",
                    device.name, device.model
                ))
            })?;

            for (index, descriptor) in table.iter().enumerate() {
                descriptor.validate().map_err(|e| {
                    ConfigError::Validation(format!(
                        "Model '{}' row {}: {}",
                        device.model, index, e
                    ))
                })?;
            }

            devices.push(DeviceEntity::new(
                device.address,
                device.name.clone(),
                device.model.clone(),
                table,
            ));
        }

        Ok(devices)
    }

    fn resolve_measurements(
        &self,
        devices: &[DeviceEntity],
    ) -> Result<Vec<Measurement>, ConfigError> {
        let mut names = HashSet::new();
        let mut measurements = Vec::with_capacity(self.measurements.len());

        for m in &self.measurements {
            let reserved = m.name == self.station.id_field
                || (self.station.include_timestamp && m.name == TIMESTAMP_FIELD);
            if m.name.is_empty() || reserved {
                return Err(ConfigError::Validation(format!(
                    "Invalid measurement name '{}'",
                    m.name
                )));
            }

            if !names.insert(m.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate measurement '{}'",
                    m.name
                )));
            }

            let source = match (&m.device, m.index, m.value) {
                (None, None, Some(value)) => MeasurementSource::Constant(value),
                (Some(device_name), Some(index), None) => {
                    let position = devices
                        .iter()
                        .position(|d| d.name() == device_name)
                        .ok_or_else(|| {
                            ConfigError::Validation(format!(
                                "Measurement '{}': unknown device '{}'",
                                m.name, device_name
                            ))
                        })?;

                    devices[position]
                        .descriptor(index)
                        .map_err(|e| {
                            ConfigError::Validation(format!("Measurement '{}': {}", m.name, e))
                        })?;

                    MeasurementSource::Register {
                        device: position,
                        index,
                        scale: m.scale,
                        offset: m.offset,
                    }
                }
                _ => {
                    return Err(ConfigError::Validation(format!(
                        "Measurement '{}': specify either device and index, or value",
                        m.name
                    )));
                }
            };

            measurements.push(Measurement {
                name: m.name.clone(),
                source,
            });
        }

        Ok(measurements)
    }
}
