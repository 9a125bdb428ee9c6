//! Acquisition configuration model
//!
//! Connection, device and parameter specs are loaded once at startup and are
//! immutable for the life of a run. Structural validation happens here so a
//! broken spec refuses to start instead of misbehaving at runtime.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::bytes::WordOrder;
use crate::utils::error::{AcqError, Result};

/// Physical transport of one upstream connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportSpec {
    /// Modbus TCP
    Tcp { host: String, port: u16 },
    /// Modbus RTU over a serial line
    Rtu {
        serial_port: String,
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
        #[serde(default)]
        parity: Parity,
    },
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Register table a connection reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Holding,
    Input,
    Coil,
    DiscreteInput,
}

impl RegisterKind {
    /// Word tables carry 16-bit values, bit tables single bits
    pub fn is_bit_table(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::DiscreteInput)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::Holding => "holding",
            RegisterKind::Input => "input",
            RegisterKind::Coil => "coil",
            RegisterKind::DiscreteInput => "discrete_input",
        }
    }
}

/// How a device is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PollMode {
    #[default]
    Periodic,
    Continuous,
    OnDemand,
}

/// Parameter value encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bit,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    #[serde(rename = "string")]
    Text,
}

impl DataType {
    /// Registers the type occupies starting at the base address.
    /// `addresses` is consulted for string parameters, which span as many
    /// registers as the spec lists.
    pub fn register_count(&self, addresses: &[u16]) -> usize {
        match self {
            DataType::Bit | DataType::Int16 | DataType::Uint16 => 1,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 2,
            DataType::Text => addresses.len().max(1),
        }
    }
}

/// Contiguous address range read in one PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadBlock {
    pub start: u16,
    pub count: u16,
}

impl ReadBlock {
    pub fn contains(&self, addr: u16) -> bool {
        addr >= self.start && u32::from(addr) < u32::from(self.start) + u32::from(self.count)
    }

    pub fn overlaps(&self, other: &ReadBlock) -> bool {
        let a_end = u32::from(self.start) + u32::from(self.count);
        let b_end = u32::from(other.start) + u32::from(other.count);
        u32::from(self.start) < b_end && u32::from(other.start) < a_end
    }
}

/// One entry of a bit map: bit index -> sub-parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitEntry {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Map from bit index ("0".."15") to bit entry
pub type BitMap = BTreeMap<String, BitEntry>;

/// Map from stringified raw value to display label
pub type EnumMap = BTreeMap<String, String>;

/// A typed parameter carved out of a device's register image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub data_type: DataType,
    pub addresses: Vec<u16>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    /// Decimal places kept on float32 values
    #[serde(default)]
    pub precision: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_map: Option<BitMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_map: Option<EnumMap>,
    #[serde(default)]
    pub on_change: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

fn default_scale() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl ParameterSpec {
    /// Base register address
    pub fn base_address(&self) -> Option<u16> {
        self.addresses.first().copied()
    }

    /// Number of registers the parameter occupies
    pub fn register_count(&self) -> usize {
        self.data_type.register_count(&self.addresses)
    }

    fn validate(&self) -> Result<()> {
        let base = self.base_address().ok_or_else(|| {
            AcqError::invalid_spec(format!("parameter '{}' has no addresses", self.code))
        })?;

        if self.code.is_empty() {
            return Err(AcqError::invalid_spec("parameter with empty code"));
        }

        // 32-bit numerics own exactly two consecutive registers
        if matches!(
            self.data_type,
            DataType::Int32 | DataType::Uint32 | DataType::Float32
        ) {
            match self.addresses.as_slice() {
                [_] => {},
                [first, second] if *second == first.wrapping_add(1) => {},
                _ => {
                    return Err(AcqError::invalid_spec(format!(
                        "parameter '{}': 32-bit types need two consecutive registers from {base}",
                        self.code
                    )))
                },
            }
        }

        if let Some(bit_map) = &self.bit_map {
            if self.data_type != DataType::Uint16 {
                return Err(AcqError::invalid_spec(format!(
                    "parameter '{}': bit_map requires data_type uint16",
                    self.code
                )));
            }
            for key in bit_map.keys() {
                match key.parse::<u8>() {
                    Ok(bit) if bit < 16 => {},
                    _ => {
                        return Err(AcqError::invalid_spec(format!(
                            "parameter '{}': bit_map index '{key}' is not in 0..=15",
                            self.code
                        )))
                    },
                }
            }
        }

        Ok(())
    }
}

/// One polled device behind a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub poll_mode: PollMode,
    #[serde(default)]
    pub read_blocks: Vec<ReadBlock>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    /// Optional external JSON file overriding poll_mode/read_blocks/
    /// parameters/description; resolved by the config provider at load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
}

impl DeviceSpec {
    /// Enabled parameters in declaration order
    pub fn enabled_parameters(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.parameters.iter().filter(|p| p.enabled)
    }

    /// Find a parameter by code, or the parent of a bit code together with
    /// the bit index it maps to.
    pub fn find_parameter(&self, code: &str) -> Option<(&ParameterSpec, Option<u8>)> {
        if let Some(param) = self.parameters.iter().find(|p| p.code == code) {
            return Some((param, None));
        }
        for param in &self.parameters {
            if let Some(bit_map) = &param.bit_map {
                for (idx, entry) in bit_map {
                    if entry.code == code {
                        return Some((param, idx.parse::<u8>().ok()));
                    }
                }
            }
        }
        None
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_id.is_empty() {
            return Err(AcqError::invalid_spec("device with empty device_id"));
        }
        if self.read_blocks.is_empty() {
            return Err(AcqError::invalid_spec(format!(
                "device '{}' has no read blocks",
                self.device_id
            )));
        }

        // Blocks of one device must not overlap
        for (i, a) in self.read_blocks.iter().enumerate() {
            if a.count == 0 {
                return Err(AcqError::invalid_spec(format!(
                    "device '{}': read block at {} has zero count",
                    self.device_id, a.start
                )));
            }
            for b in &self.read_blocks[i + 1..] {
                if a.overlaps(b) {
                    return Err(AcqError::invalid_spec(format!(
                        "device '{}': read blocks ({},{}) and ({},{}) overlap",
                        self.device_id, a.start, a.count, b.start, b.count
                    )));
                }
            }
        }

        let mut codes = HashSet::new();
        let mut bit_codes = HashSet::new();

        for param in &self.parameters {
            param.validate().map_err(|e| {
                AcqError::invalid_spec(format!("device '{}': {e}", self.device_id))
            })?;

            if !codes.insert(param.code.as_str()) {
                return Err(AcqError::invalid_spec(format!(
                    "device '{}': duplicate parameter code '{}'",
                    self.device_id, param.code
                )));
            }
            if let Some(bit_map) = &param.bit_map {
                for entry in bit_map.values() {
                    if !bit_codes.insert(entry.code.as_str()) {
                        return Err(AcqError::invalid_spec(format!(
                            "device '{}': duplicate bit code '{}'",
                            self.device_id, entry.code
                        )));
                    }
                }
            }

            // Every address of every enabled parameter must be covered by a
            // block
            if param.enabled {
                let base = param.base_address().unwrap_or(0);
                for offset in 0..param.register_count() as u16 {
                    let addr = base.wrapping_add(offset);
                    if !self.read_blocks.iter().any(|b| b.contains(addr)) {
                        return Err(AcqError::invalid_spec(format!(
                            "device '{}': parameter '{}' address {addr} not covered by any read block",
                            self.device_id, param.code
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// One upstream field-bus connection with its devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub conn_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub transport: TransportSpec,
    pub slave_id: u8,
    pub register_type: RegisterKind,
    #[serde(default)]
    pub byte_order: WordOrder,
    /// Fixed local slave port; 0 or absent selects one from the automatic
    /// range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slave_port: Option<u16>,
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde", default)]
    pub min_poll_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(with = "humantime_serde", default)]
    pub pause_after_connect: Duration,
    #[serde(default)]
    pub close_after_gather: bool,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

impl ConnectionSpec {
    pub fn validate(&self) -> Result<()> {
        if self.conn_id.is_empty() {
            return Err(AcqError::invalid_spec("connection with empty conn_id"));
        }
        if !(1..=247).contains(&self.slave_id) {
            return Err(AcqError::invalid_spec(format!(
                "connection '{}': slave_id {} outside 1..=247",
                self.conn_id, self.slave_id
            )));
        }
        if self.timeout.is_zero() {
            return Err(AcqError::invalid_spec(format!(
                "connection '{}': timeout must be greater than zero",
                self.conn_id
            )));
        }

        match &self.transport {
            TransportSpec::Tcp { host, port } => {
                if host.is_empty() {
                    return Err(AcqError::invalid_spec(format!(
                        "connection '{}': empty host",
                        self.conn_id
                    )));
                }
                if *port == 0 {
                    return Err(AcqError::invalid_spec(format!(
                        "connection '{}': port must be non-zero",
                        self.conn_id
                    )));
                }
            },
            TransportSpec::Rtu {
                serial_port,
                baud_rate,
                data_bits,
                stop_bits,
                ..
            } => {
                if serial_port.is_empty() {
                    return Err(AcqError::invalid_spec(format!(
                        "connection '{}': empty serial port",
                        self.conn_id
                    )));
                }
                if *baud_rate == 0 {
                    return Err(AcqError::invalid_spec(format!(
                        "connection '{}': baud rate must be non-zero",
                        self.conn_id
                    )));
                }
                if !(5..=8).contains(data_bits) {
                    return Err(AcqError::invalid_spec(format!(
                        "connection '{}': data bits must be 5..=8",
                        self.conn_id
                    )));
                }
                if !(1..=2).contains(stop_bits) {
                    return Err(AcqError::invalid_spec(format!(
                        "connection '{}': stop bits must be 1 or 2",
                        self.conn_id
                    )));
                }
            },
        }

        let mut device_ids = HashSet::new();
        for device in &self.devices {
            if !device_ids.insert(device.device_id.as_str()) {
                return Err(AcqError::invalid_spec(format!(
                    "connection '{}': duplicate device_id '{}'",
                    self.conn_id, device.device_id
                )));
            }
            device.validate().map_err(|e| {
                AcqError::invalid_spec(format!("connection '{}': {e}", self.conn_id))
            })?;
        }

        Ok(())
    }
}
