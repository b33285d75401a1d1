//! Protocol tables: which registers hold which value, per device model.
//!
//! A table is an ordered slice of [`RegisterDescriptor`]. Callers address
//! rows by index, so the order of each table is part of its contract and
//! must never change once a deployment references it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors in protocol table definitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Unsupported function code 0x{0:02X} (expected 0x03 or 0x04)")]
    UnsupportedFunction(u8),
    #[error("Register count must be 1 or 2, got {0}")]
    InvalidRegisterCount(u16),
}

/// Modbus read function used for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FunctionCode {
    /// 0x03 - read holding registers.
    ReadHoldingRegisters,
    /// 0x04 - read input registers.
    ReadInputRegisters,
}

impl FunctionCode {
    /// Numeric function code as sent on the wire.
    pub const fn code(self) -> u8 {
        match self {
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::ReadInputRegisters => 0x04,
        }
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            other => Err(ProtocolError::UnsupportedFunction(other)),
        }
    }
}

impl From<FunctionCode> for u8 {
    fn from(code: FunctionCode) -> u8 {
        code.code()
    }
}

impl std::fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X}", self.code())
    }
}

/// Interpretation of the concatenated register bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    /// Unsigned magnitude (default).
    #[default]
    UnsignedInteger,
    /// Two's complement over the full 16 or 32 bit width.
    SignedInteger,
}

/// One row of a protocol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    /// Read function (default: 0x03)
    #[serde(rename = "function", default = "default_function")]
    pub function_code: FunctionCode,

    /// First register offset, device-relative
    #[serde(rename = "address")]
    pub start_address: u16,

    /// Consecutive 16-bit registers composing one value (default: 1)
    #[serde(rename = "count", default = "default_count")]
    pub register_count: u16,

    /// Bit interpretation (default: unsigned_integer)
    #[serde(default)]
    pub value_type: ValueType,
}

fn default_function() -> FunctionCode {
    FunctionCode::ReadHoldingRegisters
}

fn default_count() -> u16 {
    1
}

impl RegisterDescriptor {
    /// Descriptor for a holding-register value.
    pub const fn holding(start_address: u16, register_count: u16, value_type: ValueType) -> Self {
        Self {
            function_code: FunctionCode::ReadHoldingRegisters,
            start_address,
            register_count,
            value_type,
        }
    }

    /// Bit width of the decoded value.
    pub fn width_bits(&self) -> u32 {
        16 * u32::from(self.register_count)
    }

    /// Check the descriptor invariants.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self.register_count {
            1 | 2 => Ok(()),
            n => Err(ProtocolError::InvalidRegisterCount(n)),
        }
    }
}

use ValueType::{SignedInteger as S, UnsignedInteger as U};

/// WSD304 wind sensor.
///
/// 0 speed (m/s), 1 speed (category), 2 speed (km/h),
/// 3 direction (deg*10), 4 direction (category).
pub const WSD304: &[RegisterDescriptor] = &[
    RegisterDescriptor::holding(0, 1, U),
    RegisterDescriptor::holding(1, 1, U),
    RegisterDescriptor::holding(2, 1, U),
    RegisterDescriptor::holding(3, 1, U),
    RegisterDescriptor::holding(4, 1, U),
];

/// SEM226O rainfall / illuminance sensor.
///
/// 0 rainfall (mm), 1 illuminance (lx, 32-bit), 2 illuminance (lx*100).
pub const SEM226O: &[RegisterDescriptor] = &[
    RegisterDescriptor::holding(0, 1, U),
    RegisterDescriptor::holding(2, 2, U),
    RegisterDescriptor::holding(6, 1, U),
];

/// EM619002 DC power meter.
///
/// 0 total active energy (kWh*100), 1 charge energy, 2 discharge energy,
/// 3 voltage (V*10), 4 current (A*1000), 5 active power (W*10).
pub const EM619002: &[RegisterDescriptor] = &[
    RegisterDescriptor::holding(0, 2, S),
    RegisterDescriptor::holding(20, 2, U),
    RegisterDescriptor::holding(30, 2, U),
    RegisterDescriptor::holding(305, 1, U),
    RegisterDescriptor::holding(313, 2, S),
    RegisterDescriptor::holding(321, 2, S),
];

/// SEM228A pyranometer: 0 solar radiation (W/m2), 1 deviation (W/m2).
pub const SEM228A: &[RegisterDescriptor] = &[
    RegisterDescriptor::holding(0, 1, U),
    RegisterDescriptor::holding(82, 1, U),
];

/// SEM227 air sensor: 0 humidity (%RH*10), 1 temperature (degC*10).
pub const SEM227: &[RegisterDescriptor] = &[
    RegisterDescriptor::holding(0, 1, U),
    RegisterDescriptor::holding(1, 1, S),
];

/// Models with a built-in table, by name.
pub const BUILTIN_MODELS: &[(&str, &[RegisterDescriptor])] = &[
    ("WSD304", WSD304),
    ("SEM226O", SEM226O),
    ("EM619002", EM619002),
    ("SEM228A", SEM228A),
    ("SEM227", SEM227),
];

/// Look up the built-in table for a device model (case-insensitive).
pub fn builtin_table(model: &str) -> Option<&'static [RegisterDescriptor]> {
    BUILTIN_MODELS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(model))
        .map(|(_, table)| *table)
}
