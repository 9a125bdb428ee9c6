//! Error handling for the acquisition service
//!
//! One error enum covers the whole service so callers can match on the
//! failure class (transient vs. fatal) without unwrapping nested types.

use thiserror::Error;

/// Acquisition service error type
#[derive(Error, Debug, Clone)]
pub enum AcqError {
    /// Configuration is structurally invalid; the offending connection or
    /// device is refused at load and never started
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    /// Transport-level fault (refused, reset, closed). Recoverable by
    /// reconnecting on next use
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation exceeded its time budget
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Device answered with a Modbus exception PDU
    #[error("Modbus exception: function {function:#04X}, code {code:#04X}")]
    ModbusException { function: u8, code: u8 },

    /// Register slice shorter than the data type requires
    #[error("Truncated register data: {0}")]
    Truncated(String),

    /// Parser-local: a parameter's addresses are not present in the tick's
    /// register image; the parameter is skipped for this tick
    #[error("Missing registers: {0}")]
    MissingRegisters(String),

    /// Operation attempted on a connection that is not open
    #[error("Not connected")]
    NotConnected,

    /// Request cancelled before it touched the transport
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// General protocol violation (bad frame, length mismatch, CRC)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Time-series or broker sink errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Input/output errors outside the transport layer
    #[error("IO error: {0}")]
    Io(String),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the acquisition service
pub type Result<T> = std::result::Result<T, AcqError>;

impl AcqError {
    /// True for faults that a reconnect on next use may clear
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AcqError::Transport(_) | AcqError::Timeout(_) | AcqError::NotConnected
        )
    }

    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        AcqError::InvalidSpec(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        AcqError::Transport(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        AcqError::Timeout(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        AcqError::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        AcqError::Config(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        AcqError::Storage(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AcqError::Internal(msg.into())
    }
}

impl From<std::io::Error> for AcqError {
    fn from(err: std::io::Error) -> Self {
        AcqError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AcqError {
    fn from(err: serde_json::Error) -> Self {
        AcqError::Serialization(format!("JSON error: {err}"))
    }
}

impl From<serde_yaml::Error> for AcqError {
    fn from(err: serde_yaml::Error) -> Self {
        AcqError::Serialization(format!("YAML error: {err}"))
    }
}

impl From<figment::Error> for AcqError {
    fn from(err: figment::Error) -> Self {
        AcqError::Config(err.to_string())
    }
}
