//! Field-bus data acquisition service
//!
//! Polls Modbus TCP/RTU devices, parses register blocks into typed
//! parameter samples, detects changes, persists to a time-series sink,
//! publishes over a message broker, mirrors each acquired register image
//! through a local Modbus TCP slave, and feeds a rule engine that can write
//! control registers back to the field.

pub mod config;
pub mod core;
pub mod protocols;
pub mod runtime;
pub mod sinks;
pub mod slave;
pub mod transport;
pub mod utils;

pub use config::{AppConfig, ConfigCache, ConfigProvider, FileConfigProvider};
pub use runtime::{wait_for_shutdown, Collaborators, Runtime};
pub use utils::error::{AcqError, Result};
