//! Field-bus protocol implementations

pub mod modbus;
