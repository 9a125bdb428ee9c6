//! Modbus protocol implementation: PDU handling, framing, value codec and
//! the master client

pub mod client;
pub mod codec;
pub mod constants;
pub mod frame;
pub mod pdu;

pub use client::ModbusClient;
pub use frame::{FrameCodec, FrameMode};
pub use pdu::{Pdu, PduBuilder};
