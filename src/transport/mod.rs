//! Physical transports
//!
//! A transport moves opaque bytes to and from one upstream endpoint. The
//! Modbus client layered on top never cares whether the bytes cross a TCP
//! socket or a serial line.

pub mod mock;
pub mod serial;
pub mod tcp;

use async_trait::async_trait;
use std::time::Duration;

use crate::config::spec::TransportSpec;
use crate::utils::error::Result;

/// Byte-level transport to one upstream device
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Transport type identifier for logging ("tcp", "serial", "mock")
    fn transport_type(&self) -> &str;

    /// Open the transport. Idempotent: connecting while connected first
    /// drops the old session.
    async fn connect(&mut self) -> Result<()>;

    /// Close the transport. Never fails on an already-closed transport.
    async fn disconnect(&mut self) -> Result<()>;

    /// Send the full buffer
    async fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Receive into the buffer, waiting at most `timeout`
    async fn receive(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize>;

    /// True while a session is established
    fn is_connected(&self) -> bool;
}

/// Build the transport matching a connection's spec
pub fn build_transport(spec: &TransportSpec, timeout: Duration) -> Box<dyn Transport> {
    match spec {
        TransportSpec::Tcp { host, port } => {
            Box::new(tcp::TcpTransport::new(host.clone(), *port, timeout))
        },
        TransportSpec::Rtu {
            serial_port,
            baud_rate,
            data_bits,
            stop_bits,
            parity,
        } => Box::new(serial::SerialTransport::new(serial::SerialSettings {
            path: serial_port.clone(),
            baud_rate: *baud_rate,
            data_bits: *data_bits,
            stop_bits: *stop_bits,
            parity: *parity,
            timeout,
        })),
    }
}
