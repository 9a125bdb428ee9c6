//! Serial (RTU) transport

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use crate::config::spec::Parity;
use crate::utils::error::{AcqError, Result};
use crate::utils::hex::format_hex_pretty;

use super::Transport;

/// Serial line settings for one RTU connection
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub path: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub timeout: Duration,
}

/// Serial transport over a tokio-serial stream
#[derive(Debug)]
pub struct SerialTransport {
    settings: SerialSettings,
    stream: Option<SerialStream>,
}

impl SerialTransport {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            stream: None,
        }
    }

    fn data_bits(&self) -> tokio_serial::DataBits {
        match self.settings.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn stop_bits(&self) -> tokio_serial::StopBits {
        match self.settings.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }

    fn parity(&self) -> tokio_serial::Parity {
        match self.settings.parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn transport_type(&self) -> &str {
        "serial"
    }

    async fn connect(&mut self) -> Result<()> {
        self.stream = None;
        let path = self.settings.path.clone();
        debug!("opening serial port {path}");

        let stream = tokio_serial::new(&path, self.settings.baud_rate)
            .data_bits(self.data_bits())
            .stop_bits(self.stop_bits())
            .parity(self.parity())
            .timeout(self.settings.timeout)
            .open_native_async()
            .map_err(|e| AcqError::transport(format!("failed to open {path}: {e}")))?;

        self.stream = Some(stream);
        info!(
            "opened serial port {path} at {} baud",
            self.settings.baud_rate
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.stream.take().is_some() {
            debug!("closed serial port {}", self.settings.path);
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(AcqError::NotConnected)?;
        match stream.write_all(data).await {
            Ok(()) => {
                debug!(hex_data = %format_hex_pretty(data), length = data.len(), direction = "send", "rtu frame");
                Ok(data.len())
            },
            Err(e) => {
                self.stream = None;
                Err(AcqError::transport(format!("serial send failed: {e}")))
            },
        }
    }

    async fn receive(&mut self, buffer: &mut [u8], recv_timeout: Duration) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(AcqError::NotConnected)?;
        match timeout(recv_timeout, stream.read(buffer)).await {
            Ok(Ok(0)) => {
                warn!("serial port {} returned EOF", self.settings.path);
                self.stream = None;
                Err(AcqError::transport("serial port closed"))
            },
            Ok(Ok(n)) => {
                debug!(hex_data = %format_hex_pretty(&buffer[..n]), length = n, direction = "recv", "rtu frame");
                Ok(n)
            },
            Ok(Err(e)) => {
                self.stream = None;
                Err(AcqError::transport(format!("serial receive failed: {e}")))
            },
            Err(_) => Err(AcqError::timeout(format!(
                "serial receive timed out after {recv_timeout:?}"
            ))),
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_missing_port_fails_recoverably() {
        let mut transport = SerialTransport::new(SerialSettings {
            path: "/dev/ttyACQSRV_NONEXISTENT".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            timeout: Duration::from_millis(100),
        });

        let err = transport.connect().await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(!transport.is_connected());
    }
}
