//! TCP transport

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::utils::error::{AcqError, Result};
use crate::utils::hex::format_hex_pretty;

use super::Transport;

/// TCP transport to one upstream device
#[derive(Debug)]
pub struct TcpTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(host: String, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host,
            port,
            connect_timeout,
            stream: None,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn transport_type(&self) -> &str {
        "tcp"
    }

    async fn connect(&mut self) -> Result<()> {
        self.stream = None;
        let addr = self.endpoint();
        debug!("connecting to {addr}");

        match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("failed to set TCP_NODELAY on {addr}: {e}");
                }
                self.stream = Some(stream);
                info!("connected to {addr}");
                Ok(())
            },
            Ok(Err(e)) => Err(AcqError::transport(format!(
                "failed to connect to {addr}: {e}"
            ))),
            Err(_) => Err(AcqError::timeout(format!("connect to {addr} timed out"))),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                warn!("error during TCP shutdown: {e}");
            }
            debug!("disconnected from {}", self.endpoint());
        }
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(AcqError::NotConnected)?;
        match stream.write_all(data).await {
            Ok(()) => {
                debug!(hex_data = %format_hex_pretty(data), length = data.len(), direction = "send", "tcp frame");
                Ok(data.len())
            },
            Err(e) => {
                self.stream = None;
                Err(AcqError::transport(format!("send failed: {e}")))
            },
        }
    }

    async fn receive(&mut self, buffer: &mut [u8], recv_timeout: Duration) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(AcqError::NotConnected)?;
        match timeout(recv_timeout, stream.read(buffer)).await {
            Ok(Ok(0)) => {
                self.stream = None;
                Err(AcqError::transport("connection closed by peer"))
            },
            Ok(Ok(n)) => {
                debug!(hex_data = %format_hex_pretty(&buffer[..n]), length = n, direction = "recv", "tcp frame");
                Ok(n)
            },
            Ok(Err(e)) => {
                self.stream = None;
                Err(AcqError::transport(format!("receive failed: {e}")))
            },
            Err(_) => Err(AcqError::timeout(format!(
                "receive timed out after {recv_timeout:?}"
            ))),
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
