//! Shared helpers for integration tests
//!
//! `UpstreamDevice` is a scriptable Modbus TCP device: it serves a holding/
//! input register table, records the order of incoming requests, and can
//! delay every response to hold a request in flight deterministically.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use acqsrv::config::spec::{
    ConnectionSpec, DeviceSpec, ParameterSpec, PollMode, ReadBlock, RegisterKind, TransportSpec,
};
use acqsrv::utils::bytes::WordOrder;

#[derive(Default)]
struct UpstreamState {
    registers: HashMap<u16, u16>,
    coils: HashMap<u16, bool>,
    request_log: Vec<u8>,
}

/// Simulated upstream Modbus TCP device
pub struct UpstreamDevice {
    port: u16,
    state: Arc<Mutex<UpstreamState>>,
    delay: Arc<Mutex<Duration>>,
}

impl UpstreamDevice {
    pub async fn start() -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let device = Arc::new(Self {
            port,
            state: Arc::new(Mutex::new(UpstreamState::default())),
            delay: Arc::new(Mutex::new(Duration::ZERO)),
        });

        let accept_device = device.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let device = accept_device.clone();
                tokio::spawn(async move {
                    let _ = device.serve(stream).await;
                });
            }
        });

        device
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Delay applied before every response
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state.lock().unwrap().registers.insert(address, value);
    }

    pub fn register(&self, address: u16) -> u16 {
        self.state
            .lock()
            .unwrap()
            .registers
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    pub fn coil(&self, address: u16) -> bool {
        self.state
            .lock()
            .unwrap()
            .coils
            .get(&address)
            .copied()
            .unwrap_or(false)
    }

    /// Function codes in arrival order
    pub fn request_log(&self) -> Vec<u8> {
        self.state.lock().unwrap().request_log.clone()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().request_log.len()
    }

    async fn serve(&self, mut stream: tokio::net::TcpStream) -> std::io::Result<()> {
        let mut header = [0u8; 7];
        loop {
            stream.read_exact(&mut header).await?;
            let length = u16::from_be_bytes([header[4], header[5]]) as usize;
            let mut pdu = vec![0u8; length.saturating_sub(1)];
            stream.read_exact(&mut pdu).await?;

            let delay = *self.delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let response_pdu = self.handle(&pdu);

            let mut response = Vec::with_capacity(7 + response_pdu.len());
            response.extend_from_slice(&header[0..4]);
            response.extend_from_slice(&((response_pdu.len() + 1) as u16).to_be_bytes());
            response.push(header[6]);
            response.extend_from_slice(&response_pdu);
            stream.write_all(&response).await?;
        }
    }

    fn handle(&self, pdu: &[u8]) -> Vec<u8> {
        let mut state = self.state.lock().unwrap();
        let Some(&fc) = pdu.first() else {
            return vec![0x80, 0x01];
        };
        state.request_log.push(fc);

        match fc {
            // Read holding/input registers
            0x03 | 0x04 => {
                let start = u16::from_be_bytes([pdu[1], pdu[2]]);
                let count = u16::from_be_bytes([pdu[3], pdu[4]]);
                let mut response = vec![fc, (count * 2) as u8];
                for offset in 0..count {
                    let value = state
                        .registers
                        .get(&(start + offset))
                        .copied()
                        .unwrap_or(0);
                    response.extend_from_slice(&value.to_be_bytes());
                }
                response
            },
            // Read coils/discrete inputs
            0x01 | 0x02 => {
                let start = u16::from_be_bytes([pdu[1], pdu[2]]);
                let count = u16::from_be_bytes([pdu[3], pdu[4]]);
                let mut response = vec![fc, count.div_ceil(8) as u8];
                let mut current = 0u8;
                for i in 0..count {
                    if state.coils.get(&(start + i)).copied().unwrap_or(false) {
                        current |= 1 << (i % 8);
                    }
                    if i % 8 == 7 || i == count - 1 {
                        response.push(current);
                        current = 0;
                    }
                }
                response
            },
            // Write single register
            0x06 => {
                let address = u16::from_be_bytes([pdu[1], pdu[2]]);
                let value = u16::from_be_bytes([pdu[3], pdu[4]]);
                state.registers.insert(address, value);
                pdu.to_vec()
            },
            // Write single coil
            0x05 => {
                let address = u16::from_be_bytes([pdu[1], pdu[2]]);
                let value = u16::from_be_bytes([pdu[3], pdu[4]]);
                state.coils.insert(address, value == 0xFF00);
                pdu.to_vec()
            },
            // Write multiple registers
            0x10 => {
                let start = u16::from_be_bytes([pdu[1], pdu[2]]);
                let count = u16::from_be_bytes([pdu[3], pdu[4]]);
                for i in 0..count {
                    let idx = 6 + (i as usize) * 2;
                    let value = u16::from_be_bytes([pdu[idx], pdu[idx + 1]]);
                    state.registers.insert(start + i, value);
                }
                vec![fc, pdu[1], pdu[2], pdu[3], pdu[4]]
            },
            _ => vec![fc | 0x80, 0x01],
        }
    }
}

/// Connection spec pointed at a local upstream port
pub fn tcp_connection(conn_id: &str, port: u16, devices: Vec<DeviceSpec>) -> ConnectionSpec {
    ConnectionSpec {
        conn_id: conn_id.to_string(),
        enabled: true,
        description: None,
        transport: TransportSpec::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        },
        slave_id: 1,
        register_type: RegisterKind::Holding,
        byte_order: WordOrder::Abcd,
        slave_port: None,
        poll_interval: Duration::from_millis(200),
        min_poll_interval: Duration::ZERO,
        timeout: Duration::from_secs(2),
        pause_after_connect: Duration::ZERO,
        close_after_gather: false,
        devices,
    }
}

/// Device with one read block and the given parameters
pub fn device(
    device_id: &str,
    poll_mode: PollMode,
    block: ReadBlock,
    parameters: Vec<ParameterSpec>,
) -> DeviceSpec {
    DeviceSpec {
        device_id: device_id.to_string(),
        description: None,
        poll_mode,
        read_blocks: vec![block],
        parameters,
        config_file: None,
    }
}

/// Plain uint16 parameter
pub fn uint16_param(code: &str, address: u16, on_change: bool) -> ParameterSpec {
    ParameterSpec {
        code: code.to_string(),
        name: None,
        data_type: acqsrv::config::spec::DataType::Uint16,
        addresses: vec![address],
        scale: 1.0,
        offset: 0.0,
        precision: 0,
        bit_map: None,
        enum_map: None,
        on_change,
        enabled: true,
        unit: None,
    }
}
