//! Upstream connection lifecycle
//!
//! One `Connection` owns one long-lived transport to one device. Modbus is
//! half-duplex per device, so a single async mutex around the client is the
//! serialization point for everything that touches the wire.

use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::spec::{ConnectionSpec, RegisterKind, TransportSpec};
use crate::protocols::modbus::{FrameMode, ModbusClient};
use crate::transport::{build_transport, Transport};
use crate::utils::error::Result;

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No session; the next operation reconnects
    Idle,
    /// Connect in progress
    Connecting,
    /// Session established
    Open,
    /// Last operation hit a transport fault; treated as Idle on next use
    Faulted,
}

/// One upstream field-bus connection
#[derive(Debug)]
pub struct Connection {
    spec: Arc<ConnectionSpec>,
    io: Mutex<ModbusClient>,
    state: RwLock<LinkState>,
}

impl Connection {
    /// Build with the transport described by the spec
    pub fn new(spec: Arc<ConnectionSpec>) -> Self {
        let transport = build_transport(&spec.transport, spec.timeout);
        Self::with_transport(spec, transport)
    }

    /// Build with an injected transport (tests use a mock here)
    pub fn with_transport(spec: Arc<ConnectionSpec>, transport: Box<dyn Transport>) -> Self {
        let mode = match spec.transport {
            TransportSpec::Tcp { .. } => FrameMode::Tcp,
            TransportSpec::Rtu { .. } => FrameMode::Rtu,
        };
        let client = ModbusClient::new(transport, mode, spec.slave_id, spec.timeout);
        Self {
            spec,
            io: Mutex::new(client),
            state: RwLock::new(LinkState::Idle),
        }
    }

    pub fn spec(&self) -> &Arc<ConnectionSpec> {
        &self.spec
    }

    pub async fn state(&self) -> LinkState {
        *self.state.read().await
    }

    async fn set_state(&self, state: LinkState) {
        *self.state.write().await = state;
    }

    /// Open the session if it is down. Applies `pause_after_connect` before
    /// declaring the connection usable; some devices drop requests that
    /// arrive straight after accept.
    async fn ensure_open(&self, client: &mut ModbusClient) -> Result<()> {
        if client.is_connected() {
            return Ok(());
        }

        self.set_state(LinkState::Connecting).await;
        match client.connect().await {
            Ok(()) => {
                if !self.spec.pause_after_connect.is_zero() {
                    tokio::time::sleep(self.spec.pause_after_connect).await;
                }
                self.set_state(LinkState::Open).await;
                info!(conn_id = %self.spec.conn_id, "connection open");
                Ok(())
            },
            Err(e) => {
                self.set_state(LinkState::Idle).await;
                Err(e)
            },
        }
    }

    /// Apply the error policy: transport faults (and any error when
    /// `close_after_gather` is set) drop the session; the next operation
    /// reconnects.
    async fn handle_outcome<T>(&self, client: &mut ModbusClient, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if self.spec.close_after_gather || e.is_recoverable() {
                let _ = client.disconnect().await;
                let next = if e.is_recoverable() {
                    LinkState::Faulted
                } else {
                    LinkState::Idle
                };
                self.set_state(next).await;
                warn!(conn_id = %self.spec.conn_id, "connection dropped: {e}");
            }
        }
        result
    }

    /// Close the session after a completed gather cycle when the spec asks
    /// for it. Called by the dispatcher once per read request, not per
    /// block, so multi-block devices reconnect once per cycle.
    pub async fn finish_gather(&self) {
        if !self.spec.close_after_gather {
            return;
        }
        let mut client = self.io.lock().await;
        let _ = client.disconnect().await;
        self.set_state(LinkState::Idle).await;
        debug!(conn_id = %self.spec.conn_id, "closed after gather");
    }

    /// Read one block from the connection's register table. Coil tables
    /// come back as 0/1 words so downstream code handles one shape.
    pub async fn read_block(
        &self,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let mut client = self.io.lock().await;
        if let Err(e) = self.ensure_open(&mut client).await {
            return Err(e);
        }

        let result = match kind {
            RegisterKind::Holding => client.read_holding(start, count).await,
            RegisterKind::Input => client.read_input(start, count).await,
            RegisterKind::Coil => client
                .read_coils(start, count)
                .await
                .map(|bits| bits.into_iter().map(u16::from).collect()),
            RegisterKind::DiscreteInput => client
                .read_discrete(start, count)
                .await
                .map(|bits| bits.into_iter().map(u16::from).collect()),
        };

        self.handle_outcome(&mut client, result).await
    }

    pub async fn write_single_register(&self, address: u16, value: u16) -> Result<()> {
        let mut client = self.io.lock().await;
        if let Err(e) = self.ensure_open(&mut client).await {
            return Err(e);
        }
        let result = client.write_single_register(address, value).await;
        self.handle_outcome(&mut client, result).await
    }

    pub async fn write_multiple_registers(&self, address: u16, values: &[u16]) -> Result<()> {
        let mut client = self.io.lock().await;
        if let Err(e) = self.ensure_open(&mut client).await {
            return Err(e);
        }
        let result = client.write_multiple_registers(address, values).await;
        self.handle_outcome(&mut client, result).await
    }

    pub async fn write_single_coil(&self, address: u16, value: bool) -> Result<()> {
        let mut client = self.io.lock().await;
        if let Err(e) = self.ensure_open(&mut client).await {
            return Err(e);
        }
        let result = client.write_single_coil(address, value).await;
        self.handle_outcome(&mut client, result).await
    }

    pub async fn write_multiple_coils(&self, address: u16, values: &[bool]) -> Result<()> {
        let mut client = self.io.lock().await;
        if let Err(e) = self.ensure_open(&mut client).await {
            return Err(e);
        }
        let result = client.write_multiple_coils(address, values).await;
        self.handle_outcome(&mut client, result).await
    }

    /// Open the session now instead of on first use
    pub async fn open(&self) -> Result<()> {
        let mut client = self.io.lock().await;
        self.ensure_open(&mut client).await
    }

    /// Close the session. Idempotent.
    pub async fn close(&self) {
        let mut client = self.io.lock().await;
        let _ = client.disconnect().await;
        self.set_state(LinkState::Idle).await;
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::utils::bytes::WordOrder;
    use std::time::Duration;

    fn spec(close_after_gather: bool) -> Arc<ConnectionSpec> {
        Arc::new(ConnectionSpec {
            conn_id: "c1".to_string(),
            enabled: true,
            description: None,
            transport: TransportSpec::Tcp {
                host: "127.0.0.1".to_string(),
                port: 502,
            },
            slave_id: 0x11,
            register_type: RegisterKind::Holding,
            byte_order: WordOrder::Abcd,
            slave_port: None,
            poll_interval: Duration::from_secs(1),
            min_poll_interval: Duration::ZERO,
            timeout: Duration::from_millis(200),
            pause_after_connect: Duration::ZERO,
            close_after_gather,
            devices: vec![],
        })
    }

    fn tcp_response(txid: u16, unit: u8, pdu: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&txid.to_be_bytes());
        frame.extend_from_slice(&[0x00, 0x00]);
        frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        frame.push(unit);
        frame.extend_from_slice(pdu);
        frame
    }

    #[tokio::test]
    async fn test_lazy_connect_on_first_read() {
        let mock = MockTransport::new();
        let conn = Connection::with_transport(spec(false), Box::new(mock.clone()));
        assert_eq!(conn.state().await, LinkState::Idle);

        mock.push_receive(tcp_response(1, 0x11, &[0x03, 0x02, 0x00, 0x2A]));
        let words = conn
            .read_block(RegisterKind::Holding, 0, 1)
            .await
            .unwrap();
        assert_eq!(words, vec![0x002A]);
        assert_eq!(conn.state().await, LinkState::Open);
        assert_eq!(mock.connect_count(), 1);

        // Second read reuses the session
        mock.push_receive(tcp_response(2, 0x11, &[0x03, 0x02, 0x00, 0x2B]));
        conn.read_block(RegisterKind::Holding, 0, 1).await.unwrap();
        assert_eq!(mock.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_close_after_gather_drops_session() {
        let mock = MockTransport::new();
        let conn = Connection::with_transport(spec(true), Box::new(mock.clone()));

        mock.push_receive(tcp_response(1, 0x11, &[0x03, 0x02, 0x00, 0x01]));
        conn.read_block(RegisterKind::Holding, 0, 1).await.unwrap();
        conn.finish_gather().await;
        assert_eq!(conn.state().await, LinkState::Idle);

        // Next read reconnects; the transaction counter keeps running
        mock.push_receive(tcp_response(2, 0x11, &[0x03, 0x02, 0x00, 0x02]));
        conn.read_block(RegisterKind::Holding, 0, 1).await.unwrap();
        assert_eq!(mock.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_transport_fault_faults_connection() {
        let mock = MockTransport::new();
        let conn = Connection::with_transport(spec(false), Box::new(mock.clone()));

        mock.push_receive(tcp_response(1, 0x11, &[0x03, 0x02, 0x00, 0x01]));
        conn.read_block(RegisterKind::Holding, 0, 1).await.unwrap();

        mock.set_fail_send(true);
        let err = conn
            .read_block(RegisterKind::Holding, 0, 1)
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(conn.state().await, LinkState::Faulted);

        // Recovery: next operation reconnects from scratch. Two frames were
        // built so far, so the next transaction id is 3.
        mock.set_fail_send(false);
        mock.push_receive(tcp_response(3, 0x11, &[0x03, 0x02, 0x00, 0x03]));
        conn.read_block(RegisterKind::Holding, 0, 1).await.unwrap();
        assert_eq!(conn.state().await, LinkState::Open);
    }

    #[tokio::test]
    async fn test_modbus_exception_keeps_session() {
        let mock = MockTransport::new();
        let conn = Connection::with_transport(spec(false), Box::new(mock.clone()));

        mock.push_receive(tcp_response(1, 0x11, &[0x83, 0x02]));
        let err = conn
            .read_block(RegisterKind::Holding, 0, 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::utils::error::AcqError::ModbusException { .. }
        ));
        // Device-level exceptions do not tear the transport down
        assert_eq!(conn.state().await, LinkState::Open);
    }

    #[tokio::test]
    async fn test_coil_block_reads_as_words() {
        let mock = MockTransport::new();
        let conn = Connection::with_transport(spec(false), Box::new(mock.clone()));

        // 3 coils: 0b101
        mock.push_receive(tcp_response(1, 0x11, &[0x01, 0x01, 0x05]));
        let words = conn.read_block(RegisterKind::Coil, 0, 3).await.unwrap();
        assert_eq!(words, vec![1, 0, 1]);
    }
}
