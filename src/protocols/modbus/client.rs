//! Modbus master client
//!
//! Drives one transport in strict request/response lockstep. The caller
//! (the connection layer) serializes access; this type never interleaves
//! two requests on the wire.

use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::transport::Transport;
use crate::utils::error::{AcqError, Result};

use super::codec;
use super::constants::{
    FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS,
    MAX_READ_COILS, MAX_READ_REGISTERS, MBAP_HEADER_LEN, RESPONSE_BUFFER_SIZE,
};
use super::frame::{exception_description, FrameCodec, FrameMode};
use super::pdu::{Pdu, PduBuilder};

/// Modbus master over one transport
pub struct ModbusClient {
    transport: Box<dyn Transport>,
    codec: FrameCodec,
    unit_id: u8,
    timeout: Duration,
}

impl std::fmt::Debug for ModbusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusClient")
            .field("transport", &self.transport.transport_type())
            .field("mode", &self.codec.mode())
            .field("unit_id", &self.unit_id)
            .finish()
    }
}

impl ModbusClient {
    pub fn new(
        transport: Box<dyn Transport>,
        mode: FrameMode,
        unit_id: u8,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            codec: FrameCodec::new(mode),
            unit_id,
            timeout,
        }
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.transport.connect().await
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        self.transport.disconnect().await
    }

    // ------------------------------------------------------------------
    // Read operations
    // ------------------------------------------------------------------

    /// FC03 Read Holding Registers
    pub async fn read_holding(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        self.read_words(FC_READ_HOLDING_REGISTERS, address, count)
            .await
    }

    /// FC04 Read Input Registers
    pub async fn read_input(&mut self, address: u16, count: u16) -> Result<Vec<u16>> {
        self.read_words(FC_READ_INPUT_REGISTERS, address, count)
            .await
    }

    /// FC01 Read Coils
    pub async fn read_coils(&mut self, address: u16, count: u16) -> Result<Vec<bool>> {
        self.read_bits(FC_READ_COILS, address, count).await
    }

    /// FC02 Read Discrete Inputs
    pub async fn read_discrete(&mut self, address: u16, count: u16) -> Result<Vec<bool>> {
        self.read_bits(FC_READ_DISCRETE_INPUTS, address, count)
            .await
    }

    // ------------------------------------------------------------------
    // Write operations
    // ------------------------------------------------------------------

    /// FC06 Write Single Register
    pub async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()> {
        let pdu = codec::build_write_single_register_pdu(address, value)?;
        let response = self.transact(&pdu).await?;
        Self::check_write_echo(&response, 0x06)
    }

    /// FC16 Write Multiple Registers
    pub async fn write_multiple_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> Result<()> {
        let pdu = codec::build_write_multiple_registers_pdu(address, values)?;
        let response = self.transact(&pdu).await?;
        Self::check_write_echo(&response, 0x10)
    }

    /// FC05 Write Single Coil
    pub async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<()> {
        let pdu = codec::build_write_single_coil_pdu(address, value)?;
        let response = self.transact(&pdu).await?;
        Self::check_write_echo(&response, 0x05)
    }

    /// FC15 Write Multiple Coils
    pub async fn write_multiple_coils(&mut self, address: u16, values: &[bool]) -> Result<()> {
        let pdu = codec::build_write_multiple_coils_pdu(address, values)?;
        let response = self.transact(&pdu).await?;
        Self::check_write_echo(&response, 0x0F)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn read_words(&mut self, fc: u8, address: u16, count: u16) -> Result<Vec<u16>> {
        if count == 0 || count as usize > MAX_READ_REGISTERS {
            return Err(AcqError::protocol(format!(
                "invalid register count {count} for FC{fc:02X}"
            )));
        }

        let pdu = PduBuilder::new()
            .function_code(fc)?
            .address(address)?
            .quantity(count)?
            .build();
        let response = self.transact(&pdu).await?;

        let data = response.as_slice();
        if data.len() < 2 {
            return Err(AcqError::protocol("read response too short"));
        }
        let byte_count = data[1] as usize;
        if byte_count != count as usize * 2 || data.len() < 2 + byte_count {
            return Err(AcqError::protocol(format!(
                "read response byte count mismatch: expected {}, got {byte_count}",
                count * 2
            )));
        }

        let mut words = Vec::with_capacity(count as usize);
        for chunk in data[2..2 + byte_count].chunks_exact(2) {
            words.push(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        Ok(words)
    }

    async fn read_bits(&mut self, fc: u8, address: u16, count: u16) -> Result<Vec<bool>> {
        if count == 0 || count as usize > MAX_READ_COILS {
            return Err(AcqError::protocol(format!(
                "invalid coil count {count} for FC{fc:02X}"
            )));
        }

        let pdu = PduBuilder::new()
            .function_code(fc)?
            .address(address)?
            .quantity(count)?
            .build();
        let response = self.transact(&pdu).await?;

        let data = response.as_slice();
        if data.len() < 2 {
            return Err(AcqError::protocol("read response too short"));
        }
        let byte_count = data[1] as usize;
        if byte_count != (count as usize).div_ceil(8) || data.len() < 2 + byte_count {
            return Err(AcqError::protocol("coil response byte count mismatch"));
        }

        let mut bits = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let byte = data[2 + i / 8];
            bits.push(byte & (1 << (i % 8)) != 0);
        }
        Ok(bits)
    }

    /// One request/response exchange. Exception PDUs surface as
    /// `ModbusException`; transport faults propagate untouched.
    async fn transact(&mut self, request: &Pdu) -> Result<Pdu> {
        let frame = self.codec.build_frame(self.unit_id, request);
        self.transport.send(&frame).await?;

        let raw = self.receive_frame().await?;
        let (_, response) = self.codec.parse_frame(&raw)?;

        if response.is_exception() {
            let function = response.function_code().unwrap_or(0) & 0x7F;
            let code = response.exception_code().unwrap_or(0);
            debug!(
                "unit {} answered exception {code:#04X} ({}) for FC{function:02X}",
                self.unit_id,
                exception_description(code)
            );
            return Err(AcqError::ModbusException { function, code });
        }

        Ok(response)
    }

    /// Accumulate transport reads until a complete frame is buffered.
    /// TCP frames declare their length in the MBAP header; RTU responses
    /// are sized from the function code.
    async fn receive_frame(&mut self) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let mut assembled: Vec<u8> = Vec::new();
        let mut buffer = [0u8; RESPONSE_BUFFER_SIZE];

        loop {
            if let Some(expected) = self.expected_frame_len(&assembled) {
                if assembled.len() >= expected {
                    assembled.truncate(expected);
                    return Ok(assembled);
                }
            }

            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| AcqError::timeout("response deadline exceeded"))?;

            let n = self.transport.receive(&mut buffer, remaining).await?;
            assembled.extend_from_slice(&buffer[..n]);
            trace!("assembled {} response bytes", assembled.len());
        }
    }

    fn expected_frame_len(&self, data: &[u8]) -> Option<usize> {
        match self.codec.mode() {
            FrameMode::Tcp => {
                if data.len() < MBAP_HEADER_LEN + 1 {
                    return None;
                }
                let length = u16::from_be_bytes([data[4], data[5]]) as usize;
                Some(MBAP_HEADER_LEN + length)
            },
            FrameMode::Rtu => {
                if data.len() < 2 {
                    return None;
                }
                let fc = data[1];
                if fc & 0x80 != 0 {
                    // unit + fc + exception code + crc
                    return Some(5);
                }
                match fc {
                    0x01..=0x04 => {
                        if data.len() < 3 {
                            None
                        } else {
                            Some(3 + data[2] as usize + 2)
                        }
                    },
                    0x05 | 0x06 | 0x0F | 0x10 => Some(8),
                    _ => Some(data.len().max(5)),
                }
            },
        }
    }

    fn check_write_echo(response: &Pdu, expected_fc: u8) -> Result<()> {
        match response.function_code() {
            Some(fc) if fc == expected_fc => Ok(()),
            Some(fc) => Err(AcqError::protocol(format!(
                "write echo function code mismatch: expected {expected_fc:#04X}, got {fc:#04X}"
            ))),
            None => Err(AcqError::protocol("empty write response")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn tcp_client(mock: &MockTransport) -> ModbusClient {
        ModbusClient::new(
            Box::new(mock.clone()),
            FrameMode::Tcp,
            0x11,
            Duration::from_millis(200),
        )
    }

    /// Build a TCP response frame for transaction id 1
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
    async fn test_read_holding_roundtrip() {
        let mock = MockTransport::new();
        let mut client = tcp_client(&mock);
        client.connect().await.unwrap();

        mock.push_receive(tcp_response(
            1,
            0x11,
            &[0x03, 0x04, 0x12, 0x34, 0x56, 0x78],
        ));

        let words = client.read_holding(0x0000, 2).await.unwrap();
        assert_eq!(words, vec![0x1234, 0x5678]);

        // Request on the wire: MBAP + [03 00 00 00 02]
        let sent = mock.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][7..], &[0x03, 0x00, 0x00, 0x00, 0x02]);
    }

    #[tokio::test]
    async fn test_read_coils_unpacks_bits() {
        let mock = MockTransport::new();
        let mut client = tcp_client(&mock);
        client.connect().await.unwrap();

        // 10 coils over 2 bytes: 0x8D 0x03
        mock.push_receive(tcp_response(1, 0x11, &[0x01, 0x02, 0x8D, 0x03]));

        let bits = client.read_coils(0, 10).await.unwrap();
        assert_eq!(
            bits,
            vec![true, false, true, true, false, false, false, true, true, true]
        );
    }

    #[tokio::test]
    async fn test_exception_response_maps_to_error() {
        let mock = MockTransport::new();
        let mut client = tcp_client(&mock);
        client.connect().await.unwrap();

        mock.push_receive(tcp_response(1, 0x11, &[0x83, 0x02]));

        let err = client.read_holding(0x0000, 1).await.unwrap_err();
        match err {
            AcqError::ModbusException { function, code } => {
                assert_eq!(function, 0x03);
                assert_eq!(code, 0x02);
            },
            other => panic!("expected ModbusException, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_fragmented_tcp_response_reassembled() {
        let mock = MockTransport::new();
        let mut client = tcp_client(&mock);
        client.connect().await.unwrap();

        let full = tcp_response(1, 0x11, &[0x03, 0x02, 0xAB, 0xCD]);
        let (head, tail) = full.split_at(5);
        mock.push_receive(head.to_vec());
        mock.push_receive(tail.to_vec());

        let words = client.read_holding(0, 1).await.unwrap();
        assert_eq!(words, vec![0xABCD]);
    }

    #[tokio::test]
    async fn test_write_single_register_echo() {
        let mock = MockTransport::new();
        let mut client = tcp_client(&mock);
        client.connect().await.unwrap();

        mock.push_receive(tcp_response(1, 0x11, &[0x06, 0x01, 0x00, 0x12, 0x34]));
        client.write_single_register(0x0100, 0x1234).await.unwrap();

        // Wrong echo FC fails
        mock.push_receive(tcp_response(2, 0x11, &[0x06, 0x01, 0x00, 0x12, 0x34]));
        let err = client
            .write_multiple_registers(0x0100, &[0x0001])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }

    #[tokio::test]
    async fn test_rtu_response_roundtrip() {
        use crate::protocols::modbus::frame::crc16;

        let mock = MockTransport::new();
        let mut client = ModbusClient::new(
            Box::new(mock.clone()),
            FrameMode::Rtu,
            0x01,
            Duration::from_millis(200),
        );
        client.connect().await.unwrap();

        let mut response = vec![0x01, 0x03, 0x02, 0x00, 0x2A];
        let crc = crc16(&response);
        response.extend_from_slice(&crc.to_le_bytes());
        mock.push_receive(response);

        let words = client.read_holding(0, 1).await.unwrap();
        assert_eq!(words, vec![0x002A]);

        // The request frame carries a valid CRC
        let sent = mock.sent_frames();
        let frame = &sent[0];
        let body = &frame[..frame.len() - 2];
        let crc = u16::from_le_bytes([frame[frame.len() - 2], frame[frame.len() - 1]]);
        assert_eq!(crc, crc16(body));
    }

    #[tokio::test]
    async fn test_invalid_read_counts_rejected() {
        let mock = MockTransport::new();
        let mut client = tcp_client(&mock);
        client.connect().await.unwrap();

        assert!(client.read_holding(0, 0).await.is_err());
        assert!(client.read_holding(0, 126).await.is_err());
        assert!(client.read_coils(0, 2001).await.is_err());
        // Nothing reached the wire
        assert!(mock.sent_frames().is_empty());
    }
}
