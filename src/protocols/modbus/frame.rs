//! Modbus frame codec for TCP (MBAP) and RTU (CRC-16) modes
//!
//! The connection layer is strictly request/response: one request is on the
//! wire at a time, so the codec only has to validate a response against the
//! single outstanding request.

use crate::utils::error::{AcqError, Result};

use super::constants::MBAP_HEADER_LEN;
use super::pdu::Pdu;

/// Framing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    /// MBAP header, no checksum (TCP carries integrity)
    Tcp,
    /// Unit id + PDU + CRC-16
    Rtu,
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    transaction_id: u16,
    function_code: u8,
    unit_id: u8,
}

/// Stateful frame builder/parser for one connection
#[derive(Debug)]
pub struct FrameCodec {
    mode: FrameMode,
    next_transaction_id: u16,
    outstanding: Option<Outstanding>,
}

impl FrameCodec {
    pub fn new(mode: FrameMode) -> Self {
        Self {
            mode,
            next_transaction_id: 1,
            outstanding: None,
        }
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    fn take_transaction_id(&mut self) -> u16 {
        let id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);
        id
    }

    /// Build a complete request frame and remember it for response matching
    pub fn build_frame(&mut self, unit_id: u8, pdu: &Pdu) -> Vec<u8> {
        let function_code = pdu.function_code().unwrap_or(0);

        match self.mode {
            FrameMode::Tcp => {
                let transaction_id = self.take_transaction_id();
                self.outstanding = Some(Outstanding {
                    transaction_id,
                    function_code,
                    unit_id,
                });

                let length = (pdu.len() + 1) as u16; // unit id + PDU
                let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
                frame.extend_from_slice(&transaction_id.to_be_bytes());
                frame.extend_from_slice(&0u16.to_be_bytes()); // protocol id
                frame.extend_from_slice(&length.to_be_bytes());
                frame.push(unit_id);
                frame.extend_from_slice(pdu.as_slice());
                frame
            },
            FrameMode::Rtu => {
                self.outstanding = Some(Outstanding {
                    transaction_id: 0,
                    function_code,
                    unit_id,
                });

                let mut frame = Vec::with_capacity(1 + pdu.len() + 2);
                frame.push(unit_id);
                frame.extend_from_slice(pdu.as_slice());
                let crc = crc16(&frame);
                frame.extend_from_slice(&crc.to_le_bytes());
                frame
            },
        }
    }

    /// Parse a response frame and validate it against the outstanding request
    pub fn parse_frame(&mut self, data: &[u8]) -> Result<(u8, Pdu)> {
        match self.mode {
            FrameMode::Tcp => self.parse_tcp(data),
            FrameMode::Rtu => self.parse_rtu(data),
        }
    }

    fn parse_tcp(&mut self, data: &[u8]) -> Result<(u8, Pdu)> {
        if data.len() < MBAP_HEADER_LEN + 2 {
            return Err(AcqError::protocol("TCP frame too short"));
        }

        let transaction_id = u16::from_be_bytes([data[0], data[1]]);
        let protocol_id = u16::from_be_bytes([data[2], data[3]]);
        let length = u16::from_be_bytes([data[4], data[5]]);
        let unit_id = data[6];

        if protocol_id != 0 {
            return Err(AcqError::protocol(format!(
                "invalid protocol id: expected 0, got {protocol_id}"
            )));
        }
        if data.len() != MBAP_HEADER_LEN + length as usize {
            return Err(AcqError::protocol(format!(
                "invalid TCP frame length: expected {}, got {}",
                MBAP_HEADER_LEN + length as usize,
                data.len()
            )));
        }

        let pdu = Pdu::from_slice(&data[7..])?;
        self.validate_response(transaction_id, unit_id, &pdu)?;
        Ok((unit_id, pdu))
    }

    fn parse_rtu(&mut self, data: &[u8]) -> Result<(u8, Pdu)> {
        if data.len() < 4 {
            return Err(AcqError::protocol("RTU frame too short"));
        }

        let frame_len = data.len();
        let unit_id = data[0];
        let received_crc = u16::from_le_bytes([data[frame_len - 2], data[frame_len - 1]]);
        let calculated_crc = crc16(&data[..frame_len - 2]);
        if received_crc != calculated_crc {
            return Err(AcqError::protocol(format!(
                "CRC mismatch: expected {calculated_crc:#06X}, got {received_crc:#06X}"
            )));
        }

        let pdu = Pdu::from_slice(&data[1..frame_len - 2])?;
        // RTU carries no transaction id; match on unit + function code only.
        self.validate_response(
            self.outstanding.map(|o| o.transaction_id).unwrap_or(0),
            unit_id,
            &pdu,
        )?;
        Ok((unit_id, pdu))
    }

    fn validate_response(&mut self, transaction_id: u16, unit_id: u8, pdu: &Pdu) -> Result<()> {
        let outstanding = self
            .outstanding
            .ok_or_else(|| AcqError::protocol("response with no outstanding request"))?;

        if transaction_id != outstanding.transaction_id {
            return Err(AcqError::protocol(format!(
                "transaction id mismatch: expected {:#06X}, got {transaction_id:#06X}",
                outstanding.transaction_id
            )));
        }
        if unit_id != outstanding.unit_id {
            return Err(AcqError::protocol(format!(
                "unit id mismatch: expected {}, got {unit_id}",
                outstanding.unit_id
            )));
        }
        let response_fc = pdu.function_code().map(|fc| fc & 0x7F).unwrap_or(0);
        if response_fc != outstanding.function_code {
            return Err(AcqError::protocol(format!(
                "function code mismatch: expected {:#04X}, got {response_fc:#04X}",
                outstanding.function_code
            )));
        }

        self.outstanding = None;
        Ok(())
    }
}

/// Modbus RTU CRC-16 (polynomial 0xA001)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Human-readable description of a Modbus exception code
pub fn exception_description(exception_code: u8) -> &'static str {
    match exception_code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}
