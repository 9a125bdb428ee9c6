//! Modbus protocol constants
//!
//! Limits follow the official specification: the 253-byte PDU ceiling is
//! inherited from the RS485 ADU limit of 256 bytes (address + PDU + CRC).

/// MBAP header length for TCP framing: Transaction ID(2) + Protocol ID(2) +
/// Length(2). The Unit ID byte is counted by the Length field instead.
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU size per the Modbus specification
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum value of the MBAP length field (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Receive buffer size with headroom over the largest legal frame
pub const RESPONSE_BUFFER_SIZE: usize = 512;

/// Maximum registers per FC03/FC04 read: (253 - 2) / 2
pub const MAX_READ_REGISTERS: usize = 125;

/// Maximum registers per FC16 write: (253 - 6) / 2
pub const MAX_WRITE_REGISTERS: usize = 123;

/// Maximum coils per FC01/FC02 read
pub const MAX_READ_COILS: usize = 2000;

/// Maximum coils per FC15 write
pub const MAX_WRITE_COILS: usize = 1968;

// Function codes
pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
