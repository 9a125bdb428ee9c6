//! Value reconstruction from register images
//!
//! Registers arrive as big-endian 16-bit words; this module turns slices of
//! them into typed parameter values under the connection's word order, and
//! builds the write PDUs for the control path.

use std::collections::BTreeMap;

use crate::config::spec::{BitMap, DataType};
use crate::core::events::Value;
use crate::utils::bytes::{regs_to_f32, regs_to_i32, regs_to_u32, WordOrder};
use crate::utils::error::{AcqError, Result};

use super::constants::{MAX_WRITE_COILS, MAX_WRITE_REGISTERS};
use super::pdu::{Pdu, PduBuilder};

/// Decode the raw (pre-scale) value of a parameter from its registers
pub fn decode_raw(registers: &[u16], data_type: DataType, order: WordOrder) -> Result<Value> {
    match data_type {
        DataType::Bit => {
            let reg = first(registers, data_type)?;
            Ok(Value::Integer(i64::from(reg & 0x0001)))
        },
        DataType::Int16 => {
            let reg = first(registers, data_type)?;
            Ok(Value::Integer(i64::from(reg as i16)))
        },
        DataType::Uint16 => {
            let reg = first(registers, data_type)?;
            Ok(Value::Integer(i64::from(reg)))
        },
        DataType::Int32 => {
            let pair = pair(registers, data_type)?;
            Ok(Value::Integer(i64::from(regs_to_i32(&pair, order))))
        },
        DataType::Uint32 => {
            let pair = pair(registers, data_type)?;
            Ok(Value::Integer(i64::from(regs_to_u32(&pair, order))))
        },
        DataType::Float32 => {
            let pair = pair(registers, data_type)?;
            Ok(Value::Float(f64::from(regs_to_f32(&pair, order))))
        },
        DataType::Text => {
            if registers.is_empty() {
                return Err(AcqError::Truncated(
                    "string needs at least 1 register, got 0".to_string(),
                ));
            }
            Ok(Value::Text(decode_string(registers)))
        },
    }
}

fn first(registers: &[u16], data_type: DataType) -> Result<u16> {
    registers.first().copied().ok_or_else(|| {
        AcqError::Truncated(format!("{data_type:?} needs 1 register, got 0"))
    })
}

fn pair(registers: &[u16], data_type: DataType) -> Result<[u16; 2]> {
    if registers.len() < 2 {
        return Err(AcqError::Truncated(format!(
            "{data_type:?} needs 2 registers, got {}",
            registers.len()
        )));
    }
    Ok([registers[0], registers[1]])
}

/// Apply `raw * scale + offset`. Integer types truncate toward zero after
/// scaling; float32 stays floating (the parser rounds to the configured
/// precision); bit and string values pass through untouched.
pub fn apply_scaling(raw: &Value, data_type: DataType, scale: f64, offset: f64) -> Value {
    match data_type {
        DataType::Bit | DataType::Text => raw.clone(),
        DataType::Int16 | DataType::Uint16 | DataType::Int32 | DataType::Uint32 => {
            if scale == 1.0 && offset == 0.0 {
                raw.clone()
            } else if let Value::Integer(v) = raw {
                Value::Integer(((*v as f64) * scale + offset).trunc() as i64)
            } else {
                raw.clone()
            }
        },
        DataType::Float32 => {
            if let Value::Float(v) = raw {
                Value::Float(v * scale + offset)
            } else {
                raw.clone()
            }
        },
    }
}

/// Decode registers directly into the scaled value
pub fn decode_value(
    registers: &[u16],
    data_type: DataType,
    order: WordOrder,
    scale: f64,
    offset: f64,
) -> Result<Value> {
    let raw = decode_raw(registers, data_type, order)?;
    Ok(apply_scaling(&raw, data_type, scale, offset))
}

/// Expand a raw uint16 into its mapped bits: bit code -> state
pub fn decode_bit_map(raw: u16, bit_map: &BitMap) -> BTreeMap<String, bool> {
    let mut bits = BTreeMap::new();
    for (index, entry) in bit_map {
        if let Ok(bit) = index.parse::<u8>() {
            if bit < 16 {
                bits.insert(entry.code.clone(), raw & (1 << bit) != 0);
            }
        }
    }
    bits
}

/// ASCII string from registers: high byte then low byte of each register,
/// trailing NULs trimmed.
pub fn decode_string(registers: &[u16]) -> String {
    let mut bytes = Vec::with_capacity(registers.len() * 2);
    for reg in registers {
        let [hi, lo] = reg.to_be_bytes();
        bytes.push(hi);
        bytes.push(lo);
    }
    let text: String = bytes
        .into_iter()
        .map(|b| if b.is_ascii() { b as char } else { '\u{FFFD}' })
        .collect();
    text.trim_end_matches('\0').to_string()
}

/// Round half away from zero to `precision` decimal places
pub fn round_to_precision(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

// ============================================================================
// Write PDU construction
// ============================================================================

/// FC05 Write Single Coil: ON is 0xFF00, OFF is 0x0000
pub fn build_write_single_coil_pdu(address: u16, value: bool) -> Result<Pdu> {
    Ok(PduBuilder::new()
        .function_code(0x05)?
        .address(address)?
        .byte(if value { 0xFF } else { 0x00 })?
        .byte(0x00)?
        .build())
}

/// FC06 Write Single Register
pub fn build_write_single_register_pdu(address: u16, value: u16) -> Result<Pdu> {
    Ok(PduBuilder::new()
        .function_code(0x06)?
        .address(address)?
        .quantity(value)?
        .build())
}

/// FC16 Write Multiple Registers
pub fn build_write_multiple_registers_pdu(start_address: u16, values: &[u16]) -> Result<Pdu> {
    if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
        return Err(AcqError::protocol("invalid register count for FC16"));
    }

    let mut pdu = Pdu::new();
    pdu.push(0x10)?;
    pdu.push_u16(start_address)?;
    pdu.push_u16(values.len() as u16)?;
    pdu.push((values.len() * 2) as u8)?;
    for &value in values {
        pdu.push_u16(value)?;
    }
    Ok(pdu)
}

/// FC15 Write Multiple Coils, bit 0 first within each byte
pub fn build_write_multiple_coils_pdu(start_address: u16, values: &[bool]) -> Result<Pdu> {
    if values.is_empty() || values.len() > MAX_WRITE_COILS {
        return Err(AcqError::protocol("invalid coil count for FC15"));
    }

    let mut pdu = Pdu::new();
    pdu.push(0x0F)?;
    pdu.push_u16(start_address)?;
    pdu.push_u16(values.len() as u16)?;
    pdu.push(values.len().div_ceil(8) as u8)?;

    let mut current = 0u8;
    let mut bit = 0;
    for &value in values {
        if value {
            current |= 1 << bit;
        }
        bit += 1;
        if bit == 8 {
            pdu.push(current)?;
            current = 0;
            bit = 0;
        }
    }
    if bit > 0 {
        pdu.push(current)?;
    }

    Ok(pdu)
}
