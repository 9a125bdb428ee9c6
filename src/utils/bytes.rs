//! Register/number conversions with configurable word order
//!
//! Modbus registers are big-endian 16-bit words on the wire. A 32-bit value
//! spans two registers whose bytes are labelled `A B C D` (A = high byte of
//! the first register). The word-order string names the byte sequence handed
//! to a little-endian 32-bit decoder, which is the convention the device
//! configuration files use:
//!
//! | order | LE decoder input | big-endian equivalent |
//! |-------|------------------|-----------------------|
//! | ABCD  | D C B A          | A B C D               |
//! | DCBA  | A B C D          | D C B A               |
//! | BADC  | B A D C          | C D A B               |
//! | CDAB  | C D A B          | B A D C               |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Word order for reconstructing 32-bit values from two registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WordOrder {
    /// Straight big-endian
    #[default]
    #[serde(rename = "ABCD")]
    Abcd,
    /// Fully reversed
    #[serde(rename = "DCBA")]
    Dcba,
    /// Register order swapped, bytes inside each register kept
    #[serde(rename = "BADC")]
    Badc,
    /// Bytes inside each register swapped, register order kept
    #[serde(rename = "CDAB")]
    Cdab,
}

impl WordOrder {
    /// Parse the configuration string form. Unknown strings are rejected so
    /// a typo in a device file fails at load instead of decoding garbage.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ABCD" => Some(WordOrder::Abcd),
            "DCBA" => Some(WordOrder::Dcba),
            "BADC" => Some(WordOrder::Badc),
            "CDAB" => Some(WordOrder::Cdab),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WordOrder::Abcd => "ABCD",
            WordOrder::Dcba => "DCBA",
            WordOrder::Badc => "BADC",
            WordOrder::Cdab => "CDAB",
        }
    }
}

impl fmt::Display for WordOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Registers -> bytes
// ============================================================================

/// Convert two registers to the big-endian byte image of the 32-bit value
/// they encode under the given word order.
pub fn regs_to_bytes_4(regs: &[u16; 2], order: WordOrder) -> [u8; 4] {
    let [h0, h1] = [regs[0].to_be_bytes(), regs[1].to_be_bytes()];

    match order {
        WordOrder::Abcd => [h0[0], h0[1], h1[0], h1[1]],
        WordOrder::Dcba => [h1[1], h1[0], h0[1], h0[0]],
        WordOrder::Badc => [h1[0], h1[1], h0[0], h0[1]],
        WordOrder::Cdab => [h0[1], h0[0], h1[1], h1[0]],
    }
}

// ============================================================================
// Registers -> numeric types
// ============================================================================

/// Convert two registers to f32
pub fn regs_to_f32(regs: &[u16; 2], order: WordOrder) -> f32 {
    f32::from_be_bytes(regs_to_bytes_4(regs, order))
}

/// Convert two registers to u32
pub fn regs_to_u32(regs: &[u16; 2], order: WordOrder) -> u32 {
    u32::from_be_bytes(regs_to_bytes_4(regs, order))
}

/// Convert two registers to i32
pub fn regs_to_i32(regs: &[u16; 2], order: WordOrder) -> i32 {
    i32::from_be_bytes(regs_to_bytes_4(regs, order))
}

// ============================================================================
// Numeric types -> registers (write path and round-trip tests)
// ============================================================================

/// Split a big-endian byte image into two registers under the given order.
/// Inverse of `regs_to_bytes_4`.
pub fn bytes_4_to_regs(bytes: &[u8; 4], order: WordOrder) -> [u16; 2] {
    let regs_from = |a: u8, b: u8, c: u8, d: u8| {
        [u16::from_be_bytes([a, b]), u16::from_be_bytes([c, d])]
    };

    match order {
        WordOrder::Abcd => regs_from(bytes[0], bytes[1], bytes[2], bytes[3]),
        WordOrder::Dcba => regs_from(bytes[3], bytes[2], bytes[1], bytes[0]),
        WordOrder::Badc => regs_from(bytes[2], bytes[3], bytes[0], bytes[1]),
        WordOrder::Cdab => regs_from(bytes[1], bytes[0], bytes[3], bytes[2]),
    }
}

/// Encode a u32 into two registers under the given word order
pub fn u32_to_regs(value: u32, order: WordOrder) -> [u16; 2] {
    bytes_4_to_regs(&value.to_be_bytes(), order)
}

/// Encode an f32 into two registers under the given word order
pub fn f32_to_regs(value: f32, order: WordOrder) -> [u16; 2] {
    bytes_4_to_regs(&value.to_be_bytes(), order)
}

/// Encode an i32 into two registers under the given word order
pub fn i32_to_regs(value: i32, order: WordOrder) -> [u16; 2] {
    bytes_4_to_regs(&value.to_be_bytes(), order)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_word_order_parse() {
        assert_eq!(WordOrder::parse("ABCD"), Some(WordOrder::Abcd));
        assert_eq!(WordOrder::parse("dcba"), Some(WordOrder::Dcba));
        assert_eq!(WordOrder::parse("Badc"), Some(WordOrder::Badc));
        assert_eq!(WordOrder::parse("CDAB"), Some(WordOrder::Cdab));
        assert_eq!(WordOrder::parse("ABDC"), None);
        assert_eq!(WordOrder::parse(""), None);
    }

    #[test]
    fn test_regs_to_bytes_4_all_orders() {
        // A=0x12, B=0x34, C=0x56, D=0x78
        let regs = [0x1234, 0x5678];

        assert_eq!(
            regs_to_bytes_4(&regs, WordOrder::Abcd),
            [0x12, 0x34, 0x56, 0x78]
        );
        assert_eq!(
            regs_to_bytes_4(&regs, WordOrder::Dcba),
            [0x78, 0x56, 0x34, 0x12]
        );
        assert_eq!(
            regs_to_bytes_4(&regs, WordOrder::Badc),
            [0x56, 0x78, 0x12, 0x34]
        );
        assert_eq!(
            regs_to_bytes_4(&regs, WordOrder::Cdab),
            [0x34, 0x12, 0x78, 0x56]
        );
    }

    #[test]
    fn test_regs_to_u32_reference_vectors() {
        let regs = [0x1234, 0x5678];
        assert_eq!(regs_to_u32(&regs, WordOrder::Abcd), 0x1234_5678);
        assert_eq!(regs_to_u32(&regs, WordOrder::Dcba), 0x7856_3412);
        assert_eq!(regs_to_u32(&regs, WordOrder::Badc), 0x5678_1234);
        assert_eq!(regs_to_u32(&regs, WordOrder::Cdab), 0x3412_7856);
    }

    #[test]
    fn test_regs_to_f32_ieee_bits() {
        // Registers [0x1234, 0x5678] under ABCD are the IEEE-754 bit pattern
        // 0x12345678, under DCBA the pattern 0x78563412.
        let regs = [0x1234, 0x5678];

        let abcd = regs_to_f32(&regs, WordOrder::Abcd);
        assert_eq!(abcd.to_bits(), 0x1234_5678);

        let dcba = regs_to_f32(&regs, WordOrder::Dcba);
        assert_eq!(dcba.to_bits(), 0x7856_3412);
    }

    #[test]
    fn test_regs_to_f32_known_value() {
        // 25.0 in IEEE 754: 0x41C80000
        let regs = [0x41C8, 0x0000];
        let value = regs_to_f32(&regs, WordOrder::Abcd);
        assert!((value - 25.0).abs() < f32::EPSILON);

        // Same value with swapped register order
        let regs = [0x0000, 0x41C8];
        let value = regs_to_f32(&regs, WordOrder::Badc);
        assert!((value - 25.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_regs_to_i32_negative() {
        let regs = [0xFFFF, 0xFFFF];
        assert_eq!(regs_to_i32(&regs, WordOrder::Abcd), -1);

        let regs = u32_to_regs((-12345i32) as u32, WordOrder::Cdab);
        assert_eq!(regs_to_i32(&regs, WordOrder::Cdab), -12345);
    }

    #[test]
    fn test_u32_roundtrip_all_orders() {
        let values = [0u32, 1, 0x1234_5678, 0xFFFF_FFFF, 0xDEAD_BEEF];
        let orders = [
            WordOrder::Abcd,
            WordOrder::Dcba,
            WordOrder::Badc,
            WordOrder::Cdab,
        ];

        for value in values {
            for order in orders {
                let regs = u32_to_regs(value, order);
                assert_eq!(
                    regs_to_u32(&regs, order),
                    value,
                    "u32 round-trip failed for {value:#X} with {order}"
                );
            }
        }
    }

    #[test]
    fn test_f32_roundtrip_all_orders() {
        let values = [0.0f32, 1.0, -1.0, 25.0, std::f32::consts::PI, f32::MAX];
        let orders = [
            WordOrder::Abcd,
            WordOrder::Dcba,
            WordOrder::Badc,
            WordOrder::Cdab,
        ];

        for value in values {
            for order in orders {
                let regs = f32_to_regs(value, order);
                let decoded = regs_to_f32(&regs, order);
                assert_eq!(
                    decoded.to_bits(),
                    value.to_bits(),
                    "f32 round-trip failed for {value} with {order}"
                );
            }
        }
    }

    #[test]
    fn test_serde_string_forms() {
        let order: WordOrder = serde_yaml::from_str("\"CDAB\"").unwrap();
        assert_eq!(order, WordOrder::Cdab);
        assert_eq!(serde_yaml::to_string(&order).unwrap().trim(), "CDAB");
    }
}
