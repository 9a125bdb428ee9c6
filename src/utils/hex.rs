//! Hex formatting helpers for wire-level trace logging

/// Format bytes as hex string with spaces between each byte
/// Example: [0x12, 0x34, 0xAB] -> "12 34 AB"
#[inline]
pub fn format_hex_pretty(data: &[u8]) -> String {
    let hex_str = hex::encode_upper(data);
    hex_str
        .chars()
        .collect::<Vec<_>>()
        .chunks(2)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
}
