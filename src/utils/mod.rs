//! Shared utilities: error types, byte-order conversions, hex dumps

pub mod bytes;
pub mod error;
pub mod hex;

/// Current wall-clock time as milliseconds since the Unix epoch
#[inline]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
