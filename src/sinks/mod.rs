//! Data sinks: time-series storage and broker publishing
//!
//! Both sit behind traits so the pipeline tests run against in-memory
//! doubles. Storage is at-most-once (errors are logged and dropped); broker
//! publishing is at-least-once via MQTT QoS 1.

pub mod influx;
pub mod memory;
pub mod mqtt;
pub mod writer;

use async_trait::async_trait;

use crate::core::events::{DataParsed, Value};
use crate::utils::error::Result;

/// One time-series point
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub conn_id: String,
    pub device_id: String,
    pub code: String,
    pub value: f64,
    pub ts_ms: i64,
}

/// Time-series storage
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    async fn write(&self, batch: &[DataPoint]) -> Result<()>;
}

/// Message broker
#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Publish one payload at-least-once
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Flatten a parsed batch into time-series points.
///
/// Bit-mapped parameters expand into one point per bit code named
/// `<parent>_<bit_code>`; enum parameters store the numeric raw (their
/// label only travels on the broker path); text samples have no numeric
/// form and are skipped.
pub fn samples_to_points(batch: &DataParsed) -> Vec<DataPoint> {
    let mut points = Vec::with_capacity(batch.samples.len());

    for sample in &batch.samples {
        match &sample.parsed {
            Value::Bits(bits) => {
                for (bit_code, &state) in bits {
                    points.push(DataPoint {
                        conn_id: sample.conn_id.clone(),
                        device_id: sample.device_id.clone(),
                        code: format!("{}_{}", sample.code, bit_code),
                        value: if state { 1.0 } else { 0.0 },
                        ts_ms: sample.ts_ms,
                    });
                }
            },
            Value::Text(_) => {
                // Enum labels fall back to the numeric raw; true text
                // parameters have nothing to store
                if let Some(value) = sample.raw.as_f64() {
                    points.push(DataPoint {
                        conn_id: sample.conn_id.clone(),
                        device_id: sample.device_id.clone(),
                        code: sample.code.clone(),
                        value,
                        ts_ms: sample.ts_ms,
                    });
                }
            },
            other => {
                if let Some(value) = other.as_f64() {
                    points.push(DataPoint {
                        conn_id: sample.conn_id.clone(),
                        device_id: sample.device_id.clone(),
                        code: sample.code.clone(),
                        value,
                        ts_ms: sample.ts_ms,
                    });
                }
            },
        }
    }

    points
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::core::events::ParameterSample;
    use std::collections::BTreeMap;

    fn batch(samples: Vec<ParameterSample>) -> DataParsed {
        DataParsed {
            conn_id: "c1".to_string(),
            device_id: "d1".to_string(),
            samples,
            ts_ms: 1,
        }
    }

    fn sample(code: &str, raw: Value, parsed: Value) -> ParameterSample {
        ParameterSample {
            conn_id: "c1".to_string(),
            device_id: "d1".to_string(),
            code: code.to_string(),
            raw,
            parsed,
            unit: None,
            ts_ms: 1,
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_numeric_samples_become_points() {
        let points = samples_to_points(&batch(vec![
            sample("a", Value::Integer(5), Value::Integer(5)),
            sample("b", Value::Float(2.5), Value::Float(2.5)),
            sample("c", Value::Integer(1), Value::Bool(true)),
        ]));
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].value, 5.0);
        assert_eq!(points[1].value, 2.5);
        assert_eq!(points[2].value, 1.0);
    }

    #[test]
    fn test_bit_map_expands_per_bit() {
        let mut bits = BTreeMap::new();
        bits.insert("alarm_low".to_string(), true);
        bits.insert("alarm_high".to_string(), false);

        let points =
            samples_to_points(&batch(vec![sample("status", Value::Integer(1), Value::Bits(bits))]));
        assert_eq!(points.len(), 2);
        let codes: Vec<_> = points.iter().map(|p| p.code.as_str()).collect();
        assert!(codes.contains(&"status_alarm_low"));
        assert!(codes.contains(&"status_alarm_high"));
    }

    #[test]
    fn test_enum_label_stores_numeric_raw() {
        let points = samples_to_points(&batch(vec![sample(
            "mode",
            Value::Integer(2),
            Value::Text("running".to_string()),
        )]));
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 2.0);
    }

    #[test]
    fn test_text_parameter_skipped() {
        let points = samples_to_points(&batch(vec![sample(
            "model",
            Value::Text("PUMP".to_string()),
            Value::Text("PUMP".to_string()),
        )]));
        assert!(points.is_empty());
    }
}
