//! Block image parsing
//!
//! Turns one tick's block readings into typed parameter samples. Parameter
//! failures are isolated: a parameter whose registers did not arrive this
//! tick is skipped, the rest of the device still parses.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::spec::{DataType, ParameterSpec, RegisterKind};
use crate::protocols::modbus::codec;
use crate::utils::error::{AcqError, Result};

use super::events::{
    DataAcquired, DataParsed, ParamChanged, ParameterSample, PipelineTx, Value,
};
use super::tracker::ChangeTracker;

/// Sparse per-tick register image for one device
pub struct RegisterImage {
    words: BTreeMap<u16, u16>,
}

impl RegisterImage {
    /// Merge all successfully read blocks of one tick
    pub fn from_acquired(acq: &DataAcquired) -> Self {
        let mut words = BTreeMap::new();
        for block in &acq.blocks {
            if let Some(block_words) = &block.words {
                for (offset, &word) in block_words.iter().enumerate() {
                    words.insert(block.start.wrapping_add(offset as u16), word);
                }
            }
        }
        Self { words }
    }

    /// Fetch the registers a parameter spans; `MissingRegisters` when any
    /// address is absent from this tick's image.
    pub fn slice(&self, param: &ParameterSpec) -> Result<Vec<u16>> {
        let base = param
            .base_address()
            .ok_or_else(|| AcqError::MissingRegisters(format!("'{}' has no addresses", param.code)))?;
        let count = param.register_count() as u16;

        let mut registers = Vec::with_capacity(count as usize);
        for offset in 0..count {
            let addr = base.wrapping_add(offset);
            match self.words.get(&addr) {
                Some(&word) => registers.push(word),
                None => {
                    return Err(AcqError::MissingRegisters(format!(
                        "'{}' needs register {addr}",
                        param.code
                    )))
                },
            }
        }
        Ok(registers)
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Parse one parameter out of the image
pub fn parse_parameter(
    param: &ParameterSpec,
    image: &RegisterImage,
    register_kind: RegisterKind,
    conn_id: &str,
    device_id: &str,
    ts_ms: i64,
    byte_order: crate::utils::bytes::WordOrder,
) -> Result<ParameterSample> {
    let registers = image.slice(param)?;

    // Coil and discrete-input tables carry single bits; the spec-level data
    // type is ignored there
    if register_kind.is_bit_table() {
        let bit = registers.first().copied().unwrap_or(0) & 0x0001;
        let raw = Value::Integer(i64::from(bit));
        let parsed = match &param.enum_map {
            Some(enum_map) => match enum_map.get(&bit.to_string()) {
                Some(label) => Value::Text(label.clone()),
                None => Value::Bool(bit != 0),
            },
            None => Value::Bool(bit != 0),
        };
        return Ok(sample(param, conn_id, device_id, raw, parsed, ts_ms));
    }

    let raw = codec::decode_raw(&registers, param.data_type, byte_order)?;

    let parsed = match (&param.bit_map, &param.enum_map, param.data_type) {
        (Some(bit_map), _, DataType::Uint16) => {
            let raw_word = match raw {
                Value::Integer(v) => v as u16,
                _ => 0,
            };
            Value::Bits(codec::decode_bit_map(raw_word, bit_map))
        },
        (None, Some(enum_map), DataType::Uint16) => {
            let key = match &raw {
                Value::Integer(v) => v.to_string(),
                other => {
                    return Err(AcqError::internal(format!(
                        "uint16 decoded to non-integer {other:?}"
                    )))
                },
            };
            match enum_map.get(&key) {
                Some(label) => Value::Text(label.clone()),
                None => raw.clone(),
            }
        },
        (_, _, DataType::Bit) => match raw {
            Value::Integer(v) => Value::Bool(v != 0),
            ref other => other.clone(),
        },
        (_, _, DataType::Float32) => {
            let scaled = codec::apply_scaling(&raw, param.data_type, param.scale, param.offset);
            match scaled {
                Value::Float(f) => Value::Float(codec::round_to_precision(f, param.precision)),
                other => other,
            }
        },
        _ => codec::apply_scaling(&raw, param.data_type, param.scale, param.offset),
    };

    Ok(sample(param, conn_id, device_id, raw, parsed, ts_ms))
}

fn sample(
    param: &ParameterSpec,
    conn_id: &str,
    device_id: &str,
    raw: Value,
    parsed: Value,
    ts_ms: i64,
) -> ParameterSample {
    let mut metadata = BTreeMap::new();
    if let Some(name) = &param.name {
        metadata.insert("name".to_string(), name.clone());
    }
    ParameterSample {
        conn_id: conn_id.to_string(),
        device_id: device_id.to_string(),
        code: param.code.clone(),
        raw,
        parsed,
        unit: param.unit.clone(),
        ts_ms,
        metadata,
    }
}

/// Parse every enabled parameter of one acquisition
pub fn parse_acquired(acq: &DataAcquired) -> DataParsed {
    let image = RegisterImage::from_acquired(acq);
    let conn_id = &acq.connection.conn_id;
    let device_id = &acq.device.device_id;

    let mut samples = Vec::new();
    for param in acq.device.enabled_parameters() {
        match parse_parameter(
            param,
            &image,
            acq.register_kind,
            conn_id,
            device_id,
            acq.ts_ms,
            acq.connection.byte_order,
        ) {
            Ok(sample) => samples.push(sample),
            Err(AcqError::MissingRegisters(msg)) => {
                debug!(conn_id = %conn_id, device_id = %device_id, "parameter skipped: {msg}");
            },
            Err(e) => {
                warn!(
                    conn_id = %conn_id,
                    device_id = %device_id,
                    code = %param.code,
                    "parameter decode failed: {e}"
                );
            },
        }
    }

    DataParsed {
        conn_id: conn_id.clone(),
        device_id: device_id.clone(),
        samples,
        ts_ms: acq.ts_ms,
    }
}

/// Spawn the parser stage: single consumer of `DataAcquired`, producer of
/// `DataParsed` and `ParamChanged`. Being the only consumer keeps the
/// per-device event order intact.
pub fn spawn_parser(
    mut acquired_rx: tokio::sync::mpsc::Receiver<DataAcquired>,
    pipeline: PipelineTx,
    tracker: Arc<ChangeTracker>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let acquired = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = acquired_rx.recv() => match received {
                    Some(acq) => acq,
                    None => break,
                },
            };

            let device = acquired.device.clone();
            let parsed = parse_acquired(&acquired);

            let mut changes: Vec<ParamChanged> = Vec::new();
            for sample in &parsed.samples {
                if let Some((param, _)) = device.find_parameter(&sample.code) {
                    if param.on_change {
                        if let Some(event) = tracker.observe(param, sample) {
                            changes.push(event);
                        }
                    }
                }
            }

            // Per-device order: the parsed batch leaves before its change
            // events. Sends stay cancellable so shutdown is not blocked by
            // a stalled downstream.
            tokio::select! {
                _ = shutdown.cancelled() => break,
                sent = pipeline.parsed.send(parsed) => {
                    if sent.is_err() {
                        break;
                    }
                },
            }
            for event in changes {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    sent = pipeline.rule_events.send(event.clone()) => {
                        if sent.is_err() {
                            break;
                        }
                    },
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    sent = pipeline.changes.send(event) => {
                        if sent.is_err() {
                            break;
                        }
                    },
                }
            }
        }
        info!("parser stopped");
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::spec::{
        BitEntry, BitMap, ConnectionSpec, DeviceSpec, EnumMap, PollMode, ReadBlock,
        TransportSpec,
    };
    use crate::core::events::BlockOutcome;
    use crate::utils::bytes::WordOrder;
    use std::time::Duration;

    fn param(code: &str, data_type: DataType, addresses: Vec<u16>) -> ParameterSpec {
        ParameterSpec {
            code: code.to_string(),
            name: None,
            data_type,
            addresses,
            scale: 1.0,
            offset: 0.0,
            precision: 0,
            bit_map: None,
            enum_map: None,
            on_change: false,
            enabled: true,
            unit: None,
        }
    }

    fn acquired(
        register_kind: RegisterKind,
        parameters: Vec<ParameterSpec>,
        blocks: Vec<BlockOutcome>,
    ) -> DataAcquired {
        let read_blocks = blocks
            .iter()
            .map(|b| ReadBlock {
                start: b.start,
                count: b.count,
            })
            .collect();
        DataAcquired {
            connection: Arc::new(ConnectionSpec {
                conn_id: "c1".to_string(),
                enabled: true,
                description: None,
                transport: TransportSpec::Tcp {
                    host: "127.0.0.1".to_string(),
                    port: 502,
                },
                slave_id: 1,
                register_type: register_kind,
                byte_order: WordOrder::Abcd,
                slave_port: None,
                poll_interval: Duration::from_secs(1),
                min_poll_interval: Duration::ZERO,
                timeout: Duration::from_secs(1),
                pause_after_connect: Duration::ZERO,
                close_after_gather: false,
                devices: vec![],
            }),
            device: Arc::new(DeviceSpec {
                device_id: "d1".to_string(),
                description: None,
                poll_mode: PollMode::Periodic,
                read_blocks,
                parameters,
                config_file: None,
            }),
            register_kind,
            blocks,
            ts_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_image_merges_blocks() {
        let acq = acquired(
            RegisterKind::Holding,
            vec![],
            vec![
                BlockOutcome {
                    start: 0,
                    count: 2,
                    words: Some(vec![0xAA, 0xBB]),
                },
                BlockOutcome {
                    start: 10,
                    count: 2,
                    words: Some(vec![0xCC, 0xDD]),
                },
            ],
        );
        let image = RegisterImage::from_acquired(&acq);
        assert_eq!(image.words.get(&1), Some(&0xBB));
        assert_eq!(image.words.get(&11), Some(&0xDD));
        assert_eq!(image.words.get(&5), None);
    }

    #[test]
    fn test_failed_block_skips_only_affected_parameters() {
        let acq = acquired(
            RegisterKind::Holding,
            vec![
                param("ok", DataType::Uint16, vec![0]),
                param("lost", DataType::Uint16, vec![10]),
            ],
            vec![
                BlockOutcome {
                    start: 0,
                    count: 2,
                    words: Some(vec![0x2A, 0x00]),
                },
                BlockOutcome {
                    start: 10,
                    count: 2,
                    words: None,
                },
            ],
        );

        let parsed = parse_acquired(&acq);
        assert_eq!(parsed.samples.len(), 1);
        assert_eq!(parsed.samples[0].code, "ok");
        assert!(matches!(parsed.samples[0].parsed, Value::Integer(0x2A)));
    }

    #[test]
    fn test_bit_map_parsing() {
        let mut p = param("status", DataType::Uint16, vec![0]);
        let mut map = BitMap::new();
        map.insert(
            "0".to_string(),
            BitEntry {
                code: "alarm_low".to_string(),
                name: None,
            },
        );
        map.insert(
            "2".to_string(),
            BitEntry {
                code: "alarm_high".to_string(),
                name: None,
            },
        );
        p.bit_map = Some(map);

        let acq = acquired(
            RegisterKind::Holding,
            vec![p],
            vec![BlockOutcome {
                start: 0,
                count: 1,
                words: Some(vec![0x0005]),
            }],
        );

        let parsed = parse_acquired(&acq);
        let sample = &parsed.samples[0];
        assert!(matches!(sample.raw, Value::Integer(5)));
        match &sample.parsed {
            Value::Bits(bits) => {
                assert_eq!(bits.get("alarm_low"), Some(&true));
                assert_eq!(bits.get("alarm_high"), Some(&true));
            },
            other => panic!("expected bits, got {other:?}"),
        }
    }

    #[test]
    fn test_enum_map_parsing() {
        let mut p = param("mode", DataType::Uint16, vec![0]);
        let mut map = EnumMap::new();
        map.insert("2".to_string(), "运行".to_string());
        p.enum_map = Some(map);

        let acq = acquired(
            RegisterKind::Holding,
            vec![p.clone()],
            vec![BlockOutcome {
                start: 0,
                count: 1,
                words: Some(vec![2]),
            }],
        );
        let parsed = parse_acquired(&acq);
        assert!(matches!(&parsed.samples[0].parsed, Value::Text(t) if t == "运行"));

        // Unmapped raw falls back to the number itself
        let acq = acquired(
            RegisterKind::Holding,
            vec![p],
            vec![BlockOutcome {
                start: 0,
                count: 1,
                words: Some(vec![7]),
            }],
        );
        let parsed = parse_acquired(&acq);
        assert!(matches!(parsed.samples[0].parsed, Value::Integer(7)));
    }

    #[test]
    fn test_float_precision_rounding() {
        let mut p = param("temp", DataType::Float32, vec![0]);
        p.scale = 1.0;
        p.precision = 2;

        // 2.345678 as f32 bits
        let bits = 2.345678f32.to_bits();
        let acq = acquired(
            RegisterKind::Holding,
            vec![p],
            vec![BlockOutcome {
                start: 0,
                count: 2,
                words: Some(vec![(bits >> 16) as u16, bits as u16]),
            }],
        );

        let parsed = parse_acquired(&acq);
        match parsed.samples[0].parsed {
            Value::Float(f) => assert!((f - 2.35).abs() < 1e-9),
            ref other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn test_coil_table_forces_bit_semantics() {
        // data_type says uint16 but the table is coils: one bit per address
        let mut p = param("running", DataType::Uint16, vec![1]);
        let mut map = EnumMap::new();
        map.insert("1".to_string(), "on".to_string());
        p.enum_map = Some(map);

        let acq = acquired(
            RegisterKind::Coil,
            vec![p],
            vec![BlockOutcome {
                start: 0,
                count: 3,
                words: Some(vec![0, 1, 0]),
            }],
        );

        let parsed = parse_acquired(&acq);
        let sample = &parsed.samples[0];
        assert!(matches!(sample.raw, Value::Integer(1)));
        assert!(matches!(&sample.parsed, Value::Text(t) if t == "on"));
    }

    #[test]
    fn test_string_parameter() {
        let mut p = param("model", DataType::Text, vec![0, 1, 2]);
        p.addresses = vec![0, 1, 2];

        let acq = acquired(
            RegisterKind::Holding,
            vec![p],
            vec![BlockOutcome {
                start: 0,
                count: 3,
                // "PUMP" + NUL NUL
                words: Some(vec![0x5055, 0x4D50, 0x0000]),
            }],
        );

        let parsed = parse_acquired(&acq);
        assert!(matches!(&parsed.samples[0].parsed, Value::Text(t) if t == "PUMP"));
    }

    #[test]
    fn test_disabled_parameter_not_parsed() {
        let mut p = param("off", DataType::Uint16, vec![0]);
        p.enabled = false;
        let acq = acquired(
            RegisterKind::Holding,
            vec![p],
            vec![BlockOutcome {
                start: 0,
                count: 1,
                words: Some(vec![1]),
            }],
        );
        assert!(parse_acquired(&acq).samples.is_empty());
    }

    #[test]
    fn test_integer_scaling_in_parse() {
        let mut p = param("level", DataType::Int16, vec![0]);
        p.scale = 0.5;

        let acq = acquired(
            RegisterKind::Holding,
            vec![p],
            vec![BlockOutcome {
                start: 0,
                count: 1,
                words: Some(vec![7]),
            }],
        );
        let parsed = parse_acquired(&acq);
        // 7 * 0.5 truncated toward zero
        assert!(matches!(parsed.samples[0].parsed, Value::Integer(3)));
        assert!(matches!(parsed.samples[0].raw, Value::Integer(7)));
    }
}
