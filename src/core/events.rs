//! Typed values and pipeline events
//!
//! The acquisition chain communicates through three bounded channel stages:
//! `DataAcquired` (poller -> parser), `DataParsed` (parser -> sink writer)
//! and `ParamChanged` (parser -> broker publisher and rule engine). Ordering
//! within one device follows from the parser being a single consumer;
//! nothing orders events across devices.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::spec::{ConnectionSpec, DeviceSpec, RegisterKind};

/// A parameter value, raw or parsed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    /// Decoded bit map: bit code -> state
    Bits(BTreeMap<String, bool>),
}

impl Value {
    /// Numeric view used by the time-series path; text has none
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(_) | Value::Bits(_) => None,
        }
    }

    /// Structural equality with a float tolerance of `10^-precision`.
    /// Used for change detection; everything else compares exactly.
    pub fn approx_eq(&self, other: &Value, precision: u32) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => {
                let epsilon = 10f64.powi(-(precision as i32));
                (a - b).abs() < epsilon
            },
            (Value::Float(a), Value::Integer(b)) | (Value::Integer(b), Value::Float(a)) => {
                let epsilon = 10f64.powi(-(precision as i32));
                (a - *b as f64).abs() < epsilon
            },
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bits(a), Value::Bits(b)) => a == b,
            _ => false,
        }
    }
}

/// One block of register words as read from the wire. For bit tables each
/// word is 0 or 1.
#[derive(Debug, Clone)]
pub struct BlockReading {
    pub start: u16,
    pub words: Vec<u16>,
}

/// Successful acquisition of one device's blocks for one tick
#[derive(Debug, Clone)]
pub struct DataAcquired {
    pub connection: Arc<ConnectionSpec>,
    pub device: Arc<DeviceSpec>,
    pub register_kind: RegisterKind,
    /// Per-block outcome; a failed block skips only the parameters that
    /// need it
    pub blocks: Vec<BlockOutcome>,
    pub ts_ms: i64,
}

/// Outcome of reading one configured block
#[derive(Debug, Clone)]
pub struct BlockOutcome {
    pub start: u16,
    pub count: u16,
    pub words: Option<Vec<u16>>,
}

/// One typed sample emitted by the parser
#[derive(Debug, Clone, Serialize)]
pub struct ParameterSample {
    pub conn_id: String,
    pub device_id: String,
    pub code: String,
    pub raw: Value,
    pub parsed: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub ts_ms: i64,
    /// Descriptive context carried through to the broker payloads
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Parsed batch of one tick for one device
#[derive(Debug, Clone, Serialize)]
pub struct DataParsed {
    pub conn_id: String,
    pub device_id: String,
    pub samples: Vec<ParameterSample>,
    pub ts_ms: i64,
}

/// Change event for an on-change parameter
#[derive(Debug, Clone, Serialize)]
pub struct ParamChanged {
    pub conn_id: String,
    pub device_id: String,
    pub code: String,
    pub old: Value,
    pub new: Value,
    pub ts_ms: i64,
    pub sample: ParameterSample,
}

impl ParamChanged {
    /// Debounce fingerprint
    pub fn fingerprint(&self) -> (String, String, String) {
        (
            self.conn_id.clone(),
            self.device_id.clone(),
            self.code.clone(),
        )
    }
}

/// Sending side of the pipeline, cloned into pollers and the parser
#[derive(Clone)]
pub struct PipelineTx {
    pub acquired: mpsc::Sender<DataAcquired>,
    pub parsed: mpsc::Sender<DataParsed>,
    pub changes: mpsc::Sender<ParamChanged>,
    pub rule_events: mpsc::Sender<ParamChanged>,
}

/// Receiving side, consumed once by the stage tasks
pub struct PipelineRx {
    pub acquired: mpsc::Receiver<DataAcquired>,
    pub parsed: mpsc::Receiver<DataParsed>,
    pub changes: mpsc::Receiver<ParamChanged>,
    pub rule_events: mpsc::Receiver<ParamChanged>,
}

/// Build the bounded pipeline channels. `parser_queue` caps the
/// acquisition stage; submission blocks when the parser falls behind, which
/// is the backpressure that throttles polling.
pub fn pipeline(parser_queue: usize, event_queue: usize) -> (PipelineTx, PipelineRx) {
    let (acquired_tx, acquired_rx) = mpsc::channel(parser_queue.max(1));
    let (parsed_tx, parsed_rx) = mpsc::channel(event_queue.max(1));
    let (changes_tx, changes_rx) = mpsc::channel(event_queue.max(1));
    let (rule_tx, rule_rx) = mpsc::channel(event_queue.max(1));

    (
        PipelineTx {
            acquired: acquired_tx,
            parsed: parsed_tx,
            changes: changes_tx,
            rule_events: rule_tx,
        },
        PipelineRx {
            acquired: acquired_rx,
            parsed: parsed_rx,
            changes: changes_rx,
            rule_events: rule_rx,
        },
    )
}
