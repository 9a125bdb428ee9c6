//! Last-value memory and change detection
//!
//! Keyed by `(conn_id, device_id, code)`. Entries are created on first
//! sample and never expire during a run; memory is bounded by the set of
//! configured parameters.

use dashmap::DashMap;

use crate::config::spec::ParameterSpec;

use super::events::{ParamChanged, ParameterSample, Value};

#[derive(Debug, Clone)]
struct LastValue {
    compare: Value,
    ts_ms: i64,
}

/// Per-parameter last-value store
#[derive(Default)]
pub struct ChangeTracker {
    last: DashMap<(String, String, String), LastValue>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sample. Returns a change event when the compare-value
    /// differs from the previous observation; the first observation only
    /// records.
    ///
    /// Bit-mapped parameters compare on `raw` so a single flipped bit is
    /// one change event, everything else compares on `parsed`.
    pub fn observe(
        &self,
        param: &ParameterSpec,
        sample: &ParameterSample,
    ) -> Option<ParamChanged> {
        let compare = if param.bit_map.is_some() {
            sample.raw.clone()
        } else {
            sample.parsed.clone()
        };

        let key = (
            sample.conn_id.clone(),
            sample.device_id.clone(),
            sample.code.clone(),
        );

        let mut entry = match self.last.entry(key) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(LastValue {
                    compare,
                    ts_ms: sample.ts_ms,
                });
                return None;
            },
            dashmap::mapref::entry::Entry::Occupied(occupied) => occupied,
        };

        let previous = entry.get().clone();
        if previous.compare.approx_eq(&compare, param.precision) {
            return None;
        }

        entry.insert(LastValue {
            compare: compare.clone(),
            ts_ms: sample.ts_ms,
        });

        Some(ParamChanged {
            conn_id: sample.conn_id.clone(),
            device_id: sample.device_id.clone(),
            code: sample.code.clone(),
            old: previous.compare,
            new: compare,
            ts_ms: sample.ts_ms,
            sample: sample.clone(),
        })
    }

    /// Number of tracked parameters
    pub fn len(&self) -> usize {
        self.last.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_empty()
    }
}
