//! Slave register image
//!
//! Four sparse tables per slave instance. Acquisition writes blocks in one
//! shot under the instance's write lock, so an external client reading the
//! same range sees either the whole previous block or the whole new one.

use std::collections::BTreeMap;

use crate::config::spec::RegisterKind;

/// Sparse register/coil tables of one virtual slave
#[derive(Debug, Default)]
pub struct SlaveImage {
    holding: BTreeMap<u16, u16>,
    input: BTreeMap<u16, u16>,
    coils: BTreeMap<u16, bool>,
    discrete: BTreeMap<u16, bool>,
}

impl SlaveImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one acquired block verbatim. Word tables take the values as
    /// registers; bit tables map non-zero words to ON.
    pub fn apply_block(&mut self, kind: RegisterKind, start: u16, words: &[u16]) {
        match kind {
            RegisterKind::Holding => {
                for (offset, &word) in words.iter().enumerate() {
                    self.holding.insert(start.wrapping_add(offset as u16), word);
                }
            },
            RegisterKind::Input => {
                for (offset, &word) in words.iter().enumerate() {
                    self.input.insert(start.wrapping_add(offset as u16), word);
                }
            },
            RegisterKind::Coil => {
                for (offset, &word) in words.iter().enumerate() {
                    self.coils
                        .insert(start.wrapping_add(offset as u16), word != 0);
                }
            },
            RegisterKind::DiscreteInput => {
                for (offset, &word) in words.iter().enumerate() {
                    self.discrete
                        .insert(start.wrapping_add(offset as u16), word != 0);
                }
            },
        }
    }

    /// Read a word range; unset addresses read as 0
    pub fn read_words(&self, kind: RegisterKind, start: u16, count: u16) -> Vec<u16> {
        let table = match kind {
            RegisterKind::Holding => &self.holding,
            RegisterKind::Input => &self.input,
            _ => return vec![0; count as usize],
        };
        (0..count)
            .map(|offset| {
                table
                    .get(&start.wrapping_add(offset))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    /// Read a bit range; unset addresses read as OFF
    pub fn read_bits(&self, kind: RegisterKind, start: u16, count: u16) -> Vec<bool> {
        let table = match kind {
            RegisterKind::Coil => &self.coils,
            RegisterKind::DiscreteInput => &self.discrete,
            _ => return vec![false; count as usize],
        };
        (0..count)
            .map(|offset| {
                table
                    .get(&start.wrapping_add(offset))
                    .copied()
                    .unwrap_or(false)
            })
            .collect()
    }

    /// External client write into the holding table
    pub fn write_holding(&mut self, address: u16, value: u16) {
        self.holding.insert(address, value);
    }

    /// External client write into the coil table
    pub fn write_coil(&mut self, address: u16, value: bool) {
        self.coils.insert(address, value);
    }
}
