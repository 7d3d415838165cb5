//! increasing model
//! 
//! an arithmetic progression, e.g. a free-running counter register

use serde::{Deserialize, Serialize};

use crate::types::{ReadRecord, Value};

/// counter with a fixed (wrapping) step between consecutive reads
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IncreasingModel {
    start: Value,
    step: Value,
    #[serde(skip)]
    cursor: u64,
}

impl IncreasingModel {
    pub fn new(start: Value) -> Self {
        Self { start, step: 0, cursor: 0 }
    }

    /// succeeds if every consecutive pair of reads differs by the same
    /// non-zero step
    pub fn train(&mut self, log: &[ReadRecord]) -> bool {
        if log.len() < 2 {
            return false
        }
        let step = log[1].value.wrapping_sub(log[0].value);
        if step == 0 {
            return false
        }
        if !log.windows(2).all(|w| w[1].value.wrapping_sub(w[0].value) == step) {
            return false
        }
        self.start = log[0].value;
        self.step = step;
        true
    }

    pub fn step(&self) -> Value {
        self.step
    }

    pub fn read(&mut self) -> Value {
        let value = self.start.wrapping_add(self.step.wrapping_mul(self.cursor));
        self.cursor = self.cursor.wrapping_add(1);
        value
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn merge(&mut self, _other: &IncreasingModel) -> bool {
        true
    }
}

/// counters are equal when they advance by the same step, wherever they start
impl PartialEq for IncreasingModel {
    fn eq(&self, other: &Self) -> bool {
        self.step == other.step
    }
}
