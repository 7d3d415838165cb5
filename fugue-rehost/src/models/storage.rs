//! storage model
//! 
//! a register that returns whatever was last written to it

use serde::{Deserialize, Serialize};

use crate::types::{ReadRecord, Value};

/// plain read/write storage
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageModel {
    value: Value,
}

impl StorageModel {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    /// adopt the most recently observed value
    pub fn train(&mut self, log: &[ReadRecord]) -> bool {
        if let Some(last) = log.last() {
            self.value = last.value;
        }
        true
    }

    pub fn value(&self) -> Value {
        self.value
    }

    pub fn read(&self) -> Value {
        self.value
    }

    pub fn write(&mut self, value: Value) {
        self.value = value;
    }

    pub fn merge(&mut self, _other: &StorageModel) -> bool {
        true
    }
}

/// storage behaves identically regardless of the value it currently holds
impl PartialEq for StorageModel {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}
