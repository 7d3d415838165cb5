//! rehost types
//! 
//! various types used across the rehosting modules

use std::fmt;

use serde::{Deserialize, Serialize};

/// a memory-mapped address
pub type Address = u64;

/// a value read from or written to a memory-mapped register
pub type Value = u64;

/// an interrupt request number as seen by the host interrupt controller
pub type Irq = u32;

/// identifier of a state within a single peripheral state machine
/// 
/// ids are allocated per machine, never process-wide
pub type StateId = u32;

/// an `(address, value)` write that labels a state transition
pub type WriteLabel = (Address, Value);

/// a single observed read, as recorded in a trace
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadRecord {
    pub value: Value,
    pub pc: Address,
    pub size: usize,
    pub timestamp: f64,
}

impl ReadRecord {
    pub fn new(value: Value, pc: Address, size: usize, timestamp: f64) -> Self {
        Self { value, pc, size, timestamp }
    }
}

/// a half-open address range `[start, end)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: Address,
    pub end: Address,
}

impl AddressRange {
    pub fn new(start: Address, end: Address) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn contains(&self, address: Address) -> bool {
        self.start <= address && address < self.end
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl From<std::ops::Range<Address>> for AddressRange {
    fn from(range: std::ops::Range<Address>) -> Self {
        Self::new(range.start, range.end)
    }
}

impl From<AddressRange> for std::ops::Range<Address> {
    fn from(range: AddressRange) -> Self {
        range.start..range.end
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{:#010x}, {:#010x})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_bounds() {
        let range = AddressRange::new(0x400E0800, 0x400E0940);
        assert!(range.contains(0x400E0800));
        assert!(range.contains(0x400E093F));
        assert!(!range.contains(0x400E0940));
        assert!(!range.contains(0x400E07FF));
        assert_eq!(range.len(), 0x140);

        let other = AddressRange::new(0x400E0900, 0x400E0A00);
        assert!(range.overlaps(&other));
        let disjoint = AddressRange::new(0x400E0940, 0x400E0A00);
        assert!(!range.overlaps(&disjoint));
    }
}
