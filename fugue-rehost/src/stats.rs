//! runtime statistics
//! 
//! counters that make degraded replay decisions auditable

use std::collections::BTreeMap;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

/// per-peripheral replay counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStats {
    pub reads: u64,
    pub writes: u64,
    /// writes that took an edge generalized to any value
    pub wildcard: u64,
    /// reads/writes satisfied after a breadth-first search
    pub bfs: u64,
    /// reads/writes satisfied by jumping anywhere in the graph
    pub long_jump: u64,
    /// reads/writes with nowhere to go
    pub failed: u64,
    /// writes absorbed by a storage register without a transition
    pub storage: u64,
}

/// dispatcher counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub total_reads: u64,
    pub total_writes: u64,
    pub missed_reads: u64,
    pub missed_writes: u64,
    pub interrupts_fired: u64,
}

/// snapshot of all counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub device: DeviceStats,
    pub peripherals: BTreeMap<String, ReplayStats>,
}

/// state machine size
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub states: usize,
    pub edges: usize,
    pub self_loops: usize,
    pub wildcard_edges: usize,
}

impl AddAssign for GraphStats {
    fn add_assign(&mut self, other: Self) {
        self.states += other.states;
        self.edges += other.edges;
        self.self_loops += other.self_loops;
        self.wildcard_edges += other.wildcard_edges;
    }
}
