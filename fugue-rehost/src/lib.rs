//! learned peripheral models for firmware re-hosting
//!
//! a device is learned from a recorded trace of memory-mapped accesses and
//! replayed in place of the real hardware: every peripheral becomes a state
//! machine whose states hold one read-value model per register.

pub mod config;
pub mod device;
pub mod interrupt;
pub mod memory_map;
pub mod models;
pub mod peripheral;
pub mod snapshot;
pub mod state;
pub mod stats;
pub mod trace;
pub mod types;

pub use config::RehostConfig;
pub use device::DeviceModel;
pub use interrupt::{InterruptHost, InterruptQueue, Interrupter};
pub use memory_map::{AddressMap, PeripheralRegion};
pub use models::{ModelKind, ReadValueModel};
pub use peripheral::PeripheralModel;
pub use snapshot::Snapshot;
pub use state::PeripheralState;
pub use stats::{DeviceStats, GraphStats, ReplayStats, RuntimeStats};
pub use trace::{Trace, TraceEvent, TraceReader};
pub use types::{Address, AddressRange, Irq, ReadRecord, StateId, Value, WriteLabel};
