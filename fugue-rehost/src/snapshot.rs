//! persisted models
//! 
//! a snapshot is the complete learned device: every peripheral with its
//! states, transitions and wildcards, the registers outside every
//! peripheral, and the interrupt tables. runtime cursors are not part of it; loading always
//! starts every peripheral from its start state.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RehostConfig;
use crate::memory_map::AddressMap;
use crate::models::ReadValueModel;
use crate::state::PeripheralState;
use crate::stats::{DeviceStats, ReplayStats};
use crate::types::{Address, AddressRange, Irq, StateId, Value, WriteLabel};

/// current snapshot format
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot access snapshot `{}`: {}", _0.display(), _1)]
    Io(PathBuf, #[source] std::io::Error),
    #[error("cannot encode snapshot: {0}")]
    Encode(#[source] serde_yaml::Error),
    #[error("cannot decode snapshot: {0}")]
    Decode(#[source] serde_yaml::Error),
    #[error("unsupported snapshot version {0} (expected {})", SNAPSHOT_VERSION)]
    UnsupportedVersion(u32),
}

impl Error {
    pub fn io(path: impl AsRef<Path>, e: std::io::Error) -> Self {
        Self::Io(path.as_ref().to_owned(), e)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeSnapshot {
    pub from: StateId,
    pub to: StateId,
    pub labels: Vec<WriteLabel>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WildcardSnapshot {
    pub from: StateId,
    pub to: StateId,
    pub addresses: Vec<Address>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeripheralSnapshot {
    pub name: String,
    pub range: AddressRange,
    pub next_id: StateId,
    pub start: StateId,
    pub states: Vec<PeripheralState>,
    pub edges: Vec<EdgeSnapshot>,
    #[serde(default)]
    pub wildcards: Vec<WildcardSnapshot>,
    #[serde(default)]
    pub stats: ReplayStats,
}

/// a write that fires an interrupt
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptTrigger {
    pub address: Address,
    pub value: Value,
    pub irq: Irq,
}

/// a register outside every peripheral
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageSnapshot {
    pub address: Address,
    pub model: ReadValueModel,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    #[serde(default)]
    pub config: RehostConfig,
    /// the map the device was trained against
    #[serde(default)]
    pub map: AddressMap,
    pub peripherals: Vec<PeripheralSnapshot>,
    #[serde(default)]
    pub storage: Vec<StorageSnapshot>,
    #[serde(default)]
    pub interrupt_map: Vec<InterruptTrigger>,
    /// irq to owning peripheral name
    #[serde(default)]
    pub model_per_interrupt: Vec<(Irq, String)>,
    #[serde(default)]
    pub stats: DeviceStats,
}

impl Snapshot {
    pub fn to_writer<W: Write>(&self, writer: W) -> Result<(), Error> {
        serde_yaml::to_writer(writer, self).map_err(Error::Encode)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, Error> {
        let snapshot: Snapshot = serde_yaml::from_reader(reader).map_err(Error::Decode)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::UnsupportedVersion(snapshot.version))
        }
        Ok(snapshot)
    }

    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut writer = BufWriter::new(file);
        self.to_writer(&mut writer)?;
        writer.flush().map_err(|e| Error::io(path, e))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        Self::from_reader(BufReader::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_check() {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION + 1,
            config: RehostConfig::default(),
            map: AddressMap::default(),
            peripherals: Vec::new(),
            storage: Vec::new(),
            interrupt_map: vec![InterruptTrigger { address: 0x400E0800, value: 0x1, irq: 8 }],
            model_per_interrupt: vec![(8, "UART".to_owned())],
            stats: DeviceStats::default(),
        };

        let mut buf = Vec::new();
        snapshot.to_writer(&mut buf).expect("failed to encode");
        assert!(matches!(
            Snapshot::from_reader(buf.as_slice()),
            Err(Error::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("missing.yaml");
        assert!(matches!(Snapshot::from_path(&path), Err(Error::Io(_, _))));
    }

    #[test]
    fn test_garbage() {
        assert!(matches!(
            Snapshot::from_reader("peripherals: 7".as_bytes()),
            Err(Error::Decode(_))
        ));
    }
}
