//! device module
//! 
//! the learned device as seen by an emulator: owns one state machine per
//! peripheral observed in a trace, routes every access and interrupt to its
//! owner, and persists the whole model.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use iset::IntervalMap;
use nohash_hasher::IntMap;

use crate::config::RehostConfig;
use crate::interrupt::{InterruptHost, InterruptQueue, Interrupter};
use crate::memory_map::AddressMap;
use crate::models::{self, FitOptions, ReadValueModel, StorageModel};
use crate::peripheral::PeripheralModel;
use crate::snapshot::{InterruptTrigger, Snapshot, StorageSnapshot, SNAPSHOT_VERSION};
use crate::stats::{DeviceStats, GraphStats, RuntimeStats};
use crate::trace::{Trace, TraceEvent};
use crate::types::{Address, Irq, ReadRecord, Value};

pub mod error;
pub use error::*;

/// what answers accesses to one address
enum AddressModel<'a> {
    Peripheral(&'a mut PeripheralModel),
    Register(&'a mut ReadValueModel),
}

/// accesses to one register outside every peripheral, buffered while training
#[derive(Default)]
struct UnmappedLog {
    reads: Vec<ReadRecord>,
    last_write: Option<Value>,
    // some read did not return the value last written
    diverged: bool,
}

impl UnmappedLog {
    fn write(&mut self, value: Value) {
        self.last_write = Some(value);
    }

    fn read(&mut self, record: ReadRecord) {
        if self.last_write != Some(record.value) {
            self.diverged = true;
        }
        self.reads.push(record);
    }

    /// plain storage when every read echoes the last write, otherwise the
    /// first read-value model that fits the reads
    fn fit(self, address: Address, options: &FitOptions) -> ReadValueModel {
        let storage = StorageModel::new(self.last_write.unwrap_or_default());
        if !self.diverged {
            return ReadValueModel::Storage(storage)
        }
        models::fit(None, address, &self.reads, options)
            .unwrap_or(ReadValueModel::Storage(storage))
    }
}

/// learned device
pub struct DeviceModel {
    config: RehostConfig,
    map: AddressMap,
    peripherals: Vec<PeripheralModel>,
    // address range to index into `peripherals`
    regions: IntervalMap<Address, usize>,
    storage: IntMap<Address, ReadValueModel>,
    model_per_interrupt: BTreeMap<Irq, usize>,
    interrupt_map: BTreeMap<(Address, Value), Irq>,
    stats: DeviceStats,
    host: Option<Arc<dyn InterruptHost>>,
    mailbox: InterruptQueue,
    interrupters: Vec<Interrupter>,
    trained: bool,
}

impl DeviceModel {
    pub fn new(map: AddressMap, config: RehostConfig) -> Self {
        Self {
            config,
            map,
            peripherals: Vec::new(),
            regions: IntervalMap::new(),
            storage: IntMap::default(),
            model_per_interrupt: BTreeMap::new(),
            interrupt_map: BTreeMap::new(),
            stats: DeviceStats::default(),
            host: None,
            mailbox: InterruptQueue::new(),
            interrupters: Vec::new(),
            trained: false,
        }
    }

    /// writes of `value` to `address` fire `irq` at the host
    /// 
    /// such interrupts are not learned from traces
    pub fn with_interrupt_map(mut self, interrupt_map: impl IntoIterator<Item = ((Address, Value), Irq)>) -> Self {
        self.interrupt_map.extend(interrupt_map);
        self
    }

    /// deliver fired interrupts to `host` instead of the internal mailbox
    pub fn attach_host(&mut self, host: Arc<dyn InterruptHost>) {
        self.host = Some(host);
    }

    pub fn config(&self) -> &RehostConfig {
        &self.config
    }

    pub fn address_map(&self) -> &AddressMap {
        &self.map
    }

    pub fn peripherals(&self) -> &[PeripheralModel] {
        &self.peripherals
    }

    pub fn peripheral(&self, name: &str) -> Option<&PeripheralModel> {
        self.peripherals.iter().find(|p| p.name() == name)
    }

    pub fn interrupt_map(&self) -> &BTreeMap<(Address, Value), Irq> {
        &self.interrupt_map
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    fn peripheral_index(&self, address: Address) -> Option<usize> {
        self.regions.values_overlap(address).next().copied()
    }

    fn is_modelled(&self, address: Address) -> bool {
        self.peripheral_index(address).is_some() || self.storage.contains_key(&address)
    }

    fn model_for(&mut self, address: Address) -> Option<AddressModel<'_>> {
        if let Some(index) = self.peripheral_index(address) {
            return self.peripherals.get_mut(index).map(AddressModel::Peripheral)
        }
        self.storage.get_mut(&address).map(AddressModel::Register)
    }

    fn add_peripheral(&mut self, peripheral: PeripheralModel) -> Result<usize, Error> {
        let range = peripheral.range();
        let query = range.start..range.end;
        if self.regions.has_overlap(query.clone()) {
            let existing = self.regions
                .iter(query)
                .next()
                .and_then(|(_, index)| self.peripherals.get(*index))
                .map(|p| p.name().to_owned())
                .unwrap_or_default();
            return Err(Error::Overlap(peripheral.name().to_owned(), existing))
        }
        let index = self.peripherals.len();
        self.regions.insert(range.start..range.end, index);
        self.peripherals.push(peripheral);
        Ok(index)
    }

    /// learn the device from a trace
    /// 
    /// one peripheral is created for every region of the address map that
    /// the trace touches, covering the whole region. a register outside every
    /// region is plain storage while its reads echo its writes, and gets a
    /// read-value model of its own otherwise.
    pub fn train(&mut self, trace: &Trace) -> Result<(), Error> {
        if self.trained {
            return Err(Error::AlreadyTrained)
        }

        let accessed = trace.accessed_addresses();
        if accessed.is_empty() {
            log::error!("no memory accesses were recorded");
            return Err(Error::EmptyTrace)
        }

        let mut touched = BTreeSet::new();
        for address in accessed.iter() {
            match self.map.lookup(*address) {
                Some(region) => {
                    touched.insert(region.name.clone());
                }
                None => log::warn!("{:#010x} is outside every known peripheral", address),
            }
        }

        let regions = self.map
            .regions()
            .iter()
            .filter(|region| touched.contains(&region.name))
            .cloned()
            .collect::<Vec<_>>();
        for region in regions {
            log::info!("packing peripheral {} {}", region.name, region.range());
            let index = self.add_peripheral(PeripheralModel::new(region.name.clone(), region.range()))?;
            for irq in region.irqs.iter() {
                self.model_per_interrupt.entry(*irq).or_insert(index);
            }
        }

        let mapped = self.interrupt_map.values().copied().collect::<BTreeSet<_>>();
        let mut unmapped = BTreeMap::<Address, UnmappedLog>::new();
        let mut last_write = None;

        for event in trace.events() {
            match *event {
                TraceEvent::Write { address, value, .. } => {
                    match self.peripheral_index(address) {
                        Some(index) => self.peripherals[index].train_write(address, value),
                        None => unmapped.entry(address).or_default().write(value),
                    }
                    last_write = Some(address);
                }
                TraceEvent::Read { address, record } => {
                    match self.peripheral_index(address) {
                        Some(index) => self.peripherals[index].train_read(address, record),
                        None => unmapped.entry(address).or_default().read(record),
                    }
                }
                TraceEvent::Interrupt { irq, .. } => {
                    if mapped.contains(&irq) {
                        log::debug!("interrupt {} fires on a known write, not learning it", irq);
                        continue
                    }
                    if let Some(index) = self.model_per_interrupt.get(&irq).copied() {
                        self.peripherals[index].train_interrupt(irq);
                        continue
                    }
                    // approximation: blame whatever was written last
                    match last_write.and_then(|address| self.peripheral_index(address)) {
                        Some(index) => {
                            log::warn!(
                                "interrupt {} has no peripheral, attributing it to {}",
                                irq, self.peripherals[index].name(),
                            );
                            self.peripherals[index].train_interrupt(irq);
                        }
                        None => log::warn!("interrupt {} has no peripheral and no preceding write, dropping it", irq),
                    }
                }
            }
        }

        let options = self.config.fit_options();
        for peripheral in self.peripherals.iter_mut() {
            peripheral.train(&options);
        }
        for (address, accesses) in unmapped.into_iter() {
            let model = accesses.fit(address, &options);
            log::debug!("unmapped register {:#010x} is {}", address, model);
            self.storage.insert(address, model);
        }

        self.trained = true;
        log::info!(
            "trained {} peripherals and {} unmapped registers",
            self.peripherals.len(), self.storage.len(),
        );
        Ok(())
    }

    pub fn train_from_path(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        let trace = Trace::from_path(path)?;
        self.train(&trace)
    }

    /// collapse every peripheral's state machine
    pub fn optimize(&mut self) {
        let threshold = self.config.wildcard_threshold;
        for peripheral in self.peripherals.iter_mut() {
            peripheral.optimize(threshold);
        }
    }

    /// answer a read from the emulated program
    /// 
    /// an address nothing models becomes plain storage
    pub fn read_memory(&mut self, address: Address, size: usize) -> Value {
        self.stats.total_reads += 1;

        if !self.is_modelled(address) {
            log::debug!("no model for {:#010x}, using storage", address);
            self.stats.missed_reads += 1;
            self.storage.insert(address, ReadValueModel::Storage(StorageModel::default()));
        }

        match self.model_for(address) {
            Some(AddressModel::Peripheral(peripheral)) => peripheral.read(address, size),
            Some(AddressModel::Register(model)) => model.read(),
            None => 0,
        }
    }

    /// apply a write from the emulated program
    pub fn write_memory(&mut self, address: Address, size: usize, value: Value) -> bool {
        self.stats.total_writes += 1;

        let accepted = if !self.is_modelled(address) {
            log::debug!("no model for {:#010x}, using storage", address);
            self.stats.missed_writes += 1;
            self.storage.insert(address, ReadValueModel::Storage(StorageModel::new(value)));
            true
        } else {
            match self.model_for(address) {
                Some(AddressModel::Peripheral(peripheral)) => peripheral.write(address, size, value),
                Some(AddressModel::Register(model)) => {
                    model.write(value);
                    true
                }
                None => true,
            }
        };

        if let Some(irq) = self.interrupt_map.get(&(address, value)).copied() {
            self.stats.interrupts_fired += 1;
            self.fire(irq);
        }

        accepted
    }

    /// inject `irq` once, asynchronously
    fn fire(&mut self, irq: Irq) {
        self.interrupters.retain(|interrupter| !interrupter.is_finished());

        let host: Arc<dyn InterruptHost> = match self.host.clone() {
            Some(host) => host,
            None => Arc::new(self.mailbox.clone()),
        };
        log::info!("injecting interrupt {}", irq);
        match Interrupter::spawn(irq, host, Some(1), self.config.interrupt_interval()) {
            Ok(interrupter) => self.interrupters.push(interrupter),
            Err(e) => log::error!("{}", e),
        }
    }

    /// wait for every pending injection to finish
    pub fn join_interrupters(&mut self) {
        for interrupter in self.interrupters.drain(..) {
            interrupter.join();
        }
    }

    /// drain interrupts queued by every peripheral and fired into the
    /// mailbox
    pub fn get_interrupts(&mut self) -> BTreeMap<Irq, u32> {
        let mut interrupts = self.mailbox.drain();
        for peripheral in self.peripherals.iter() {
            for (irq, count) in peripheral.get_interrupts() {
                *interrupts.entry(irq).or_default() += count;
            }
        }
        interrupts
    }

    /// drain interrupts queued by the peripheral owning `address`
    pub fn peripheral_interrupts(&self, address: Address) -> BTreeMap<Irq, u32> {
        self.peripheral_index(address)
            .and_then(|index| self.peripherals.get(index))
            .map(|peripheral| peripheral.get_interrupts())
            .unwrap_or_default()
    }

    pub fn get_runtime_stats(&self) -> RuntimeStats {
        RuntimeStats {
            device: self.stats,
            peripherals: self.peripherals
                .iter()
                .map(|p| (p.name().to_owned(), p.stats()))
                .collect(),
        }
    }

    pub fn graph_stats(&self) -> GraphStats {
        let mut stats = GraphStats::default();
        for peripheral in self.peripherals.iter() {
            stats += peripheral.graph_stats();
        }
        stats
    }

    /// name the model that answers accesses to `address`
    pub fn get_model(&self, address: Address) -> Option<String> {
        if let Some(index) = self.peripheral_index(address) {
            return self.peripherals.get(index).map(|p| p.name().to_owned())
        }
        self.storage.get(&address).map(|model| match model {
            ReadValueModel::Storage(storage) => format!("storage {:#x}", storage.value()),
            model => model.to_string(),
        })
    }

    /// rewind every peripheral to its start state
    pub fn reset(&mut self) {
        for peripheral in self.peripherals.iter_mut() {
            peripheral.reset();
        }
        for model in self.storage.values_mut() {
            model.reset();
        }
        self.mailbox.clear();
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut storage = self.storage
            .iter()
            .map(|(address, model)| StorageSnapshot { address: *address, model: model.clone() })
            .collect::<Vec<_>>();
        storage.sort_by_key(|s| s.address);

        Snapshot {
            version: SNAPSHOT_VERSION,
            config: self.config.clone(),
            map: self.map.clone(),
            peripherals: self.peripherals.iter().map(PeripheralModel::snapshot).collect(),
            storage,
            interrupt_map: self.interrupt_map
                .iter()
                .map(|((address, value), irq)| InterruptTrigger {
                    address: *address,
                    value: *value,
                    irq: *irq,
                })
                .collect(),
            model_per_interrupt: self.model_per_interrupt
                .iter()
                .filter_map(|(irq, index)| {
                    self.peripherals.get(*index).map(|p| (*irq, p.name().to_owned()))
                })
                .collect(),
            stats: self.stats,
        }
    }

    /// rebuild a device from a snapshot, rewound and ready to replay
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self, Error> {
        let Snapshot { config, map, peripherals, storage, interrupt_map, model_per_interrupt, stats, .. } = snapshot;

        let mut device = Self::new(map, config);
        for peripheral in peripherals.into_iter() {
            device.add_peripheral(PeripheralModel::from_snapshot(peripheral)?)?;
        }
        device.storage = storage
            .into_iter()
            .map(|s| (s.address, s.model))
            .collect();
        device.interrupt_map = interrupt_map
            .into_iter()
            .map(|t| ((t.address, t.value), t.irq))
            .collect();
        for (irq, name) in model_per_interrupt.into_iter() {
            let Some(index) = device.peripherals.iter().position(|p| p.name() == name) else {
                return Err(Error::UnknownPeripheral(irq, name))
            };
            device.model_per_interrupt.insert(irq, index);
        }
        device.stats = stats;
        device.trained = true;
        device.reset();
        Ok(device)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        log::info!("saving model to {}", path.display());
        self.snapshot().to_path(path)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        log::info!("loading model from {}", path.display());
        Self::from_snapshot(Snapshot::from_path(path)?)
    }

    /// fold a device trained on another recording into this one
    /// 
    /// peripherals are matched by name; ones only `other` observed are
    /// adopted. returns the names of peripherals whose recordings disagreed
    /// and were left unchanged.
    pub fn merge(&mut self, mut other: DeviceModel) -> Vec<String> {
        let threshold = self.config.wildcard_threshold;
        other.shutdown();
        let peripherals = std::mem::take(&mut other.peripherals);
        let storage = std::mem::take(&mut other.storage);
        let model_per_interrupt = std::mem::take(&mut other.model_per_interrupt);
        let interrupt_map = std::mem::take(&mut other.interrupt_map);
        let stats = other.stats;

        let irqs_by_name = model_per_interrupt
            .iter()
            .filter_map(|(irq, index)| peripherals.get(*index).map(|p| (p.name().to_owned(), *irq)))
            .fold(BTreeMap::<String, Vec<Irq>>::new(), |mut irqs, (name, irq)| {
                irqs.entry(name).or_default().push(irq);
                irqs
            });

        let mut rejected = Vec::new();
        for peripheral in peripherals.into_iter() {
            let name = peripheral.name().to_owned();
            let index = match self.peripherals.iter().position(|p| p.name() == name) {
                Some(index) => {
                    if !self.peripherals[index].merge(peripheral, threshold) {
                        rejected.push(name);
                        continue
                    }
                    index
                }
                None => match self.add_peripheral(peripheral) {
                    Ok(index) => index,
                    Err(e) => {
                        log::error!("cannot adopt peripheral: {}", e);
                        rejected.push(name);
                        continue
                    }
                },
            };
            for irq in irqs_by_name.get(&name).into_iter().flatten() {
                self.model_per_interrupt.entry(*irq).or_insert(index);
            }
        }

        for (address, model) in storage.into_iter() {
            if self.peripheral_index(address).is_none() {
                self.storage.entry(address).or_insert(model);
            }
        }
        for (trigger, irq) in interrupt_map.into_iter() {
            self.interrupt_map.entry(trigger).or_insert(irq);
        }

        self.stats.total_reads += stats.total_reads;
        self.stats.total_writes += stats.total_writes;
        self.stats.missed_reads += stats.missed_reads;
        self.stats.missed_writes += stats.missed_writes;
        self.stats.interrupts_fired += stats.interrupts_fired;

        self.trained |= !self.peripherals.is_empty();
        rejected
    }

    /// stop and wait for every pending injection
    pub fn shutdown(&mut self) {
        for interrupter in self.interrupters.iter_mut() {
            interrupter.shutdown();
        }
        self.join_interrupters();
    }
}

impl Drop for DeviceModel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_map::PeripheralRegion;

    const CR: Address = 0x400E0800;
    const SR: Address = 0x400E0814;
    const THR: Address = 0x400E081C;

    fn uart_trace() -> Trace {
        Trace::new()
            .read(SR, 0x0)
            .write(CR, 0x50)
            .read(SR, 0x2)
            .write(THR, 0x41)
            .interrupt(8)
            .read(SR, 0x0)
            .read(SR, 0x2)
            .read(SR, 0x0)
            .read(SR, 0x2)
    }

    fn device() -> DeviceModel {
        let mut device = DeviceModel::new(AddressMap::arduino_due(), RehostConfig::default());
        device.train(&uart_trace()).expect("failed to train");
        device
    }

    #[test]
    fn test_train() {
        let device = device();
        assert!(device.is_trained());
        assert_eq!(device.peripherals().len(), 1);

        let uart = device.peripheral("UART").expect("missing UART");
        assert_eq!(uart.range().start, 0x400E0800);
        assert_eq!(uart.range().end, 0x400E0940);
        assert_eq!(uart.state_count(), 3);
        assert_eq!(device.get_model(0x400E0900).as_deref(), Some("UART"));
        assert!(device.get_model(0x400E0940).is_none());
    }

    #[test]
    fn test_train_errors() {
        let mut device = DeviceModel::new(AddressMap::arduino_due(), RehostConfig::default());
        assert!(matches!(device.train(&Trace::new().interrupt(8)), Err(Error::EmptyTrace)));
        assert!(device.peripherals().is_empty());

        let mut device = self::device();
        assert!(matches!(device.train(&uart_trace()), Err(Error::AlreadyTrained)));
    }

    #[test]
    fn test_unknown_interrupt_follows_last_write() {
        let map = AddressMap::new([
            PeripheralRegion::new("UART", 0x400E0800, 0x400E0940),
            PeripheralRegion::new("PMC", 0x400E0600, 0x400E0800),
        ])
        .expect("bad map");
        let mut device = DeviceModel::new(map, RehostConfig::default());
        let trace = Trace::new()
            .write(0x400E0600, 0x1)
            .write(CR, 0x50)
            .interrupt(99)
            .read(SR, 0x2);
        device.train(&trace).expect("failed to train");

        let uart = device.peripheral("UART").expect("missing UART");
        assert_eq!(uart.state(2).map(|s| s.interrupts().get(&99).copied()), Some(Some(1)));
        let pmc = device.peripheral("PMC").expect("missing PMC");
        assert!(pmc.states().iter().all(|s| s.interrupts().is_empty()));
    }

    #[test]
    fn test_mapped_interrupt_is_not_learned() {
        let mut device = DeviceModel::new(AddressMap::arduino_due(), RehostConfig::default())
            .with_interrupt_map([((THR, 0x41), 8)]);
        device.train(&uart_trace()).expect("failed to train");

        let uart = device.peripheral("UART").expect("missing UART");
        assert!(uart.states().iter().all(|s| s.interrupts().is_empty()));

        device.write_memory(CR, 4, 0x50);
        device.write_memory(THR, 4, 0x41);
        device.join_interrupters();
        assert_eq!(device.get_interrupts().get(&8), Some(&1));
        assert_eq!(device.get_runtime_stats().device.interrupts_fired, 1);
    }

    #[test]
    fn test_replay_and_interrupts() {
        let mut device = device();
        assert_eq!(device.read_memory(SR, 4), 0x0);
        assert!(device.write_memory(CR, 4, 0x50));
        assert_eq!(device.read_memory(SR, 4), 0x2);
        assert!(device.write_memory(THR, 4, 0x41));
        assert_eq!(device.peripheral_interrupts(SR).get(&8), Some(&1));
        assert!(device.get_interrupts().is_empty());
        for value in [0x0, 0x2, 0x0, 0x2] {
            assert_eq!(device.read_memory(SR, 4), value);
        }

        let stats = device.get_runtime_stats();
        assert_eq!(stats.device.total_reads, 6);
        assert_eq!(stats.device.total_writes, 2);
        assert_eq!(stats.device.missed_reads, 0);
        assert_eq!(stats.peripherals.get("UART").map(|s| s.failed), Some(0));
    }

    #[test]
    fn test_backfilled_storage() {
        let mut device = device();
        assert_eq!(device.read_memory(0x20000000, 4), 0);
        assert!(device.write_memory(0x20000004, 4, 0x1234));
        assert_eq!(device.read_memory(0x20000004, 4), 0x1234);

        let stats = device.get_runtime_stats().device;
        assert_eq!(stats.missed_reads, 1);
        assert_eq!(stats.missed_writes, 1);
        assert_eq!(device.get_model(0x20000004).as_deref(), Some("storage 0x1234"));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut device = device();
        device.optimize();
        let graph = device.graph_stats();

        let mut restored = DeviceModel::from_snapshot(device.snapshot()).expect("failed to restore");
        assert_eq!(restored.graph_stats(), graph);
        for _ in 0..2 {
            assert_eq!(restored.read_memory(SR, 4), device.read_memory(SR, 4));
            assert_eq!(
                restored.write_memory(CR, 4, 0x50),
                device.write_memory(CR, 4, 0x50),
            );
            assert_eq!(restored.read_memory(SR, 4), device.read_memory(SR, 4));
        }
    }

    #[test]
    fn test_merge_devices() {
        let mut a = device();
        let mut b = DeviceModel::new(AddressMap::arduino_due(), RehostConfig::default());
        b.train(&Trace::new().write(0x400E0600, 0x1).read(0x400E0668, 0x1)).expect("failed to train");

        assert!(a.merge(b).is_empty());
        assert_eq!(a.peripherals().len(), 2);
        assert_eq!(a.get_model(0x400E0668).as_deref(), Some("PMC"));
        assert_eq!(a.peripheral_index(0x400E0668), Some(1));
    }
}
