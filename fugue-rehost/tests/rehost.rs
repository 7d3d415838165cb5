use std::collections::BTreeMap;
use std::io::Write;

use fugue_rehost::{
    Address, AddressMap, DeviceModel, ModelKind, RehostConfig, Trace, TraceEvent, Value,
};

const UART_CR: Address = 0x400E0800;
const UART_SR: Address = 0x400E0814;
const UART_THR: Address = 0x400E081C;
const PIOA_ODSR: Address = 0x400E0E38;
const SRAM: Address = 0x20000000;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn trained(trace: &Trace) -> DeviceModel {
    let mut device = DeviceModel::new(AddressMap::arduino_due(), RehostConfig::default());
    device.train(trace).expect("failed to train device");
    device
}

fn reads(device: &mut DeviceModel, address: Address, n: usize) -> Vec<Value> {
    (0..n).map(|_| device.read_memory(address, 4)).collect()
}

#[test]
fn test_pattern_round_trip() {
    init();
    let trace = [1, 2, 1, 2, 1, 2]
        .into_iter()
        .fold(Trace::new(), |trace, value| trace.read(UART_SR, value));

    let mut device = trained(&trace);
    let uart = device.peripheral("UART").expect("UART was not learned");
    let start = uart.state(uart.start_state()).expect("no start state");
    assert_eq!(start.model(UART_SR).map(|m| m.kind()), Some(ModelKind::Pattern));

    assert_eq!(reads(&mut device, UART_SR, 6), vec![1, 2, 1, 2, 1, 2]);
    assert_eq!(device.get_runtime_stats().peripherals["UART"].failed, 0);
}

#[test]
fn test_storage_is_idempotent() {
    init();
    let trace = Trace::new()
        .write(UART_CR, 0x50)
        .read(UART_CR, 0x50);

    let mut device = trained(&trace);
    assert!(device.write_memory(UART_CR, 4, 0x50));
    assert_eq!(device.read_memory(UART_CR, 4), 0x50);

    // an unseen value is stored without moving the peripheral
    let uart = device.peripheral("UART").expect("UART was not learned");
    let current = uart.current_state();
    assert!(device.write_memory(UART_CR, 4, 0x51));
    assert_eq!(device.read_memory(UART_CR, 4), 0x51);
    assert_eq!(device.read_memory(UART_CR, 4), 0x51);

    let uart = device.peripheral("UART").expect("UART was not learned");
    assert_eq!(uart.current_state(), current);
    assert_eq!(uart.stats().storage, 1);
}

#[test]
fn test_graceful_miss() {
    init();
    let mut device = trained(&Trace::new().read(UART_SR, 0x2));

    // inside the peripheral, but never observed
    assert_eq!(device.read_memory(UART_THR, 4), 0);
    assert!(device.write_memory(UART_THR, 4, 0x41));
    let stats = device.get_runtime_stats();
    assert_eq!(stats.peripherals["UART"].failed, 2);

    // outside every peripheral the trace touched
    assert_eq!(device.read_memory(PIOA_ODSR, 4), 0);
    assert!(device.write_memory(PIOA_ODSR, 4, 0x8000));
    assert_eq!(device.read_memory(PIOA_ODSR, 4), 0x8000);

    let stats = device.get_runtime_stats();
    assert_eq!(stats.device.missed_reads, 1);
    assert_eq!(stats.device.missed_writes, 0);
    assert_eq!(device.get_model(PIOA_ODSR), Some("storage 0x8000".to_owned()));
}

#[test]
fn test_replay_reproduces_training_trace() {
    init();
    let trace = Trace::new()
        .read(UART_SR, 0x0)
        .write(UART_CR, 0x50)
        .read(UART_SR, 0x2).read(UART_SR, 0x2)
        .write(UART_THR, 0x41)
        .interrupt(8)
        .read(UART_SR, 0x0).read(UART_SR, 0x2).read(UART_SR, 0x0).read(UART_SR, 0x2)
        .write(UART_CR, 0x1)
        .read(UART_SR, 5).read(UART_SR, 6).read(UART_SR, 7);

    let mut device = trained(&trace);
    for _ in 0..2 {
        device.reset();
        for event in trace.events() {
            match *event {
                TraceEvent::Read { address, record } => {
                    assert_eq!(device.read_memory(address, record.size), record.value);
                }
                TraceEvent::Write { address, value, size } => {
                    assert!(device.write_memory(address, size, value));
                }
                TraceEvent::Interrupt { irq, .. } => {
                    assert_eq!(device.get_interrupts().get(&irq), Some(&1));
                }
            }
        }
    }

    let stats = device.get_runtime_stats();
    assert_eq!(stats.peripherals["UART"].failed, 0);
    assert_eq!(stats.peripherals["UART"].long_jump, 0);
}

#[test]
fn test_same_seed_replays_same_values() {
    init();
    let trace = [5, 9, 3, 5, 1, 9, 2, 7, 3, 9]
        .into_iter()
        .fold(Trace::new(), |trace, value| trace.read(UART_SR, value));

    let mut first = trained(&trace);
    let mut second = trained(&trace);

    let replayed = reads(&mut first, UART_SR, 32);
    assert_eq!(replayed, reads(&mut second, UART_SR, 32));

    first.reset();
    assert_eq!(replayed, reads(&mut first, UART_SR, 32));
}

#[test]
fn test_unmapped_register_replays_recorded_reads() {
    init();
    let trace = Trace::new()
        .read(UART_SR, 0x0)
        .read(SRAM, 1).read(SRAM, 2).read(SRAM, 3)
        .write(SRAM + 4, 0x55)
        .read(SRAM + 4, 0x55);

    let mut device = trained(&trace);
    assert_eq!(device.read_memory(UART_SR, 4), 0x0);
    assert_eq!(reads(&mut device, SRAM, 3), vec![1, 2, 3]);

    // reads that echo the last write stay plain storage
    assert_eq!(device.get_model(SRAM + 4), Some("storage 0x55".to_owned()));
    assert_eq!(device.read_memory(SRAM + 4, 4), 0x55);
    assert!(device.write_memory(SRAM + 4, 4, 0x66));
    assert_eq!(device.read_memory(SRAM + 4, 4), 0x66);

    device.reset();
    assert_eq!(reads(&mut device, SRAM, 3), vec![1, 2, 3]);

    let stats = device.get_runtime_stats().device;
    assert_eq!(stats.missed_reads, 0);
    assert_eq!(stats.missed_writes, 0);
}

#[test]
fn test_optimize_never_merges_unequal_states() {
    init();
    // the middle state only reads THR, so it equals both of its neighbours,
    // but the outer two disagree on SR
    let trace = Trace::new()
        .write(UART_CR, 0x1)
        .read(UART_SR, 1).read(UART_SR, 2).read(UART_SR, 1).read(UART_SR, 2)
        .write(UART_CR, 0x2)
        .read(UART_THR, 7)
        .write(UART_CR, 0x3)
        .read(UART_SR, 3).read(UART_SR, 4).read(UART_SR, 3).read(UART_SR, 4);

    let mut device = trained(&trace);
    device.optimize();
    assert_eq!(device.graph_stats().states, 3);

    assert!(device.write_memory(UART_CR, 4, 0x1));
    assert_eq!(reads(&mut device, UART_SR, 2), vec![1, 2]);
    assert!(device.write_memory(UART_CR, 4, 0x2));
    assert_eq!(device.read_memory(UART_THR, 4), 7);
    assert!(device.write_memory(UART_CR, 4, 0x3));
    assert_eq!(reads(&mut device, UART_SR, 4), vec![3, 4, 3, 4]);

    assert_eq!(device.get_runtime_stats().peripherals["UART"].failed, 0);
}

fn sending_loop(values: std::ops::Range<Value>) -> Trace {
    values.fold(Trace::new().read(UART_SR, 0x0), |trace, value| {
        trace
            .write(UART_THR, value)
            .read(UART_SR, 0x2)
            .write(UART_CR, 0x1)
            .read(UART_SR, 0x0)
    })
}

#[test]
fn test_wildcard_after_threshold() {
    init();
    let mut device = trained(&sending_loop(0..7));
    device.optimize();
    assert_eq!(device.graph_stats().wildcard_edges, 1);

    assert!(device.write_memory(UART_THR, 4, 0x0));
    assert_eq!(device.read_memory(UART_SR, 4), 0x2);
    assert!(device.write_memory(UART_CR, 4, 0x1));
    assert_eq!(device.read_memory(UART_SR, 4), 0x0);

    // never written during training
    assert!(device.write_memory(UART_THR, 4, 0x7f));
    assert_eq!(device.read_memory(UART_SR, 4), 0x2);

    let stats = device.get_runtime_stats().peripherals["UART"];
    assert_eq!(stats.wildcard, 1);
    assert_eq!(stats.failed, 0);

    let mut device = trained(&sending_loop(0..6));
    device.optimize();
    assert_eq!(device.graph_stats().wildcard_edges, 0);
}

#[test]
fn test_interrupts_follow_states() {
    init();
    let trace = Trace::new()
        .write(UART_CR, 0x1)
        .read(UART_SR, 0x1)
        .interrupt(8)
        .write(UART_CR, 0x2)
        .read(UART_SR, 0x0);

    let mut device = trained(&trace);
    assert!(device.get_interrupts().is_empty());

    device.write_memory(UART_CR, 4, 0x1);
    assert_eq!(device.get_interrupts(), BTreeMap::from([(8, 1)]));
    assert!(device.get_interrupts().is_empty());

    device.write_memory(UART_CR, 4, 0x2);
    assert!(device.get_interrupts().is_empty());
}

#[test]
fn test_mapped_interrupt_is_injected() {
    init();
    let trace = Trace::new().write(UART_CR, 0x1).read(UART_SR, 0x1);
    let mut device = DeviceModel::new(AddressMap::arduino_due(), RehostConfig::default())
        .with_interrupt_map([((UART_THR, 0x41), 8)]);
    device.train(&trace).expect("failed to train device");

    device.write_memory(UART_THR, 4, 0x41);
    device.join_interrupters();
    assert_eq!(device.get_interrupts(), BTreeMap::from([(8, 1)]));
    assert_eq!(device.get_runtime_stats().device.interrupts_fired, 1);
}

#[test]
fn test_persistence_round_trip() {
    init();
    let trace = sending_loop(0..7)
        .read(UART_THR, 5).read(UART_THR, 1).read(UART_THR, 4).read(UART_THR, 5).read(UART_THR, 2);
    let mut device = trained(&trace);
    device.optimize();

    let dir = tempfile::tempdir().expect("failed to create temporary directory");
    let path = dir.path().join("model.yaml");
    device.save(&path).expect("failed to save model");

    let mut loaded = DeviceModel::load(&path).expect("failed to load model");
    assert!(loaded.is_trained());
    assert_eq!(loaded.graph_stats(), device.graph_stats());
    assert_eq!(loaded.config(), device.config());
    assert_eq!(loaded.address_map(), device.address_map());

    for device in [&mut device, &mut loaded] {
        device.reset();
    }
    let replay = |device: &mut DeviceModel| {
        let mut values = Vec::new();
        for value in 0..10 {
            device.write_memory(UART_THR, 4, value);
            values.push(device.read_memory(UART_SR, 4));
            values.push(device.read_memory(UART_THR, 4));
            device.write_memory(UART_CR, 4, 0x1);
            values.push(device.read_memory(UART_SR, 4));
        }
        values
    };
    assert_eq!(replay(&mut device), replay(&mut loaded));
    assert_eq!(loaded.get_runtime_stats(), device.get_runtime_stats());
}

#[test]
fn test_load_rejects_garbage() {
    init();
    let mut file = tempfile::NamedTempFile::new().expect("failed to create temporary file");
    writeln!(file, "not: [a, model").expect("failed to write");
    assert!(DeviceModel::load(file.path()).is_err());
    assert!(DeviceModel::load(file.path().with_extension("missing")).is_err());
}

#[test]
fn test_train_from_tab_separated_trace() {
    init();
    let mut file = tempfile::NamedTempFile::new().expect("failed to create temporary file");
    write!(
        file,
        "Operation\tSeqn\tAddress\tValue\tValue (Model)\tPC\tSize\tTimestamp\tModel\n\
         READ\t0\t0x400e0814\t0\t0\t0x80114\t4\t0.001\tUART\n\
         WRITE\t1\t0x400e0800\t50\t0\t0x80120\t4\t0.002\tUART\n\
         READ\t2\t0x400e0800\t50\t0\t0x80124\t4\t0.003\tUART\n\
         garbage\n\
         READ\t3\t0x400e0814\t2\t0\t0x80128\tfour\t0.004\tUART\n\
         READ\t4\t0x400e0814\t2\t0\t0x80128\t4\t0.005\tUART\n\
         WRITE\t5\t0x400e0e38\t8000\t0\t0x80130\t4\t0.006\tPIOA\n"
    )
    .expect("failed to write trace");

    let trace = Trace::from_path(file.path()).expect("failed to read trace");
    assert_eq!(trace.len(), 5);

    let mut device = DeviceModel::new(AddressMap::arduino_due(), RehostConfig::default());
    device.train_from_path(file.path()).expect("failed to train device");
    let names = device.peripherals().iter().map(|p| p.name()).collect::<Vec<_>>();
    assert_eq!(names, vec!["UART", "PIOA"]);

    assert_eq!(device.read_memory(UART_SR, 4), 0x0);
    device.write_memory(UART_CR, 4, 0x50);
    assert_eq!(device.read_memory(UART_CR, 4), 0x50);
    assert_eq!(device.read_memory(UART_SR, 4), 0x2);
}

#[test]
fn test_merge_recordings() {
    init();
    let mut first = trained(&Trace::new().write(UART_CR, 0x1).read(UART_SR, 0x1));
    let second = trained(&Trace::new().write(UART_CR, 0x2).read(UART_SR, 0x3).write(PIOA_ODSR, 0x1));

    let rejected = first.merge(second);
    assert!(rejected.is_empty());
    assert!(first.peripheral("PIOA").is_some());

    first.write_memory(UART_CR, 4, 0x1);
    assert_eq!(first.read_memory(UART_SR, 4), 0x1);
    first.reset();
    first.write_memory(UART_CR, 4, 0x2);
    assert_eq!(first.read_memory(UART_SR, 4), 0x3);
}
