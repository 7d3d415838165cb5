//! trace module
//! 
//! recorded peripheral accesses. a trace is a tab-separated table with a
//! header row and the columns
//! 
//! `Operation, Seqn, Address, Value, Value (Model), PC, Size, Timestamp, Model`
//! 
//! where the operation is `READ`, `WRITE` or `INTERRUPT` (or `0`, `1`, `2`).
//! addresses, values and program counters are hexadecimal; for interrupts the
//! value column holds the irq.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use crate::types::{Address, Irq, ReadRecord, Value};

pub mod error;
pub use error::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
    Interrupt,
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "READ" | "0" => Ok(Operation::Read),
            "WRITE" | "1" => Ok(Operation::Write),
            "INTERRUPT" | "2" => Ok(Operation::Interrupt),
            other => Err(format!("unknown operation `{}`", other)),
        }
    }
}

/// one recorded event
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TraceEvent {
    Read { address: Address, record: ReadRecord },
    Write { address: Address, value: Value, size: usize },
    Interrupt { irq: Irq, timestamp: f64 },
}

impl TraceEvent {
    /// the accessed address, for reads and writes
    pub fn address(&self) -> Option<Address> {
        match self {
            TraceEvent::Read { address, .. } | TraceEvent::Write { address, .. } => Some(*address),
            TraceEvent::Interrupt { .. } => None,
        }
    }
}

/// an in-memory trace
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    pub fn read(mut self, address: Address, value: Value) -> Self {
        let timestamp = self.events.len() as f64;
        self.push(TraceEvent::Read {
            address,
            record: ReadRecord::new(value, 0, 4, timestamp),
        });
        self
    }

    pub fn write(mut self, address: Address, value: Value) -> Self {
        self.push(TraceEvent::Write { address, value, size: 4 });
        self
    }

    pub fn interrupt(mut self, irq: Irq) -> Self {
        let timestamp = self.events.len() as f64;
        self.push(TraceEvent::Interrupt { irq, timestamp });
        self
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// every address read or written at least once
    pub fn accessed_addresses(&self) -> BTreeSet<Address> {
        self.events.iter().filter_map(TraceEvent::address).collect()
    }

    /// read a whole tab-separated trace; malformed rows are skipped
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, Error> {
        let events = TraceReader::new(reader).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { events })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::Io(path.to_owned(), e))?;
        let trace = Self::from_reader(file)?;
        log::info!("read {} events from {}", trace.len(), path.display());
        Ok(trace)
    }
}

impl FromIterator<TraceEvent> for Trace {
    fn from_iter<T: IntoIterator<Item = TraceEvent>>(iter: T) -> Self {
        Self { events: iter.into_iter().collect() }
    }
}

/// streaming reader over a tab-separated trace
/// 
/// malformed rows are logged and skipped; only failures of the underlying
/// reader are returned as errors
pub struct TraceReader<R> {
    reader: csv::Reader<R>,
    record: csv::StringRecord,
    skipped: usize,
}

impl<R: Read> TraceReader<R> {
    pub fn new(reader: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .flexible(true)
            .delimiter(b'\t')
            .quote(b'|')
            .has_headers(true)
            .from_reader(reader);
        Self {
            reader,
            record: csv::StringRecord::new(),
            skipped: 0,
        }
    }

    /// number of malformed rows skipped so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn line(&self) -> u64 {
        self.record.position().map(|p| p.line()).unwrap_or_default()
    }

    fn field(&self, index: usize, name: &str) -> Result<&str, Error> {
        self.record
            .get(index)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::malformed(self.line(), format!("missing {}", name)))
    }

    fn hex(&self, index: usize, name: &str) -> Result<u64, Error> {
        let field = self.field(index, name)?;
        let digits = field
            .strip_prefix("0x")
            .or_else(|| field.strip_prefix("0X"))
            .unwrap_or(field);
        u64::from_str_radix(digits, 16)
            .map_err(|e| Error::malformed(self.line(), format!("bad {} `{}`: {}", name, field, e)))
    }

    fn parse<T: FromStr>(&self, index: usize, name: &str) -> Result<T, Error>
    where T::Err: std::fmt::Display {
        let field = self.field(index, name)?;
        field
            .parse::<T>()
            .map_err(|e| Error::malformed(self.line(), format!("bad {} `{}`: {}", name, field, e)))
    }

    fn event(&self) -> Result<TraceEvent, Error> {
        let operation = self.field(0, "operation")?
            .parse::<Operation>()
            .map_err(|e| Error::malformed(self.line(), e))?;

        match operation {
            Operation::Read => {
                let address = self.hex(2, "address")?;
                let value = self.hex(3, "value")?;
                let pc = self.hex(5, "pc")?;
                let size = self.parse::<usize>(6, "size")?;
                let timestamp = self.parse::<f64>(7, "timestamp")?;
                Ok(TraceEvent::Read {
                    address,
                    record: ReadRecord::new(value, pc, size, timestamp),
                })
            }
            Operation::Write => Ok(TraceEvent::Write {
                address: self.hex(2, "address")?,
                value: self.hex(3, "value")?,
                size: self.parse::<usize>(6, "size")?,
            }),
            Operation::Interrupt => {
                let irq = self.hex(3, "irq")?;
                let irq = Irq::try_from(irq)
                    .map_err(|e| Error::malformed(self.line(), format!("bad irq {:#x}: {}", irq, e)))?;
                let timestamp = self.parse::<f64>(7, "timestamp").unwrap_or_default();
                Ok(TraceEvent::Interrupt { irq, timestamp })
            }
        }
    }
}

impl<R: Read> Iterator for TraceReader<R> {
    type Item = Result<TraceEvent, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.reader.read_record(&mut self.record) {
                Ok(false) => return None,
                Ok(true) => (),
                Err(e) if e.is_io_error() => return Some(Err(Error::Read(e))),
                Err(e) => {
                    log::warn!("skipping unreadable trace row: {}", e);
                    self.skipped += 1;
                    continue
                }
            }

            match self.event() {
                Ok(event) => return Some(Ok(event)),
                Err(e) => {
                    log::warn!("skipping {}", e);
                    self.skipped += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = "\
Operation\tSeqn\tAddress\tValue\tValue (Model)\tPC\tSize\tTimestamp\tModel
READ\t0\t0x400e0814\t00000000\t0\t0x80114\t4\t0.001\tUART
WRITE\t1\t0x400e0800\t00000050\t0\t0x80120\t4\t0.002\tUART
this row is garbage
1\t2\t0x400e081c\t41\t0\t0x80130\t4\t0.003\tUART
READ\t3\tnot-hex\t0\t0\t0x80134\t4\t0.004\tUART
INTERRUPT\t4\t0x00000000\t00000008\t0\t0x0\t0\t0.005\t???
0\t5\t0x400e0814\t2\t0\t0x80140\t4\t0.006\tUART
";

    #[test]
    fn test_read_trace() {
        let mut reader = TraceReader::new(TRACE.as_bytes());
        let events = reader.by_ref().collect::<Result<Vec<_>, _>>().expect("failed to read trace");
        assert_eq!(reader.skipped(), 2);
        assert_eq!(events.len(), 5);

        assert_eq!(
            events[0],
            TraceEvent::Read { address: 0x400E0814, record: ReadRecord::new(0, 0x80114, 4, 0.001) }
        );
        assert_eq!(events[1], TraceEvent::Write { address: 0x400E0800, value: 0x50, size: 4 });
        assert_eq!(events[2], TraceEvent::Write { address: 0x400E081C, value: 0x41, size: 4 });
        assert_eq!(events[3], TraceEvent::Interrupt { irq: 8, timestamp: 0.005 });
        assert_eq!(events[4].address(), Some(0x400E0814));
    }

    #[test]
    fn test_accessed_addresses() {
        let trace = Trace::from_reader(TRACE.as_bytes()).expect("failed to read trace");
        let addresses = trace.accessed_addresses().into_iter().collect::<Vec<_>>();
        assert_eq!(addresses, vec![0x400E0800, 0x400E0814, 0x400E081C]);
    }

    #[test]
    fn test_builder() {
        let trace = Trace::new().read(0x10, 1).write(0x10, 2).interrupt(3);
        assert_eq!(trace.len(), 3);
        assert_eq!(trace.accessed_addresses().len(), 1);
        assert!(Trace::new().is_empty());
    }

    #[test]
    fn test_write_keeps_size() {
        let trace = "\
Operation\tSeqn\tAddress\tValue\tValue (Model)\tPC\tSize\tTimestamp\tModel
WRITE\t0\t0x400e0e38\t8000\t0\t0x80120\t2\t0.001\tPIOA
WRITE\t1\t0x400e0e38\t8000\t0\t0x80124\t\t0.002\tPIOA
";
        let mut reader = TraceReader::new(trace.as_bytes());
        let events = reader.by_ref().collect::<Result<Vec<_>, _>>().expect("failed to read trace");
        assert_eq!(events, vec![TraceEvent::Write { address: 0x400E0E38, value: 0x8000, size: 2 }]);
        assert_eq!(reader.skipped(), 1);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(Trace::from_path("/nonexistent/trace.tsv"), Err(Error::Io(_, _))));
    }
}
