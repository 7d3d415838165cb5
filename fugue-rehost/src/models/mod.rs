//! read-value models
//! 
//! generative models for the values a single register returns while its
//! peripheral sits in one state. a model is picked per address by trying
//! each variant in a fixed order and keeping the first that fits.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{Address, ReadRecord, Value, WriteLabel};

pub mod increasing;
pub mod markov;
pub mod pattern;
pub mod storage;

pub use increasing::IncreasingModel;
pub use markov::{MarkovModel, MarkovPatternModel, Transitions};
pub use pattern::PatternModel;
pub use storage::StorageModel;

/// model variant tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModelKind {
    Storage,
    Pattern,
    Increasing,
    MarkovPattern,
    Markov,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ModelKind::Storage => "storage",
            ModelKind::Pattern => "pattern",
            ModelKind::Increasing => "increasing",
            ModelKind::MarkovPattern => "markov-pattern",
            ModelKind::Markov => "markov",
        };
        f.write_str(name)
    }
}

/// options controlling model selection
#[derive(Clone, Copy, Debug)]
pub struct FitOptions {
    /// try the ordered/periodic variants before falling back to markov
    pub use_time_domain: bool,
    /// base seed for the markov variants' generators
    pub seed: u64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self { use_time_domain: true, seed: 0 }
    }
}

/// the model chosen for one address of one state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ReadValueModel {
    Storage(StorageModel),
    Pattern(PatternModel),
    Increasing(IncreasingModel),
    MarkovPattern(MarkovPatternModel),
    Markov(MarkovModel),
}

impl ReadValueModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            ReadValueModel::Storage(_) => ModelKind::Storage,
            ReadValueModel::Pattern(_) => ModelKind::Pattern,
            ReadValueModel::Increasing(_) => ModelKind::Increasing,
            ReadValueModel::MarkovPattern(_) => ModelKind::MarkovPattern,
            ReadValueModel::Markov(_) => ModelKind::Markov,
        }
    }

    #[inline]
    pub fn is_storage(&self) -> bool {
        matches!(self, ReadValueModel::Storage(_))
    }

    /// produce the next value
    pub fn read(&mut self) -> Value {
        match self {
            ReadValueModel::Storage(m) => m.read(),
            ReadValueModel::Pattern(m) => m.read(),
            ReadValueModel::Increasing(m) => m.read(),
            ReadValueModel::MarkovPattern(m) => m.read(),
            ReadValueModel::Markov(m) => m.read(),
        }
    }

    /// an explicit write to this model's address
    /// 
    /// storage takes the value; a pattern switches to the patterns learned
    /// for that write value; the other variants ignore writes
    pub fn write(&mut self, value: Value) {
        match self {
            ReadValueModel::Storage(m) => m.write(value),
            ReadValueModel::Pattern(m) => m.select(value),
            _ => (),
        }
    }

    /// notification that the owning state was entered by a write of `value`
    /// to some other address
    pub fn select(&mut self, value: Value) {
        if let ReadValueModel::Pattern(m) = self {
            m.select(value)
        }
    }

    /// rewind read cursors; learned data is untouched
    pub fn reset(&mut self) {
        match self {
            ReadValueModel::Storage(_) => (),
            ReadValueModel::Pattern(m) => m.reset(),
            ReadValueModel::Increasing(m) => m.reset(),
            ReadValueModel::MarkovPattern(m) => m.reset(),
            ReadValueModel::Markov(m) => m.reset(),
        }
    }

    /// fold an equal model of the same variant into this one
    pub fn merge(&mut self, other: &ReadValueModel) -> bool {
        if self.kind() != other.kind() {
            log::error!("tried to merge models of different kinds ({} != {})", self.kind(), other.kind());
            return false
        }
        if *self != *other {
            log::error!("tried to merge unequal {} models", self.kind());
            return false
        }
        match (self, other) {
            (ReadValueModel::Storage(a), ReadValueModel::Storage(b)) => a.merge(b),
            (ReadValueModel::Pattern(a), ReadValueModel::Pattern(b)) => a.merge(b),
            (ReadValueModel::Increasing(a), ReadValueModel::Increasing(b)) => a.merge(b),
            (ReadValueModel::MarkovPattern(a), ReadValueModel::MarkovPattern(b)) => a.merge(b),
            (ReadValueModel::Markov(a), ReadValueModel::Markov(b)) => a.merge(b),
            _ => false,
        }
    }
}

impl PartialEq for ReadValueModel {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ReadValueModel::Storage(a), ReadValueModel::Storage(b)) => a == b,
            (ReadValueModel::Pattern(a), ReadValueModel::Pattern(b)) => a == b,
            (ReadValueModel::Increasing(a), ReadValueModel::Increasing(b)) => a == b,
            (ReadValueModel::MarkovPattern(a), ReadValueModel::MarkovPattern(b)) => a == b,
            (ReadValueModel::Markov(a), ReadValueModel::Markov(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for ReadValueModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReadValueModel::Storage(m) => write!(f, "<storage {:#x}>", m.value()),
            ReadValueModel::Pattern(m) => match m.primary() {
                Some(p) if p.len() > 5 => write!(f, "<pattern [{} items]>", p.len()),
                Some(p) => write!(f, "<pattern {:x?}>", p),
                None => write!(f, "<pattern (empty)>"),
            },
            ReadValueModel::Increasing(m) => write!(f, "<increasing step {:#x}>", m.step()),
            ReadValueModel::MarkovPattern(m) => write!(f, "<markov-pattern {:x?}>", m.alphabet()),
            ReadValueModel::Markov(m) => write!(f, "<markov {:x?}>", m.alphabet()),
        }
    }
}

/// is this log explained by plain storage?
/// 
/// for a state entered by a write, every read must be of the written address
/// and return the written value. for the start state every read must return
/// the same value.
fn fits_storage(trigger: Option<WriteLabel>, address: Address, log: &[ReadRecord]) -> bool {
    match trigger {
        Some((write_address, write_value)) => {
            address == write_address && log.iter().all(|r| r.value == write_value)
        }
        None => log.windows(2).all(|w| w[0].value == w[1].value),
    }
}

/// select a model for the reads of `address` observed in one state
/// 
/// returns `None` for an empty log
pub fn fit(
    trigger: Option<WriteLabel>,
    address: Address,
    log: &[ReadRecord],
    options: &FitOptions,
) -> Option<ReadValueModel> {
    if log.is_empty() {
        return None
    }

    if fits_storage(trigger, address, log) {
        let mut m = StorageModel::new(trigger.map(|(_, v)| v).unwrap_or_default());
        m.train(log);
        log::debug!("{:#x} is storage", address);
        return Some(ReadValueModel::Storage(m))
    }

    let trigger_value = trigger.map(|(_, v)| v).unwrap_or_default();
    let seed = options.seed
        ^ address.rotate_left(17)
        ^ trigger_value.rotate_left(41);

    if options.use_time_domain {
        let mut m = PatternModel::new(trigger_value);
        if m.train(log) {
            log::debug!("{:#x} is pattern", address);
            return Some(ReadValueModel::Pattern(m))
        }
        let mut m = IncreasingModel::new(log[0].value);
        if m.train(log) {
            log::debug!("{:#x} is increasing", address);
            return Some(ReadValueModel::Increasing(m))
        }
        let mut m = MarkovPatternModel::new(seed);
        if m.train(log) {
            log::debug!("{:#x} is markov-pattern", address);
            return Some(ReadValueModel::MarkovPattern(m))
        }
    }

    let mut m = MarkovModel::new(seed);
    m.train(log);
    log::debug!("{:#x} is markov", address);
    Some(ReadValueModel::Markov(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_of(values: &[Value]) -> Vec<ReadRecord> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| ReadRecord::new(*v, 0x80000 + 4 * i as u64, 4, i as f64 * 1e-3))
            .collect()
    }

    #[test]
    fn test_cascade_order() {
        let opts = FitOptions::default();
        let trigger = Some((0x400E0800, 0x50));

        let m = fit(trigger, 0x400E0800, &log_of(&[0x50]), &opts).expect("no model");
        assert_eq!(m.kind(), ModelKind::Storage);

        let m = fit(trigger, 0x400E0814, &log_of(&[0x50]), &opts).expect("no model");
        assert_eq!(m.kind(), ModelKind::Pattern);

        let m = fit(trigger, 0x400E0814, &log_of(&[1, 2, 1, 2, 1, 2]), &opts).expect("no model");
        assert_eq!(m.kind(), ModelKind::Pattern);

        let m = fit(trigger, 0x400E0814, &log_of(&[1, 2, 3, 4, 5]), &opts).expect("no model");
        assert_eq!(m.kind(), ModelKind::Increasing);

        let m = fit(trigger, 0x400E0814, &log_of(&[0, 0, 2, 2, 2, 0]), &opts).expect("no model");
        assert_eq!(m.kind(), ModelKind::MarkovPattern);

        let m = fit(trigger, 0x400E0814, &log_of(&[1, 3, 2, 5]), &opts).expect("no model");
        assert_eq!(m.kind(), ModelKind::Markov);

        assert!(fit(trigger, 0x400E0814, &[], &opts).is_none());
    }

    #[test]
    fn test_start_state_storage() {
        let opts = FitOptions::default();
        let m = fit(None, 0x400E0818, &log_of(&[9, 9, 9]), &opts).expect("no model");
        assert_eq!(m.kind(), ModelKind::Storage);
        let m = fit(None, 0x400E0818, &log_of(&[9, 8, 9, 8]), &opts).expect("no model");
        assert_eq!(m.kind(), ModelKind::Pattern);
    }

    #[test]
    fn test_markov_only() {
        let opts = FitOptions { use_time_domain: false, seed: 1 };
        let m = fit(None, 0x10, &log_of(&[1, 2, 1, 2]), &opts).expect("no model");
        assert_eq!(m.kind(), ModelKind::Markov);
    }

    #[test]
    fn test_storage_write_read() {
        let opts = FitOptions::default();
        let mut m = fit(Some((0x20, 0x7)), 0x20, &log_of(&[0x7]), &opts).expect("no model");
        assert!(m.is_storage());
        for v in [0u64, 0x55, 0xffff_ffff] {
            m.write(v);
            assert_eq!(m.read(), v);
        }
    }

    #[test]
    fn test_merge_kind_mismatch() {
        let opts = FitOptions::default();
        let mut a = fit(None, 0x10, &log_of(&[1, 1]), &opts).expect("no model");
        let b = fit(Some((0x0, 0x0)), 0x10, &log_of(&[1, 2, 3]), &opts).expect("no model");
        assert_ne!(a.kind(), b.kind());
        assert!(a != b);
        assert!(!a.merge(&b));
    }
}
