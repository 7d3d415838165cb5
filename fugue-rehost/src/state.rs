//! peripheral states
//! 
//! a single node of a peripheral's state machine: the reads observed while
//! the peripheral was in that state, the model chosen for each address, and
//! the interrupts that fired

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::{self, FitOptions, ReadValueModel};
use crate::types::{Address, Irq, ReadRecord, StateId, Value, WriteLabel};

/// peripheral state
/// 
/// equality between states is deliberately not transitive: two states are
/// only compared on the addresses both of them observed, so `a == b` and
/// `b == c` says nothing about `a` and `c`. anything that merges states must
/// verify every pair it intends to collapse.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeripheralState {
    id: StateId,
    trigger: Option<WriteLabel>,
    models: BTreeMap<Address, ReadValueModel>,
    interrupts: BTreeMap<Irq, u32>,
    merged: BTreeSet<StateId>,
    // training-time read logs
    #[serde(skip)]
    reads: BTreeMap<Address, Vec<ReadRecord>>,
}

impl PeripheralState {
    /// the synthetic start state
    pub fn start(id: StateId) -> Self {
        Self::new(id, None)
    }

    /// a state entered by the write `trigger`
    pub fn with_trigger(id: StateId, address: Address, value: Value) -> Self {
        Self::new(id, Some((address, value)))
    }

    fn new(id: StateId, trigger: Option<WriteLabel>) -> Self {
        Self {
            id,
            trigger,
            models: BTreeMap::new(),
            interrupts: BTreeMap::new(),
            merged: BTreeSet::from([id]),
            reads: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> StateId {
        self.id
    }

    /// give the state a new identity, keeping its provenance
    pub(crate) fn set_id(&mut self, id: StateId) {
        self.id = id;
        self.merged.insert(id);
    }

    /// shift every id this state knows about by `offset`
    pub(crate) fn relabel(&mut self, offset: StateId) {
        self.id += offset;
        self.merged = self.merged.iter().map(|id| id + offset).collect();
    }

    pub fn trigger(&self) -> Option<WriteLabel> {
        self.trigger
    }

    pub fn models(&self) -> &BTreeMap<Address, ReadValueModel> {
        &self.models
    }

    pub fn model(&self, address: Address) -> Option<&ReadValueModel> {
        self.models.get(&address)
    }

    pub fn model_mut(&mut self, address: Address) -> Option<&mut ReadValueModel> {
        self.models.get_mut(&address)
    }

    pub fn has_model(&self, address: Address) -> bool {
        self.models.contains_key(&address)
    }

    pub(crate) fn models_mut(&mut self) -> impl Iterator<Item = (&Address, &mut ReadValueModel)> {
        self.models.iter_mut()
    }

    pub fn interrupts(&self) -> &BTreeMap<Irq, u32> {
        &self.interrupts
    }

    pub fn merged_states(&self) -> &BTreeSet<StateId> {
        &self.merged
    }

    /// a state without any read models carries no observable behaviour
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// number of buffered reads that have not been fitted yet
    pub fn pending_reads(&self) -> usize {
        self.reads.values().map(Vec::len).sum()
    }

    pub fn append_read(&mut self, address: Address, record: ReadRecord) {
        self.reads.entry(address).or_default().push(record);
    }

    /// count another occurrence of `irq` while in this state
    pub fn append_interrupt(&mut self, irq: Irq) {
        *self.interrupts.entry(irq).or_default() += 1;
    }

    /// fit one model per observed address and drop the raw logs
    pub fn train(&mut self, options: &FitOptions) {
        let reads = std::mem::take(&mut self.reads);
        for (address, log) in reads.into_iter() {
            if let Some(model) = models::fit(self.trigger, address, &log, options) {
                log::debug!("state {} {:#x}: {}", self.id, address, model);
                self.models.insert(address, model);
            }
        }
    }

    /// rewind every model's read cursor
    pub fn reset(&mut self) {
        for model in self.models.values_mut() {
            model.reset();
        }
    }

    /// absorb `other` into this state
    /// 
    /// models for shared addresses are merged, models only `other` has are
    /// copied, and each interrupt keeps the larger of the two counts
    pub fn merge(&mut self, other: &PeripheralState) -> bool {
        if self.id == other.id {
            log::warn!("tried to merge state {} with itself", self.id);
            return false
        }
        log::debug!("merging {} into {}", other, self);

        for (address, model) in other.models.iter() {
            match self.models.get_mut(address) {
                Some(ours) => {
                    ours.merge(model);
                }
                None => {
                    self.models.insert(*address, model.clone());
                }
            }
        }

        for (irq, count) in other.interrupts.iter() {
            let ours = self.interrupts.entry(*irq).or_default();
            *ours = (*ours).max(*count);
        }

        self.merged.extend(other.merged.iter().copied());
        true
    }
}

impl PartialEq for PeripheralState {
    fn eq(&self, other: &Self) -> bool {
        // never equate a state that observed nothing with one that did
        if self.is_empty() != other.is_empty() {
            return false
        }

        for (address, model) in self.models.iter() {
            if let Some(theirs) = other.models.get(address) {
                if model != theirs {
                    return false
                }
            }
        }

        self.interrupts.keys().eq(other.interrupts.keys())
    }
}

impl fmt::Display for PeripheralState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.trigger {
            Some((address, value)) => write!(f, "{} write:{:#x}:{:#x}", self.id, address, value)?,
            None => write!(f, "{} start", self.id)?,
        }
        write!(f, ", #{}", self.merged.len())?;
        for (address, model) in self.models.iter() {
            write!(f, ", {:#010x}: {}", address, model)?;
        }
        if !self.interrupts.is_empty() {
            write!(f, " | {:?}", self.interrupts)?;
        }
        Ok(())
    }
}
