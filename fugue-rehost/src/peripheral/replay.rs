//! runtime replay
//! 
//! reads and writes from the emulated program move the peripheral through
//! its graph. when the current state cannot answer, replay escalates: first
//! to the nearest state that can (breadth-first), then to any state in the
//! graph. replay never fails; misses are counted instead.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::types::{Address, Irq, StateId, Value};

use super::PeripheralModel;

impl PeripheralModel {
    /// answer a read of `address`
    /// 
    /// returns 0 when no state anywhere has a model for the address
    pub fn read(&mut self, address: Address, size: usize) -> Value {
        self.stats.reads += 1;

        if let Some(value) = self.read_current(address) {
            log::trace!("{}/{}: read {:#010x} = {:#x}", self.name, self.current, address, value);
            return value
        }

        if let Some(id) = self.nearest_with_model(address) {
            log::info!(
                "{}/{}: jumping to {} to read {:#010x}",
                self.name, self.current, id, address,
            );
            self.stats.bfs += 1;
            self.enter(id);
            return self.read_current(address).unwrap_or_default()
        }

        if let Some(id) = self.any_with_model(address) {
            log::info!(
                "{}/{}: long jump to {} to read {:#010x}",
                self.name, self.current, id, address,
            );
            self.stats.long_jump += 1;
            self.enter(id);
            return self.read_current(address).unwrap_or_default()
        }

        log::warn!(
            "{}/{}: no model for read of {:#010x} (size {})",
            self.name, self.current, address, size,
        );
        self.stats.failed += 1;
        0
    }

    /// apply a write of `value` to `address`
    /// 
    /// always succeeds: a write that matches nothing leaves the peripheral
    /// where it is and is counted as failed
    pub fn write(&mut self, address: Address, size: usize, value: Value) -> bool {
        self.stats.writes += 1;
        let current = self.current;

        let outgoing = self.out_edges(current);
        let exact = outgoing
            .iter()
            .find(|(_, labels)| labels.contains(&(address, value)))
            .map(|(to, _)| *to);
        let wildcard = outgoing
            .iter()
            .find(|(to, _)| self.is_wildcard(current, *to, address))
            .map(|(to, _)| *to);

        if let Some(to) = exact {
            log::trace!("{}/{}: write ({:#010x}, {:#x}) -> {}", self.name, current, address, value, to);
            self.transition(to, address, value);
            return true
        }

        if let Some(to) = wildcard {
            log::debug!("{}/{}: wildcard write ({:#010x}, {:#x}) -> {}", self.name, current, address, value, to);
            self.stats.wildcard += 1;
            self.transition(to, address, value);
            return true
        }

        if let Some(model) = self.state_mut(current).and_then(|state| state.model_mut(address)) {
            if model.is_storage() {
                model.write(value);
                self.stats.storage += 1;
                log::trace!("{}/{}: stored {:#x} at {:#010x}", self.name, current, value, address);
                return true
            }
        }

        if let Some((to, wildcard)) = self.search_edge(address, value) {
            log::info!(
                "{}/{}: searched for ({:#010x}, {:#x}), found {}{}",
                self.name, current, address, value, to,
                if wildcard { " (wildcard)" } else { "" },
            );
            self.stats.bfs += 1;
            if wildcard {
                self.stats.wildcard += 1;
            }
            self.transition(to, address, value);
            return true
        }

        if let Some(to) = self.busiest_edge(address) {
            log::info!(
                "{}/{}: long jump to {} for ({:#010x}, {:#x})",
                self.name, current, to, address, value,
            );
            self.stats.long_jump += 1;
            self.transition(to, address, value);
            return true
        }

        log::warn!(
            "{}/{}: no transition has ever written {:#010x} (size {}), ignoring {:#x}",
            self.name, current, address, size, value,
        );
        self.stats.failed += 1;
        true
    }

    /// take the interrupts queued since the last call
    pub fn get_interrupts(&self) -> BTreeMap<Irq, u32> {
        self.pending.drain()
    }

    fn read_current(&mut self, address: Address) -> Option<Value> {
        let current = self.current;
        self.state_mut(current)
            .and_then(|state| state.model_mut(address))
            .map(|model| model.read())
    }

    /// make `id` current and queue its interrupts
    fn enter(&mut self, id: StateId) {
        self.current = id;
        if let Some(state) = self.state(id) {
            if !state.interrupts().is_empty() {
                log::debug!("{}/{}: queueing {:?}", self.name, id, state.interrupts());
                self.pending.extend(state.interrupts());
            }
        }
    }

    /// take a transition caused by writing `value` to `address`
    /// 
    /// a destination with a model for `address` receives the write; otherwise
    /// each of its models learns which value entered the state
    fn transition(&mut self, to: StateId, address: Address, value: Value) {
        self.enter(to);
        let Some(state) = self.state_mut(to) else {
            return
        };
        match state.model_mut(address) {
            Some(model) => model.write(value),
            None => {
                for (_, model) in state.models_mut() {
                    model.select(value);
                }
            }
        }
    }

    /// states reachable from the current one, breadth-first; siblings are
    /// visited in id order
    fn reachable(&self) -> Vec<StateId> {
        let mut order = Vec::new();
        let mut seen = BTreeSet::from([self.current]);
        let mut queue = VecDeque::from([self.current]);
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for (to, _) in self.out_edges(id) {
                if seen.insert(to) {
                    queue.push_back(to);
                }
            }
        }
        order
    }

    /// nearest state reachable from the current one with a model for
    /// `address`
    fn nearest_with_model(&self, address: Address) -> Option<StateId> {
        self.reachable()
            .into_iter()
            .find(|id| self.state(*id).map(|state| state.has_model(address)).unwrap_or(false))
    }

    /// lowest-numbered state anywhere with a model for `address`
    fn any_with_model(&self, address: Address) -> Option<StateId> {
        self.states()
            .into_iter()
            .find(|state| state.has_model(address))
            .map(|state| state.id())
    }

    /// breadth-first search for a reachable transition accepting the write;
    /// the flag is set when the match is a wildcard
    fn search_edge(&self, address: Address, value: Value) -> Option<(StateId, bool)> {
        for from in self.reachable() {
            for (to, labels) in self.out_edges(from) {
                if labels.contains(&(address, value)) {
                    return Some((to, false))
                }
                if self.is_wildcard(from, to, address) {
                    return Some((to, true))
                }
            }
        }
        None
    }

    /// the transition whose labels mention `address` most often; ties go to
    /// the first transition in `(from, to)` order
    fn busiest_edge(&self, address: Address) -> Option<StateId> {
        let mut best: Option<(StateId, usize)> = None;
        for (_, to, labels) in self.edges() {
            let count = labels.iter().filter(|(a, _)| *a == address).count();
            if count > best.map(|(_, n)| n).unwrap_or(0) {
                best = Some((to, count));
            }
        }
        best.map(|(to, _)| to)
    }
}
