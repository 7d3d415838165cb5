//! peripheral state machine
//! 
//! a peripheral is a directed graph of states connected by the writes that
//! caused each transition. training appends one state per observed write,
//! optimization collapses equivalent states, and replay walks the graph to
//! answer reads and writes from an emulated program.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use nohash_hasher::IntMap;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::{Dfs, EdgeRef};

use crate::interrupt::InterruptQueue;
use crate::models::FitOptions;
use crate::snapshot::{EdgeSnapshot, PeripheralSnapshot, WildcardSnapshot};
use crate::state::PeripheralState;
use crate::stats::{GraphStats, ReplayStats};
use crate::types::{Address, AddressRange, Irq, ReadRecord, StateId, Value, WriteLabel};

pub mod error;
pub mod merge;
pub mod optimize;
pub mod replay;

pub use error::*;

/// the labels carried by one transition
pub type EdgeLabels = BTreeSet<WriteLabel>;

/// a learned peripheral
/// 
/// states live in the graph as node weights; `index` resolves a state id to
/// its node. ids are allocated by this machine only and never reused.
pub struct PeripheralModel {
    name: String,
    range: AddressRange,
    next_id: StateId,
    graph: StableGraph<PeripheralState, EdgeLabels>,
    index: IntMap<StateId, NodeIndex>,
    start: StateId,
    current: StateId,
    wildcards: BTreeMap<(StateId, StateId), BTreeSet<Address>>,
    stats: ReplayStats,
    pending: InterruptQueue,
}

impl PeripheralModel {
    pub fn new(name: impl Into<String>, range: impl Into<AddressRange>) -> Self {
        let mut peripheral = Self {
            name: name.into(),
            range: range.into(),
            next_id: 1,
            graph: StableGraph::new(),
            index: IntMap::default(),
            start: 0,
            current: 0,
            wildcards: BTreeMap::new(),
            stats: ReplayStats::default(),
            pending: InterruptQueue::new(),
        };
        let start = peripheral.alloc_id();
        peripheral.insert_state(PeripheralState::start(start));
        peripheral.start = start;
        peripheral.current = start;
        peripheral
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn range(&self) -> AddressRange {
        self.range
    }

    pub fn contains(&self, address: Address) -> bool {
        self.range.contains(address)
    }

    pub fn start_state(&self) -> StateId {
        self.start
    }

    pub fn current_state(&self) -> StateId {
        self.current
    }

    pub fn state(&self, id: StateId) -> Option<&PeripheralState> {
        self.index.get(&id).and_then(|ix| self.graph.node_weight(*ix))
    }

    pub(crate) fn state_mut(&mut self, id: StateId) -> Option<&mut PeripheralState> {
        let ix = *self.index.get(&id)?;
        self.graph.node_weight_mut(ix)
    }

    /// all states, ordered by id
    pub fn states(&self) -> Vec<&PeripheralState> {
        let mut states = self.graph.node_weights().collect::<Vec<_>>();
        states.sort_by_key(|state| state.id());
        states
    }

    pub fn state_ids(&self) -> Vec<StateId> {
        let mut ids = self.index.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    pub fn state_count(&self) -> usize {
        self.graph.node_count()
    }

    /// the labels of the transition `from -> to`, if there is one
    pub fn edge_labels(&self, from: StateId, to: StateId) -> Option<&EdgeLabels> {
        let a = *self.index.get(&from)?;
        let b = *self.index.get(&to)?;
        let e = self.graph.find_edge(a, b)?;
        self.graph.edge_weight(e)
    }

    /// outgoing transitions of `id`, ordered by destination
    pub fn out_edges(&self, id: StateId) -> Vec<(StateId, &EdgeLabels)> {
        let Some(ix) = self.index.get(&id) else {
            return Vec::new()
        };
        let mut edges = self.graph
            .edges(*ix)
            .map(|e| (self.graph[e.target()].id(), e.weight()))
            .collect::<Vec<_>>();
        edges.sort_by_key(|(to, _)| *to);
        edges
    }

    /// all transitions, ordered by `(from, to)`
    pub fn edges(&self) -> Vec<(StateId, StateId, &EdgeLabels)> {
        let mut edges = self.graph
            .edge_indices()
            .filter_map(|e| {
                let (a, b) = self.graph.edge_endpoints(e)?;
                Some((self.graph[a].id(), self.graph[b].id(), self.graph.edge_weight(e)?))
            })
            .collect::<Vec<_>>();
        edges.sort_by_key(|(from, to, _)| (*from, *to));
        edges
    }

    pub fn wildcards(&self) -> &BTreeMap<(StateId, StateId), BTreeSet<Address>> {
        &self.wildcards
    }

    pub fn is_wildcard(&self, from: StateId, to: StateId, address: Address) -> bool {
        self.wildcards
            .get(&(from, to))
            .map(|addresses| addresses.contains(&address))
            .unwrap_or(false)
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    pub fn graph_stats(&self) -> GraphStats {
        let edges = self.edges();
        GraphStats {
            states: self.state_count(),
            edges: edges.len(),
            self_loops: edges.iter().filter(|(from, to, _)| from == to).count(),
            wildcard_edges: self.wildcards.len(),
        }
    }

    pub(crate) fn alloc_id(&mut self) -> StateId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn insert_state(&mut self, state: PeripheralState) {
        let id = state.id();
        let ix = self.graph.add_node(state);
        self.index.insert(id, ix);
    }

    /// remove a state and every transition touching it
    pub(crate) fn remove_state(&mut self, id: StateId) -> Option<PeripheralState> {
        let ix = self.index.remove(&id)?;
        self.graph.remove_node(ix)
    }

    /// add labels to `from -> to`, creating the transition if needed
    pub(crate) fn add_labels(
        &mut self,
        from: StateId,
        to: StateId,
        labels: impl IntoIterator<Item = WriteLabel>,
    ) -> bool {
        let (Some(a), Some(b)) = (self.index.get(&from).copied(), self.index.get(&to).copied()) else {
            log::error!("{}: cannot add transition {} -> {}: unknown state", self.name, from, to);
            return false
        };
        match self.graph.find_edge(a, b) {
            Some(e) => self.graph[e].extend(labels),
            None => {
                self.graph.add_edge(a, b, labels.into_iter().collect());
            }
        }
        true
    }

    /// states in depth-first preorder from `id`
    pub(crate) fn preorder(&self, id: StateId) -> Vec<StateId> {
        let Some(ix) = self.index.get(&id) else {
            return Vec::new()
        };
        let mut dfs = Dfs::new(&self.graph, *ix);
        let mut order = Vec::new();
        while let Some(nx) = dfs.next(&self.graph) {
            order.push(self.graph[nx].id());
        }
        order
    }

    /// record a read observed while in the current state
    pub fn train_read(&mut self, address: Address, record: ReadRecord) {
        log::trace!("{}: read {:#010x} = {:#x}", self.name, address, record.value);
        let current = self.current;
        match self.state_mut(current) {
            Some(state) => state.append_read(address, record),
            None => log::error!("{}: lost current state {}", self.name, current),
        }
    }

    /// record a write: every write enters a fresh state
    pub fn train_write(&mut self, address: Address, value: Value) {
        log::trace!("{}: write {:#010x} = {:#x}", self.name, address, value);
        let id = self.alloc_id();
        self.insert_state(PeripheralState::with_trigger(id, address, value));
        let previous = std::mem::replace(&mut self.current, id);
        self.add_labels(previous, id, [(address, value)]);
    }

    /// record an interrupt observed while in the current state
    pub fn train_interrupt(&mut self, irq: Irq) {
        log::trace!("{}: interrupt {}", self.name, irq);
        let current = self.current;
        if let Some(state) = self.state_mut(current) {
            state.append_interrupt(irq);
        }
    }

    /// fit the read models of every state and rewind
    pub fn train(&mut self, options: &FitOptions) {
        for state in self.graph.node_weights_mut() {
            state.train(options);
        }
        log::info!("{}: trained {} states", self.name, self.state_count());
        self.reset();
    }

    /// rewind to the start state
    /// 
    /// read cursors and queued interrupts are cleared; learned models and
    /// counters are kept
    pub fn reset(&mut self) {
        self.current = self.start;
        for state in self.graph.node_weights_mut() {
            state.reset();
        }
        self.pending.clear();
    }

    /// shift every state id by `offset`
    pub(crate) fn relabel(&mut self, offset: StateId) {
        for state in self.graph.node_weights_mut() {
            state.relabel(offset);
        }
        self.index = std::mem::take(&mut self.index)
            .into_iter()
            .map(|(id, ix)| (id + offset, ix))
            .collect();
        self.start += offset;
        self.current += offset;
        self.next_id += offset;
        self.wildcards = std::mem::take(&mut self.wildcards)
            .into_iter()
            .map(|((from, to), addresses)| ((from + offset, to + offset), addresses))
            .collect();
    }

    pub fn snapshot(&self) -> PeripheralSnapshot {
        PeripheralSnapshot {
            name: self.name.clone(),
            range: self.range,
            next_id: self.next_id,
            start: self.start,
            states: self.states().into_iter().cloned().collect(),
            edges: self
                .edges()
                .into_iter()
                .map(|(from, to, labels)| EdgeSnapshot {
                    from,
                    to,
                    labels: labels.iter().copied().collect(),
                })
                .collect(),
            wildcards: self
                .wildcards
                .iter()
                .map(|((from, to), addresses)| WildcardSnapshot {
                    from: *from,
                    to: *to,
                    addresses: addresses.iter().copied().collect(),
                })
                .collect(),
            stats: self.stats,
        }
    }

    /// rebuild a peripheral from its persisted form, rewound to its start
    /// state
    pub fn from_snapshot(snapshot: PeripheralSnapshot) -> Result<Self, Error> {
        let PeripheralSnapshot { name, range, next_id, start, states, edges, wildcards, stats } = snapshot;

        let mut peripheral = Self {
            name,
            range,
            next_id,
            graph: StableGraph::new(),
            index: IntMap::default(),
            start,
            current: start,
            wildcards: BTreeMap::new(),
            stats,
            pending: InterruptQueue::new(),
        };

        for state in states.into_iter() {
            let id = state.id();
            if peripheral.index.contains_key(&id) {
                return Err(Error::DuplicateState(peripheral.name, id))
            }
            if id >= next_id {
                return Err(Error::StaleStateId(peripheral.name, id, next_id))
            }
            peripheral.insert_state(state);
        }

        if !peripheral.index.contains_key(&start) {
            return Err(Error::MissingStart(peripheral.name, start))
        }

        for edge in edges.into_iter() {
            for id in [edge.from, edge.to] {
                if !peripheral.index.contains_key(&id) {
                    return Err(Error::DanglingEdge(peripheral.name, edge.from, id))
                }
            }
            peripheral.add_labels(edge.from, edge.to, edge.labels);
        }

        for wildcard in wildcards.into_iter() {
            peripheral.wildcards
                .entry((wildcard.from, wildcard.to))
                .or_default()
                .extend(wildcard.addresses);
        }

        peripheral.reset();
        Ok(peripheral)
    }
}

/// clones get their own, empty interrupt queue
impl Clone for PeripheralModel {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            range: self.range,
            next_id: self.next_id,
            graph: self.graph.clone(),
            index: self.index.clone(),
            start: self.start,
            current: self.current,
            wildcards: self.wildcards.clone(),
            stats: self.stats,
            pending: InterruptQueue::new(),
        }
    }
}

impl fmt::Debug for PeripheralModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PeripheralModel")
            .field("name", &self.name)
            .field("range", &self.range)
            .field("states", &self.state_count())
            .field("start", &self.start)
            .field("current", &self.current)
            .finish()
    }
}

impl fmt::Display for PeripheralModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.range)?;
        for state in self.states() {
            let marker = if state.id() == self.start { "*" } else { " " };
            writeln!(f, "{} {}", marker, state)?;
        }
        for (from, to, labels) in self.edges() {
            write!(f, "  {} -> {}:", from, to)?;
            for (address, value) in labels.iter() {
                write!(f, " ({:#010x}, {:#x})", address, value)?;
            }
            if let Some(addresses) = self.wildcards.get(&(from, to)) {
                for address in addresses.iter() {
                    write!(f, " ({:#010x}, *)", address)?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
