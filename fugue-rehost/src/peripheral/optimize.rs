//! state machine optimization
//! 
//! training leaves a chain with one state per write. optimization collapses
//! states that replay cannot tell apart, then generalizes transitions that
//! were taken with many different values.
//! 
//! state equality is not transitive, so merging happens in two phases: a
//! candidate pair is expanded into every pair its shared transitions force
//! to merge as well, all of those are verified, and only then is the graph
//! touched.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::graphmap::UnGraphMap;
use petgraph::visit::Bfs;

use crate::types::{Address, StateId, Value};

use super::{EdgeLabels, PeripheralModel};

/// verified pairs of states that must merge together
type Equivalences = Vec<(StateId, StateId)>;

/// working set of a single merge proposal
#[derive(Default)]
struct Proposal {
    equivalent: Equivalences,
    visited: BTreeSet<StateId>,
}

impl Proposal {
    /// the states already known to merge with `id`, including `id`
    fn class_of(&self, id: StateId) -> BTreeSet<StateId> {
        components(&self.equivalent)
            .into_iter()
            .find(|component| component.contains(&id))
            .unwrap_or_else(|| BTreeSet::from([id]))
    }
}

/// connected components of the graph formed by `pairs`
fn components(pairs: &[(StateId, StateId)]) -> Vec<BTreeSet<StateId>> {
    let graph = UnGraphMap::<StateId, ()>::from_edges(pairs.iter().copied());
    let mut seen = BTreeSet::new();
    let mut components = Vec::new();

    let mut nodes = graph.nodes().collect::<Vec<_>>();
    nodes.sort_unstable();

    for node in nodes {
        if seen.contains(&node) {
            continue
        }
        let mut component = BTreeSet::new();
        let mut bfs = Bfs::new(&graph, node);
        while let Some(member) = bfs.next(&graph) {
            component.insert(member);
        }
        seen.extend(component.iter().copied());
        components.push(component);
    }
    components
}

impl PeripheralModel {
    /// collapse the graph and generalize busy transitions
    /// 
    /// an edge is made a wildcard for an address once it carries more than
    /// `wildcard_threshold` distinct values for it
    pub fn optimize(&mut self, wildcard_threshold: usize) {
        let before = self.graph_stats();
        self.merge_empty_states();
        self.merge_equivalent_states();
        self.prune_unreachable();
        self.update_wildcard_edges(wildcard_threshold);
        self.reset();
        let after = self.graph_stats();
        log::info!(
            "{}: optimized {} states / {} edges into {} states / {} edges ({} wildcard)",
            self.name, before.states, before.edges, after.states, after.edges, after.wildcard_edges,
        );
    }

    /// fold states that observed nothing into their only predecessor
    /// 
    /// the transition into the empty state becomes a self-loop on the
    /// predecessor, which inherits the empty state's outgoing transitions
    pub fn merge_empty_states(&mut self) -> usize {
        let mut merged = 0;
        while let Some((from, empty)) = self.next_empty_state() {
            log::debug!("{}: folding empty state {} into {}", self.name, empty, from);

            let incoming = self.edge_labels(from, empty).cloned().unwrap_or_default();
            let outgoing = self
                .out_edges(empty)
                .into_iter()
                .map(|(to, labels)| (if to == empty { from } else { to }, labels.clone()))
                .collect::<Vec<_>>();

            let Some(state) = self.remove_state(empty) else {
                break
            };
            if let Some(predecessor) = self.state_mut(from) {
                predecessor.merge(&state);
            }

            self.add_labels(from, from, incoming);
            for (to, labels) in outgoing {
                self.add_labels(from, to, labels);
            }

            if self.current == empty {
                self.current = from;
            }
            merged += 1;
        }
        merged
    }

    /// first empty state in depth-first order that can be folded
    fn next_empty_state(&self) -> Option<(StateId, StateId)> {
        self.preorder(self.start)
            .into_iter()
            .filter(|id| *id != self.start)
            .find_map(|id| {
                let state = self.state(id)?;
                if !state.is_empty() || !state.interrupts().is_empty() {
                    return None
                }
                let from = self.single_predecessor(id)?;
                self.can_fold(from, id).then_some((from, id))
            })
    }

    fn single_predecessor(&self, id: StateId) -> Option<StateId> {
        let predecessors = self
            .edges()
            .into_iter()
            .filter(|(from, to, _)| *to == id && *from != id)
            .map(|(from, _, _)| from)
            .collect::<BTreeSet<_>>();
        if predecessors.len() == 1 {
            predecessors.into_iter().next()
        } else {
            None
        }
    }

    /// folding must not leave `from` with one label leading to two places
    fn can_fold(&self, from: StateId, empty: StateId) -> bool {
        let mut targets = BTreeMap::<(Address, Value), StateId>::new();

        let mut folded = Vec::new();
        for (to, labels) in self.out_edges(from) {
            let to = if to == empty { from } else { to };
            folded.push((to, labels));
        }
        for (to, labels) in self.out_edges(empty) {
            let to = if to == empty { from } else { to };
            folded.push((to, labels));
        }

        for (to, labels) in folded {
            for label in labels.iter() {
                if let Some(other) = targets.insert(*label, to) {
                    if other != to {
                        return false
                    }
                }
            }
        }
        true
    }

    /// repeatedly merge verified equivalence classes until none remain
    pub fn merge_equivalent_states(&mut self) -> usize {
        let mut rounds = 0;
        while let Some(equivalent) = self.find_merge() {
            self.commit_merge(&equivalent);
            rounds += 1;
        }
        rounds
    }

    /// the first candidate pair whose implied merges all verify
    fn find_merge(&self) -> Option<Equivalences> {
        let ids = self.preorder(self.start);
        for (i, first) in ids.iter().enumerate() {
            for second in ids.iter().skip(i + 1) {
                log::trace!("{}: comparing {} and {}", self.name, first, second);
                if let Some(equivalent) = self.propose_merge(*first, *second) {
                    if self.verify_components(&equivalent) {
                        log::debug!("{}: merging {} and {} ({:?})", self.name, first, second, equivalent);
                        return Some(equivalent)
                    }
                }
            }
        }
        None
    }

    /// expand a candidate pair into every pair of states it forces to merge
    /// 
    /// nothing is mutated; `None` means some forced pair is not equal
    pub(crate) fn propose_merge(&self, first: StateId, second: StateId) -> Option<Equivalences> {
        let mut proposal = Proposal::default();
        let mut worklist = self.merge_constraints(first, second, &mut proposal)?;
        while let Some((x, y)) = worklist.pop_first() {
            let implied = self.merge_constraints(x, y, &mut proposal)?;
            worklist.extend(implied);
        }
        (!proposal.equivalent.is_empty()).then_some(proposal.equivalent)
    }

    /// pairs of destinations that must merge if `first` and `second` do
    /// 
    /// a destination of either state is paired with every destination of the
    /// states already equivalent to `first` that is reached over a shared
    /// label
    fn merge_constraints(
        &self,
        first: StateId,
        second: StateId,
        proposal: &mut Proposal,
    ) -> Option<BTreeSet<(StateId, StateId)>> {
        let mut constraints = BTreeSet::new();
        if first == second {
            return Some(constraints)
        }

        let a = self.state(first)?;
        let b = self.state(second)?;
        if a != b {
            log::trace!("{}: {} and {} are not mergeable", self.name, first, second);
            return None
        }

        proposal.equivalent.push((first, second));
        if proposal.visited.contains(&first) && proposal.visited.contains(&second) {
            return Some(constraints)
        }
        proposal.visited.insert(first);
        proposal.visited.insert(second);

        let class_edges = proposal
            .class_of(first)
            .into_iter()
            .flat_map(|id| self.out_edges(id))
            .collect::<Vec<(StateId, &EdgeLabels)>>();

        for (to, labels) in self.out_edges(first).into_iter().chain(self.out_edges(second)) {
            for (class_to, class_labels) in class_edges.iter() {
                if !labels.is_disjoint(class_labels) {
                    constraints.insert((to, *class_to));
                }
            }
        }
        Some(constraints)
    }

    /// every member of every component must equal every other member
    fn verify_components(&self, equivalent: &[(StateId, StateId)]) -> bool {
        for component in components(equivalent) {
            let members = component
                .iter()
                .filter_map(|id| self.state(*id))
                .collect::<Vec<_>>();
            for (i, a) in members.iter().enumerate() {
                for b in members.iter().skip(i + 1) {
                    if a != b {
                        log::debug!(
                            "{}: rejecting merge, {} and {} are both equivalent to a common state but not to each other",
                            self.name, a.id(), b.id(),
                        );
                        return false
                    }
                }
            }
        }
        true
    }

    /// replace every component of `equivalent` with a single fresh state
    fn commit_merge(&mut self, equivalent: &[(StateId, StateId)]) {
        for component in components(equivalent) {
            let mut members = component.iter().filter_map(|id| self.state(*id));
            let Some(first) = members.next() else {
                continue
            };
            let mut merged = first.clone();
            for state in members {
                merged.merge(state);
            }

            let id = self.alloc_id();
            merged.set_id(id);

            let rewire = |n: StateId| if component.contains(&n) { id } else { n };
            let edges = self
                .edges()
                .into_iter()
                .filter(|(from, to, _)| component.contains(from) || component.contains(to))
                .map(|(from, to, labels)| (rewire(from), rewire(to), labels.clone()))
                .collect::<Vec<_>>();

            self.insert_state(merged);
            for (from, to, labels) in edges {
                self.add_labels(from, to, labels);
            }
            for old in component.iter() {
                self.remove_state(*old);
            }
            self.wildcards.retain(|(from, to), _| !component.contains(from) && !component.contains(to));

            if component.contains(&self.start) {
                self.start = id;
            }
            if component.contains(&self.current) {
                self.current = id;
            }
            log::debug!("{}: merged {:?} into {}", self.name, component, id);
        }
    }

    /// drop states the start state cannot reach
    pub fn prune_unreachable(&mut self) -> usize {
        let reachable = self.preorder(self.start).into_iter().collect::<BTreeSet<_>>();
        let unreachable = self
            .state_ids()
            .into_iter()
            .filter(|id| !reachable.contains(id))
            .collect::<Vec<_>>();
        for id in unreachable.iter() {
            log::debug!("{}: pruning unreachable state {}", self.name, id);
            self.remove_state(*id);
        }
        self.wildcards.retain(|(from, to), _| reachable.contains(from) && reachable.contains(to));
        if !reachable.contains(&self.current) {
            self.current = self.start;
        }
        unreachable.len()
    }

    /// mark `(edge, address)` pairs that accept any value
    /// 
    /// an address qualifies when the edge carries more than `threshold`
    /// distinct values for it and no other edge leaving the same state
    /// mentions it
    pub fn update_wildcard_edges(&mut self, threshold: usize) {
        let mut wildcards = BTreeMap::<(StateId, StateId), BTreeSet<Address>>::new();

        for (from, to, labels) in self.edges() {
            let mut values = BTreeMap::<Address, BTreeSet<Value>>::new();
            for (address, value) in labels.iter() {
                values.entry(*address).or_default().insert(*value);
            }

            let siblings = self
                .out_edges(from)
                .into_iter()
                .filter(|(other, _)| *other != to)
                .collect::<Vec<_>>();

            for (address, values) in values.into_iter() {
                if values.len() <= threshold {
                    continue
                }
                let contested = siblings
                    .iter()
                    .any(|(_, labels)| labels.iter().any(|(a, _)| *a == address));
                if contested {
                    log::debug!("{}: {} -> {} not a wildcard for {:#010x}, another edge uses it", self.name, from, to, address);
                    continue
                }
                log::info!(
                    "{}: {} -> {} is a wildcard for {:#010x} ({} values)",
                    self.name, from, to, address, values.len(),
                );
                wildcards.entry((from, to)).or_default().insert(address);
            }
        }

        self.wildcards = wildcards;
    }
}
