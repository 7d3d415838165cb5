//! merging peripherals learned from separate recordings

use std::collections::{BTreeMap, BTreeSet};

use crate::types::StateId;

use super::PeripheralModel;

impl PeripheralModel {
    /// fold a peripheral trained on another recording into this one
    /// 
    /// both graphs are walked together from their start states, pairing the
    /// states reached over shared labels. every pair must be equal and no
    /// state of `other` may pair with two of ours; otherwise nothing changes
    /// and `false` is returned. paired states are merged, the rest of
    /// `other` is imported under fresh ids, and wildcards are recomputed.
    pub fn merge(&mut self, mut other: PeripheralModel, wildcard_threshold: usize) -> bool {
        if self.name != other.name || self.range != other.range {
            log::error!(
                "cannot merge peripheral {} {} with {} {}",
                self.name, self.range, other.name, other.range,
            );
            return false
        }

        other.relabel(self.next_id - 1);

        let Some(mapping) = self.pair_states(&other) else {
            log::error!("{}: recordings disagree, not merging", self.name);
            return false
        };
        if !self.verify_mapping(&other, &mapping) {
            log::error!("{}: recordings pair unequal states, not merging", self.name);
            return false
        }

        let edges = other
            .edges()
            .into_iter()
            .map(|(from, to, labels)| (from, to, labels.clone()))
            .collect::<Vec<_>>();

        let mut imported = 0;
        for id in other.state_ids() {
            let Some(state) = other.remove_state(id) else {
                continue
            };
            match mapping.get(&id) {
                Some(ours) => {
                    if let Some(target) = self.state_mut(*ours) {
                        target.merge(&state);
                    }
                }
                None => {
                    self.insert_state(state);
                    imported += 1;
                }
            }
        }
        self.next_id = self.next_id.max(other.next_id);

        let resolve = |id: StateId| mapping.get(&id).copied().unwrap_or(id);
        for (from, to, labels) in edges {
            self.add_labels(resolve(from), resolve(to), labels);
        }

        self.update_wildcard_edges(wildcard_threshold);
        self.reset();

        log::info!(
            "{}: merged {} paired and {} new states",
            self.name, mapping.len(), imported,
        );
        true
    }

    /// walk both graphs in step; maps each reached state of `other` to ours
    fn pair_states(&self, other: &PeripheralModel) -> Option<BTreeMap<StateId, StateId>> {
        let mut mapping = BTreeMap::new();
        let mut stack = vec![(self.start, other.start)];

        while let Some((ours, theirs)) = stack.pop() {
            if self.state(ours)? != other.state(theirs)? {
                log::debug!("{}: {} != {}", self.name, ours, theirs);
                return None
            }
            match mapping.get(&theirs) {
                Some(existing) if *existing == ours => continue,
                Some(existing) => {
                    log::debug!("{}: {} pairs with both {} and {}", self.name, theirs, existing, ours);
                    return None
                }
                None => {
                    mapping.insert(theirs, ours);
                }
            }

            for (to, labels) in self.out_edges(ours) {
                for (other_to, other_labels) in other.out_edges(theirs) {
                    if !labels.is_disjoint(other_labels) {
                        stack.push((to, other_to));
                    }
                }
            }
        }
        Some(mapping)
    }

    /// states of `other` that land on the same state of ours must agree
    /// with each other too
    fn verify_mapping(&self, other: &PeripheralModel, mapping: &BTreeMap<StateId, StateId>) -> bool {
        let mut groups = BTreeMap::<StateId, BTreeSet<StateId>>::new();
        for (theirs, ours) in mapping.iter() {
            groups.entry(*ours).or_default().insert(*theirs);
        }
        groups.values().all(|group| {
            let states = group.iter().filter_map(|id| other.state(*id)).collect::<Vec<_>>();
            states
                .iter()
                .enumerate()
                .all(|(i, a)| states.iter().skip(i + 1).all(|b| a == b))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{read, CR, SR, THR, UART};
    use super::super::PeripheralModel;
    use crate::models::FitOptions;

    fn recording(sent: u64, status: u64) -> PeripheralModel {
        let mut uart = PeripheralModel::new("UART", UART);
        read(&mut uart, SR, 0x0);
        uart.train_write(CR, 0x50);
        read(&mut uart, SR, 0x2);
        uart.train_write(THR, sent);
        read(&mut uart, SR, status);
        uart.train(&FitOptions::default());
        uart
    }

    #[test]
    fn test_merge_recordings() {
        let mut a = recording(0x41, 0x0);
        let b = recording(0x42, 0x0);

        assert!(a.merge(b, 5));
        // the two THR writes lead to distinct, but equal, final states
        assert_eq!(a.state_count(), 4);
        assert_eq!(a.state_ids(), vec![1, 2, 3, 6]);
        assert_eq!(a.edge_labels(1, 2).map(|l| l.len()), Some(1));

        a.write(CR, 4, 0x50);
        assert!(a.write(THR, 4, 0x42));
        assert_eq!(a.current_state(), 6);
        assert_eq!(a.stats().failed + a.stats().long_jump, 0);
    }

    #[test]
    fn test_merge_refuses_disagreement() {
        let mut a = recording(0x41, 0x0);
        let b = recording(0x41, 0x7);
        let before = a.graph_stats();
        assert!(!a.merge(b, 5));
        assert_eq!(a.graph_stats(), before);
        assert_eq!(a.state_ids(), vec![1, 2, 3]);
    }

    #[test]
    fn test_merge_requires_same_peripheral() {
        let mut a = recording(0x41, 0x0);
        let b = PeripheralModel::new("USART0", UART);
        assert!(!a.merge(b, 5));
    }
}
