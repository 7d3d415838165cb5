//! markov models
//! 
//! transition-probability models over the observed value alphabet. both
//! variants first reproduce the trajectory they were trained on, then walk
//! the learned transitions with a seeded generator so that replay stays
//! reproducible across resets.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::types::{ReadRecord, Value};

use super::pattern::run_length_encode;

/// weighted transition table `from -> to -> count`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transitions(BTreeMap<Value, BTreeMap<Value, u32>>);

impl Transitions {
    pub fn observe(&mut self, from: Value, to: Value) {
        *self.0.entry(from).or_default().entry(to).or_default() += 1;
    }

    pub fn merge(&mut self, other: &Transitions) {
        for (from, targets) in other.0.iter() {
            let ours = self.0.entry(*from).or_default();
            for (to, count) in targets.iter() {
                *ours.entry(*to).or_default() += count;
            }
        }
    }

    pub fn count(&self, from: Value, to: Value) -> u32 {
        self.0
            .get(&from)
            .and_then(|targets| targets.get(&to))
            .copied()
            .unwrap_or(0)
    }

    /// draw a successor of `from` proportionally to observed counts
    pub fn sample(&self, from: Value, rng: &mut StdRng) -> Option<Value> {
        let targets = self.0.get(&from)?;
        let total = targets.values().map(|c| *c as u64).sum::<u64>();
        if total == 0 {
            return None
        }
        let mut pick = rng.gen_range(0..total);
        for (to, count) in targets.iter() {
            let count = *count as u64;
            if pick < count {
                return Some(*to)
            }
            pick -= count;
        }
        None
    }
}

/// first-order markov chain over individual reads
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MarkovModel {
    observed: Vec<Value>,
    transitions: Transitions,
    seed: u64,
    #[serde(skip)]
    cursor: usize,
    #[serde(skip)]
    last: Option<Value>,
    #[serde(skip)]
    rng: Option<StdRng>,
}

impl MarkovModel {
    pub fn new(seed: u64) -> Self {
        Self {
            observed: Vec::new(),
            transitions: Transitions::default(),
            seed,
            cursor: 0,
            last: None,
            rng: None,
        }
    }

    /// always fits given at least one observation
    pub fn train(&mut self, log: &[ReadRecord]) -> bool {
        if log.is_empty() {
            return false
        }
        self.observed = log.iter().map(|r| r.value).collect();
        self.transitions = Transitions::default();
        for w in self.observed.windows(2) {
            self.transitions.observe(w[0], w[1]);
        }
        true
    }

    pub fn alphabet(&self) -> BTreeSet<Value> {
        self.observed.iter().copied().collect()
    }

    pub fn transitions(&self) -> &Transitions {
        &self.transitions
    }

    pub fn read(&mut self) -> Value {
        let Some(first) = self.observed.first().copied() else {
            return 0
        };
        let value = if self.cursor < self.observed.len() {
            self.observed[self.cursor]
        } else {
            let rng = self.rng.get_or_insert_with(|| StdRng::seed_from_u64(self.seed));
            self.last
                .and_then(|last| self.transitions.sample(last, rng))
                .unwrap_or(first)
        };
        self.cursor = self.cursor.saturating_add(1);
        self.last = Some(value);
        value
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        self.last = None;
        self.rng = None;
    }

    pub fn merge(&mut self, other: &MarkovModel) -> bool {
        self.transitions.merge(&other.transitions);
        true
    }
}

impl PartialEq for MarkovModel {
    fn eq(&self, other: &Self) -> bool {
        self.alphabet() == other.alphabet()
    }
}

/// markov chain over runs of identical reads
/// 
/// models registers that hold a value for a while before switching, e.g.
/// a busy flag that stays set for several polls. transitions are learned
/// between runs and each value remembers how long it was held.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MarkovPatternModel {
    runs: Vec<(Value, usize)>,
    dwell: BTreeMap<Value, Vec<usize>>,
    transitions: Transitions,
    seed: u64,
    #[serde(skip)]
    run: usize,
    #[serde(skip)]
    remaining: usize,
    #[serde(skip)]
    current: Option<Value>,
    #[serde(skip)]
    rng: Option<StdRng>,
}

impl MarkovPatternModel {
    pub fn new(seed: u64) -> Self {
        Self {
            runs: Vec::new(),
            dwell: BTreeMap::new(),
            transitions: Transitions::default(),
            seed,
            run: 0,
            remaining: 0,
            current: None,
            rng: None,
        }
    }

    /// fits when at least two values alternate and some value is held for
    /// more than one consecutive read
    pub fn train(&mut self, log: &[ReadRecord]) -> bool {
        let values = log.iter().map(|r| r.value).collect::<Vec<_>>();
        let runs = run_length_encode(&values);
        let distinct = values.iter().collect::<BTreeSet<_>>().len();
        if distinct < 2 || runs.len() == values.len() {
            return false
        }

        self.dwell.clear();
        self.transitions = Transitions::default();
        for (value, count) in runs.iter() {
            self.dwell.entry(*value).or_default().push(*count);
        }
        for w in runs.windows(2) {
            self.transitions.observe(w[0].0, w[1].0);
        }
        self.runs = runs;
        true
    }

    pub fn alphabet(&self) -> BTreeSet<Value> {
        self.dwell.keys().copied().collect()
    }

    pub fn runs(&self) -> &[(Value, usize)] {
        &self.runs
    }

    fn advance(&mut self) {
        if self.run < self.runs.len() {
            let (value, count) = self.runs[self.run];
            self.run += 1;
            self.current = Some(value);
            self.remaining = count;
            return
        }

        let first = self.runs[0].0;
        let rng = self.rng.get_or_insert_with(|| StdRng::seed_from_u64(self.seed));
        let next = self.current
            .and_then(|current| self.transitions.sample(current, rng))
            .unwrap_or(first);
        let held = match self.dwell.get(&next) {
            Some(lengths) if !lengths.is_empty() => lengths[rng.gen_range(0..lengths.len())],
            _ => 1,
        };
        self.current = Some(next);
        self.remaining = held.max(1);
    }

    pub fn read(&mut self) -> Value {
        if self.runs.is_empty() {
            return 0
        }
        if self.remaining == 0 {
            self.advance();
        }
        self.remaining -= 1;
        self.current.unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.run = 0;
        self.remaining = 0;
        self.current = None;
        self.rng = None;
    }

    pub fn merge(&mut self, other: &MarkovPatternModel) -> bool {
        self.transitions.merge(&other.transitions);
        for (value, lengths) in other.dwell.iter() {
            self.dwell.entry(*value).or_default().extend(lengths.iter().copied());
        }
        true
    }
}

impl PartialEq for MarkovPatternModel {
    fn eq(&self, other: &Self) -> bool {
        self.alphabet() == other.alphabet()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_of(values: &[Value]) -> Vec<ReadRecord> {
        values
            .iter()
            .map(|v| ReadRecord::new(*v, 0, 4, 0.0))
            .collect()
    }

    #[test]
    fn test_markov_replays_observed_then_walks() {
        let mut model = MarkovModel::new(7);
        assert!(model.train(&log_of(&[1, 3, 2, 5])));
        let head = (0..4).map(|_| model.read()).collect::<Vec<_>>();
        assert_eq!(head, vec![1, 3, 2, 5]);

        // 5 has no successor, so the walk restarts from the first value
        assert_eq!(model.read(), 1);
        let alphabet = model.alphabet();
        for _ in 0..32 {
            assert!(alphabet.contains(&model.read()));
        }
    }

    #[test]
    fn test_markov_reset_is_reproducible() {
        let mut model = MarkovModel::new(42);
        assert!(model.train(&log_of(&[0, 1, 0, 2, 0, 1, 1, 2])));
        let first = (0..64).map(|_| model.read()).collect::<Vec<_>>();
        model.reset();
        let second = (0..64).map(|_| model.read()).collect::<Vec<_>>();
        assert_eq!(first, second);
    }

    #[test]
    fn test_markov_merge_sums_counts() {
        let mut a = MarkovModel::new(0);
        assert!(a.train(&log_of(&[1, 2, 1])));
        let mut b = MarkovModel::new(0);
        assert!(b.train(&log_of(&[2, 1, 2])));
        assert!(a == b);
        assert!(a.merge(&b));
        assert_eq!(a.transitions().count(1, 2), 2);
        assert_eq!(a.transitions().count(2, 1), 2);
    }

    #[test]
    fn test_markov_pattern_fit() {
        let mut model = MarkovPatternModel::new(0);
        assert!(!model.train(&log_of(&[1, 2, 3])));
        assert!(!model.train(&log_of(&[4, 4, 4])));
        assert!(model.train(&log_of(&[0, 0, 0, 1, 0, 0, 1, 1])));
        assert_eq!(model.runs(), &[(0, 3), (1, 1), (0, 2), (1, 2)][..]);

        let head = (0..8).map(|_| model.read()).collect::<Vec<_>>();
        assert_eq!(head, vec![0, 0, 0, 1, 0, 0, 1, 1]);
        for _ in 0..32 {
            assert!(model.read() <= 1);
        }
    }
}
