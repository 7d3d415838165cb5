//! pattern model
//! 
//! a periodic sequence of read values, keyed by the write value that
//! entered the owning state

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{ReadRecord, Value};

/// repeating read pattern
/// 
/// each trigger value owns a list of alternative patterns, one per
/// distinct observation merged into this model
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PatternModel {
    trigger: Value,
    patterns: BTreeMap<Value, Vec<Vec<Value>>>,
    encoded: Vec<(Value, usize)>,
    #[serde(skip)]
    selected: Option<Value>,
    #[serde(skip)]
    index: usize,
    // selections made among several alternatives since the last reset
    #[serde(skip)]
    rotations: usize,
    #[serde(skip)]
    cursor: usize,
}

impl PatternModel {
    pub fn new(trigger: Value) -> Self {
        let mut patterns = BTreeMap::new();
        patterns.insert(trigger, Vec::new());
        Self {
            trigger,
            patterns,
            encoded: Vec::new(),
            selected: None,
            index: 0,
            rotations: 0,
            cursor: 0,
        }
    }

    /// fit a pattern to the log; fails when no period explains it
    pub fn train(&mut self, log: &[ReadRecord]) -> bool {
        let reads = log.iter().map(|r| r.value).collect::<Vec<_>>();
        let Some(pattern) = find_period(&reads) else {
            return false
        };
        self.encoded = run_length_encode(&pattern);
        self.patterns.entry(self.trigger).or_default().push(pattern);
        true
    }

    /// the pattern learned for the trigger value that created this model
    pub fn primary(&self) -> Option<&[Value]> {
        self.patterns
            .get(&self.trigger)
            .and_then(|alternatives| alternatives.first())
            .map(Vec::as_slice)
    }

    /// the pattern that the next read will draw from
    pub fn active(&self) -> Option<&[Value]> {
        let key = self.selected.unwrap_or(self.trigger);
        self.patterns
            .get(&key)
            .and_then(|alternatives| alternatives.get(self.index))
            .map(Vec::as_slice)
    }

    pub fn patterns(&self) -> &BTreeMap<Value, Vec<Vec<Value>>> {
        &self.patterns
    }

    pub fn read(&mut self) -> Value {
        let value = match self.active() {
            Some(pattern) if !pattern.is_empty() => pattern[self.cursor % pattern.len()],
            _ => return 0,
        };
        self.cursor = self.cursor.wrapping_add(1);
        value
    }

    /// switch to the patterns observed after a write of `value`
    /// 
    /// when several alternatives exist they are rotated through on each
    /// selection, starting from the first one learned; an unseen value keeps
    /// the current selection
    pub fn select(&mut self, value: Value) {
        match self.patterns.get(&value) {
            Some(alternatives) if !alternatives.is_empty() => {
                if alternatives.len() > 1 {
                    self.index = self.rotations % alternatives.len();
                    self.rotations = self.rotations.wrapping_add(1);
                    log::debug!("rotated to read pattern {} of {}", self.index, alternatives.len());
                } else {
                    self.index = 0;
                }
                self.selected = Some(value);
            }
            _ => {
                log::debug!("no read pattern for write value {:#x}, keeping current", value);
            }
        }
    }

    pub fn reset(&mut self) {
        self.selected = None;
        self.index = 0;
        self.rotations = 0;
        self.cursor = 0;
    }

    /// union the other model's patterns into this one, dropping duplicates
    pub fn merge(&mut self, other: &PatternModel) -> bool {
        for (value, alternatives) in other.patterns.iter() {
            let ours = self.patterns.entry(*value).or_default();
            for pattern in alternatives.iter() {
                if !ours.contains(pattern) {
                    ours.push(pattern.clone());
                }
            }
        }
        true
    }
}

/// two patterns are equal if they repeat the same sequence, or if they walk
/// through the same values in the same order with different run lengths
impl PartialEq for PatternModel {
    fn eq(&self, other: &Self) -> bool {
        if self.primary() == other.primary() {
            return true
        }
        self.encoded.len() == other.encoded.len()
            && self.encoded
                .iter()
                .zip(other.encoded.iter())
                .all(|((a, _), (b, _))| a == b)
    }
}

/// extract the shortest repeating period from a stream of reads
/// 
/// a homogeneous stream has period one. otherwise the first two periods must
/// match, as must every later period; an incomplete trailing period must
/// match the prefix of the same length.
pub fn find_period(reads: &[Value]) -> Option<Vec<Value>> {
    let first = *reads.first()?;
    if reads.iter().all(|v| *v == first) {
        return Some(vec![first])
    }

    for len in 2..=reads.len() / 2 {
        if reads[..len] != reads[len..2 * len] {
            continue
        }
        if reads.chunks(len).all(|chunk| chunk == &reads[..chunk.len()]) {
            return Some(reads[..len].to_vec())
        }
    }
    None
}

/// collapse consecutive duplicates into `(value, count)` runs
pub fn run_length_encode(values: &[Value]) -> Vec<(Value, usize)> {
    let mut runs: Vec<(Value, usize)> = Vec::new();
    for value in values.iter() {
        match runs.last_mut() {
            Some((last, count)) if last == value => *count += 1,
            _ => runs.push((*value, 1)),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_of(values: &[Value]) -> Vec<ReadRecord> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| ReadRecord::new(*v, 0x80100, 4, i as f64))
            .collect()
    }

    #[test]
    fn test_find_period() {
        assert_eq!(find_period(&[5, 5, 5]), Some(vec![5]));
        assert_eq!(find_period(&[1, 2, 1, 2, 1, 2]), Some(vec![1, 2]));
        assert_eq!(find_period(&[1, 2, 1, 2]), Some(vec![1, 2]));
        assert_eq!(find_period(&[1, 2, 3, 1, 2, 3, 1]), Some(vec![1, 2, 3]));
        assert_eq!(find_period(&[1, 2, 1, 2, 1, 3]), None);
        assert_eq!(find_period(&[1, 2, 3, 4]), None);
        assert_eq!(find_period(&[]), None);
    }

    #[test]
    fn test_trailing_remainder_must_match() {
        // [1, 2, 3] repeats, but the tail starts with 9
        assert_eq!(find_period(&[1, 2, 3, 1, 2, 3, 9]), None);
    }

    #[test]
    fn test_periodic_read_cycles() {
        let mut model = PatternModel::new(0);
        assert!(model.train(&log_of(&[1, 2, 1, 2, 1, 2])));
        assert_eq!(model.primary(), Some(&[1u64, 2][..]));

        let reads = (0..9).map(|_| model.read()).collect::<Vec<_>>();
        assert_eq!(reads, vec![1, 2, 1, 2, 1, 2, 1, 2, 1]);

        model.reset();
        assert_eq!(model.read(), 1);
    }

    #[test]
    fn test_merge_unions_patterns() {
        let mut a = PatternModel::new(0x1);
        assert!(a.train(&log_of(&[4, 4, 4])));
        let mut b = PatternModel::new(0x2);
        assert!(b.train(&log_of(&[4, 4])));
        assert!(a == b);

        assert!(a.merge(&b));
        assert!(a.merge(&b));
        assert_eq!(a.patterns().get(&0x1).map(Vec::len), Some(1));
        assert_eq!(a.patterns().get(&0x2).map(Vec::len), Some(1));

        a.select(0x2);
        assert_eq!(a.read(), 4);
    }

    #[test]
    fn test_alternatives_rotate_from_first() {
        let mut a = PatternModel::new(0x1);
        assert!(a.train(&log_of(&[4, 4])));
        let mut b = PatternModel::new(0x1);
        assert!(b.train(&log_of(&[6, 6])));
        assert!(a.merge(&b));
        assert_eq!(a.patterns().get(&0x1).map(Vec::len), Some(2));

        let reads = (0..3)
            .map(|_| {
                a.select(0x1);
                a.read()
            })
            .collect::<Vec<_>>();
        assert_eq!(reads, vec![4, 6, 4]);

        a.reset();
        a.select(0x1);
        assert_eq!(a.read(), 4);
    }

    #[test]
    fn test_encoded_equality() {
        let mut a = PatternModel::new(0);
        assert!(a.train(&log_of(&[0, 0, 1, 0, 0, 1])));
        let mut b = PatternModel::new(0);
        assert!(b.train(&log_of(&[0, 1, 0, 1])));
        let mut c = PatternModel::new(0);
        assert!(c.train(&log_of(&[1, 0, 1, 0])));

        // same value walk, different run lengths
        assert!(a == b);
        assert!(b != c);
    }
}
